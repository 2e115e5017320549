// Wire format for framing chat messages on a TCP stream.
//
// Every frame is `[u32 data_len][u32 msg_id][payload]`, both header fields
// little-endian. The payload is exactly `data_len` bytes; zero is legal.
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame payload of {got} bytes exceeds the {max} byte limit")]
    OversizedFrame { got: usize, max: usize },
    #[error("incomplete frame")]
    IncompleteFrame,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub data_len: u32,
    pub msg_id: u32,
}

impl FrameHeader {
    pub const LEN: usize = 8;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.data_len.to_le_bytes());
        buf.extend_from_slice(&self.msg_id.to_le_bytes());
    }

    pub fn encode_into(&self, out: &mut [u8; Self::LEN]) {
        out[..4].copy_from_slice(&self.data_len.to_le_bytes());
        out[4..].copy_from_slice(&self.msg_id.to_le_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < Self::LEN {
            return Err(Error::IncompleteFrame);
        }
        let data_len = buf.get_u32_le();
        let msg_id = buf.get_u32_le();
        Ok(Self { data_len, msg_id })
    }
}

/// Header length in bytes; the reader must consume exactly this much before
/// it knows how many payload bytes follow.
pub const fn head_len() -> usize {
    FrameHeader::LEN
}

/// Decode the two header fields from the first eight bytes of a frame.
pub fn unpack_head(bytes: Bytes) -> Result<(u32, u32)> {
    let header = FrameHeader::decode(bytes)?;
    Ok((header.data_len, header.msg_id))
}

/// Complete frame: message id plus payload.
///
/// ```
/// use bytes::Bytes;
/// use parley_wire::Frame;
///
/// let frame = Frame::new(201, Bytes::from_static(b"{\"content\":\"hi\"}"));
/// let encoded = frame.encode();
/// let decoded = Frame::decode(encoded).expect("decode");
/// assert_eq!(decoded.msg_id, 201);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_id: u32, payload: Bytes) -> Self {
        Self { msg_id, payload }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            data_len: self.payload.len() as u32,
            msg_id: self.msg_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        // Pre-allocate the exact size to avoid reallocation.
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header().encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        if input.len() < FrameHeader::LEN {
            return Err(Error::IncompleteFrame);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.data_len as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::IncompleteFrame);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self {
            msg_id: header.msg_id,
            payload,
        })
    }
}

/// Pack a message id and payload into wire bytes.
pub fn pack(msg_id: u32, payload: Bytes) -> Bytes {
    Frame::new(msg_id, payload).encode()
}

/// Read one frame off an async stream.
///
/// Reads exactly `head_len()` bytes, validates the declared length against
/// `max_packet_size`, then reads exactly that many payload bytes. Returns
/// `Ok(None)` on a clean EOF at a frame boundary; an EOF mid-frame is an
/// `IncompleteFrame`.
pub async fn read_frame<R>(recv: &mut R, max_packet_size: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    let mut filled = 0;
    while filled < FrameHeader::LEN {
        let n = recv.read(&mut header_bytes[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::IncompleteFrame);
        }
        filled += n;
    }

    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))?;
    let length = header.data_len as usize;
    // Check the cap before allocating anything the peer asked for.
    if length > max_packet_size {
        return Err(Error::OversizedFrame {
            got: length,
            max: max_packet_size,
        });
    }

    let mut payload = BytesMut::zeroed(length);
    recv.read_exact(&mut payload[..])
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::IncompleteFrame,
            _ => Error::Io(err),
        })?;

    Ok(Some(Frame {
        msg_id: header.msg_id,
        payload: payload.freeze(),
    }))
}

/// Write one frame to an async stream. Header and payload go out as a single
/// buffer so a concurrent writer can never interleave inside a frame.
pub async fn write_frame<W>(send: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send.write_all(&frame.encode()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let frame = Frame::new(201, Bytes::from_static(b"hello"));
        let encoded = frame.encode();
        assert_eq!(encoded.len(), head_len() + 5);
        let decoded = Frame::decode(encoded).expect("decode");
        assert_eq!(decoded.msg_id, 201);
        assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn header_fields_are_little_endian() {
        let frame = Frame::new(0x0102_0304, Bytes::from_static(b"ab"));
        let encoded = frame.encode();
        assert_eq!(&encoded[..4], &[2, 0, 0, 0]);
        assert_eq!(&encoded[4..8], &[4, 3, 2, 1]);
    }

    #[test]
    fn unpack_head_matches_pack() {
        let packed = pack(103, Bytes::from_static(b"xyz"));
        let (data_len, msg_id) = unpack_head(packed.slice(0..head_len())).expect("head");
        assert_eq!(data_len, 3);
        assert_eq!(msg_id, 103);
    }

    #[test]
    fn zero_length_payload_is_legal() {
        let frame = Frame::new(105, Bytes::new());
        let decoded = Frame::decode(frame.encode()).expect("decode");
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.msg_id, 105);
    }

    #[test]
    fn decode_rejects_incomplete_header() {
        let err = Frame::decode(Bytes::from_static(b"short")).expect_err("incomplete");
        assert!(matches!(err, Error::IncompleteFrame));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let mut buf = BytesMut::new();
        FrameHeader {
            data_len: 5,
            msg_id: 1,
        }
        .encode(&mut buf);
        buf.extend_from_slice(b"hi");
        let err = Frame::decode(buf.freeze()).expect_err("truncated");
        assert!(matches!(err, Error::IncompleteFrame));
    }

    #[tokio::test]
    async fn read_frame_enforces_max_packet_size() {
        let frame = Frame::new(201, Bytes::from(vec![0u8; 64]));
        let encoded = frame.encode();
        let mut reader = std::io::Cursor::new(encoded.to_vec());
        let err = read_frame(&mut reader, 16).await.expect_err("oversized");
        assert!(matches!(err, Error::OversizedFrame { got: 64, max: 16 }));
    }

    #[tokio::test]
    async fn read_frame_returns_none_on_clean_eof() {
        let mut reader = std::io::Cursor::new(Vec::new());
        let frame = read_frame(&mut reader, 1024).await.expect("read");
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn read_frame_flags_eof_inside_header() {
        let mut reader = std::io::Cursor::new(vec![1, 0, 0]);
        let err = read_frame(&mut reader, 1024).await.expect_err("partial");
        assert!(matches!(err, Error::IncompleteFrame));
    }

    #[tokio::test]
    async fn read_frame_flags_eof_inside_payload() {
        let mut bytes = Frame::new(2, Bytes::from_static(b"pong")).encode().to_vec();
        bytes.truncate(bytes.len() - 2);
        let mut reader = std::io::Cursor::new(bytes);
        let err = read_frame(&mut reader, 1024).await.expect_err("partial");
        assert!(matches!(err, Error::IncompleteFrame));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let mut buf = Vec::new();
        let frame = Frame::new(312, Bytes::from_static(b"{\"group_id\":7}"));
        write_frame(&mut buf, &frame).await.expect("write");
        let mut reader = std::io::Cursor::new(buf);
        let decoded = read_frame(&mut reader, 1024)
            .await
            .expect("read")
            .expect("frame");
        assert_eq!(decoded, frame);
    }
}
