//! Domain errors surfaced at the protocol boundary. Each kind maps to one
//! wire code; backend failures are wrapped and collapsed before they reach
//! a client.
use parley_proto::code;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(thiserror::Error, Debug)]
pub enum ChatError {
    #[error("invalid request format: {0}")]
    InvalidFormat(String),
    #[error("not authenticated")]
    Unauthenticated,
    #[error("username already exists")]
    UsernameExists,
    #[error("user not found")]
    UserNotFound,
    #[error("password incorrect")]
    PasswordIncorrect,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("not a member of this group")]
    NotAMember,
    #[error("group not found")]
    GroupNotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("group owner cannot leave without transfer")]
    OwnerCannotLeave,
    #[error("recipient unknown")]
    RecipientUnknown,
    #[error("operation timed out")]
    Timeout,
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// The code carried in the error response for this kind.
    pub fn wire_code(&self) -> u32 {
        match self {
            ChatError::InvalidFormat(_) => code::INVALID_FORMAT,
            ChatError::Unauthenticated => code::UNAUTHENTICATED,
            ChatError::UsernameExists => code::USERNAME_EXISTS,
            // Credential specifics never cross the wire; they are logged.
            ChatError::UserNotFound
            | ChatError::PasswordIncorrect
            | ChatError::InvalidCredentials => code::INVALID_CREDENTIALS,
            ChatError::NotAMember => code::NOT_A_MEMBER,
            ChatError::GroupNotFound => code::GROUP_NOT_FOUND,
            ChatError::PermissionDenied => code::PERMISSION_DENIED,
            ChatError::OwnerCannotLeave => code::OWNER_CANNOT_LEAVE,
            ChatError::RecipientUnknown => code::RECIPIENT_UNKNOWN,
            ChatError::Timeout => code::TIMEOUT,
            ChatError::BackendUnavailable(_) => code::BACKEND_UNAVAILABLE,
            ChatError::Internal(_) => code::INTERNAL,
        }
    }

    /// The message carried in the error response. Credential failures all
    /// collapse to one string.
    pub fn wire_message(&self) -> String {
        match self {
            ChatError::UserNotFound
            | ChatError::PasswordIncorrect
            | ChatError::InvalidCredentials => "invalid credentials".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::InvalidFormat(err.to_string())
    }
}

impl From<parley_auth::AuthError> for ChatError {
    fn from(err: parley_auth::AuthError) -> Self {
        match err {
            parley_auth::AuthError::TokenRejected(_) => ChatError::Unauthenticated,
            parley_auth::AuthError::SignatureRejected(_) => ChatError::PermissionDenied,
            parley_auth::AuthError::PasswordHash(msg) => ChatError::Internal(msg),
            parley_auth::AuthError::Storage(err) => ChatError::BackendUnavailable(err.to_string()),
        }
    }
}

impl From<parley_storage::StorageError> for ChatError {
    fn from(err: parley_storage::StorageError) -> Self {
        ChatError::BackendUnavailable(err.to_string())
    }
}

impl From<parley_presence::PresenceError> for ChatError {
    fn from(err: parley_presence::PresenceError) -> Self {
        ChatError::BackendUnavailable(err.to_string())
    }
}

impl From<parley_bus::BusError> for ChatError {
    fn from(err: parley_bus::BusError) -> Self {
        ChatError::BackendUnavailable(err.to_string())
    }
}
