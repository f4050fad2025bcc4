pub mod config;
pub mod messages;
pub mod nucleus;
pub mod serialization;

mod element;
pub use element::{Element, Extras, ReadFrom, SendOptions, StreamHandler, WriteOptions};

pub use messages::{Acknowledge, Command, Entry, EntryId, Log, LogLevel, Response};
pub use serialization::{Datum, Serialization};

/// Re-exported so callers of [`Element::command_loop`] don't need their own
/// `tokio-util` dependency to mint a shutdown token.
pub use tokio_util::sync::CancellationToken;

/// Stable numeric error codes carried in Response envelopes. Handler codes
/// are offset by `USER_ERRORS_BEGIN` before they hit the wire.
pub mod codes {
    pub const NO_ERROR: u64 = 0;
    pub const INTERNAL_ERROR: u64 = 1;
    pub const NUCLEUS_ERROR: u64 = 2;
    pub const COMMAND_NO_ACK: u64 = 3;
    pub const COMMAND_NO_RESPONSE: u64 = 4;
    pub const COMMAND_INVALID_DATA: u64 = 5;
    pub const COMMAND_UNSUPPORTED: u64 = 6;
    pub const CALLBACK_FAILED: u64 = 7;
    pub const LANGUAGE_ERRORS_BEGIN: u64 = 100;
    pub const USER_ERRORS_BEGIN: u64 = 1000;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not connect to nucleus")]
    Connect(#[source] redis::RedisError),
    #[error(transparent)]
    Nucleus(#[from] redis::RedisError),
    #[error("nucleus connection pool failure")]
    Pool(#[from] deadpool_redis::PoolError),
    #[error("invalid nucleus configuration")]
    Config(#[from] deadpool_redis::CreatePoolError),
    #[error(transparent)]
    Codec(#[from] serialization::CodecError),
    #[error("'{0}' is a reserved command name, choose another name")]
    ReservedCommand(String),
    #[error("'{0}' is a reserved envelope key and cannot be set as an extra")]
    ReservedKey(String),
    #[error("invalid entry id '{0}'")]
    InvalidEntryId(String),
    #[error("envelope is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("element name must not be empty")]
    EmptyElementName,
    #[error("stream '{0}' is not owned by this element")]
    UnknownStream(String),
    #[error("reference '{0}' not found")]
    ReferenceNotFound(String),
    #[error("reference key collision on '{0}'")]
    ReferenceExists(String),
    #[error("stream reference script is not loaded")]
    ScriptNotLoaded,
    #[error("unexpected reply shape from the nucleus: {0}")]
    UnexpectedReply(&'static str),
}

pub type Result<Ok, Err = Error> = std::result::Result<Ok, Err>;

impl Error {
    /// The wire code for this error, per the stable taxonomy in [`codes`].
    pub fn code(&self) -> u64 {
        match self {
            Error::Connect(_) | Error::Nucleus(_) | Error::Pool(_) | Error::Config(_) => {
                codes::NUCLEUS_ERROR
            }
            Error::Codec(_) => codes::COMMAND_INVALID_DATA,
            Error::ReservedCommand(_)
            | Error::ReservedKey(_)
            | Error::InvalidEntryId(_)
            | Error::MissingField(_)
            | Error::EmptyElementName
            | Error::UnknownStream(_)
            | Error::ReferenceNotFound(_)
            | Error::ReferenceExists(_)
            | Error::ScriptNotLoaded
            | Error::UnexpectedReply(_) => codes::INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(Error::ScriptNotLoaded.code(), codes::INTERNAL_ERROR);
        assert_eq!(
            Error::ReferenceNotFound("reference:foo:bar".to_string()).code(),
            codes::INTERNAL_ERROR
        );
        assert_eq!(codes::COMMAND_NO_ACK, 3);
        assert_eq!(codes::COMMAND_NO_RESPONSE, 4);
        assert_eq!(codes::COMMAND_UNSUPPORTED, 6);
        assert_eq!(codes::CALLBACK_FAILED, 7);
        assert_eq!(codes::USER_ERRORS_BEGIN, 1000);
    }
}
