use serde_json::Error as JsonError;
use thiserror::Error;
use url::ParseError as UrlParseError;

/// Enumeration of all possible errors in the `socket.io` context.
#[derive(Error, Debug)]
#[non_exhaustive]
#[cfg_attr(tarpaulin, ignore)]
pub enum Error {
    // Conform to https://rust-lang.github.io/api-guidelines/naming.html#names-use-a-consistent-word-order-c-word-order
    // Negative verb-object
    #[error("Invalid packet id: {0}")]
    InvalidPacketId(char),
    #[error("Error while parsing an incomplete packet")]
    IncompletePacket(),
    #[error("Got an invalid packet which did not follow the protocol format")]
    InvalidPacket(),
    #[error("invalid payload")]
    InvalidPayload(),
    #[error("illegal attachments")]
    IllegalAttachments(),
    #[error("got plaintext data when reconstructing a packet")]
    UnexpectedPlaintext(),
    #[error("got binary data when not reconstructing a packet")]
    UnexpectedBinary(),
    #[error("\"{0}\" is a reserved event name")]
    ReservedEvent(String),
    #[error("operation has timed out")]
    AckTimeout(),
    #[error("socket has been disconnected")]
    Disconnected(),
    #[error("string is not json serializable: {0}")]
    InvalidJson(#[from] JsonError),
    #[error("Invalid Url during parsing")]
    InvalidUrl(#[from] UrlParseError),
    #[error("Invalid Url Scheme: {0}")]
    InvalidUrlScheme(String),
    #[error("EngineIO Error: {0}")]
    IncompleteResponseFromEngineIo(#[from] engineio_client::Error),
    #[error("The manager task has stopped")]
    StoppedManager(),
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

impl From<Error> for std::io::Error {
    fn from(err: Error) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::Other, err)
    }
}
