//! Crate-wide error enumeration, grouped into the three bands from the
//! design: codec, message, and connection errors.
//!
//! Errors are values, not exceptions: the first error in a chain is kept
//! and threaded through `Writer::finish()` -> `Arguments` -> `Message` ->
//! `PendingReply` without being overwritten by later failures.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // --- codec band ---------------------------------------------------
    #[error("signature exceeds 255 bytes")]
    SignatureTooLong,
    #[error("nesting exceeds the 32/32/64 aggregate limits")]
    ExcessiveNesting,
    #[error("a struct must contain at least one complete type")]
    EmptyStruct,
    #[error("a variant may only be empty while traversing a nil array")]
    EmptyVariant,
    #[error("a variant must contain exactly one single complete type")]
    NotSingleCompleteTypeInVariant,
    #[error("dict keys must be a basic type")]
    InvalidKeyTypeInDict,
    #[error("array or dict body exceeds 64 MiB")]
    ArrayOrDictTooLong,
    #[error("serialized arguments exceed 128 MiB")]
    ArgumentsTooLong,
    #[error("no array is open to end here")]
    CannotEndArrayHere,
    #[error("no variant is open to end here")]
    CannotEndVariantHere,
    #[error("no struct is open to end here")]
    CannotEndStructHere,
    #[error("array element type changed between iterations")]
    TypeMismatchInSubsequentArrayIteration,
    #[error("string contains an embedded NUL or is not valid UTF-8")]
    InvalidString,
    #[error("object path does not match the grammar")]
    InvalidObjectPath,
    #[error("signature does not match the grammar")]
    InvalidSignature,
    #[error("unknown or invalid type letter")]
    InvalidType,
    #[error("malformed message data")]
    MalformedMessageData,
    #[error("aggregate cannot be skipped in its current state")]
    StateNotSkippable,
    #[error("read requested a type that does not match the data")]
    ReadWrongType,

    // --- message band ---------------------------------------------------
    #[error("MethodCall/Signal message is missing the Path header")]
    MessagePath,
    #[error("MethodCall/Signal message is missing the Method header")]
    MessageMethod,
    #[error("Signal message is missing the Interface header")]
    MessageInterface,
    #[error("Error message is missing the ErrorName header")]
    MessageErrorName,
    #[error("MethodReturn/Error message is missing the ReplySerial header")]
    MessageReplySerial,
    #[error("message serial must be nonzero")]
    MessageSerial,
    #[error("unsupported protocol version")]
    MessageProtocolVersion,
    #[error("invalid or Invalid message type")]
    MessageType,
    #[error("message would exceed the implementation limit of passed unix fds")]
    SendingTooManyUnixFds,

    // --- connection band -------------------------------------------------
    #[error("connection was closed locally")]
    LocalDisconnect,
    #[error("connection was closed by the peer")]
    RemoteDisconnect,
    #[error("reply timed out")]
    Timeout,
    #[error("transport I/O error: {0}")]
    Connection(#[from] io::Error),
    #[error("no pending reply exists for this serial")]
    NoSuchPendingReply,
    #[error("address string is malformed: {0}")]
    InvalidAddress(String),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("operation attempted in the wrong connection state")]
    WrongState,
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Connection(io::Error::from(e))
    }
}
