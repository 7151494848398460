//! Typed error taxonomy for the messaging core.
//!
//! The send/receive transport, the wire codec, and the name registry each
//! surface a distinct error type; [`IpcError`] is the umbrella that the
//! client and service APIs hand back to callers. Transport-level failures
//! carry a raw `status` code from the [`status`] module so the origin of a
//! refusal stays legible as it crosses layers.

use thiserror::Error;

/// Raw transport status codes carried by [`SendError::Transport`] and
/// [`ReceiveError::Transport`].
pub mod status {
    /// The destination port no longer has a receiver.
    pub const PORT_DEAD: i32 = 1;
    /// A message could not be parsed into a valid envelope.
    pub const MALFORMED: i32 = 2;
    /// A named capability right was missing or of the wrong kind.
    pub const INVALID_RIGHT: i32 = 3;
    /// The destination could not be resolved to a live port.
    pub const INVALID_DEST: i32 = 4;
    /// A message exceeded the caller's accepted size.
    pub const TOO_LARGE: i32 = 5;
}

/// A failure while decoding a value from the wire codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer ran out before `needed` bytes could be read.
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    BufferUnderflow { needed: usize, remaining: usize },
    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
    /// A field held a value outside its permitted domain.
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}

/// A failure while delivering a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The port layer refused delivery with the given status code.
    #[error("send failed with status {0}")]
    Transport(i32),
}

/// A failure while receiving or interpreting a reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiveError {
    /// The port layer failed the receive with the given status code.
    #[error("receive failed with status {0}")]
    Transport(i32),
    /// The peer answered with the reserved error shape carrying this code.
    #[error("remote returned error code {0}")]
    Remote(i32),
    /// A reply arrived that did not match the awaited request.
    #[error("unexpected reply")]
    UnexpectedReply,
    /// A reply did not match the expected message layout.
    #[error("protocol mismatch")]
    ProtocolMismatch,
    /// A received message could not be parsed into a valid envelope.
    #[error("malformed message")]
    Malformed,
    /// A reply payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// A failure while registering or resolving a well-known service name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// The service name is already bound to a port.
    #[error("service already registered: {0}")]
    AlreadyRegistered(String),
    /// No port is bound to the service name.
    #[error("service not registered: {0}")]
    NotRegistered(String),
}

/// The umbrella error returned by the client and service APIs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpcError {
    /// A message could not be sent.
    #[error(transparent)]
    Send(#[from] SendError),
    /// A reply could not be received or interpreted.
    #[error(transparent)]
    Receive(#[from] ReceiveError),
    /// A service name could not be registered or resolved.
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

impl From<DecodeError> for IpcError {
    fn from(error: DecodeError) -> IpcError {
        IpcError::Receive(ReceiveError::Decode(error))
    }
}
