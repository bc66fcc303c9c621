//! Error taxonomy shared by both ends of the bridge.
//!
//! In-host failures are [`CallError`]s: a kind plus a message. The agent
//! renders them as traceback text, which the client surfaces unchanged inside
//! [`RemoteError`].

use std::fmt;

use thiserror::Error;

use crate::codec::CodecError;
use crate::control::ControlError;
use crate::frame::FrameError;
use crate::rendezvous::BootstrapError;

const TRACEBACK_HEADER: &str = "Traceback (most recent call last):";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NameError,
    TypeError,
    ValueError,
    IndexError,
    KeyError,
    AttributeError,
    SyntaxError,
    HostError,
    CodecError,
    UndefinedWrapper,
    BridgeError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NameError => "NameError",
            Self::TypeError => "TypeError",
            Self::ValueError => "ValueError",
            Self::IndexError => "IndexError",
            Self::KeyError => "KeyError",
            Self::AttributeError => "AttributeError",
            Self::SyntaxError => "SyntaxError",
            Self::HostError => "HostError",
            Self::CodecError => "CodecError",
            Self::UndefinedWrapper => "UndefinedWrapper",
            Self::BridgeError => "BridgeError",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "NameError" => Self::NameError,
            "TypeError" => Self::TypeError,
            "ValueError" => Self::ValueError,
            "IndexError" => Self::IndexError,
            "KeyError" => Self::KeyError,
            "AttributeError" => Self::AttributeError,
            "SyntaxError" => Self::SyntaxError,
            "HostError" => Self::HostError,
            "CodecError" => Self::CodecError,
            "UndefinedWrapper" => Self::UndefinedWrapper,
            "BridgeError" => Self::BridgeError,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure raised while running code inside the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn name(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NameError, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message)
    }

    pub fn value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValueError, message)
    }

    pub fn index(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IndexError, message)
    }

    pub fn key(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::KeyError, message)
    }

    pub fn attribute(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AttributeError, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SyntaxError, message)
    }

    /// Renders the traceback text sent back to clients.
    pub fn traceback(&self, function: &str) -> String {
        format!(
            "{TRACEBACK_HEADER}\n  File \"<agent>\", line 1, in {function}\n{}: {}",
            self.kind, self.message
        )
    }
}

/// An error raised inside the host and reported back over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote call failed:\n{traceback}")]
pub struct RemoteError {
    traceback: String,
}

impl RemoteError {
    pub fn new(traceback: impl Into<String>) -> Self {
        Self {
            traceback: traceback.into(),
        }
    }

    pub fn traceback(&self) -> &str {
        &self.traceback
    }

    /// Last line of the traceback, e.g. `NameError: NonExistentApi`.
    pub fn summary(&self) -> &str {
        self.traceback.lines().last().unwrap_or_default()
    }

    /// Kind named on the summary line, when it is one the bridge knows.
    pub fn kind(&self) -> Option<ErrorKind> {
        let (kind, _) = self.summary().split_once(':')?;
        ErrorKind::parse(kind.trim())
    }

    pub fn message(&self) -> &str {
        self.summary()
            .split_once(':')
            .map(|(_, message)| message.trim())
            .unwrap_or_default()
    }
}

/// Everything a bridge call can fail with, on either side.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("connection to {slave} was lost; call reconnect() to retry")]
    Disconnected { slave: String },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("{class} handle {handle} no longer refers to a live host object")]
    UndefinedWrapper { class: String, handle: String },
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("frame transport failed: {0}")]
    Frame(#[from] FrameError),
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),
    #[error("protocol violation: {message}")]
    Protocol { message: String },
    #[error("unknown slave {slave}")]
    UnknownSlave { slave: String },
}

impl BridgeError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Kind reported when this error escapes an in-host call.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Call(err) => err.kind,
            Self::Remote(err) => err.kind().unwrap_or(ErrorKind::BridgeError),
            Self::UndefinedWrapper { .. } => ErrorKind::UndefinedWrapper,
            Self::InvalidArgument { .. } => ErrorKind::ValueError,
            Self::Codec(_) => ErrorKind::CodecError,
            _ => ErrorKind::BridgeError,
        }
    }

    /// Converts to the in-host form used when building an error response.
    pub fn into_call_error(self) -> CallError {
        match self {
            Self::Call(err) => err,
            Self::Remote(err) => CallError::new(
                err.kind().unwrap_or(ErrorKind::BridgeError),
                err.message().to_string(),
            ),
            Self::InvalidArgument { message } => CallError::value(message),
            other => CallError::new(other.kind(), other.to_string()),
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
