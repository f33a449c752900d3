//! Shared wire protocol for the Atrium main <-> extension-host bridge.
//!
//! Both processes link this crate, so the set of service identifiers, the
//! envelope shape, and the serializable error form are checked by the compiler
//! rather than kept in sync by convention. Arguments and results travel as
//! CBOR values: primitives, records, arrays, byte strings, and integer
//! handles all encode losslessly.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod tabs;

/// Argument/result payload type for RPC calls.
pub type Value = serde_cbor::Value;

/// Correlation id matching a reply to its request.
pub type CorrelationId = u64;

/// Maximum size of a single encoded message (not including the outer 4-byte
/// length prefix). Enforced before deserializing untrusted input.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

/// Logical service names, shared by both sides of the bridge.
///
/// The registry on each side is keyed by this enum; the same variant names the
/// same contract in both processes. `Unknown` absorbs identifiers added by a
/// newer peer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ProxyId {
    /// Tab/group model owner (main side).
    TabsMain,
    /// Tab model mirror consumer (extension side).
    TabsExt,
    /// Workspace metadata storage (main side).
    StorageMain,
    /// Document events (extension side).
    DocumentsExt,
    /// Command execution (extension side).
    CommandsExt,
    #[serde(other)]
    Unknown,
}

impl ProxyId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyId::TabsMain => "tabs_main",
            ProxyId::TabsExt => "tabs_ext",
            ProxyId::StorageMain => "storage_main",
            ProxyId::DocumentsExt => "documents_ext",
            ProxyId::CommandsExt => "commands_ext",
            ProxyId::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorCode {
    UnknownTarget,
    UnknownMethod,
    /// The referenced handle was released or never bound. Callers treat this
    /// as "the other side already cleaned this up", not as a bug.
    NoSuchHandle,
    InvalidArgs,
    Cancelled,
    HandlerFailed,
    Internal,
    #[serde(other)]
    Unknown,
}

/// Serializable failure description.
///
/// A raw error is never assumed to be reconstructible on the other side;
/// everything crossing the boundary is flattened into this shape first.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteError {
    pub code: RemoteErrorCode,
    pub message: String,
    pub retryable: bool,
    pub details: Option<String>,
}

impl RemoteError {
    fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    pub fn unknown_target(target: ProxyId) -> Self {
        Self::new(
            RemoteErrorCode::UnknownTarget,
            format!("no handler registered for {target}"),
        )
    }

    pub fn unknown_method(target: ProxyId, method: &str) -> Self {
        Self::new(
            RemoteErrorCode::UnknownMethod,
            format!("{target} has no method {method:?}"),
        )
    }

    pub fn no_such_handle(handle: u64) -> Self {
        Self::new(
            RemoteErrorCode::NoSuchHandle,
            format!("handle {handle} is released or was never bound"),
        )
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorCode::InvalidArgs, message)
    }

    pub fn cancelled() -> Self {
        Self::new(RemoteErrorCode::Cancelled, "request cancelled")
    }

    pub fn handler_failed(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorCode::HandlerFailed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorCode::Internal, message)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RemoteError {}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallResult {
    Ok {
        value: Value,
    },
    Err {
        error: RemoteError,
    },
    #[serde(other)]
    Unknown,
}

/// One transportable unit. Each frame on the wire decodes to exactly one of
/// these; unknown frame types from a newer peer decode as `Unknown` and are
/// ignored rather than treated as protocol errors.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum RpcMessage {
    Request {
        id: CorrelationId,
        target: ProxyId,
        method: String,
        args: Vec<Value>,
    },
    Reply {
        id: CorrelationId,
        result: CallResult,
    },
    Notification {
        target: ProxyId,
        method: String,
        args: Vec<Value>,
    },
    /// Advisory cancellation of the request with the given id. Fire-and-forget;
    /// the callee is trusted, not forced, to stop.
    Cancel {
        id: CorrelationId,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("message too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    #[error("malformed message: {message}")]
    Malformed { message: String },

    #[error("encode failed: {message}")]
    Encode { message: String },
}

pub fn encode_message(message: &RpcMessage) -> Result<Vec<u8>, CodecError> {
    serde_cbor::to_vec(message).map_err(|err| CodecError::Encode {
        message: err.to_string(),
    })
}

/// Decodes one message. Malformed input yields `CodecError::Malformed`, never
/// a partial result.
pub fn decode_message(bytes: &[u8]) -> Result<RpcMessage, CodecError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(CodecError::TooLarge {
            len: bytes.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    serde_cbor::from_slice(bytes).map_err(|err| CodecError::Malformed {
        message: err.to_string(),
    })
}

/// Converts a serializable argument/result into the wire value model.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value, CodecError> {
    serde_cbor::value::to_value(value).map_err(|err| CodecError::Encode {
        message: err.to_string(),
    })
}

pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, CodecError> {
    serde_cbor::value::from_value(value).map_err(|err| CodecError::Malformed {
        message: err.to_string(),
    })
}
