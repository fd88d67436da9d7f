//! Error types for vipcore
//!
//! This module defines the error types used throughout the agent runtime.
//! `CoreError` is the crate-wide error; `VipError` is the typed form of an
//! inbound `error` envelope, decoded from its numeric/sentinel fields.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

// ============================================================================
// VIP Error Classification
// ============================================================================

/// errno reported when a peer cannot be reached through the router.
pub const EHOSTUNREACH: i64 = 113;
/// errno reported when the router asks the sender to try again.
pub const EAGAIN: i64 = 11;
/// errno reported for an envelope addressed to an unknown subsystem.
pub const EPROTONOSUPPORT: i64 = 93;

/// Classification of a VIP error by its errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VipErrorKind {
    /// Peer unreachable (`EHOSTUNREACH`)
    Unreachable,
    /// Resource temporarily unavailable (`EAGAIN`)
    Again,
    /// Recipient does not support the subsystem (`EPROTONOSUPPORT`)
    UnknownSubsystem,
    /// Any other errno
    Other(i64),
}

impl VipErrorKind {
    /// Maps an errno onto its classification.
    pub fn from_errno(errnum: i64) -> Self {
        match errnum {
            EHOSTUNREACH => VipErrorKind::Unreachable,
            EAGAIN => VipErrorKind::Again,
            EPROTONOSUPPORT => VipErrorKind::UnknownSubsystem,
            other => VipErrorKind::Other(other),
        }
    }

    /// Returns `true` if the sender may retry the original envelope.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VipErrorKind::Again | VipErrorKind::Unreachable)
    }
}

impl fmt::Display for VipErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VipErrorKind::Unreachable => write!(f, "unreachable"),
            VipErrorKind::Again => write!(f, "again"),
            VipErrorKind::UnknownSubsystem => write!(f, "unknown subsystem"),
            VipErrorKind::Other(n) => write!(f, "errno {}", n),
        }
    }
}

/// A typed error decoded from the args of an inbound `error` envelope.
///
/// Wire layout of the args: `[errnum, message, peer, subsystem, ...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VipError {
    pub errnum: i64,
    pub message: String,
    pub peer: String,
    pub subsystem: String,
}

impl VipError {
    /// Minimum number of args an `error` envelope must carry to be decoded.
    pub const MIN_ARGS: usize = 4;

    pub fn new(errnum: i64, message: &str, peer: &str, subsystem: &str) -> Self {
        Self {
            errnum,
            message: message.to_string(),
            peer: peer.to_string(),
            subsystem: subsystem.to_string(),
        }
    }

    /// Decodes a `VipError` from envelope args.
    ///
    /// `errnum` may be a JSON integer or a numeric string sentinel. Returns
    /// `None` when fewer than [`VipError::MIN_ARGS`] args are present or the
    /// errno cannot be read.
    pub fn from_args(args: &[Value]) -> Option<Self> {
        if args.len() < Self::MIN_ARGS {
            return None;
        }
        let errnum = match &args[0] {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.trim().parse::<i64>().ok()?,
            _ => return None,
        };
        Some(Self {
            errnum,
            message: value_to_string(&args[1]),
            peer: value_to_string(&args[2]),
            subsystem: value_to_string(&args[3]),
        })
    }

    /// Encodes this error back into envelope args.
    pub fn to_args(&self) -> Vec<Value> {
        vec![
            Value::from(self.errnum),
            Value::from(self.message.clone()),
            Value::from(self.peer.clone()),
            Value::from(self.subsystem.clone()),
        ]
    }

    pub fn kind(&self) -> VipErrorKind {
        VipErrorKind::from_errno(self.errnum)
    }
}

impl fmt::Display for VipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VIP error {} ({}): {} [peer={:?}, subsystem={:?}]",
            self.errnum,
            self.kind(),
            self.message,
            self.peer,
            self.subsystem
        )
    }
}

impl std::error::Error for VipError {}

impl From<VipError> for CoreError {
    fn from(err: VipError) -> Self {
        CoreError::Vip(err)
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for vipcore operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration-related errors (invalid config file, bad override values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The Core was assembled from an invalid set of collaborators
    #[error("Construction error: {0}")]
    Construction(String),

    /// Credentials were supplied for a different identity
    #[error("Identity mismatch: core identity {identity:?} but credentials for {credentials:?}")]
    IdentityMismatch {
        identity: String,
        credentials: String,
    },

    /// Transport failures (connect, send, receive)
    #[error("Transport error: {0}")]
    Transport(String),

    /// In-memory transport channel closed unexpectedly
    #[error("Bus error: channel closed")]
    BusClosed,

    /// `run()` called on a Core that already ran (or was stopped)
    #[error("Core already started")]
    AlreadyStarted,

    /// Operation requires a running Core
    #[error("Core is not running")]
    NotRunning,

    /// The receive loop returned while the Core was still running
    #[error("VIP loop ended prematurely")]
    MainLoopEnded,

    /// The cross-context queue no longer accepts calls
    #[error("Dispatcher closed")]
    DispatcherClosed,

    /// A marshalled call panicked on the owner's context
    #[error("Call panicked: {0}")]
    CallPanicked(String),

    /// Typed protocol error
    #[error("{0}")]
    Vip(VipError),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors raised by user-supplied handlers
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A specialized `Result` type for vipcore operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Renders a panic payload captured by `catch_unwind`.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_display() {
        let err = CoreError::Config("missing identity".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing identity");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let core_err: CoreError = io_err.into();
        assert!(matches!(core_err, CoreError::Io(_)));
    }

    #[test]
    fn test_main_loop_ended_display() {
        assert_eq!(
            CoreError::MainLoopEnded.to_string(),
            "VIP loop ended prematurely"
        );
    }

    #[test]
    fn test_identity_mismatch_display() {
        let err = CoreError::IdentityMismatch {
            identity: "a".into(),
            credentials: "b".into(),
        };
        assert!(err.to_string().contains("\"a\""));
        assert!(err.to_string().contains("\"b\""));
    }

    #[test]
    fn test_vip_error_kind_from_errno() {
        assert_eq!(VipErrorKind::from_errno(113), VipErrorKind::Unreachable);
        assert_eq!(VipErrorKind::from_errno(11), VipErrorKind::Again);
        assert_eq!(VipErrorKind::from_errno(93), VipErrorKind::UnknownSubsystem);
        assert_eq!(VipErrorKind::from_errno(5), VipErrorKind::Other(5));
    }

    #[test]
    fn test_vip_error_kind_is_retryable() {
        assert!(VipErrorKind::Again.is_retryable());
        assert!(VipErrorKind::Unreachable.is_retryable());
        assert!(!VipErrorKind::UnknownSubsystem.is_retryable());
        assert!(!VipErrorKind::Other(1).is_retryable());
    }

    #[test]
    fn test_vip_error_from_numeric_args() {
        let args = vec![json!(113), json!("no route"), json!("peer-a"), json!("rpc")];
        let err = VipError::from_args(&args).unwrap();
        assert_eq!(err.kind(), VipErrorKind::Unreachable);
        assert_eq!(err.message, "no route");
        assert_eq!(err.peer, "peer-a");
        assert_eq!(err.subsystem, "rpc");
    }

    #[test]
    fn test_vip_error_from_string_sentinel() {
        let args = vec![json!("93"), json!("unsupported"), json!(""), json!("bogus")];
        let err = VipError::from_args(&args).unwrap();
        assert_eq!(err.kind(), VipErrorKind::UnknownSubsystem);
        assert_eq!(err.subsystem, "bogus");
    }

    #[test]
    fn test_vip_error_too_few_args() {
        let args = vec![json!(11), json!("again"), json!("peer")];
        assert!(VipError::from_args(&args).is_none());
    }

    #[test]
    fn test_vip_error_bad_errno() {
        let args = vec![json!("x"), json!("m"), json!("p"), json!("s")];
        assert!(VipError::from_args(&args).is_none());
    }

    #[test]
    fn test_vip_error_into_core_error() {
        let ce: CoreError = VipError::new(11, "busy", "", "pubsub").into();
        assert!(matches!(ce, CoreError::Vip(_)));
        assert!(ce.to_string().contains("busy"));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
