use std::os::raw::c_int;

use thiserror::Error;
use tvmrt::{
    TVM_ERR_ALREADY_EXISTS, TVM_ERR_INVALID_ARGUMENT, TVM_ERR_NATIVE, TVM_ERR_NOT_FOUND, TVM_OK,
};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("native failure: {0}")]
    NativeFailure(String),
    #[error("runtime library: {0}")]
    Library(String),
    #[error("config: {0}")]
    Config(String),
    #[error("callback failed: {0}")]
    Callback(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub fn from_status(status: c_int, message: String) -> Self {
        match status {
            TVM_ERR_NOT_FOUND => BridgeError::NotFound(message),
            TVM_ERR_ALREADY_EXISTS => BridgeError::AlreadyExists(message),
            TVM_ERR_INVALID_ARGUMENT => BridgeError::InvalidArgument(message),
            _ => BridgeError::NativeFailure(message),
        }
    }

    /// Status reported to the runtime when this error escapes a callback.
    pub fn status(&self) -> c_int {
        match self {
            BridgeError::NotFound(_) => TVM_ERR_NOT_FOUND,
            BridgeError::AlreadyExists(_) => TVM_ERR_ALREADY_EXISTS,
            BridgeError::InvalidArgument(_) => TVM_ERR_INVALID_ARGUMENT,
            _ => TVM_ERR_NATIVE,
        }
    }

    /// Message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            BridgeError::NotFound(m)
            | BridgeError::AlreadyExists(m)
            | BridgeError::InvalidArgument(m)
            | BridgeError::NativeFailure(m)
            | BridgeError::Library(m)
            | BridgeError::Config(m)
            | BridgeError::Callback(m) => m,
        }
    }
}

pub(crate) fn is_ok(status: c_int) -> bool {
    status == TVM_OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_error() {
        for status in [TVM_ERR_NOT_FOUND, TVM_ERR_ALREADY_EXISTS, TVM_ERR_INVALID_ARGUMENT] {
            let err = BridgeError::from_status(status, "x".into());
            assert_eq!(err.status(), status);
        }
        let err = BridgeError::from_status(-99, "odd".into());
        assert!(matches!(err, BridgeError::NativeFailure(_)));
        assert_eq!(err.status(), TVM_ERR_NATIVE);
    }

    #[test]
    fn display_keeps_native_message() {
        let err = BridgeError::NotFound("global function `x` is not registered".into());
        assert_eq!(err.to_string(), "not found: global function `x` is not registered");
        assert_eq!(err.message(), "global function `x` is not registered");
    }
}
