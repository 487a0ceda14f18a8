//! Out-parameter slots and status checking shared by the typed wrappers.

use std::fmt;
use std::os::raw::c_int;

use tvmrt::abi::{TvmValue, TypeCode};

use crate::error::{self, BridgeError, BridgeResult};
use crate::lib_info::LibInfo;

/// Handle or integer out-parameter. Only written when the call succeeds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefLong {
    pub value: i64,
}

/// Typed return slot filled by `func_call`.
#[derive(Clone, Copy)]
pub struct RefValue {
    pub value: TvmValue,
    pub type_code: c_int,
}

impl Default for RefValue {
    fn default() -> Self {
        Self {
            value: TvmValue::null(),
            type_code: TypeCode::Null as c_int,
        }
    }
}

impl RefValue {
    pub fn code(&self) -> Option<TypeCode> {
        TypeCode::from_raw(self.type_code)
    }
}

impl fmt::Debug for RefValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Every variant fits in the first eight bytes; show them as an integer.
        let bits = unsafe { self.value.v_int64 };
        f.debug_struct("RefValue")
            .field("type_code", &self.code())
            .field("bits", &bits)
            .finish()
    }
}

/// Turns a status code into a `Result`, pulling the message from the
/// runtime's error channel on failure.
pub fn check_call(lib: &LibInfo, status: c_int) -> BridgeResult<()> {
    if error::is_ok(status) {
        return Ok(());
    }
    let err = BridgeError::from_status(status, lib.get_last_error());
    tracing::debug!(status, "native call failed: {}", err);
    Err(err)
}
