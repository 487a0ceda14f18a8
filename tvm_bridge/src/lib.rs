//! Managed side of the tensor runtime bridge.
//!
//! [`LibInfo`] binds the runtime's C entry points (linked in-process or loaded
//! from a shared library) and exposes them with status codes. [`Function`] and
//! [`NDArray`] are owning wrappers that turn statuses into [`BridgeResult`]s
//! and free their handles on drop. [`compat::LegacyLibInfo`] keeps the older
//! `tvmFFI*` naming working on top of the same entry points.

pub mod base;
pub mod callback;
pub mod compat;
pub mod config;
pub mod error;
pub mod function;
pub mod lib_info;
pub mod logging;
pub mod tensor;
pub mod value;

pub use base::{check_call, RefLong, RefValue};
pub use callback::Callback;
pub use compat::{LegacyLibInfo, PushOutcome, LEGACY_ENTRY_POINTS};
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use function::Function;
pub use lib_info::LibInfo;
pub use tensor::{synchronize, NDArray};
pub use tvmrt::abi::{DLDataType, DLDevice, DataTypeCode, DeviceType, TvmHandle, TypeCode};
pub use value::Value;
