//! Process-wide table of runtime-owned objects keyed by opaque handle.
//!
//! Handles come from a monotonically increasing counter and are never reused,
//! so a lookup miss below the counter is reported as a stale (freed) handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;

use crate::abi::{TvmHandle, TypeCode};
use crate::error::{RuntimeError, RuntimeResult};
use crate::registry::PackedFunc;
use crate::tensor::TensorEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    Function,
    Tensor,
}

impl HandleKind {
    fn label(self) -> &'static str {
        match self {
            HandleKind::Function => "function",
            HandleKind::Tensor => "tensor",
        }
    }
}

#[derive(Clone)]
pub(crate) enum Object {
    Function(PackedFunc),
    Tensor(Arc<TensorEntry>),
}

impl Object {
    fn kind(&self) -> HandleKind {
        match self {
            Object::Function(_) => HandleKind::Function,
            Object::Tensor(_) => HandleKind::Tensor,
        }
    }
}

struct Entry {
    object: Object,
    refcount: u32,
}

static NEXT_HANDLE: AtomicI64 = AtomicI64::new(1);
static TABLE: Lazy<Mutex<HashMap<TvmHandle, Entry>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn table() -> RuntimeResult<MutexGuard<'static, HashMap<TvmHandle, Entry>>> {
    TABLE
        .lock()
        .map_err(|_| RuntimeError::native("handle table poisoned"))
}

fn missing(handle: TvmHandle) -> RuntimeError {
    if handle > 0 && handle < NEXT_HANDLE.load(Ordering::SeqCst) {
        RuntimeError::invalid(format!("stale handle {} (already freed)", handle))
    } else {
        RuntimeError::invalid(format!("invalid handle {}", handle))
    }
}

fn wrong_kind(handle: TvmHandle, found: HandleKind, expected: HandleKind) -> RuntimeError {
    RuntimeError::invalid(format!(
        "handle {} refers to a {}, expected a {}",
        handle,
        found.label(),
        expected.label()
    ))
}

/// Stores `object` with a single reference owned by the caller.
pub(crate) fn insert(object: Object) -> RuntimeResult<TvmHandle> {
    let kind = object.kind();
    let mut guard = table()?;
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::SeqCst);
    guard.insert(
        handle,
        Entry {
            object,
            refcount: 1,
        },
    );
    tracing::trace!(handle, kind = kind.label(), "handle allocated");
    Ok(handle)
}

pub(crate) fn retain(handle: TvmHandle) -> RuntimeResult<()> {
    let mut guard = table()?;
    let entry = guard.get_mut(&handle).ok_or_else(|| missing(handle))?;
    entry.refcount = entry.refcount.saturating_add(1);
    Ok(())
}

/// Drops one reference. The object itself is dropped outside the table lock,
/// since a callback finalizer may re-enter the runtime.
pub(crate) fn release(handle: TvmHandle, expected: Option<HandleKind>) -> RuntimeResult<()> {
    let removed = {
        let mut guard = table()?;
        let entry = guard.get_mut(&handle).ok_or_else(|| missing(handle))?;
        let found = entry.object.kind();
        if let Some(expected) = expected {
            if found != expected {
                return Err(wrong_kind(handle, found, expected));
            }
        }
        entry.refcount -= 1;
        if entry.refcount == 0 {
            guard.remove(&handle)
        } else {
            None
        }
    };
    if let Some(entry) = removed {
        tracing::trace!(handle, kind = entry.object.kind().label(), "handle released");
        drop(entry);
    }
    Ok(())
}

fn get(handle: TvmHandle) -> RuntimeResult<Object> {
    let guard = table()?;
    guard
        .get(&handle)
        .map(|entry| entry.object.clone())
        .ok_or_else(|| missing(handle))
}

pub(crate) fn function(handle: TvmHandle) -> RuntimeResult<PackedFunc> {
    match get(handle)? {
        Object::Function(f) => Ok(f),
        other => Err(wrong_kind(handle, other.kind(), HandleKind::Function)),
    }
}

pub(crate) fn tensor(handle: TvmHandle) -> RuntimeResult<Arc<TensorEntry>> {
    match get(handle)? {
        Object::Tensor(t) => Ok(t),
        other => Err(wrong_kind(handle, other.kind(), HandleKind::Tensor)),
    }
}

pub fn kind(handle: TvmHandle) -> RuntimeResult<HandleKind> {
    let guard = table()?;
    guard
        .get(&handle)
        .map(|entry| entry.object.kind())
        .ok_or_else(|| missing(handle))
}

/// Checks that a handle pushed with `code` names a live object of the right kind.
pub(crate) fn check_typed(handle: TvmHandle, code: TypeCode) -> RuntimeResult<()> {
    match code {
        TypeCode::PackedFuncHandle => function(handle).map(|_| ()),
        TypeCode::NDArrayHandle | TypeCode::DLTensorHandle => tensor(handle).map(|_| ()),
        TypeCode::ObjectHandle => kind(handle).map(|_| ()),
        TypeCode::OpaqueHandle => Ok(()),
        TypeCode::ModuleHandle => Err(RuntimeError::invalid(
            "module handles are not supported by this runtime",
        )),
        other => Err(RuntimeError::invalid(format!(
            "type code {:?} is not a handle type",
            other
        ))),
    }
}

pub fn live_count() -> RuntimeResult<usize> {
    Ok(table()?.len())
}
