use std::sync::{Arc, Mutex, MutexGuard};

use crate::abi::{DLDataType, DLDevice, DataTypeCode, TvmHandle};
use crate::device::{self, Pending};
use crate::error::{RuntimeError, RuntimeResult};
use crate::handles::{self, HandleKind, Object};

/// Host-backed storage for one n-dimensional array.
#[derive(Debug)]
pub(crate) struct TensorEntry {
    pub shape: Vec<i64>,
    pub dtype: DLDataType,
    pub device: DLDevice,
    nbytes: usize,
    data: Mutex<Vec<u8>>,
    inflight: Pending,
}

impl TensorEntry {
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    fn data(&self) -> RuntimeResult<MutexGuard<'_, Vec<u8>>> {
        self.data
            .lock()
            .map_err(|_| RuntimeError::native("tensor storage poisoned"))
    }
}

pub(crate) fn validate_dtype(dtype: DLDataType) -> RuntimeResult<()> {
    let int = DataTypeCode::Int as u8;
    let uint = DataTypeCode::UInt as u8;
    let float = DataTypeCode::Float as u8;
    let bfloat = DataTypeCode::BFloat as u8;
    let supported = match dtype.code {
        c if c == int || c == uint => matches!(dtype.bits, 8 | 16 | 32 | 64),
        c if c == float => matches!(dtype.bits, 16 | 32 | 64),
        c if c == bfloat => dtype.bits == 16,
        _ => false,
    };
    if !supported || dtype.lanes == 0 {
        return Err(RuntimeError::invalid(format!(
            "unsupported dtype (code={}, bits={}, lanes={})",
            dtype.code, dtype.bits, dtype.lanes
        )));
    }
    Ok(())
}

/// `product(shape) * bits/8 * lanes`, rejecting negative dims and overflow.
pub(crate) fn byte_size(shape: &[i64], dtype: DLDataType) -> RuntimeResult<usize> {
    let mut elements: usize = 1;
    for &dim in shape {
        let dim = usize::try_from(dim)
            .map_err(|_| RuntimeError::invalid(format!("negative dimension {} in shape", dim)))?;
        elements = elements
            .checked_mul(dim)
            .ok_or_else(|| RuntimeError::invalid("shape is too large"))?;
    }
    elements
        .checked_mul(dtype.element_bytes())
        .ok_or_else(|| RuntimeError::invalid("shape is too large"))
}

pub(crate) fn alloc(shape: &[i64], dtype: DLDataType, device: DLDevice) -> RuntimeResult<TvmHandle> {
    validate_dtype(dtype)?;
    device::validate(device)?;
    let nbytes = byte_size(shape, dtype)?;
    let mut storage = Vec::new();
    storage.try_reserve_exact(nbytes).map_err(|err| {
        RuntimeError::native(format!("cannot allocate {} bytes for tensor: {}", nbytes, err))
    })?;
    storage.resize(nbytes, 0u8);
    let entry = TensorEntry {
        shape: shape.to_vec(),
        dtype,
        device,
        nbytes,
        data: Mutex::new(storage),
        inflight: Pending::default(),
    };
    let handle = handles::insert(Object::Tensor(Arc::new(entry)))?;
    tracing::debug!(handle, ?shape, ?dtype, ?device, "tensor allocated");
    Ok(handle)
}

pub(crate) fn shape(handle: TvmHandle) -> RuntimeResult<Vec<i64>> {
    Ok(handles::tensor(handle)?.shape.clone())
}

pub(crate) fn meta(handle: TvmHandle) -> RuntimeResult<(DLDataType, DLDevice)> {
    let entry = handles::tensor(handle)?;
    Ok((entry.dtype, entry.device))
}

fn copy_data(src: &TensorEntry, dst: &TensorEntry) -> RuntimeResult<()> {
    let bytes = src.data()?.clone();
    dst.data()?.copy_from_slice(&bytes);
    Ok(())
}

/// Copies `src` into `dst`. Copies touching an `ExtDev` tensor are queued on
/// that device and may still be running when this returns.
pub(crate) fn copy_from_to(src: TvmHandle, dst: TvmHandle) -> RuntimeResult<()> {
    let src_entry = handles::tensor(src)?;
    let dst_entry = handles::tensor(dst)?;
    if src_entry.shape != dst_entry.shape || src_entry.dtype != dst_entry.dtype {
        return Err(RuntimeError::invalid(format!(
            "cannot copy tensor of shape {:?} ({:?}) into tensor of shape {:?} ({:?})",
            src_entry.shape, src_entry.dtype, dst_entry.shape, dst_entry.dtype
        )));
    }
    if Arc::ptr_eq(&src_entry, &dst_entry) {
        return Ok(());
    }
    // Work already queued against either tensor must land first.
    src_entry.inflight.wait()?;
    dst_entry.inflight.wait()?;

    let target = if device::is_async(dst_entry.device) {
        dst_entry.device
    } else {
        src_entry.device
    };
    src_entry.inflight.begin()?;
    dst_entry.inflight.begin()?;
    let (s, d) = (src_entry.clone(), dst_entry.clone());
    let submitted = device::submit(
        target,
        Box::new(move || {
            if let Err(err) = copy_data(&s, &d) {
                tracing::error!("tensor copy failed: {}", err);
            }
            s.inflight.finish();
            d.inflight.finish();
        }),
    );
    if let Err(err) = submitted {
        src_entry.inflight.finish();
        dst_entry.inflight.finish();
        return Err(err);
    }
    Ok(())
}

fn check_len(entry: &TensorEntry, len: usize) -> RuntimeResult<()> {
    if len != entry.nbytes {
        return Err(RuntimeError::invalid(format!(
            "byte buffer has {} bytes but tensor of shape {:?} needs {}",
            len, entry.shape, entry.nbytes
        )));
    }
    Ok(())
}

pub(crate) fn copy_from_bytes(bytes: &[u8], dst: TvmHandle) -> RuntimeResult<()> {
    let entry = handles::tensor(dst)?;
    check_len(&entry, bytes.len())?;
    entry.inflight.wait()?;
    entry.data()?.copy_from_slice(bytes);
    Ok(())
}

pub(crate) fn copy_to_bytes(src: TvmHandle, out: &mut [u8]) -> RuntimeResult<()> {
    let entry = handles::tensor(src)?;
    check_len(&entry, out.len())?;
    entry.inflight.wait()?;
    out.copy_from_slice(&entry.data()?);
    Ok(())
}

pub(crate) fn free(handle: TvmHandle) -> RuntimeResult<()> {
    handles::release(handle, Some(HandleKind::Tensor))
}
