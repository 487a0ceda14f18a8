use std::mem::ManuallyDrop;
use std::os::raw::c_int;

use tvmrt::abi::{DLDataType, DLDevice, DataTypeCode, DeviceType, TvmHandle};

use crate::base::{check_call, RefLong};
use crate::error::{BridgeError, BridgeResult};
use crate::lib_info::LibInfo;

pub const FLOAT32: DLDataType = DLDataType::new(DataTypeCode::Float, 32, 1);
pub const INT32: DLDataType = DLDataType::new(DataTypeCode::Int, 32, 1);
pub const UINT8: DLDataType = DLDataType::new(DataTypeCode::UInt, 8, 1);
pub const CPU: DLDevice = DLDevice::new(DeviceType::Cpu, 0);

/// Owned reference to a runtime tensor, freed on drop.
#[derive(Debug)]
pub struct NDArray {
    handle: TvmHandle,
    dtype: DLDataType,
    device: DLDevice,
    lib: LibInfo,
}

impl NDArray {
    /// Allocates a zero-filled tensor.
    pub fn empty(
        lib: &LibInfo,
        shape: &[i64],
        dtype: DLDataType,
        device: DLDevice,
    ) -> BridgeResult<NDArray> {
        let mut handle = RefLong::default();
        let rc = lib.array_alloc(
            shape,
            dtype.code as c_int,
            dtype.bits as c_int,
            dtype.lanes as c_int,
            device.device_type,
            device.device_id,
            &mut handle,
        );
        check_call(lib, rc)?;
        Ok(NDArray {
            handle: handle.value,
            dtype,
            device,
            lib: lib.clone(),
        })
    }

    /// # Safety
    /// `handle` must be a live tensor handle of `lib`'s runtime with the given
    /// dtype and device, and the caller's reference moves into the wrapper.
    pub unsafe fn from_raw(
        lib: LibInfo,
        handle: TvmHandle,
        dtype: DLDataType,
        device: DLDevice,
    ) -> NDArray {
        NDArray {
            handle,
            dtype,
            device,
            lib,
        }
    }

    pub fn into_raw(self) -> TvmHandle {
        let this = ManuallyDrop::new(self);
        // Drop the library binding, skip the free.
        drop(unsafe { std::ptr::read(&this.lib) });
        this.handle
    }

    pub fn handle(&self) -> TvmHandle {
        self.handle
    }

    pub fn dtype(&self) -> DLDataType {
        self.dtype
    }

    pub fn device(&self) -> DLDevice {
        self.device
    }

    pub fn shape(&self) -> BridgeResult<Vec<i64>> {
        let mut shape = Vec::new();
        check_call(&self.lib, self.lib.array_get_shape(self.handle, &mut shape))?;
        Ok(shape)
    }

    /// Bytes needed by `copy_from_bytes` / `copy_to_bytes`.
    pub fn nbytes(&self) -> BridgeResult<usize> {
        let elements = self.shape()?.iter().try_fold(1usize, |acc, &dim| {
            usize::try_from(dim).ok().and_then(|d| acc.checked_mul(d))
        });
        elements
            .and_then(|n| n.checked_mul(self.dtype.element_bytes()))
            .ok_or_else(|| BridgeError::InvalidArgument("tensor size overflows usize".into()))
    }

    pub fn copy_from_bytes(&self, data: &[u8]) -> BridgeResult<()> {
        check_call(&self.lib, self.lib.array_copy_from_bytes(data, self.handle))
    }

    pub fn copy_to_bytes(&self, out: &mut [u8]) -> BridgeResult<()> {
        check_call(&self.lib, self.lib.array_copy_to_bytes(self.handle, out))
    }

    pub fn to_bytes(&self) -> BridgeResult<Vec<u8>> {
        let mut out = vec![0u8; self.nbytes()?];
        self.copy_to_bytes(&mut out)?;
        Ok(out)
    }

    /// Copies this tensor into `target`. May complete asynchronously when
    /// either side lives on an accelerator; see [`synchronize`].
    pub fn copy_to(&self, target: &NDArray) -> BridgeResult<()> {
        check_call(
            &self.lib,
            self.lib.array_copy_from_to(self.handle, target.handle),
        )
    }
}

impl Drop for NDArray {
    fn drop(&mut self) {
        let rc = self.lib.array_free(self.handle);
        if rc != 0 {
            tracing::warn!(
                handle = self.handle,
                "failed to free tensor: {}",
                self.lib.get_last_error()
            );
        }
    }
}

/// Blocks until all work queued on `device` has finished.
pub fn synchronize(lib: &LibInfo, device: DLDevice) -> BridgeResult<()> {
    check_call(lib, lib.synchronize(device.device_type, device.device_id))
}
