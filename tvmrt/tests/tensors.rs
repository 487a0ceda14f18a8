use std::ffi::CStr;
use std::ptr;

use tvmrt::abi::{DLDataType, DLDevice, DataTypeCode, DeviceType};
use tvmrt::{
    tvm_array_alloc, tvm_array_copy_from_bytes, tvm_array_copy_from_to,
    tvm_array_copy_to_bytes, tvm_array_free, tvm_array_get_meta, tvm_array_get_shape, tvm_free,
    tvm_get_last_error, tvm_synchronize, TVM_ERR_INVALID_ARGUMENT, TVM_ERR_NATIVE,
};

const CPU: DLDevice = DLDevice::new(DeviceType::Cpu, 0);
const EXT: DLDevice = DLDevice::new(DeviceType::ExtDev, 0);

fn last_error() -> String {
    unsafe { CStr::from_ptr(tvm_get_last_error()) }
        .to_string_lossy()
        .into_owned()
}

fn try_alloc(shape: &[i64], dtype: DLDataType, device: DLDevice) -> Result<i64, i32> {
    let mut handle = 0i64;
    let rc = unsafe {
        tvm_array_alloc(
            shape.as_ptr(),
            shape.len() as i32,
            dtype.code as i32,
            dtype.bits as i32,
            dtype.lanes as i32,
            device.device_type,
            device.device_id,
            &mut handle,
        )
    };
    if rc == 0 {
        Ok(handle)
    } else {
        Err(rc)
    }
}

fn alloc(shape: &[i64], dtype: DLDataType, device: DLDevice) -> i64 {
    try_alloc(shape, dtype, device).unwrap_or_else(|rc| panic!("alloc failed ({}): {}", rc, last_error()))
}

fn read(handle: i64, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let rc = unsafe { tvm_array_copy_to_bytes(handle, out.as_mut_ptr(), out.len()) };
    assert_eq!(rc, 0, "{}", last_error());
    out
}

fn write(handle: i64, bytes: &[u8]) -> i32 {
    unsafe { tvm_array_copy_from_bytes(bytes.as_ptr(), bytes.len(), handle) }
}

fn i32_dtype() -> DLDataType {
    DLDataType::new(DataTypeCode::Int, 32, 1)
}

#[test]
fn bytes_round_trip_through_tensor() {
    let t = alloc(&[2, 2], i32_dtype(), CPU);
    let data: Vec<u8> = [1i32, -2, 3, -4]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    assert_eq!(write(t, &data), 0, "{}", last_error());
    assert_eq!(read(t, 16), data);
    assert_eq!(tvm_array_free(t), 0);
}

#[test]
fn shape_query_returns_dimensions() {
    let t = alloc(&[2, 3, 4], DLDataType::new(DataTypeCode::Float, 32, 1), CPU);
    let mut json = ptr::null_mut();
    let mut len = 0usize;
    let rc = unsafe { tvm_array_get_shape(t, &mut json, &mut len) };
    assert_eq!(rc, 0, "{}", last_error());
    let bytes = unsafe { std::slice::from_raw_parts(json, len) }.to_vec();
    unsafe { tvm_free(json, len) };
    let shape: Vec<i64> = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(shape, vec![2, 3, 4]);
    assert_eq!(tvm_array_free(t), 0);
}

#[test]
fn wrong_buffer_length_leaves_tensor_untouched() {
    let t = alloc(&[4], DLDataType::new(DataTypeCode::UInt, 8, 1), CPU);
    assert_eq!(write(t, &[1, 2, 3, 4]), 0);
    assert_eq!(write(t, &[9, 9, 9]), TVM_ERR_INVALID_ARGUMENT);
    assert!(last_error().contains("needs 4"));
    assert_eq!(read(t, 4), vec![1, 2, 3, 4]);

    let mut short = vec![0u8; 5];
    let rc = unsafe { tvm_array_copy_to_bytes(t, short.as_mut_ptr(), short.len()) };
    assert_eq!(rc, TVM_ERR_INVALID_ARGUMENT);
    assert_eq!(tvm_array_free(t), 0);
}

#[test]
fn meta_reports_dtype_and_device() {
    let dtype = DLDataType::new(DataTypeCode::Float, 16, 4);
    let t = alloc(&[3], dtype, EXT);
    let mut out_dtype = DLDataType::new(DataTypeCode::Int, 8, 1);
    let mut out_device = CPU;
    let rc = unsafe { tvm_array_get_meta(t, &mut out_dtype, &mut out_device) };
    assert_eq!(rc, 0, "{}", last_error());
    assert_eq!(out_dtype, dtype);
    assert_eq!(out_device, EXT);
    assert_eq!(tvm_array_free(t), 0);
}

#[test]
fn host_to_host_copy_requires_matching_layout() {
    let src = alloc(&[3], i32_dtype(), CPU);
    let dst = alloc(&[3], i32_dtype(), CPU);
    let other = alloc(&[4], i32_dtype(), CPU);
    let data: Vec<u8> = (0u8..12).collect();
    assert_eq!(write(src, &data), 0);

    assert_eq!(tvm_array_copy_from_to(src, dst), 0, "{}", last_error());
    assert_eq!(read(dst, 12), data);
    assert_eq!(tvm_array_copy_from_to(src, other), TVM_ERR_INVALID_ARGUMENT);

    for t in [src, dst, other] {
        assert_eq!(tvm_array_free(t), 0);
    }
}

#[test]
fn extdev_copy_completes_after_synchronize() {
    let len = 1 << 16;
    let src = alloc(&[len], DLDataType::new(DataTypeCode::UInt, 8, 1), CPU);
    let dst = alloc(&[len], DLDataType::new(DataTypeCode::UInt, 8, 1), EXT);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    assert_eq!(write(src, &data), 0);

    assert_eq!(tvm_array_copy_from_to(src, dst), 0, "{}", last_error());
    assert_eq!(tvm_synchronize(EXT.device_type, EXT.device_id), 0);
    assert_eq!(read(dst, len as usize), data);

    let back = alloc(&[len], DLDataType::new(DataTypeCode::UInt, 8, 1), CPU);
    assert_eq!(tvm_array_copy_from_to(dst, back), 0);
    assert_eq!(tvm_synchronize(EXT.device_type, EXT.device_id), 0);
    assert_eq!(read(back, len as usize), data);

    for t in [src, dst, back] {
        assert_eq!(tvm_array_free(t), 0);
    }
}

#[test]
fn alloc_rejects_bad_arguments() {
    let cuda = DLDevice::new(DeviceType::Cuda, 0);
    assert_eq!(try_alloc(&[2], i32_dtype(), cuda), Err(TVM_ERR_INVALID_ARGUMENT));
    assert!(last_error().contains("unsupported device type"));
    assert_eq!(try_alloc(&[-1], i32_dtype(), CPU), Err(TVM_ERR_INVALID_ARGUMENT));
    let bad = DLDataType::new(DataTypeCode::Float, 8, 1);
    assert_eq!(try_alloc(&[2], bad, CPU), Err(TVM_ERR_INVALID_ARGUMENT));
    assert_eq!(
        tvm_synchronize(DeviceType::Metal as i32, 0),
        TVM_ERR_INVALID_ARGUMENT
    );
}

#[test]
fn alloc_beyond_available_memory_returns_status() {
    let u8_dtype = DLDataType::new(DataTypeCode::UInt, 8, 1);
    let rc = try_alloc(&[1 << 46], u8_dtype, CPU);
    assert_eq!(rc, Err(TVM_ERR_NATIVE));
    assert!(last_error().contains("cannot allocate"), "{}", last_error());

    // The runtime keeps working afterwards.
    let t = alloc(&[4], u8_dtype, CPU);
    assert_eq!(tvm_array_free(t), 0);
}

#[test]
fn ext_device_ids_are_bounded() {
    let last = DLDevice::new(DeviceType::ExtDev, 63);
    let t = alloc(&[1], i32_dtype(), last);
    assert_eq!(tvm_array_free(t), 0);

    let beyond = DLDevice::new(DeviceType::ExtDev, 64);
    assert_eq!(try_alloc(&[1], i32_dtype(), beyond), Err(TVM_ERR_INVALID_ARGUMENT));
    assert!(last_error().contains("device id"), "{}", last_error());
    assert_eq!(
        tvm_synchronize(beyond.device_type, beyond.device_id),
        TVM_ERR_INVALID_ARGUMENT
    );
}

#[test]
fn double_free_reports_stale_handle() {
    let t = alloc(&[1], i32_dtype(), CPU);
    assert_eq!(tvm_array_free(t), 0);
    assert_eq!(tvm_array_free(t), TVM_ERR_INVALID_ARGUMENT);
    assert!(last_error().contains("stale handle"));
    assert_eq!(write(t, &[0, 0, 0, 0]), TVM_ERR_INVALID_ARGUMENT);
}
