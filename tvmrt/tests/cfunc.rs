use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tvmrt::abi::{TvmValue, TypeCode};
use tvmrt::{
    tvm_api_set_last_error, tvm_func_call, tvm_func_create_from_cfunc, tvm_func_free,
    tvm_func_get_global, tvm_func_push_arg_long, tvm_get_last_error, tvm_object_retain,
    TVM_ERR_INVALID_ARGUMENT, TVM_ERR_NATIVE,
};

fn last_error() -> String {
    unsafe { CStr::from_ptr(tvm_get_last_error()) }
        .to_string_lossy()
        .into_owned()
}

unsafe extern "C" fn sum_ints(
    args: *const TvmValue,
    type_codes: *const c_int,
    num_args: c_int,
    ret_val: *mut TvmValue,
    ret_type_code: *mut c_int,
    resource: *mut c_void,
) -> c_int {
    let calls = &*(resource as *const AtomicUsize);
    calls.fetch_add(1, Ordering::SeqCst);
    let mut total = 0i64;
    for i in 0..num_args as usize {
        if *type_codes.add(i) != TypeCode::Int as c_int {
            let msg = CString::new("sum_ints only takes integers").unwrap();
            tvm_api_set_last_error(msg.as_ptr());
            return TVM_ERR_INVALID_ARGUMENT;
        }
        total += (*args.add(i)).v_int64;
    }
    (*ret_val).v_int64 = total;
    *ret_type_code = TypeCode::Int as c_int;
    0
}

unsafe extern "C" fn always_fails(
    _args: *const TvmValue,
    _type_codes: *const c_int,
    _num_args: c_int,
    _ret_val: *mut TvmValue,
    _ret_type_code: *mut c_int,
    _resource: *mut c_void,
) -> c_int {
    let msg = CString::new("callback exploded").unwrap();
    tvm_api_set_last_error(msg.as_ptr());
    -1
}

/// Calls `testing.add(args[0], 100)` from inside a call.
unsafe extern "C" fn nested_add(
    args: *const TvmValue,
    _type_codes: *const c_int,
    _num_args: c_int,
    ret_val: *mut TvmValue,
    ret_type_code: *mut c_int,
    _resource: *mut c_void,
) -> c_int {
    let name = CString::new("testing.add").unwrap();
    let mut add = 0i64;
    let rc = tvm_func_get_global(name.as_ptr(), &mut add);
    if rc != 0 {
        return rc;
    }
    tvm_func_push_arg_long((*args).v_int64);
    tvm_func_push_arg_long(100);
    let rc = tvm_func_call(add, ret_val, ret_type_code);
    tvm_func_free(add);
    rc
}

static FINALIZED: AtomicBool = AtomicBool::new(false);

unsafe extern "C" fn mark_finalized(resource: *mut c_void) {
    let flag = &*(resource as *const AtomicBool);
    flag.store(true, Ordering::SeqCst);
}

fn call(handle: i64) -> (i32, TvmValue, i32) {
    let mut ret = TvmValue::null();
    let mut code = -1;
    let rc = unsafe { tvm_func_call(handle, &mut ret, &mut code) };
    (rc, ret, code)
}

#[test]
fn cfunc_sees_arguments_and_resource() {
    let calls = Box::new(AtomicUsize::new(0));
    let mut handle = 0i64;
    let rc = unsafe {
        tvm_func_create_from_cfunc(
            Some(sum_ints),
            &*calls as *const AtomicUsize as *mut c_void,
            None,
            &mut handle,
        )
    };
    assert_eq!(rc, 0, "{}", last_error());

    for v in [1, 2, 3, 4] {
        tvm_func_push_arg_long(v);
    }
    let (rc, ret, code) = call(handle);
    assert_eq!(rc, 0, "{}", last_error());
    assert_eq!(code, TypeCode::Int as i32);
    assert_eq!(unsafe { ret.v_int64 }, 10);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(tvm_func_free(handle), 0);
}

#[test]
fn cfunc_failure_surfaces_its_message() {
    let mut handle = 0i64;
    let rc = unsafe {
        tvm_func_create_from_cfunc(Some(always_fails), std::ptr::null_mut(), None, &mut handle)
    };
    assert_eq!(rc, 0);
    let (rc, _, _) = call(handle);
    assert_eq!(rc, TVM_ERR_NATIVE);
    assert_eq!(last_error(), "callback exploded");
    assert_eq!(tvm_func_free(handle), 0);
}

#[test]
fn cfunc_status_kind_is_preserved() {
    let calls = Box::new(AtomicUsize::new(0));
    let mut handle = 0i64;
    let rc = unsafe {
        tvm_func_create_from_cfunc(
            Some(sum_ints),
            &*calls as *const AtomicUsize as *mut c_void,
            None,
            &mut handle,
        )
    };
    assert_eq!(rc, 0);
    tvmrt::tvm_func_push_arg_double(1.0);
    let (rc, _, _) = call(handle);
    assert_eq!(rc, TVM_ERR_INVALID_ARGUMENT);
    assert_eq!(last_error(), "sum_ints only takes integers");
    assert_eq!(tvm_func_free(handle), 0);
}

#[test]
fn cfunc_may_call_back_into_the_runtime() {
    let mut handle = 0i64;
    let rc = unsafe {
        tvm_func_create_from_cfunc(Some(nested_add), std::ptr::null_mut(), None, &mut handle)
    };
    assert_eq!(rc, 0);
    tvm_func_push_arg_long(5);
    let (rc, ret, _) = call(handle);
    assert_eq!(rc, 0, "{}", last_error());
    assert_eq!(unsafe { ret.v_int64 }, 105);
    assert_eq!(tvm_func_free(handle), 0);
}

#[test]
fn finalizer_runs_on_last_release() {
    let mut handle = 0i64;
    let rc = unsafe {
        tvm_func_create_from_cfunc(
            Some(always_fails),
            &FINALIZED as *const AtomicBool as *mut c_void,
            Some(mark_finalized),
            &mut handle,
        )
    };
    assert_eq!(rc, 0);
    assert_eq!(tvm_object_retain(handle), 0);
    assert_eq!(tvm_func_free(handle), 0);
    assert!(!FINALIZED.load(Ordering::SeqCst));
    assert_eq!(tvm_func_free(handle), 0);
    assert!(FINALIZED.load(Ordering::SeqCst));
}

#[test]
fn null_function_pointer_is_rejected() {
    let mut handle = 0i64;
    let rc = unsafe {
        tvm_func_create_from_cfunc(None, std::ptr::null_mut(), None, &mut handle)
    };
    assert_eq!(rc, TVM_ERR_INVALID_ARGUMENT);
    assert_eq!(handle, 0);
}
