use std::ffi::{CStr, CString};
use std::ptr;

use tvmrt::{
    tvm_free, tvm_func_free, tvm_func_get_global, tvm_func_list_global_names,
    tvm_func_register_global, tvm_get_last_error, TVM_ERR_ALREADY_EXISTS,
    TVM_ERR_INVALID_ARGUMENT, TVM_ERR_NOT_FOUND,
};

fn last_error() -> String {
    unsafe { CStr::from_ptr(tvm_get_last_error()) }
        .to_string_lossy()
        .into_owned()
}

fn get_global(name: &str) -> Result<i64, i32> {
    let name = CString::new(name).unwrap();
    let mut handle = 0i64;
    let rc = unsafe { tvm_func_get_global(name.as_ptr(), &mut handle) };
    if rc == 0 {
        Ok(handle)
    } else {
        Err(rc)
    }
}

fn register(name: &str, handle: i64, override_existing: bool) -> i32 {
    let name = CString::new(name).unwrap();
    unsafe { tvm_func_register_global(name.as_ptr(), handle, override_existing as i32) }
}

fn list_names() -> Vec<String> {
    let mut data = ptr::null_mut();
    let mut len = 0usize;
    let rc = unsafe { tvm_func_list_global_names(&mut data, &mut len) };
    assert_eq!(rc, 0, "{}", last_error());
    let bytes = unsafe { std::slice::from_raw_parts(data, len) }.to_vec();
    unsafe { tvm_free(data, len) };
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn registered_name_resolves_to_same_handle() {
    let add = get_global("testing.add").unwrap();
    assert_eq!(register("tests.registry.alias", add, false), 0);

    let alias = get_global("tests.registry.alias").unwrap();
    assert_eq!(alias, add);
    assert!(list_names().iter().any(|n| n == "tests.registry.alias"));

    assert_eq!(tvm_func_free(alias), 0);
    assert_eq!(tvm_func_free(add), 0);
}

#[test]
fn duplicate_registration_needs_override() {
    let add = get_global("testing.add").unwrap();
    let sub = get_global("testing.sub").unwrap();
    assert_eq!(register("tests.registry.dup", add, false), 0);

    assert_eq!(register("tests.registry.dup", sub, false), TVM_ERR_ALREADY_EXISTS);
    assert!(last_error().contains("tests.registry.dup"));
    let still = get_global("tests.registry.dup").unwrap();
    assert_eq!(still, add);

    assert_eq!(register("tests.registry.dup", sub, true), 0);
    let now = get_global("tests.registry.dup").unwrap();
    assert_eq!(now, sub);

    // The caller's own references survive the override.
    for handle in [still, now, add, sub] {
        assert_eq!(tvm_func_free(handle), 0);
    }
}

#[test]
fn missing_name_is_not_found() {
    assert_eq!(get_global("tests.registry.nope"), Err(TVM_ERR_NOT_FOUND));
    assert!(last_error().contains("tests.registry.nope"));
}

#[test]
fn listed_names_are_sorted_and_include_builtins() {
    let names = list_names();
    for builtin in ["runtime.NumArgs", "testing.add", "testing.echo", "testing.sub"] {
        assert!(names.iter().any(|n| n == builtin), "missing {}", builtin);
    }
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

#[test]
fn freeing_handle_zero_is_invalid() {
    assert_eq!(tvm_func_free(0), TVM_ERR_INVALID_ARGUMENT);
    assert!(last_error().contains("invalid handle"));
}

#[test]
fn register_rejects_empty_name_and_null_pointers() {
    let add = get_global("testing.add").unwrap();
    assert_eq!(register("", add, false), TVM_ERR_INVALID_ARGUMENT);
    let rc = unsafe { tvm_func_register_global(ptr::null(), add, 0) };
    assert_eq!(rc, TVM_ERR_INVALID_ARGUMENT);
    assert!(last_error().contains("null string pointer"));
    assert_eq!(tvm_func_free(add), 0);
}
