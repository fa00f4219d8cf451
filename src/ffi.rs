use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};

use chrono::NaiveDate;

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::gateway::Gateway;
use crate::op::{AggregateKey, AggregateType, DeviceId, OpId, OpKind};
use crate::reconcile::Reconciler;
use crate::remote::{RemoteRecord, decode_batch};

/// Opaque handle that owns a sync engine.
/// Swift/Objective-C hold this as an unsafe pointer and pass it back to Rust APIs.
/// Hosts that own the vendor remote client drive pull/merge/push through it.
pub struct SyncEngineHandle {
    engine: SyncEngine,
    gateway: Gateway,
    reconciler: Reconciler,
}

fn ptr_to_str<'a>(ptr: *const c_char) -> Result<&'a str, ()> {
    if ptr.is_null() {
        return Err(());
    }
    unsafe { CStr::from_ptr(ptr).to_str().map_err(|_| ()) }
}

fn to_cstring_ptr(s: &str) -> *mut c_char {
    CString::new(s).map(|cs| cs.into_raw()).unwrap_or(std::ptr::null_mut())
}

fn to_json_ptr<T: serde::Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(s) => to_cstring_ptr(&s),
        Err(_) => std::ptr::null_mut(),
    }
}

fn parse_key(
    aggregate_type: *const c_char,
    aggregate_id: *const c_char,
) -> Result<AggregateKey, ()> {
    let t = AggregateType::parse(ptr_to_str(aggregate_type)?).ok_or(())?;
    Ok(AggregateKey::new(t, ptr_to_str(aggregate_id)?))
}

fn handle_ref<'a>(handle: *mut SyncEngineHandle) -> Option<&'a SyncEngineHandle> {
    unsafe { handle.as_ref() }
}

/// Free a C string returned by this library.
#[unsafe(no_mangle)]
pub extern "C" fn sync_string_free(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe { let _ = CString::from_raw(s); }
}

/// Open the operation log at `path` (file path or ":memory:") for `device_id`.
/// Returns null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn sync_open(
    path: *const c_char,
    device_id: *const c_char,
) -> *mut SyncEngineHandle {
    let (path, device_id) = match (ptr_to_str(path), ptr_to_str(device_id)) {
        (Ok(p), Ok(d)) => (p, d),
        _ => return std::ptr::null_mut(),
    };
    match SyncEngine::open(path, DeviceId::new(device_id), SyncConfig::default()) {
        Ok(engine) => {
            let gateway = engine.gateway();
            let reconciler = engine.reconciler();
            Box::into_raw(Box::new(SyncEngineHandle {
                engine,
                gateway,
                reconciler,
            }))
        }
        Err(_) => std::ptr::null_mut(),
    }
}

/// Close a previously opened handle.
#[unsafe(no_mangle)]
pub extern "C" fn sync_close(handle: *mut SyncEngineHandle) {
    if handle.is_null() {
        return;
    }
    unsafe { let _ = Box::from_raw(handle); }
}

/// Record a local operation. `kind_json` is an `OpKind` object.
/// Returns `{"operation":..,"snapshot":..}` or null on error.
#[unsafe(no_mangle)]
pub extern "C" fn sync_record(
    handle: *mut SyncEngineHandle,
    aggregate_type: *const c_char,
    aggregate_id: *const c_char,
    kind_json: *const c_char,
) -> *mut c_char {
    let Some(h) = handle_ref(handle) else { return std::ptr::null_mut() };
    let Ok(key) = parse_key(aggregate_type, aggregate_id) else { return std::ptr::null_mut() };
    let kind: OpKind = match ptr_to_str(kind_json).map(serde_json::from_str) {
        Ok(Ok(k)) => k,
        _ => return std::ptr::null_mut(),
    };
    match h.gateway.record(&key, kind) {
        Ok(recorded) => to_json_ptr(&recorded),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Feed a raw daily step total (`date` as YYYY-MM-DD). Returns the recorded
/// operation JSON, the string "null" when nothing increased, or null on error.
#[unsafe(no_mangle)]
pub extern "C" fn sync_observe_steps(
    handle: *mut SyncEngineHandle,
    date: *const c_char,
    raw_count: u64,
) -> *mut c_char {
    let Some(h) = handle_ref(handle) else { return std::ptr::null_mut() };
    let date = match ptr_to_str(date).map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d")) {
        Ok(Ok(d)) => d,
        _ => return std::ptr::null_mut(),
    };
    match h.gateway.observe_daily_steps(date, raw_count) {
        Ok(recorded) => to_json_ptr(&recorded),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Current snapshot JSON of an aggregate, or null on error.
#[unsafe(no_mangle)]
pub extern "C" fn sync_snapshot_json(
    handle: *mut SyncEngineHandle,
    aggregate_type: *const c_char,
    aggregate_id: *const c_char,
) -> *mut c_char {
    let Some(h) = handle_ref(handle) else { return std::ptr::null_mut() };
    let Ok(key) = parse_key(aggregate_type, aggregate_id) else { return std::ptr::null_mut() };
    match h.gateway.snapshot(&key) {
        Ok(snapshot) => to_json_ptr(&snapshot),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Unacknowledged local operations of an aggregate as a JSON array of remote
/// records, ready to push. Returns null on error.
#[unsafe(no_mangle)]
pub extern "C" fn sync_pending_ops_json(
    handle: *mut SyncEngineHandle,
    aggregate_type: *const c_char,
    aggregate_id: *const c_char,
    limit: i64,
) -> *mut c_char {
    let Some(h) = handle_ref(handle) else { return std::ptr::null_mut() };
    let Ok(key) = parse_key(aggregate_type, aggregate_id) else { return std::ptr::null_mut() };
    let limit = usize::try_from(limit).unwrap_or(0);
    match h.engine.log().pending_ops(&key, limit) {
        Ok(ops) => match ops.iter().map(RemoteRecord::try_from).collect::<Result<Vec<_>, _>>() {
            Ok(records) => to_json_ptr(&records),
            Err(_) => std::ptr::null_mut(),
        },
        Err(_) => std::ptr::null_mut(),
    }
}

/// Mark operations (JSON array of op id strings) as acknowledged. Returns 0 on success.
#[unsafe(no_mangle)]
pub extern "C" fn sync_mark_ops_acked(
    handle: *mut SyncEngineHandle,
    ids_json: *const c_char,
) -> c_int {
    let Some(h) = handle_ref(handle) else { return 2 };
    let ids: Vec<OpId> = match ptr_to_str(ids_json).map(serde_json::from_str) {
        Ok(Ok(ids)) => ids,
        _ => return 3,
    };
    match h.engine.log().mark_acked(&ids) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

/// Reconcile pulled records (JSON array) into an aggregate. Corrupt records
/// are skipped. Returns the merged snapshot JSON or null on error.
#[unsafe(no_mangle)]
pub extern "C" fn sync_apply_remote_json(
    handle: *mut SyncEngineHandle,
    aggregate_type: *const c_char,
    aggregate_id: *const c_char,
    records_json: *const c_char,
) -> *mut c_char {
    let Some(h) = handle_ref(handle) else { return std::ptr::null_mut() };
    let Ok(key) = parse_key(aggregate_type, aggregate_id) else { return std::ptr::null_mut() };
    let records: Vec<RemoteRecord> = match ptr_to_str(records_json).map(serde_json::from_str) {
        Ok(Ok(r)) => r,
        _ => return std::ptr::null_mut(),
    };
    let ops = decode_batch(&key, &records);
    match h.reconciler.reconcile(&key, &ops) {
        Ok(outcome) => to_json_ptr(&outcome.snapshot),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Get the remote cursor of an aggregate. Returns empty string if not set, null on error.
#[unsafe(no_mangle)]
pub extern "C" fn sync_get_cursor(
    handle: *mut SyncEngineHandle,
    aggregate_type: *const c_char,
    aggregate_id: *const c_char,
) -> *mut c_char {
    let Some(h) = handle_ref(handle) else { return std::ptr::null_mut() };
    let Ok(key) = parse_key(aggregate_type, aggregate_id) else { return std::ptr::null_mut() };
    match h.engine.log().cursor(&key) {
        Ok(Some(s)) => to_cstring_ptr(&s),
        Ok(None) => to_cstring_ptr(""),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Set the remote cursor of an aggregate. Returns 0 on success.
#[unsafe(no_mangle)]
pub extern "C" fn sync_set_cursor(
    handle: *mut SyncEngineHandle,
    aggregate_type: *const c_char,
    aggregate_id: *const c_char,
    cursor: *const c_char,
) -> c_int {
    let Some(h) = handle_ref(handle) else { return 2 };
    let (Ok(key), Ok(cursor)) = (parse_key(aggregate_type, aggregate_id), ptr_to_str(cursor)) else {
        return 3;
    };
    match h.engine.log().set_cursor(&key, cursor) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}
