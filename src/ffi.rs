use std::ffi::{CStr, CString, c_void};
use std::os::raw::{c_char, c_int};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::backend::{AppliedAction, Backend, BackendError, FetchRequest};
use crate::config::EngineConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{ErrorKind, Failure, SyncError, envelope, failure_envelope};
use crate::model::{CanonicalRow, Order, OrderItem, TimeWindow, UserConfirmed};
use crate::outbox::{Action, ActionPayload};
use crate::store::LocalStore;
use crate::sync::SyncEngine;

/// Host callback: receives a JSON request, returns a JSON reply
/// `{"ok":true,"value":…}` or `{"ok":false,"kind":"network"|"rejected","message":…}`.
pub type HostCallFn = extern "C" fn(ctx: *mut c_void, request_json: *const c_char) -> *mut c_char;
/// Releases a reply string produced by a host callback.
pub type HostFreeFn = extern "C" fn(ctx: *mut c_void, reply: *mut c_char);

struct HostCallbacks {
    ctx: *mut c_void,
    fetch: HostCallFn,
    apply: HostCallFn,
    free: Option<HostFreeFn>,
}

/// Backend implemented by the native shell through C callbacks.
struct HostBackend {
    callbacks: Option<HostCallbacks>,
}

impl HostBackend {
    fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        pick: impl FnOnce(&HostCallbacks) -> HostCallFn,
        request: &Req,
    ) -> Result<Resp, BackendError> {
        let Some(cb) = &self.callbacks else {
            return Err(BackendError::Network("no backend attached".into()));
        };
        let request = serde_json::to_string(request)
            .ok()
            .and_then(|s| CString::new(s).ok())
            .ok_or_else(|| BackendError::Rejected("unencodable request".into()))?;
        let raw = pick(cb)(cb.ctx, request.as_ptr());
        if raw.is_null() {
            return Err(BackendError::Network("host callback returned null".into()));
        }
        let reply = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        if let Some(free) = cb.free {
            free(cb.ctx, raw);
        }
        parse_reply(&reply)
    }
}

fn parse_reply<Resp: DeserializeOwned>(reply: &str) -> Result<Resp, BackendError> {
    let v: Value = serde_json::from_str(reply)
        .map_err(|e| BackendError::Network(format!("malformed host reply: {e}")))?;
    if v.get("ok").and_then(Value::as_bool) == Some(true) {
        return serde_json::from_value(v.get("value").cloned().unwrap_or(Value::Null))
            .map_err(|e| BackendError::Network(format!("malformed host reply: {e}")));
    }
    let message = v
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("host reported failure")
        .to_string();
    match v.get("kind").and_then(Value::as_str) {
        Some("rejected") => Err(BackendError::Rejected(message)),
        _ => Err(BackendError::Network(message)),
    }
}

impl Backend for HostBackend {
    fn fetch_rows(&self, request: &FetchRequest) -> Result<Vec<CanonicalRow>, BackendError> {
        self.call(|cb| cb.fetch, request)
    }

    fn apply_action(&self, payload: &ActionPayload) -> Result<AppliedAction, BackendError> {
        self.call(|cb| cb.apply, payload)
    }
}

/// Opaque handle owning the store, the connectivity flag and the host backend.
/// Native shells hold this as an unsafe pointer and pass it back to Rust APIs.
pub struct PosSyncHandle {
    store: LocalStore,
    connectivity: ConnectivityMonitor,
    config: EngineConfig,
    backend: HostBackend,
}

impl PosSyncHandle {
    fn engine(&self) -> SyncEngine<'_, &HostBackend> {
        SyncEngine::new(&self.store, &self.backend, &self.connectivity, &self.config)
    }
}

fn ptr_to_str<'a>(ptr: *const c_char) -> Result<&'a str, SyncError> {
    if ptr.is_null() {
        return Err(SyncError::State("null string argument"));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| SyncError::State("string argument is not utf-8"))
}

fn opt_ptr_to_str<'a>(ptr: *const c_char) -> Result<Option<&'a str>, SyncError> {
    if ptr.is_null() {
        return Ok(None);
    }
    Ok(Some(ptr_to_str(ptr)?))
}

fn to_cstring_ptr(s: &str) -> *mut c_char {
    CString::new(s).map(|cs| cs.into_raw()).unwrap_or(std::ptr::null_mut())
}

fn respond<T: Serialize>(result: Result<T, SyncError>) -> *mut c_char {
    to_cstring_ptr(&envelope(&result).to_string())
}

fn with_handle<T: Serialize>(
    handle: *mut PosSyncHandle,
    f: impl FnOnce(&PosSyncHandle) -> Result<T, SyncError>,
) -> *mut c_char {
    match unsafe { handle.as_ref() } {
        Some(h) => respond(f(h)),
        None => to_cstring_ptr(
            &failure_envelope(&Failure {
                kind: ErrorKind::InvalidState,
                message: "null handle".into(),
            })
            .to_string(),
        ),
    }
}

/// Free a C string returned by this library.
#[unsafe(no_mangle)]
pub extern "C" fn pos_sync_string_free(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe {
        let _ = CString::from_raw(s);
    }
}

/// Open the engine. `config_json` is nullable; without a `database_path`
/// the store lives in memory. An unopenable database degrades to memory.
/// Returns null on invalid configuration.
#[unsafe(no_mangle)]
pub extern "C" fn pos_sync_open(config_json: *const c_char) -> *mut PosSyncHandle {
    let config = match opt_ptr_to_str(config_json) {
        Ok(Some(s)) => match serde_json::from_str::<Value>(s)
            .map_err(SyncError::from)
            .and_then(|v| EngineConfig::from_json(&v))
        {
            Ok(c) => c,
            Err(_) => return std::ptr::null_mut(),
        },
        Ok(None) => EngineConfig::default(),
        Err(_) => return std::ptr::null_mut(),
    };
    let store = match &config.database_path {
        Some(path) => LocalStore::open_with_fallback(path),
        None => LocalStore::open_in_memory(),
    };
    match store {
        Ok(store) => Box::into_raw(Box::new(PosSyncHandle {
            store,
            connectivity: ConnectivityMonitor::new(false),
            config,
            backend: HostBackend { callbacks: None },
        })),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Close a handle returned by `pos_sync_open`.
#[unsafe(no_mangle)]
pub extern "C" fn pos_sync_close(handle: *mut PosSyncHandle) {
    if handle.is_null() {
        return;
    }
    unsafe {
        let _ = Box::from_raw(handle);
    }
}

/// Attach the host backend. `ctx` is passed back to every callback.
/// Returns 0 on success, 2 on a null handle.
#[unsafe(no_mangle)]
pub extern "C" fn pos_sync_set_backend(
    handle: *mut PosSyncHandle,
    ctx: *mut c_void,
    fetch: HostCallFn,
    apply: HostCallFn,
    free: Option<HostFreeFn>,
) -> c_int {
    match unsafe { handle.as_mut() } {
        Some(h) => {
            h.backend.callbacks = Some(HostCallbacks {
                ctx,
                fetch,
                apply,
                free,
            });
            0
        }
        None => 2,
    }
}

/// Report the platform's connectivity. Coming online runs a sync cycle for
/// `scope` and returns its report; otherwise the value is null.
#[unsafe(no_mangle)]
pub extern "C" fn pos_sync_set_online(
    handle: *mut PosSyncHandle,
    online: bool,
    scope: *const c_char,
) -> *mut c_char {
    with_handle(handle, |h| {
        let scope = ptr_to_str(scope)?;
        h.engine().handle_connectivity_change(online, scope)
    })
}

/// Queue an action given as JSON (`{"type":…,"data":…}`).
#[unsafe(no_mangle)]
pub extern "C" fn pos_sync_enqueue(
    handle: *mut PosSyncHandle,
    scope: *const c_char,
    action_json: *const c_char,
) -> *mut c_char {
    with_handle(handle, |h| {
        let scope = ptr_to_str(scope)?;
        let action: Action = serde_json::from_str(ptr_to_str(action_json)?)?;
        h.engine().enqueue_action(scope, action)
    })
}

/// Create an order offline from an order JSON object and an items JSON array.
#[unsafe(no_mangle)]
pub extern "C" fn pos_sync_create_order(
    handle: *mut PosSyncHandle,
    scope: *const c_char,
    order_json: *const c_char,
    items_json: *const c_char,
) -> *mut c_char {
    with_handle(handle, |h| {
        let scope = ptr_to_str(scope)?;
        let order: Order = serde_json::from_str(ptr_to_str(order_json)?)?;
        let items: Vec<OrderItem> = match opt_ptr_to_str(items_json)? {
            Some(s) => serde_json::from_str(s)?,
            None => Vec::new(),
        };
        h.engine().create_order_offline(scope, order, items)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn pos_sync_run_cycle(handle: *mut PosSyncHandle, scope: *const c_char) -> *mut c_char {
    with_handle(handle, |h| h.engine().run_sync_cycle(ptr_to_str(scope)?))
}

/// Outbox counts for `scope`, or for every scope when `scope` is null.
#[unsafe(no_mangle)]
pub extern "C" fn pos_sync_queue_stats(
    handle: *mut PosSyncHandle,
    scope: *const c_char,
) -> *mut c_char {
    with_handle(handle, |h| match opt_ptr_to_str(scope)? {
        Some(scope) => h.engine().queue_stats(scope),
        None => h.engine().queue_stats_all(),
    })
}

/// Compare local orders of the last `window_days` days with the backend.
#[unsafe(no_mangle)]
pub extern "C" fn pos_sync_validate(
    handle: *mut PosSyncHandle,
    scope: *const c_char,
    window_days: i64,
) -> *mut c_char {
    with_handle(handle, |h| {
        let scope = ptr_to_str(scope)?;
        let window = if window_days <= 0 {
            TimeWindow::today()
        } else {
            TimeWindow::last_days(window_days)
        };
        h.engine().validate(scope, window)
    })
}

/// Wipe all local data. `confirmed` must be true.
#[unsafe(no_mangle)]
pub extern "C" fn pos_sync_clear_all(handle: *mut PosSyncHandle, confirmed: bool) -> *mut c_char {
    with_handle(handle, |h| {
        if !confirmed {
            return Err(SyncError::State("clearing local data requires confirmation"));
        }
        h.engine().clear_all_local_data(UserConfirmed::acknowledge())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn pos_sync_export_snapshot(handle: *mut PosSyncHandle) -> *mut c_char {
    with_handle(handle, |h| h.engine().export_snapshot())
}
