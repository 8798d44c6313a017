use crate::{
    action::{ActionCall, ActionHandler},
    config::EventConfig,
    entity::{Entity, RefDrop, TableEnt},
    errors::{set_last_error, Error, ErrorCode, HandlerError},
    handle_registry::{register_handle, unregister_handle, with_handle, HandleId},
    types::{ActionRes, EntId},
    Context,
};
use std::{
    any::Any,
    ffi::{c_void, CStr},
    os::raw::c_char,
    sync::Arc,
};

/// Handler signature for actions registered over the C ABI. A negative
/// return aborts the dispatch with that code.
pub type CActionHandler = unsafe extern "C" fn(
    ctx: HandleId,
    action_id: EntId,
    handler_arg: *mut c_void,
    caller_arg: *mut c_void,
    trigger_event_id: EntId,
    route_id: EntId,
    results: *mut u32,
) -> i32;

// Opaque C pointer carried through the engine. The engine never
// dereferences it; the C side owns its thread-safety.
#[derive(Copy, Clone)]
struct CPtr(*mut c_void);

unsafe impl Send for CPtr {}
unsafe impl Sync for CPtr {}

// ─────────────────────────── helpers ─────────────────────────────────── //

#[inline]
fn cbytes<'a>(p: *const c_char) -> Result<&'a [u8], ErrorCode> {
    if p.is_null() {
        return Err(ErrorCode::InvalidArg);
    }
    Ok(unsafe { CStr::from_ptr(p) }.to_bytes())
}

/// Records `code` as this thread's last error and hands it back.
#[inline]
fn report(code: ErrorCode) -> ErrorCode {
    set_last_error(code);
    code
}

#[inline]
fn lib_err(e: Error) -> ErrorCode {
    e.code()
}

/// Writes `DEALLOCATED` into `*out` (when non-null) if the drop released
/// the entity.
fn note_drop(outcome: RefDrop, out: *mut u32) {
    if let Some(out) = unsafe { out.as_mut() } {
        let mut res = ActionRes::from_bits_retain(*out);
        if outcome.released() {
            res |= ActionRes::DEALLOCATED;
        }
        *out = res.bits();
    }
}

// ─── small helper to turn Result<T,ErrorCode> into early-return ──────────
macro_rules! try_c { ($expr:expr) => { match $expr {
    Ok(v)  => v,
    Err(e) => return report(e),
}}}

fn c_handler(handle: HandleId, handler: CActionHandler, handler_arg: CPtr) -> ActionHandler {
    Arc::new(move |call: &ActionCall<'_>, results: &mut ActionRes| {
        // Capture the whole `CPtr` (Send + Sync), not just its raw field.
        let handler_arg = handler_arg;
        let caller_arg = call
            .caller_arg
            .and_then(|a| a.downcast_ref::<CPtr>())
            .map_or(std::ptr::null_mut(), |p| p.0);
        let mut word = results.bits();
        let rc = unsafe {
            handler(
                handle,
                call.action.header().id(),
                handler_arg.0,
                caller_arg,
                call.trigger_event.map_or(0, |e| e.header().id()),
                call.route.map_or(0, |r| r.header().id()),
                &mut word,
            )
        };
        *results = ActionRes::from_bits_retain(word);
        if rc < 0 {
            return Err(HandlerError::new(rc, "C action handler failed"));
        }
        Ok(())
    })
}

// ───────────────────────── lifetime ──────────────────────────────────── //

/// Creates a context with default settings and stores its handle in `*out`.
#[no_mangle]
pub extern "C" fn sentinel_context_new(out: *mut HandleId) -> ErrorCode {
    if out.is_null() {
        return report(ErrorCode::InvalidArg);
    }
    let ctx = try_c!(Context::new().map_err(lib_err));
    unsafe { *out = register_handle(ctx) };
    report(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn sentinel_context_free(h: HandleId) -> ErrorCode {
    try_c!(unregister_handle(h));
    report(ErrorCode::Success)
}

// ───────────────────────── actions ───────────────────────────────────── //

#[no_mangle]
pub extern "C" fn sentinel_action_insert(
    h: HandleId,
    label: *const c_char,
    handler: Option<CActionHandler>,
    handler_arg: *mut c_void,
    out_id: *mut EntId,
) -> ErrorCode {
    let label = try_c!(cbytes(label));
    let handler = try_c!(handler.ok_or(ErrorCode::InvalidArg));
    let handler = c_handler(h, handler, CPtr(handler_arg));
    let id = try_c!(with_handle(h, |ctx| ctx.action_insert(label, handler, None)).and_then(|r| r.map_err(lib_err)));
    if let Some(out) = unsafe { out_id.as_mut() } {
        *out = id;
    }
    report(ErrorCode::Success)
}

/// Deletes an action by label. `out_results` (may be NULL) receives
/// `DEALLOCATED` if the action was released.
#[no_mangle]
pub extern "C" fn sentinel_action_delete(h: HandleId, label: *const c_char, out_results: *mut u32) -> ErrorCode {
    let label = try_c!(cbytes(label));
    let outcome = try_c!(with_handle(h, |ctx| ctx.action_delete(label)).and_then(|r| r.map_err(lib_err)));
    note_drop(outcome, out_results);
    report(ErrorCode::Success)
}

/// Copies the label of action `id` into `buf` (not NUL-terminated). `*out_len`
/// receives the label length, also when `buf` is too small.
#[no_mangle]
pub extern "C" fn sentinel_action_get_label(
    h: HandleId,
    id: EntId,
    buf: *mut c_char,
    buf_len: usize,
    out_len: *mut usize,
) -> ErrorCode {
    if buf.is_null() || out_len.is_null() {
        return report(ErrorCode::InvalidArg);
    }
    let label = try_c!(with_handle(h, |ctx| match ctx.get_by_id(id)? {
        Entity::Action(a) => Ok(*a.label()),
        _ => Err(Error::ItemNotFound),
    })
    .and_then(|r| r.map_err(lib_err)));
    unsafe { *out_len = label.len() };
    let dst = unsafe { std::slice::from_raw_parts_mut(buf as *mut u8, buf_len) };
    let n = try_c!(label.copy_to(dst).map_err(lib_err));
    unsafe { *out_len = n };
    report(ErrorCode::Success)
}

// ───────────────────────── events ────────────────────────────────────── //

/// Inserts an event. `config` may be NULL for the context default.
#[no_mangle]
pub extern "C" fn sentinel_event_insert(
    h: HandleId,
    label: *const c_char,
    priority: u16,
    config: *const EventConfig,
    out_id: *mut EntId,
) -> ErrorCode {
    let label = try_c!(cbytes(label));
    let config = unsafe { config.as_ref() }.copied();
    let id = try_c!(with_handle(h, |ctx| ctx.event_insert(label, priority, config)).and_then(|r| r.map_err(lib_err)));
    if let Some(out) = unsafe { out_id.as_mut() } {
        *out = id;
    }
    report(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn sentinel_event_delete(h: HandleId, label: *const c_char, out_results: *mut u32) -> ErrorCode {
    let label = try_c!(cbytes(label));
    let outcome = try_c!(with_handle(h, |ctx| ctx.event_delete(label)).and_then(|r| r.map_err(lib_err)));
    note_drop(outcome, out_results);
    report(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn sentinel_event_action_append(h: HandleId, event: *const c_char, action: *const c_char) -> ErrorCode {
    let event = try_c!(cbytes(event));
    let action = try_c!(cbytes(action));
    try_c!(with_handle(h, |ctx| ctx.event_action_append(event, action)).and_then(|r| r.map_err(lib_err)));
    report(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn sentinel_event_action_prepend(h: HandleId, event: *const c_char, action: *const c_char) -> ErrorCode {
    let event = try_c!(cbytes(event));
    let action = try_c!(cbytes(action));
    try_c!(with_handle(h, |ctx| ctx.event_action_prepend(event, action)).and_then(|r| r.map_err(lib_err)));
    report(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn sentinel_event_action_insert_after(
    h: HandleId,
    event: *const c_char,
    action: *const c_char,
    point: *const c_char,
) -> ErrorCode {
    let event = try_c!(cbytes(event));
    let action = try_c!(cbytes(action));
    let point = try_c!(cbytes(point));
    try_c!(with_handle(h, |ctx| ctx.event_action_insert_after(event, action, point)).and_then(|r| r.map_err(lib_err)));
    report(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn sentinel_event_action_delete(
    h: HandleId,
    event: *const c_char,
    action: *const c_char,
    out_results: *mut u32,
) -> ErrorCode {
    let event = try_c!(cbytes(event));
    let action = try_c!(cbytes(action));
    let outcome = try_c!(with_handle(h, |ctx| ctx.event_action_delete(event, action)).and_then(|r| r.map_err(lib_err)));
    note_drop(outcome, out_results);
    report(ErrorCode::Success)
}

/// Runs the event's action list. `*results` is read as the starting result
/// word and receives the final one, including after a handler failure.
///
/// Returns 0 on success or a negative `ErrorCode`. When a handler fails,
/// its own negative return code is passed through unchanged and the
/// thread's last error is `HandlerFailed`.
#[no_mangle]
pub extern "C" fn sentinel_event_dispatch(
    h: HandleId,
    label: *const c_char,
    caller_arg: *mut c_void,
    results: *mut u32,
) -> i32 {
    let label = match cbytes(label) {
        Ok(l) => l,
        Err(e) => return report(e) as i32,
    };
    let Some(results) = (unsafe { results.as_mut() }) else {
        return report(ErrorCode::InvalidArg) as i32;
    };
    let mut res = ActionRes::from_bits_retain(*results);
    let caller = CPtr(caller_arg);
    let caller: &(dyn Any + Send + Sync) = &caller;
    let outcome = with_handle(h, |ctx| ctx.event_dispatch(label, Some(caller), None, None, &mut res));
    *results = res.bits();
    match outcome {
        Ok(Ok(())) => report(ErrorCode::Success) as i32,
        Ok(Err(Error::Handler(e))) => {
            report(ErrorCode::HandlerFailed);
            e.code
        }
        Ok(Err(e)) => report(lib_err(e)) as i32,
        Err(code) => report(code) as i32,
    }
}

#[no_mangle]
pub extern "C" fn sentinel_hitcount(h: HandleId, id: EntId, out: *mut u64) -> ErrorCode {
    if out.is_null() {
        return report(ErrorCode::InvalidArg);
    }
    let hits = try_c!(with_handle(h, |ctx| ctx.hitcount(id)).and_then(|r| r.map_err(lib_err)));
    unsafe { *out = hits };
    report(ErrorCode::Success)
}
