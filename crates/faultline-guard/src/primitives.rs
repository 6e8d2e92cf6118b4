//! Unchecked runtime primitives.
//!
//! These bypass the bookkeeping rules the object model otherwise enforces.
//! Misuse cannot corrupt Rust memory, but it can leave objects deallocated
//! while still referenced, keep dead objects alive forever, or hand immutable
//! types new attributes. Callers take responsibility for the result.

use faultline_core::{FrameRef, RuntimeError, TypeRef, Value};

fn header_of(value: &Value) -> Result<&faultline_core::Header, RuntimeError> {
    value.header().ok_or_else(|| {
        RuntimeError::InvalidArgument(format!(
            "'{}' values carry no lifetime count",
            value.type_name()
        ))
    })
}

/// Increment the lifetime count of `value`. Returns the new count.
pub fn add_ref(value: &Value) -> Result<isize, RuntimeError> {
    Ok(header_of(value)?.retain())
}

/// Decrement the lifetime count of `value`, deallocating it when the count
/// reaches exactly zero. Returns the new count.
pub fn remove_ref(value: &Value) -> Result<isize, RuntimeError> {
    let count = header_of(value)?.release();
    if count == 0 {
        value.deallocate();
    }
    Ok(count)
}

/// Overwrite the lifetime count of `value`. Never deallocates, whatever the
/// new count.
pub fn set_ref(value: &Value, count: isize) -> Result<(), RuntimeError> {
    header_of(value)?.set(count);
    Ok(())
}

/// Insert or overwrite `key` in the attribute table of `typ`, ignoring
/// immutability, then invalidate cached lookups for it and its subclasses.
pub fn force_set_attr(typ: &TypeRef, key: &str, value: Value) {
    typ.store_attr(key, value);
    typ.modified();
}

/// Replace the value bound to `key` in `frame` in place.
///
/// The old value is released and the new one retained. A `key` that is not
/// bound in the frame's locals view leaves the frame untouched; the return
/// value says whether a slot was replaced.
pub fn force_update_locals(frame: &FrameRef, key: &str, value: Value) -> bool {
    if !frame.locals().contains_key(key) {
        return false;
    }
    let Some(index) = frame.code().slot_of(key) else {
        return false;
    };
    value.retain();
    if let Some(previous) = frame.swap_slot(index, Some(value)) {
        previous.release();
    }
    true
}
