//! Supervised call dispatch.
//!
//! [`handle`] runs a callable with fault interception armed. A fault raised
//! anywhere below it (in the callable, in callables it calls, or in native
//! code they reach) comes back as [`RuntimeError::Fault`] naming the innermost
//! frame that was executing, and the process keeps running. Ordinary errors
//! from the callable pass through unchanged.

use std::sync::Arc;

use faultline_core::frame;
use faultline_core::{Callable, CallableRef, FaultReport, Kwargs, RuntimeError, Value};

use crate::region::Region;
use crate::signal::{self, Guarded};

/// Run `body` inside a supervised region.
///
/// On a captured fault `unit` is called once, after control is back in this
/// frame, to name the unit of work for the report.
pub fn supervise<R>(
    unit: impl FnOnce() -> String,
    body: impl FnOnce() -> R,
) -> Result<R, RuntimeError> {
    let _region = Region::enter()?;
    match signal::protect(body)? {
        Guarded::Completed(value) => Ok(value),
        Guarded::Faulted {
            kind,
            signal,
            fault_addr,
        } => Err(RuntimeError::Fault(FaultReport::new(
            kind, signal, unit(), fault_addr,
        ))),
    }
}

/// Call `callable` with `args` and `kwargs` under fault interception.
///
/// Missing argument containers are treated as empty. On a fault the report
/// names the innermost frame pushed since this call began, or the callable
/// itself if none is observable, and the abandoned frames are popped.
pub fn handle(
    callable: &CallableRef,
    args: Option<Vec<Value>>,
    kwargs: Option<Kwargs>,
) -> Result<Value, RuntimeError> {
    let args = args.unwrap_or_default();
    let kwargs = kwargs.unwrap_or_default();
    let depth = frame::depth();

    let unit = || {
        let name = frame::innermost_since(depth)
            .map_or_else(|| callable.name().to_string(), |f| f.name().to_string());
        frame::unwind_to(depth);
        name
    };
    supervise(unit, || callable.call(&args, &kwargs))?
}

/// Wrap `callable` so every invocation goes through [`handle`].
#[must_use]
pub fn guarded(callable: &CallableRef) -> CallableRef {
    let inner = Arc::clone(callable);
    Callable::new(callable.name(), &callable.params(), move |scope| {
        handle(
            &inner,
            Some(scope.args().to_vec()),
            Some(scope.kwargs().clone()),
        )
    })
}
