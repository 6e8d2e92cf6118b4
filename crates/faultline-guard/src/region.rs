//! Supervised regions.
//!
//! A region is the span of one supervised call. The first region to open
//! process-wide registers the fault handlers and suspends every registered
//! [`FaultReporter`]; the last one to close resumes the reporters and, under
//! [`Disposition::RestoreDefault`], puts back the dispositions that were in
//! place before. All transitions happen under one lock together with the
//! active-region counter.

use std::sync::Arc;

use parking_lot::{Mutex, const_mutex};

use faultline_core::config::{self, Disposition};
use faultline_core::{InitError, RuntimeError};

use crate::signal;

/// A third-party crash printer that must stay quiet while faults are being
/// intercepted, or it would report crashes that are about to be recovered.
pub trait FaultReporter: Send + Sync {
    fn name(&self) -> &str;
    fn disable(&self);
    fn enable(&self);
}

struct RegionState {
    active: usize,
    reporters: Vec<Arc<dyn FaultReporter>>,
    /// First failure from the restore performed when the last region closed.
    restore_error: Option<InitError>,
}

static REGIONS: Mutex<RegionState> = const_mutex(RegionState {
    active: 0,
    reporters: Vec::new(),
    restore_error: None,
});

/// Register a reporter. It is disabled immediately if a region is open.
pub fn register_reporter(reporter: Arc<dyn FaultReporter>) {
    let mut state = REGIONS.lock();
    if state.active > 0 {
        reporter.disable();
    }
    state.reporters.push(reporter);
}

/// Remove every reporter called `name`, re-enabling it if a region is open.
/// Returns whether anything was removed.
pub fn unregister_reporter(name: &str) -> bool {
    let mut state = REGIONS.lock();
    let active = state.active > 0;
    let before = state.reporters.len();
    state.reporters.retain(|reporter| {
        let keep = reporter.name() != name;
        if !keep && active {
            reporter.enable();
        }
        keep
    });
    state.reporters.len() != before
}

/// Number of supervised regions open process-wide.
#[must_use]
pub fn active_regions() -> usize {
    REGIONS.lock().active
}

/// Take the error recorded when closing the last region failed to put back
/// a previous disposition. Kinds that failed stay installed and are retried
/// by the next restore.
pub fn take_restore_error() -> Option<InitError> {
    REGIONS.lock().restore_error.take()
}

/// Install every handler, then honor the configured disposition: under
/// [`Disposition::RestoreDefault`] with no open region the previous
/// dispositions are put back straight away.
pub fn init() -> Result<(), InitError> {
    let state = REGIONS.lock();
    signal::install_all()?;
    if state.active == 0 && config::disposition().restores_between_calls() {
        signal::restore_all()?;
    }
    Ok(())
}

/// Closes a region when dropped.
#[must_use = "the region closes as soon as the guard is dropped"]
pub struct Region {
    _private: (),
}

impl Region {
    /// Open a region, registering handlers if it is the first.
    pub fn enter() -> Result<Self, RuntimeError> {
        let mut state = REGIONS.lock();
        if state.active == 0 {
            if let Err(err) = signal::install_all() {
                // A failed rollback leaves handlers behind; report that first.
                if config::disposition().restores_between_calls() {
                    signal::restore_all()?;
                }
                return Err(err.into());
            }
            for reporter in &state.reporters {
                reporter.disable();
            }
        }
        state.active += 1;
        Ok(Self { _private: () })
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let mut state = REGIONS.lock();
        state.active = state.active.saturating_sub(1);
        if state.active > 0 {
            return;
        }
        if config::disposition() == Disposition::RestoreDefault
            && let Err(err) = signal::restore_all()
        {
            state.restore_error.get_or_insert(err);
        }
        for reporter in &state.reporters {
            reporter.enable();
        }
    }
}
