//! Disposition configuration.
//!
//! What happens to the covered signals once the last active supervised call
//! returns is set via the `FAULTLINE_DISPOSITION` environment variable:
//! - `restore` (default): the dispositions that were in place before faultline
//!   installed its handlers are put back. Outside supervised calls the process
//!   behaves as if faultline were not loaded.
//! - `armed`: the handlers stay registered for the life of the process. Faults
//!   outside a supervised call are chained to the previous disposition by the
//!   handler itself.

use std::sync::atomic::{AtomicU8, Ordering};

/// Name of the environment variable consulted on first use.
pub const DISPOSITION_ENV: &str = "FAULTLINE_DISPOSITION";

/// Policy for fault handler registration between supervised calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Restore the previous dispositions when no supervised call is active.
    #[default]
    RestoreDefault,
    /// Leave the handlers installed process-wide.
    StayArmed,
}

impl Disposition {
    /// Parse from string (case-insensitive). Unknown values map to the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "restore" | "default" | "dfl" | "sig_dfl" => Self::RestoreDefault,
            "armed" | "stay" | "stay-armed" | "persistent" | "keep" => Self::StayArmed,
            _ => Self::RestoreDefault,
        }
    }

    /// Short stable name, the inverse of [`Disposition::from_str_loose`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RestoreDefault => "restore",
            Self::StayArmed => "armed",
        }
    }

    /// Whether handlers are removed again when the last region exits.
    #[must_use]
    pub const fn restores_between_calls(self) -> bool {
        matches!(self, Self::RestoreDefault)
    }
}

// Atomic cache: 0=unresolved, 1=RestoreDefault, 2=StayArmed, 255=resolving.
// The fault path never reads the environment; it only loads this byte.
static CACHED_DISPOSITION: AtomicU8 = AtomicU8::new(0);

const DISPOSITION_UNRESOLVED: u8 = 0;
const DISPOSITION_RESTORE: u8 = 1;
const DISPOSITION_ARMED: u8 = 2;
const DISPOSITION_RESOLVING: u8 = 255;

fn to_u8(disposition: Disposition) -> u8 {
    match disposition {
        Disposition::RestoreDefault => DISPOSITION_RESTORE,
        Disposition::StayArmed => DISPOSITION_ARMED,
    }
}

fn from_u8(v: u8) -> Disposition {
    match v {
        DISPOSITION_ARMED => Disposition::StayArmed,
        _ => Disposition::RestoreDefault,
    }
}

/// Get the configured disposition (reads the environment on first call).
///
/// A reentrant call that arrives while the environment is being read sees the
/// resolving state and gets the default instead of blocking.
#[must_use]
pub fn disposition() -> Disposition {
    let cached = CACHED_DISPOSITION.load(Ordering::Relaxed);

    if cached != DISPOSITION_UNRESOLVED && cached != DISPOSITION_RESOLVING {
        return from_u8(cached);
    }
    if cached == DISPOSITION_RESOLVING {
        return Disposition::default();
    }

    if CACHED_DISPOSITION
        .compare_exchange(
            DISPOSITION_UNRESOLVED,
            DISPOSITION_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_DISPOSITION.load(Ordering::Relaxed);
        return if v != DISPOSITION_UNRESOLVED && v != DISPOSITION_RESOLVING {
            from_u8(v)
        } else {
            Disposition::default()
        };
    }

    let resolved = std::env::var(DISPOSITION_ENV)
        .map(|v| Disposition::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_DISPOSITION.store(to_u8(resolved), Ordering::Release);
    resolved
}

/// Override the disposition for the rest of the process, returning the old one.
pub fn set_disposition(disposition: Disposition) -> Disposition {
    let previous = CACHED_DISPOSITION.swap(to_u8(disposition), Ordering::SeqCst);
    if previous == DISPOSITION_UNRESOLVED || previous == DISPOSITION_RESOLVING {
        Disposition::default()
    } else {
        from_u8(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dispositions() {
        assert_eq!(
            Disposition::from_str_loose("restore"),
            Disposition::RestoreDefault
        );
        assert_eq!(
            Disposition::from_str_loose("SIG_DFL"),
            Disposition::RestoreDefault
        );
        assert_eq!(Disposition::from_str_loose("ARMED"), Disposition::StayArmed);
        assert_eq!(
            Disposition::from_str_loose("persistent"),
            Disposition::StayArmed
        );
        assert_eq!(
            Disposition::from_str_loose("bogus"),
            Disposition::RestoreDefault
        );
    }

    #[test]
    fn names_round_trip() {
        for d in [Disposition::RestoreDefault, Disposition::StayArmed] {
            assert_eq!(Disposition::from_str_loose(d.as_str()), d);
        }
    }

    #[test]
    fn only_restore_default_restores() {
        assert!(Disposition::RestoreDefault.restores_between_calls());
        assert!(!Disposition::StayArmed.restores_between_calls());
    }

    #[test]
    fn cached_disposition_is_sticky_until_overridden() {
        let previous = CACHED_DISPOSITION.swap(DISPOSITION_RESTORE, Ordering::SeqCst);
        assert_eq!(disposition(), Disposition::RestoreDefault);

        CACHED_DISPOSITION.store(DISPOSITION_ARMED, Ordering::SeqCst);
        assert_eq!(disposition(), Disposition::StayArmed);

        CACHED_DISPOSITION.store(DISPOSITION_RESOLVING, Ordering::SeqCst);
        assert_eq!(disposition(), Disposition::RestoreDefault);

        CACHED_DISPOSITION.store(previous, Ordering::SeqCst);
    }
}
