//! Fault taxonomy.
//!
//! A [`FaultKind`] classifies the synchronous crash signals that a supervised
//! call can intercept. A [`FaultReport`] is what a captured fault turns into once
//! control is back in ordinary code: the kind, the raw signal number, the name of
//! the unit of work that was executing, and the faulting address when the kernel
//! reported one.

use std::fmt;

/// Classification of a fatal low-level fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FaultKind {
    /// Invalid memory access (`SIGSEGV`).
    Segmentation,
    /// Abnormal termination requested by the process itself (`SIGABRT`).
    Abort,
    /// Misaligned or non-existent physical address (`SIGBUS`).
    Bus,
    /// Erroneous arithmetic operation (`SIGFPE`).
    FloatingPoint,
    /// Illegal instruction (`SIGILL`).
    IllegalInstruction,
}

impl FaultKind {
    /// Every kind covered by fault interception, in registration order.
    pub const ALL: [FaultKind; 5] = [
        FaultKind::Segmentation,
        FaultKind::Abort,
        FaultKind::Bus,
        FaultKind::FloatingPoint,
        FaultKind::IllegalInstruction,
    ];

    /// Dense index into per-kind tables.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Segmentation => 0,
            Self::Abort => 1,
            Self::Bus => 2,
            Self::FloatingPoint => 3,
            Self::IllegalInstruction => 4,
        }
    }

    /// Conventional POSIX signal name.
    #[must_use]
    pub const fn signal_name(self) -> &'static str {
        match self {
            Self::Segmentation => "SIGSEGV",
            Self::Abort => "SIGABRT",
            Self::Bus => "SIGBUS",
            Self::FloatingPoint => "SIGFPE",
            Self::IllegalInstruction => "SIGILL",
        }
    }

    /// Human-readable description used in fault messages.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Segmentation => "segmentation fault",
            Self::Abort => "abnormal termination",
            Self::Bus => "bus error",
            Self::FloatingPoint => "floating point exception",
            Self::IllegalInstruction => "illegal instruction",
        }
    }

    /// Parse a kind from its signal name or description (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sigsegv" | "segv" | "segfault" | "segmentation" | "segmentation fault" => {
                Some(Self::Segmentation)
            }
            "sigabrt" | "abrt" | "abort" | "abnormal termination" => Some(Self::Abort),
            "sigbus" | "bus" | "bus error" => Some(Self::Bus),
            "sigfpe" | "fpe" | "floating point exception" => Some(Self::FloatingPoint),
            "sigill" | "ill" | "illegal instruction" => Some(Self::IllegalInstruction),
            _ => None,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A fault captured during a supervised call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReport {
    /// What kind of fault was delivered.
    pub kind: FaultKind,
    /// Raw signal number as delivered by the kernel.
    pub signal: i32,
    /// Name of the innermost unit of work that was executing.
    pub unit: String,
    /// Faulting address reported by the kernel, 0 when not applicable.
    pub fault_addr: usize,
}

impl FaultReport {
    /// Create a report for `unit`.
    #[must_use]
    pub fn new(kind: FaultKind, signal: i32, unit: impl Into<String>, fault_addr: usize) -> Self {
        Self {
            kind,
            signal,
            unit: unit.into(),
            fault_addr,
        }
    }
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} occurred during execution of {}",
            self.kind.description(),
            self.unit
        )
    }
}
