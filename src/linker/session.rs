//! The link session: a process-wide diagnostic table and phase timers,
//! threaded through the pipeline as a value.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{error, warn};
use snafu::Snafu;

/// Diagnostic taxonomy. Which of these are warnings is fixed; whether an
/// error stops the link is decided at the driver's checkpoints.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Snafu)]
pub enum DiagKind {
    #[snafu(display("invalid path"))]
    InvalidPath,
    #[snafu(display("multiply defined symbol"))]
    MultiplyDefinedSymbol,
    #[snafu(display("unresolved symbol"))]
    UnresolvedSymbol,
    #[snafu(display("cyclic weak symbol"))]
    WeakCycle,
    #[snafu(display("incompatible machine"))]
    IncompatibleMachine,
    #[snafu(display("relocation against removed section"))]
    RelocationAgainstRemovedSection,
    #[snafu(display("illegal relocation"))]
    IllegalRelocation,
    #[snafu(display("large address aware required"))]
    LargeAddressAwareRequired,
    #[snafu(display("unable to load resource"))]
    LoadRes,
    #[snafu(display("entry point"))]
    EntryPoint,
    #[snafu(display("no subsystem"))]
    NoSubsystem,
    #[snafu(display("command line"))]
    CmdLine,
    #[snafu(display("manifest tool failure"))]
    MtToolFailure,
    #[snafu(display("invalid type index"))]
    TypeIndexInvalid,
    #[snafu(display("section references discarded memory"))]
    SectRefsDiscardedMemory,
    #[snafu(display("ill-formed data"))]
    IllData,

    // warnings
    #[snafu(display("file not found"))]
    FileNotFound,
    #[snafu(display("multiple library matches"))]
    MultipleLibMatch,
    #[snafu(display("section flags conflict"))]
    SectionFlagsConflict,
    #[snafu(display("unresolved COMDAT selection"))]
    UnresolvedComdat,
    #[snafu(display("unknown directive"))]
    UnknownDirective,
    #[snafu(display("ill-formed export"))]
    IllExport,
    #[snafu(display("export of entry point"))]
    TryingToExportEntryPoint,
    #[snafu(display("long section name"))]
    LongSectionName,
    #[snafu(display("unused delay-load dll"))]
    UnusedDelayLoadDll,
}

impl DiagKind {
    pub fn is_warning(self) -> bool {
        matches!(
            self,
            DiagKind::FileNotFound
                | DiagKind::MultipleLibMatch
                | DiagKind::SectionFlagsConflict
                | DiagKind::UnresolvedComdat
                | DiagKind::UnknownDirective
                | DiagKind::IllExport
                | DiagKind::TryingToExportEntryPoint
                | DiagKind::LongSectionName
                | DiagKind::UnusedDelayLoadDll
        )
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagKind,
    pub message: String,
    /// Path of the object or library that triggered this, if any.
    pub origin: Option<String>,
}

#[derive(Default)]
pub struct Session {
    diags: Mutex<Vec<Diagnostic>>,
    error_count: AtomicUsize,
    /// `/FORCE` demotes unresolved symbols from link-stopping to recorded.
    force_unresolved: AtomicBool,
    timers: Mutex<Vec<(&'static str, Duration)>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_force_unresolved(&self, force: bool) {
        self.force_unresolved.store(force, Ordering::Relaxed);
    }

    pub fn error(&self, kind: DiagKind, message: impl Into<String>) {
        self.record(kind, message.into(), None)
    }

    pub fn error_obj(&self, kind: DiagKind, origin: &str, message: impl Into<String>) {
        self.record(kind, message.into(), Some(origin.to_owned()))
    }

    fn record(&self, kind: DiagKind, message: String, origin: Option<String>) {
        if kind.is_warning() {
            match &origin {
                Some(origin) => warn!("{origin}: {kind}: {message}"),
                None => warn!("{kind}: {message}"),
            }
        } else {
            match &origin {
                Some(origin) => error!("{origin}: {kind}: {message}"),
                None => error!("{kind}: {message}"),
            }
            let stops = match kind {
                DiagKind::UnresolvedSymbol => !self.force_unresolved.load(Ordering::Relaxed),
                _ => true,
            };
            if stops {
                self.error_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.diags.lock().unwrap().push(Diagnostic {
            kind,
            message,
            origin,
        });
    }

    /// True when an error-severity diagnostic has been recorded that should
    /// stop the link at the next checkpoint. Warnings never count.
    pub fn has_errors(&self) -> bool {
        self.error_count.load(Ordering::Relaxed) > 0
    }

    /// Exit code: nonzero iff any error-severity diagnostic was recorded,
    /// even ones `/FORCE` downgraded from stopping the link.
    pub fn exit_code(&self) -> i32 {
        let any_error = self
            .diags
            .lock()
            .unwrap()
            .iter()
            .any(|diag| !diag.kind.is_warning());
        i32::from(any_error)
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diags.lock().unwrap().clone()
    }

    pub fn has_diag(&self, kind: DiagKind) -> bool {
        self.diags.lock().unwrap().iter().any(|d| d.kind == kind)
    }

    pub fn time<R>(&self, name: &'static str, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        self.timers.lock().unwrap().push((name, start.elapsed()));
        result
    }

    pub fn log_timers(&self) {
        for (name, duration) in self.timers.lock().unwrap().iter() {
            log::debug!("{name}: {duration:?}");
        }
    }
}
