//! Kernel-style log macros for baton
//!
//! `kerror!`, `kwarn!` and `kinfo!` forward to `tracing` so the binary decides
//! where output goes (the daemon installs a `tracing_subscriber` fmt layer).
//! `kdebug!` is additionally gated by a per-subsystem toggle so that verbose
//! scheduler or handover chatter costs nothing unless asked for.
//!
//! # Environment Variables
//!
//! - `BATON_DEBUG=<list>` - comma-separated subsystems to trace, e.g.
//!   `scheduler,handover`, or `all`. Read once, on first use.
//!
//! # Usage
//!
//! ```ignore
//! use baton_core::{kdebug, kinfo, kwarn, kerror, Subsystem};
//!
//! kinfo!("listening on {}", addr);
//! kdebug!(Subsystem::Scheduler, "task {} parked on fd {}", id, fd);
//! kwarn!("handover failed: {}", err);
//! kerror!("poll failed: {}", err);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::env::parse_list;

/// Subsystems with an independent debug toggle
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Scheduler = 1 << 0,
    Io = 1 << 1,
    Signal = 1 << 2,
    Handover = 1 << 3,
    Log = 1 << 4,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [
        Subsystem::Scheduler,
        Subsystem::Io,
        Subsystem::Signal,
        Subsystem::Handover,
        Subsystem::Log,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Subsystem::Scheduler => "scheduler",
            Subsystem::Io => "io",
            Subsystem::Signal => "signal",
            Subsystem::Handover => "handover",
            Subsystem::Log => "log",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    #[inline]
    const fn bit(self) -> u8 {
        self as u8
    }
}

static ENABLED: AtomicU8 = AtomicU8::new(0);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

fn mask_from_list(items: &[String]) -> u8 {
    items.iter().fold(0u8, |mask, item| {
        if item == "all" {
            return u8::MAX;
        }
        match Subsystem::from_name(item) {
            Some(s) => mask | s.bit(),
            None => mask,
        }
    })
}

/// Initialize toggles from `BATON_DEBUG`
///
/// Called automatically on first check, but can be called explicitly for
/// deterministic initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Ok(raw) = std::env::var("BATON_DEBUG") {
        ENABLED.fetch_or(mask_from_list(&parse_list(&raw)), Ordering::Relaxed);
    }
}

/// Check if debug output is enabled for a subsystem
#[inline]
pub fn enabled(subsystem: Subsystem) -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    ENABLED.load(Ordering::Relaxed) & subsystem.bit() != 0
}

/// Toggle a subsystem programmatically
pub fn set_enabled(subsystem: Subsystem, on: bool) {
    init();
    if on {
        ENABLED.fetch_or(subsystem.bit(), Ordering::Relaxed);
    } else {
        ENABLED.fetch_and(!subsystem.bit(), Ordering::Relaxed);
    }
}

// ============================================================================
// Public Macros
// ============================================================================

/// Error level log
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::__tracing::error!($($arg)*);
    }};
}

/// Warning level log
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::__tracing::warn!($($arg)*);
    }};
}

/// Info level log
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::__tracing::info!($($arg)*);
    }};
}

/// Debug log, emitted only when the subsystem toggle is on
#[macro_export]
macro_rules! kdebug {
    ($subsystem:expr, $($arg:tt)*) => {{
        let subsystem: $crate::kprint::Subsystem = $subsystem;
        if $crate::kprint::enabled(subsystem) {
            $crate::__tracing::debug!(subsystem = subsystem.name(), $($arg)*);
        }
    }};
}

// ============================================================================
// Tests
// ============================================================================
