//! Signal handling: SIGTERM/SIGINT graceful shutdown, SIGUSR1 immediate resync.
//!
//! Uses `signal-hook` flag registration. The daemon loop polls the flags on
//! every tick rather than blocking on signals.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Signal state shared between the OS hooks and the daemon loop.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    resync_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register OS signal hooks. Registration failures
    /// are reported on stderr but are not fatal.
    #[must_use]
    pub fn new() -> Self {
        let handler = Self::detached();
        handler.register_signals();
        handler
    }

    /// A handler not wired to any OS signal; driven programmatically.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            resync_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Check and clear a pending resync request.
    #[must_use]
    pub fn should_resync(&self) -> bool {
        self.resync_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_resync(&self) {
        self.resync_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        for (signal, name) in [(SIGTERM, "SIGTERM"), (SIGINT, "SIGINT")] {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&self.shutdown_flag)) {
                eprintln!("[LZR-SIGNAL] failed to register {name}: {e}");
            }
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::SIGUSR1;
            if let Err(e) = signal_hook::flag::register(SIGUSR1, Arc::clone(&self.resync_flag)) {
                eprintln!("[LZR-SIGNAL] failed to register SIGUSR1: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
