//! Ctrl+C handling for long searches
//!
//! The first Ctrl+C asks the search to stop after the batch in flight and
//! still write out the best instance found so far. A second one within two
//! seconds exits immediately.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::Result;

/// Exit status used when the user aborts
pub const ABORT_EXIT_CODE: i32 = 130;

/// Interrupt handler for the search
pub struct InterruptHandler {
    /// Set on the first Ctrl+C
    interrupt_flag: Arc<AtomicBool>,
    /// Count of consecutive interrupts
    interrupt_count: Arc<AtomicUsize>,
}

impl Default for InterruptHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptHandler {
    /// Create a handler with a cleared interrupt flag
    pub fn new() -> Self {
        Self {
            interrupt_flag: Arc::new(AtomicBool::new(false)),
            interrupt_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Install the process-wide Ctrl+C handler
    pub fn install(&self) -> Result<()> {
        let interrupt_flag = self.interrupt_flag.clone();
        let interrupt_count = self.interrupt_count.clone();

        ctrlc::set_handler(move || {
            if register_interrupt(&interrupt_flag, &interrupt_count) {
                warn!("Stopping after the current batch, press Ctrl+C again to abort");

                let count = interrupt_count.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_secs(2));
                    count.store(0, Ordering::SeqCst);
                });
            } else {
                warn!("Aborted");
                std::process::exit(ABORT_EXIT_CODE);
            }
        })
        .map_err(|e| crate::Error::Config(format!("Failed to set signal handler: {}", e)))?;

        debug!("Interrupt handler installed");
        Ok(())
    }

    /// Flag to hand to the search
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt_flag.clone()
    }

    /// Check if interrupted
    pub fn is_interrupted(&self) -> bool {
        self.interrupt_flag.load(Ordering::SeqCst)
    }
}

/// Record one Ctrl+C; returns false if it follows another one closely
fn register_interrupt(flag: &AtomicBool, count: &AtomicUsize) -> bool {
    let previous = count.fetch_add(1, Ordering::SeqCst);
    flag.store(true, Ordering::SeqCst);
    previous == 0
}
