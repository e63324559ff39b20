//! Operator interrupt (Ctrl-C) tracking.
//!
//! The engine never terminates on Ctrl-C. A listener thread records the
//! signal in a shared flag that blocking operations consult once they return.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Shared, cloneable interrupt flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a process-wide Ctrl-C listener that sets this flag.
    ///
    /// Replaces the default "terminate on SIGINT" behavior for the process.
    pub fn install(&self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .context("build signal runtime")?;
        let flag = self.flag.clone();
        thread::Builder::new()
            .name("ctrl-c".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    loop {
                        if let Err(e) = tokio::signal::ctrl_c().await {
                            warn!(err = %e, "ctrl-c listener failed");
                            return;
                        }
                        debug!("operator interrupt received");
                        flag.store(true, Ordering::SeqCst);
                    }
                });
            })
            .context("spawn ctrl-c listener")?;
        Ok(())
    }

    /// Record an interrupt.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}
