//! Run-scoped cancellation.
//!
//! A single [`CancelToken`] is created per invocation and handed to every
//! network call and polling loop. Waits sleep in short slices so a
//! cancellation is observed within [`SLICE`]. The binaries connect the token
//! to Ctrl-C and SIGTERM with [`cancel_on_interrupt`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

const SLICE: Duration = Duration::from_millis(100);

/// Exit status when a second interrupt aborts the process.
pub const INTERRUPTED_EXIT: i32 = 130;

/// Error returned once the run has been cancelled.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Signal cancellation to every holder of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Cancel on behalf of an interrupt; `true` if the run was already cancelled.
    pub fn interrupt(&self) -> bool {
        self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail fast if cancellation was requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early if cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }
}

/// Cancel `token` on the first interrupt and call `notice`; a second
/// interrupt exits immediately with [`INTERRUPTED_EXIT`].
///
/// Only one handler can be installed per process.
pub fn cancel_on_interrupt<F>(token: &CancelToken, notice: F) -> Result<(), ctrlc::Error>
where
    F: Fn() + Send + 'static,
{
    let token = token.clone();
    ctrlc::set_handler(move || {
        if token.interrupt() {
            std::process::exit(INTERRUPTED_EXIT);
        }
        notice();
    })
}
