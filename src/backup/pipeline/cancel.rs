//! Run-wide cancellation shared by every pipeline stage.
//!
//! The first failure reported through [`Cancellation::fail`] wins: it is kept
//! together with the stage it came from and every later failure is dropped,
//! since those are usually consequences of the first one (closed channels,
//! aborted uploads).
//!
//! One exception: a stage that stops because its neighbour went away reports
//! `Cancelled`, and may do so before the neighbour gets to report the actual
//! cause. Such a stage-reported `Cancelled` gives way to the next error of any
//! other kind. A user interrupt is never replaced.

use crate::backup::result_error::error::{Error, ErrorKind};
use crate::backup::result_error::result::Result;
use derive_more::Display;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    #[display("reader")]
    Reader,
    #[display("cipher")]
    Cipher,
    #[display("upload")]
    Upload,
    #[display("user")]
    User,
}

#[derive(Default)]
struct CancelState {
    cancelled: bool,
    first_error: Option<(Stage, Error)>,
}

#[derive(Default)]
struct CancelInner {
    state: Mutex<CancelState>,
    wake: Condvar,
}

#[derive(Clone, Default)]
pub struct Cancellation {
    inner: Arc<CancelInner>,
}

impl Cancellation {
    fn lock(&self) -> MutexGuard<'_, CancelState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// User-initiated cancellation.
    pub fn cancel(&self) {
        self.fail(Stage::User, Error::Cancelled("interrupted by user".into()));
    }

    /// Records a fatal error from `stage` and cancels the run.
    ///
    /// Returns `true` if `error` is now the one the run reports.
    pub fn fail(&self, stage: Stage, error: Error) -> bool {
        let mut state = self.lock();
        state.cancelled = true;
        let first = match &state.first_error {
            None => true,
            Some((recorded_stage, recorded)) => {
                *recorded_stage != Stage::User
                    && recorded.kind() == ErrorKind::Cancelled
                    && error.kind() != ErrorKind::Cancelled
            }
        };
        if first {
            tracing::debug!("{stage} stage reported first fatal error: {error}");
            state.first_error = Some((stage, error));
        } else {
            tracing::debug!("Ignoring follow-up error from {stage} stage: {error}");
        }
        drop(state);
        self.inner.wake.notify_all();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// `Err(Cancelled)` once the run has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled("pipeline cancelled".into()))
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// Returns `true` if woken by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .inner
                .wake
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    pub fn take_error(&self) -> Option<(Stage, Error)> {
        self.lock().first_error.take()
    }
}
