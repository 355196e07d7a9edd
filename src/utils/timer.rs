//! Timer/timeout utility implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::RapError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Somewhere far enough in the future to stand for "not armed".
const DORMANT_SECS: u64 = 30 * 24 * 3600;

/// Timer utility for signalling after a given timeout. Supports cancellation
/// and re-kickoff with a different duration for implementing incremental
/// backoff, etc.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Timeout duration used by the last kick-off.
    last_dur: Option<Duration>,
}

impl Timer {
    /// Creates a new dormant timer utility.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::from_secs(DORMANT_SECS))),
            last_dur: None,
        }
    }

    /// Gets the last timeout duration kicked off, if any.
    pub fn get_dur(&self) -> Option<Duration> {
        self.last_dur
    }

    /// Kicks off the timer with the given duration.
    pub fn kickoff(&mut self, dur: Duration) -> Result<(), RapError> {
        if dur.is_zero() {
            return logged_err!("invalid timeout duration {} ns", dur.as_nanos());
        }

        self.last_dur = Some(dur);
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Cancels the timer, putting it back into dormant state.
    pub fn cancel(&mut self) -> Result<(), RapError> {
        self.last_dur = None;
        self.sleep
            .as_mut()
            .reset(Instant::now() + Duration::from_secs(DORMANT_SECS));
        Ok(())
    }

    /// Waits for the timer to timeout. Typically, this should be used as a
    /// branch of a `tokio::select!`.
    pub async fn timeout(&mut self) {
        self.sleep.as_mut().await
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
