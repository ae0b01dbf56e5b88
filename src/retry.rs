//! Retry discipline for storage writes, and the read-path circuit breaker
//!
//! The two guards are deliberately different: `RetryPolicy` always ends
//! in a hard answer (success or `Exhausted` after recovery), while
//! `CircuitBreaker` trades correctness for availability and can serve a
//! fallback value instead of an error. Callers must opt into the breaker
//! knowingly.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, StoreError};

/// Bounded retry for transient I/O failures with multiplicative backoff.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Runs `op`, re-invoking it on transient failures up to the attempt
    /// bound. Non-transient errors return on first sight. When the bound
    /// is hit, `recover` runs (callers pass the partial-artifact sweep
    /// for the operation's target) and the final cause comes back wrapped
    /// in [`StoreError::Exhausted`].
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T>, recover: impl FnOnce()) -> Result<T> {
        let bound = self.max_attempts.max(1);
        let mut delay = self.initial_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < bound => {
                    std::thread::sleep(delay);
                    delay = next_delay(delay, self.multiplier, self.max_delay);
                }
                Err(e) if e.is_transient() => {
                    recover();
                    return Err(StoreError::Exhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn next_delay(current: Duration, multiplier: f64, cap: Duration) -> Duration {
    current.mul_f64(multiplier.max(1.0)).min(cap)
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive: u32,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn reset(&mut self) {
        self.consecutive = 0;
        self.opened_at = None;
    }
}

/// Availability guard for the read path.
///
/// After `failure_threshold` consecutive transient failures the breaker
/// opens and [`CircuitBreaker::guard`] returns the caller's fallback
/// without touching the backend. After `reset_after` one call is let
/// through as a probe; success closes the breaker, failure re-opens it.
///
/// While open this is a silent-degradation mode: callers receive the
/// fallback as an ordinary success. The trip and the close are logged so
/// operators can see the window.
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_after: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_after: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_after,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().opened_at.is_some()
    }

    /// Invokes `op` unless the breaker is open, in which case `fallback`
    /// is served immediately. A successful call, or any non-transient
    /// error (the backend answered), resets the failure run.
    pub fn guard<T>(&self, fallback: impl FnOnce() -> T, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut probing = false;
        {
            let mut st = self.state.lock();
            if let Some(opened) = st.opened_at {
                if opened.elapsed() < self.reset_after {
                    return Ok(fallback());
                }
                // Half-open: this call probes the backend. One more
                // failure re-opens immediately.
                st.opened_at = None;
                st.consecutive = self.failure_threshold - 1;
                probing = true;
            }
        }
        match op() {
            Ok(v) => {
                self.state.lock().reset();
                if probing {
                    eprintln!("stash: circuit breaker closed after successful probe");
                }
                Ok(v)
            }
            Err(e) if e.is_transient() => {
                let mut st = self.state.lock();
                st.consecutive += 1;
                if st.consecutive >= self.failure_threshold {
                    st.opened_at = Some(Instant::now());
                    eprintln!(
                        "stash: circuit breaker open after {} consecutive read failures, serving fallback for {:?}",
                        st.consecutive, self.reset_after
                    );
                }
                Err(e)
            }
            Err(e) => {
                self.state.lock().reset();
                Err(e)
            }
        }
    }
}
