//! Polling primitives every other layer builds its timing behaviour on.
//!
//! All loops are cooperative: the calling thread sleeps between attempts
//! and a budget (wall time or attempt count) is the only bound. A backend
//! call that blocks longer than the budget cannot be interrupted.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::errors::{AutomationError, CandidateOutcome, ErrorKind, Stage, TimeoutError};
use crate::timings::TimeoutSettings;

/// Wall-time budget for a polling loop.
#[derive(Debug, Clone)]
pub struct Wait {
    pub timeout: Duration,
    pub interval: Duration,
    pub description: String,
    pub stage: Option<Stage>,
}

impl Wait {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            description: "condition".to_string(),
            stage: None,
        }
    }

    pub fn from_settings(settings: &TimeoutSettings) -> Self {
        Self::new(settings.timeout, settings.interval)
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn at_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Replaces the timeout when one is given, keeping the interval.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(timeout) = timeout {
            self.timeout = timeout;
        }
        self
    }

    fn expired(&self, started: Instant, attempts: u32, last_error: Option<AutomationError>) -> AutomationError {
        let elapsed = started.elapsed();
        debug!(
            target: "deskpilot::timing",
            description = %self.description,
            attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "wait timed out"
        );
        AutomationError::Timeout(Box::new(TimeoutError {
            description: self.description.clone(),
            timeout: self.timeout,
            attempts,
            elapsed,
            stage: self.stage,
            attempt_bounded: false,
            last_error: last_error.map(Box::new),
            candidates: Vec::new(),
        }))
    }
}

/// Attempt-count budget for [`retry`].
#[derive(Debug, Clone)]
pub struct Retry {
    pub max_attempts: u32,
    pub interval: Duration,
    pub description: String,
    pub stage: Option<Stage>,
}

impl Retry {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
            description: "operation".to_string(),
            stage: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn at_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }
}

/// A successful result together with what it cost to get it.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Values a predicate may return: `true` and `Some(_)` end the wait.
pub trait Truthy {
    type Output;
    fn truthy(self) -> Option<Self::Output>;
}

impl Truthy for bool {
    type Output = bool;

    fn truthy(self) -> Option<bool> {
        self.then_some(true)
    }
}

impl<T> Truthy for Option<T> {
    type Output = T;

    fn truthy(self) -> Option<T> {
        self
    }
}

fn pause(wait: &Wait, elapsed: Duration) {
    let remaining = wait.timeout.saturating_sub(elapsed);
    thread::sleep(wait.interval.min(remaining));
}

/// Polls `predicate` until it returns a truthy value and hands that value back.
///
/// A falsy value and an `Err` both mean "not yet". The predicate runs at
/// least once even with a zero timeout. When the deadline passes the
/// returned [`AutomationError::Timeout`] carries the most recent error.
pub fn wait_until<R, F>(wait: &Wait, mut predicate: F) -> Result<R::Output, AutomationError>
where
    R: Truthy,
    F: FnMut() -> Result<R, AutomationError>,
{
    let started = Instant::now();
    let mut attempts = 0u32;
    let mut last_error = None;
    trace!(target: "deskpilot::timing", description = %wait.description, timeout = ?wait.timeout, "wait started");

    loop {
        attempts += 1;
        match predicate() {
            Ok(value) => {
                if let Some(out) = value.truthy() {
                    trace!(
                        target: "deskpilot::timing",
                        description = %wait.description,
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "wait satisfied"
                    );
                    return Ok(out);
                }
            }
            Err(err) => {
                trace!(target: "deskpilot::timing", description = %wait.description, error = %err, "predicate failed");
                last_error = Some(err);
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= wait.timeout {
            return Err(wait.expired(started, attempts, last_error));
        }
        pause(wait, elapsed);
    }
}

/// Polls `predicate` until it reports `false`.
///
/// Errors are handled exactly like in [`wait_until`]: they count as "not
/// yet" and the last one is attached to the timeout.
pub fn wait_until_not<F>(wait: &Wait, mut predicate: F) -> Result<(), AutomationError>
where
    F: FnMut() -> Result<bool, AutomationError>,
{
    let started = Instant::now();
    let mut attempts = 0u32;
    let mut last_error = None;

    loop {
        attempts += 1;
        match predicate() {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            Err(err) => last_error = Some(err),
        }

        let elapsed = started.elapsed();
        if elapsed >= wait.timeout {
            return Err(wait.expired(started, attempts, last_error));
        }
        pause(wait, elapsed);
    }
}

/// Repeats `action` until it succeeds.
///
/// Only failures whose kind is listed in `retryable` are retried; anything
/// else propagates immediately. The remaining budget is recomputed from
/// wall time after every failure.
pub fn wait_until_passes<T, F>(
    wait: &Wait,
    retryable: &[ErrorKind],
    mut action: F,
) -> Result<Retried<T>, AutomationError>
where
    F: FnMut() -> Result<T, AutomationError>,
{
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match action() {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts,
                    elapsed: started.elapsed(),
                })
            }
            Err(err) if retryable.contains(&err.kind()) => {
                let elapsed = started.elapsed();
                if elapsed >= wait.timeout {
                    return Err(wait.expired(started, attempts, Some(err)));
                }
                debug!(
                    target: "deskpilot::timing",
                    description = %wait.description,
                    attempt = attempts,
                    error = %err,
                    "retrying"
                );
                pause(wait, elapsed);
            }
            Err(err) => return Err(err),
        }
    }
}

/// A named predicate raced by [`wait_for_any`].
pub struct Candidate<'a> {
    description: String,
    predicate: Box<dyn FnMut() -> Result<bool, AutomationError> + 'a>,
}

impl<'a> Candidate<'a> {
    pub fn new<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: FnMut() -> Result<bool, AutomationError> + 'a,
    {
        Self {
            description: description.into(),
            predicate: Box::new(predicate),
        }
    }
}

/// Round-robins every candidate on each cycle and returns the index of the
/// first one that reports `true`.
pub fn wait_for_any(wait: &Wait, candidates: &mut [Candidate<'_>]) -> Result<usize, AutomationError> {
    if candidates.is_empty() {
        return Err(AutomationError::InvalidArgument(
            "wait_for_any needs at least one candidate".to_string(),
        ));
    }

    let started = Instant::now();
    let mut attempts = 0u32;
    let mut last_errors: Vec<Option<String>> = vec![None; candidates.len()];

    loop {
        attempts += 1;
        for (index, candidate) in candidates.iter_mut().enumerate() {
            match (candidate.predicate)() {
                Ok(true) => {
                    trace!(target: "deskpilot::timing", winner = %candidate.description, attempts, "wait_for_any satisfied");
                    return Ok(index);
                }
                Ok(false) => {}
                Err(err) => last_errors[index] = Some(err.to_string()),
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= wait.timeout {
            let mut err = wait.expired(started, attempts, None);
            if let AutomationError::Timeout(t) = &mut err {
                t.candidates = candidates
                    .iter()
                    .zip(last_errors)
                    .map(|(c, last_error)| CandidateOutcome {
                        description: c.description.clone(),
                        last_error,
                    })
                    .collect();
            }
            return Err(err);
        }
        pause(wait, elapsed);
    }
}

/// Runs `action` up to `policy.max_attempts` times, sleeping between
/// attempts but not after the last one.
pub fn retry<T, F>(policy: &Retry, retryable: &[ErrorKind], mut action: F) -> Result<Retried<T>, AutomationError>
where
    F: FnMut() -> Result<T, AutomationError>,
{
    let started = Instant::now();
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts {
        match action() {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                })
            }
            Err(err) if retryable.contains(&err.kind()) => {
                debug!(
                    target: "deskpilot::timing",
                    description = %policy.description,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "attempt failed"
                );
                last_error = Some(err);
                if attempt < policy.max_attempts {
                    thread::sleep(policy.interval);
                }
            }
            Err(err) => return Err(err),
        }
    }

    let elapsed = started.elapsed();
    Err(AutomationError::Timeout(Box::new(TimeoutError {
        description: policy.description.clone(),
        timeout: elapsed,
        attempts: policy.max_attempts,
        elapsed,
        stage: policy.stage,
        attempt_bounded: true,
        last_error: last_error.map(Box::new),
        candidates: Vec::new(),
    })))
}
