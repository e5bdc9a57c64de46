use super::policy::RetryPolicy;
use super::sleep::{Sleeper, TokioSleeper};
use crate::core::{ConfigError, ErrorClass, ErrorClassifier, RunError, SqlState, SqlStateClassifier};
use crate::transaction::{RunReport, RunState, Session, TransactionScope};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, warn};

/// Runs a unit of work inside a transaction and retries it on serialization
/// conflicts.
///
/// Each attempt opens a fresh [`TransactionScope`], runs the unit of work from
/// its start and commits. A failure classified as [`ErrorClass::Retryable`]
/// (at any point, commit included) rolls the attempt back, waits out an
/// exponential, jittered backoff and starts over. A fatal failure is rolled
/// back and returned unchanged. After `max_retries` conflicting attempts the
/// runner gives up with [`RunError::RetriesExhausted`].
///
/// # Examples
///
/// ```
/// use txretry::{RetryPolicy, TransactionRunner};
/// use txretry::memory::{MemoryError, MemoryStore};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MemoryStore::new();
/// let mut session = store.session();
/// let runner = TransactionRunner::new(RetryPolicy::new().max_retries(5))?;
///
/// runner
///     .run(&mut session, |s| {
///         Box::pin(async move {
///             let balance = s.get("acct").await?.unwrap_or(0);
///             s.put("acct", balance + 10).await?;
///             Ok::<_, MemoryError>(())
///         })
///     })
///     .await?;
///
/// assert_eq!(store.value("acct").await, Some(10));
/// # Ok(())
/// # }
/// ```
pub struct TransactionRunner<C = SqlStateClassifier> {
    policy: RetryPolicy,
    classifier: C,
    sleeper: Arc<dyn Sleeper>,
    cancel: Option<CancellationToken>,
}

enum Step<T, E> {
    Committed(T),
    /// Retryable failure; the attempt's transaction is already released.
    Conflict(E),
    /// Fatal failure; the attempt's transaction is already released.
    Fatal(E),
    Cancelled,
}

impl TransactionRunner {
    pub fn new(policy: RetryPolicy) -> Result<Self, ConfigError> {
        policy.validate()?;
        Ok(Self {
            policy,
            classifier: SqlStateClassifier::new(),
            sleeper: Arc::new(TokioSleeper),
            cancel: None,
        })
    }
}

impl Default for TransactionRunner {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            classifier: SqlStateClassifier::new(),
            sleeper: Arc::new(TokioSleeper),
            cancel: None,
        }
    }
}

impl<C> TransactionRunner<C> {
    pub fn with_classifier<C2>(self, classifier: C2) -> TransactionRunner<C2> {
        TransactionRunner {
            policy: self.policy,
            classifier,
            sleeper: self.sleeper,
            cancel: self.cancel,
        }
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Abort the in-flight attempt or backoff wait as soon as `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    /// Run `op` with retries. See [`run_with_report`](Self::run_with_report).
    pub async fn run<S, T, E, F>(&self, session: &mut S, op: F) -> Result<T, RunError<E>>
    where
        S: Session,
        E: From<S::Error> + fmt::Display,
        C: ErrorClassifier<E>,
        F: for<'c> FnMut(&'c mut S) -> BoxFuture<'c, Result<T, E>>,
    {
        self.run_with_report(session, op).await.0
    }

    /// Run `op` with retries and report what happened.
    ///
    /// The unit of work must be safe to run again from the start: everything
    /// it does outside the session's transaction is repeated on every attempt.
    pub async fn run_with_report<S, T, E, F>(
        &self,
        session: &mut S,
        op: F,
    ) -> (Result<T, RunError<E>>, RunReport)
    where
        S: Session,
        E: From<S::Error> + fmt::Display,
        C: ErrorClassifier<E>,
        F: for<'c> FnMut(&'c mut S) -> BoxFuture<'c, Result<T, E>>,
    {
        let started = Instant::now();
        let mut report = RunReport::new();
        let span = debug_span!("txn_run", max_retries = self.policy.max_retries);

        let driven = self.drive(session, op, &mut report).instrument(span);
        let result = match self.policy.deadline {
            Some(deadline) => {
                let outcome = tokio::time::timeout(deadline, driven).await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(deadline_ms = millis(deadline), "transaction deadline elapsed");
                        report.final_state = RunState::Cancelled;
                        Err(RunError::TimedOut {
                            elapsed: started.elapsed(),
                        })
                    }
                }
            }
            None => driven.await,
        };

        report.elapsed = started.elapsed();
        (result, report)
    }

    async fn drive<S, T, E, F>(
        &self,
        session: &mut S,
        mut op: F,
        report: &mut RunReport,
    ) -> Result<T, RunError<E>>
    where
        S: Session,
        E: From<S::Error> + fmt::Display,
        C: ErrorClassifier<E>,
        F: for<'c> FnMut(&'c mut S) -> BoxFuture<'c, Result<T, E>>,
    {
        let max_retries = self.policy.max_retries.max(1);
        let mut state = RunState::Idle;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if self.is_cancelled() {
                report.final_state = advance(state, RunState::Cancelled);
                return Err(RunError::Cancelled {
                    attempts: attempt - 1,
                });
            }

            state = advance(state, RunState::Attempting);
            report.final_state = state;
            report.attempts = attempt;
            debug!(attempt, max_retries, "starting transaction attempt");

            let err = match self.attempt(session, &mut op).await {
                Step::Committed(value) => {
                    report.final_state = advance(state, RunState::Committed);
                    debug!(attempt, "transaction committed");
                    return Ok(value);
                }
                Step::Fatal(err) => {
                    report.final_state = advance(state, RunState::Aborted);
                    debug!(attempt, error = %err, "non-retryable error, aborting transaction");
                    return Err(RunError::Operation(err));
                }
                Step::Cancelled => {
                    report.final_state = advance(state, RunState::Cancelled);
                    debug!(attempt, "transaction attempt cancelled");
                    return Err(RunError::Cancelled { attempts: attempt });
                }
                Step::Conflict(err) => err,
            };

            if attempt >= max_retries {
                report.final_state = advance(state, RunState::Exhausted);
                warn!(
                    attempt,
                    max_retries,
                    error = %err,
                    "transaction did not succeed after {} retries",
                    max_retries
                );
                return Err(RunError::RetriesExhausted { max_retries });
            }

            state = advance(state, RunState::RolledBackPendingRetry);
            report.final_state = state;

            let backoff = self.policy.random_backoff_delay(attempt);
            warn!(
                attempt,
                max_retries,
                backoff_ms = millis(backoff),
                error = %err,
                "retry on conflict (attempt {} of {})",
                attempt,
                max_retries
            );
            report.backoffs.push(backoff);

            if !self.wait(backoff).await {
                report.final_state = advance(state, RunState::Cancelled);
                debug!(attempt, "backoff cancelled");
                return Err(RunError::Cancelled { attempts: attempt });
            }
        }
    }

    /// One full attempt: begin, run, commit. The transaction is released
    /// before this returns, whatever the outcome.
    async fn attempt<S, T, E, F>(&self, session: &mut S, op: &mut F) -> Step<T, E>
    where
        S: Session,
        E: From<S::Error> + fmt::Display,
        C: ErrorClassifier<E>,
        F: for<'c> FnMut(&'c mut S) -> BoxFuture<'c, Result<T, E>>,
    {
        let mut scope = match TransactionScope::begin(session).await {
            Ok(scope) => scope,
            Err(err) => return self.failed(E::from(err)),
        };

        let outcome = {
            let work = op(scope.session());
            match &self.cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    result = work => Some(result),
                },
                None => Some(work.await),
            }
        };

        // Dropping the open scope starts the rollback.
        let Some(outcome) = outcome else {
            return Step::Cancelled;
        };

        match outcome {
            Ok(value) => match scope.commit().await {
                Ok(()) => Step::Committed(value),
                Err(err) => self.failed(E::from(err)),
            },
            Err(err) => match self.classifier.classify(&err) {
                ErrorClass::Retryable => match scope.rollback().await {
                    Ok(()) => Step::Conflict(err),
                    Err(rollback_err) => {
                        warn!(error = %err, rollback_error = %rollback_err, "rollback after conflict failed");
                        Step::Fatal(E::from(rollback_err))
                    }
                },
                ErrorClass::Fatal => {
                    if let Err(rollback_err) = scope.rollback().await {
                        warn!(error = %err, rollback_error = %rollback_err, "rollback after fatal error failed");
                    }
                    Step::Fatal(err)
                }
            },
        }
    }

    fn failed<T, E>(&self, err: E) -> Step<T, E>
    where
        C: ErrorClassifier<E>,
    {
        match self.classifier.classify(&err) {
            ErrorClass::Retryable => Step::Conflict(err),
            ErrorClass::Fatal => Step::Fatal(err),
        }
    }

    /// Returns `false` when cancelled before `backoff` elapsed.
    async fn wait(&self, backoff: Duration) -> bool {
        let sleep = self.sleeper.sleep(backoff);
        match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => false,
                _ = sleep => true,
            },
            None => {
                sleep.await;
                true
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

fn advance(from: RunState, to: RunState) -> RunState {
    debug_assert!(
        from.can_transition(to),
        "illegal runner transition {from} -> {to}"
    );
    to
}

/// Run `op` on `session` with up to `max_retries` attempts, the default
/// backoff and SQLSTATE classification.
///
/// `max_retries` of 0 is treated as 1.
pub async fn run_transaction<S, T, E, F>(
    session: &mut S,
    op: F,
    max_retries: u32,
) -> Result<T, RunError<E>>
where
    S: Session,
    E: From<S::Error> + SqlState + fmt::Display,
    F: for<'c> FnMut(&'c mut S) -> BoxFuture<'c, Result<T, E>>,
{
    let runner = TransactionRunner {
        policy: RetryPolicy::new().max_retries(max_retries.max(1)),
        ..TransactionRunner::default()
    };
    runner.run(session, op).await
}
