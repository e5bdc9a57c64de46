/// Runner contract tests
///
/// Attempt, sleep and rollback counts for every outcome of a runner
/// invocation, driven by a scripted session.
/// Run with: cargo test --test runner_tests
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use txretry::{
    BoxFuture, ErrorClass, MessageClassifier, RetryPolicy, RunError, RunState, Session, Sleeper,
    SqlState, TransactionRunner,
};

#[derive(Debug, Clone, PartialEq)]
struct ScriptError {
    code: Option<&'static str>,
    message: String,
}

impl ScriptError {
    fn conflict() -> Self {
        Self {
            code: Some("40001"),
            message: "restart transaction: TransactionRetryWithProtoRefreshError".into(),
        }
    }

    fn fatal(message: &str) -> Self {
        Self {
            code: Some("23505"),
            message: message.into(),
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ScriptError {}

impl SqlState for ScriptError {
    fn sqlstate(&self) -> Option<&str> {
        self.code
    }
}

#[derive(Default)]
struct ScriptedSession {
    calls: usize,
    begins: usize,
    commits: usize,
    rollbacks: usize,
    drop_rollbacks: usize,
    open: bool,
    commit_failures: VecDeque<ScriptError>,
    rollback_failures: VecDeque<ScriptError>,
}

#[async_trait]
impl Session for ScriptedSession {
    type Error = ScriptError;

    async fn begin(&mut self) -> Result<(), ScriptError> {
        assert!(!self.open, "at most one transaction may be open");
        self.open = true;
        self.begins += 1;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ScriptError> {
        assert!(self.open);
        self.open = false;
        if let Some(err) = self.commit_failures.pop_front() {
            return Err(err);
        }
        self.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ScriptError> {
        assert!(self.open);
        self.open = false;
        self.rollbacks += 1;
        match self.rollback_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn start_rollback(&mut self) {
        self.open = false;
        self.drop_rollbacks += 1;
    }
}

#[derive(Clone, Default)]
struct CountingSleeper {
    waits: Arc<Mutex<Vec<Duration>>>,
}

impl CountingSleeper {
    fn count(&self) -> usize {
        self.waits.lock().unwrap().len()
    }
}

impl Sleeper for CountingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.waits.lock().unwrap().push(duration);
        Box::pin(async {})
    }
}

fn runner(max_retries: u32, sleeper: &CountingSleeper) -> TransactionRunner {
    TransactionRunner::new(RetryPolicy::new().max_retries(max_retries))
        .unwrap()
        .with_sleeper(sleeper.clone())
}

/// Runs `script` (one entry per attempt) and returns the result.
async fn run_script(
    runner: &TransactionRunner,
    session: &mut ScriptedSession,
    script: &[Result<u32, ScriptError>],
) -> Result<u32, RunError<ScriptError>> {
    runner
        .run(session, |s| {
            let outcome = script[s.calls].clone();
            s.calls += 1;
            Box::pin(async move { outcome })
        })
        .await
}

#[tokio::test]
async fn test_always_conflicting_exhausts_every_ceiling() {
    for max_retries in 1..=8 {
        let sleeper = CountingSleeper::default();
        let runner = runner(max_retries, &sleeper);
        let mut session = ScriptedSession::default();
        let script = vec![Err(ScriptError::conflict()); max_retries as usize];

        let err = run_script(&runner, &mut session, &script).await.unwrap_err();

        match err {
            RunError::RetriesExhausted { max_retries: ceiling } => assert_eq!(ceiling, max_retries),
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(session.calls, max_retries as usize);
        assert_eq!(session.begins, max_retries as usize);
        assert_eq!(session.rollbacks, max_retries as usize);
        assert_eq!(session.commits, 0);
        assert_eq!(sleeper.count(), max_retries as usize - 1);
    }
}

#[tokio::test]
async fn test_success_on_attempt_k() {
    let max_retries = 5;
    for k in 1..=max_retries {
        let sleeper = CountingSleeper::default();
        let runner = runner(max_retries, &sleeper);
        let mut session = ScriptedSession::default();

        let mut script = vec![Err(ScriptError::conflict()); k as usize - 1];
        script.push(Ok(k));

        let value = run_script(&runner, &mut session, &script).await.unwrap();

        assert_eq!(value, k);
        assert_eq!(session.calls, k as usize);
        assert_eq!(session.commits, 1);
        assert_eq!(session.rollbacks, k as usize - 1);
        assert_eq!(sleeper.count(), k as usize - 1);
        assert!(!session.open);
    }
}

#[tokio::test]
async fn test_fatal_on_attempt_j_stops_immediately() {
    let max_retries = 5;
    for j in 1..=max_retries {
        let sleeper = CountingSleeper::default();
        let runner = runner(max_retries, &sleeper);
        let mut session = ScriptedSession::default();

        let mut script = vec![Err(ScriptError::conflict()); j as usize - 1];
        script.push(Err(ScriptError::fatal("constraint violation")));

        let err = run_script(&runner, &mut session, &script).await.unwrap_err();

        assert_eq!(
            err.into_operation(),
            Some(ScriptError::fatal("constraint violation"))
        );
        assert_eq!(session.calls, j as usize);
        assert_eq!(session.commits, 0);
        // Conflicts and the fatal error are all rolled back explicitly.
        assert_eq!(session.rollbacks, j as usize);
        assert_eq!(sleeper.count(), j as usize - 1);
    }
}

#[tokio::test]
async fn test_scenario_two_conflicts_then_success() {
    let sleeper = CountingSleeper::default();
    let runner = runner(3, &sleeper);
    let mut session = ScriptedSession::default();
    let script = [
        Err(ScriptError::conflict()),
        Err(ScriptError::conflict()),
        Ok(42),
    ];

    let (result, report) = runner
        .run_with_report(&mut session, |s| {
            let outcome = script[s.calls].clone();
            s.calls += 1;
            Box::pin(async move { outcome })
        })
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(session.calls, 3);
    assert_eq!(sleeper.count(), 2);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.sleeps(), 2);
    assert_eq!(report.final_state, RunState::Committed);
}

#[tokio::test]
async fn test_scenario_ceiling_two() {
    let sleeper = CountingSleeper::default();
    let runner = runner(2, &sleeper);
    let mut session = ScriptedSession::default();
    let script = vec![Err(ScriptError::conflict()); 2];

    let err = run_script(&runner, &mut session, &script).await.unwrap_err();

    assert!(err.is_retries_exhausted());
    assert!(err.to_string().contains('2'));
    assert_eq!(session.calls, 2);
    assert_eq!(sleeper.count(), 1);
}

#[tokio::test]
async fn test_scenario_fatal_first_attempt() {
    let sleeper = CountingSleeper::default();
    let runner = runner(5, &sleeper);
    let mut session = ScriptedSession::default();
    let script: [Result<u32, ScriptError>; 1] = [Err(ScriptError::fatal("constraint violation"))];

    let (result, report) = runner
        .run_with_report(&mut session, |s| {
            let outcome = script[s.calls].clone();
            s.calls += 1;
            Box::pin(async move { outcome })
        })
        .await;

    match result {
        Err(RunError::Operation(err)) => assert_eq!(err, ScriptError::fatal("constraint violation")),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(session.calls, 1);
    assert_eq!(sleeper.count(), 0);
    assert_eq!(report.final_state, RunState::Aborted);
}

#[tokio::test]
async fn test_fatal_classification_is_repeatable() {
    let sleeper = CountingSleeper::default();
    let runner = runner(3, &sleeper);

    let mut first = ScriptedSession::default();
    let mut second = ScriptedSession::default();
    let script = [Err(ScriptError::fatal("constraint violation"))];

    let a = run_script(&runner, &mut first, &script).await.unwrap_err();
    let b = run_script(&runner, &mut second, &script).await.unwrap_err();

    assert_eq!(a.as_operation(), b.as_operation());
    assert!(a.as_operation().is_some());
}

#[tokio::test]
async fn test_commit_time_conflict_counts_as_attempt() {
    let sleeper = CountingSleeper::default();
    let runner = runner(3, &sleeper);
    let mut session = ScriptedSession {
        commit_failures: VecDeque::from([ScriptError::conflict(), ScriptError::conflict()]),
        ..Default::default()
    };
    let script = [Ok(1), Ok(2), Ok(3)];

    let value = run_script(&runner, &mut session, &script).await.unwrap();

    assert_eq!(value, 3);
    assert_eq!(session.begins, 3);
    assert_eq!(session.commits, 1);
    // A failed commit already ended the transaction, nothing to roll back.
    assert_eq!(session.rollbacks, 0);
    assert_eq!(sleeper.count(), 2);
}

#[tokio::test]
async fn test_fatal_commit_error_propagates() {
    let sleeper = CountingSleeper::default();
    let runner = runner(3, &sleeper);
    let mut session = ScriptedSession {
        commit_failures: VecDeque::from([ScriptError::fatal("connection reset")]),
        ..Default::default()
    };

    let err = run_script(&runner, &mut session, &[Ok(1)]).await.unwrap_err();

    assert_eq!(err.into_operation(), Some(ScriptError::fatal("connection reset")));
    assert_eq!(session.calls, 1);
    assert_eq!(sleeper.count(), 0);
}

#[tokio::test]
async fn test_failed_rollback_after_conflict_is_fatal() {
    let sleeper = CountingSleeper::default();
    let runner = runner(3, &sleeper);
    let mut session = ScriptedSession {
        rollback_failures: VecDeque::from([ScriptError::fatal("connection lost")]),
        ..Default::default()
    };
    let script = [Err(ScriptError::conflict()), Ok(1)];

    let err = run_script(&runner, &mut session, &script).await.unwrap_err();

    assert_eq!(err.into_operation(), Some(ScriptError::fatal("connection lost")));
    assert_eq!(session.calls, 1);
    assert_eq!(sleeper.count(), 0);
}

#[tokio::test]
async fn test_failed_rollback_after_fatal_keeps_original_error() {
    let sleeper = CountingSleeper::default();
    let runner = runner(3, &sleeper);
    let mut session = ScriptedSession {
        rollback_failures: VecDeque::from([ScriptError::fatal("connection lost")]),
        ..Default::default()
    };
    let script = [Err(ScriptError::fatal("business rule"))];

    let err = run_script(&runner, &mut session, &script).await.unwrap_err();

    assert_eq!(err.into_operation(), Some(ScriptError::fatal("business rule")));
}

#[tokio::test]
async fn test_message_classifier_drives_retries() {
    let sleeper = CountingSleeper::default();
    let runner = runner(3, &sleeper).with_classifier(MessageClassifier::default());
    let mut session = ScriptedSession::default();
    let untagged_conflict = ScriptError {
        code: None,
        message: "ERROR: restart transaction".into(),
    };
    let script = [Err(untagged_conflict), Ok(9)];

    assert_eq!(run_script_with(&runner, &mut session, &script).await.unwrap(), 9);
    assert_eq!(sleeper.count(), 1);
}

#[tokio::test]
async fn test_closure_classifier() {
    let sleeper = CountingSleeper::default();
    let runner = runner(4, &sleeper).with_classifier(|err: &ScriptError| {
        if err.message.contains("retry me") {
            ErrorClass::Retryable
        } else {
            ErrorClass::Fatal
        }
    });
    let mut session = ScriptedSession::default();
    let retry_me = ScriptError::fatal("please retry me");
    let script = [Err(retry_me.clone()), Err(retry_me), Ok(5)];

    assert_eq!(run_script_with(&runner, &mut session, &script).await.unwrap(), 5);
    assert_eq!(session.calls, 3);
    assert_eq!(sleeper.count(), 2);
}

async fn run_script_with<C>(
    runner: &TransactionRunner<C>,
    session: &mut ScriptedSession,
    script: &[Result<u32, ScriptError>],
) -> Result<u32, RunError<ScriptError>>
where
    C: txretry::ErrorClassifier<ScriptError>,
{
    runner
        .run(session, |s| {
            let outcome = script[s.calls].clone();
            s.calls += 1;
            Box::pin(async move { outcome })
        })
        .await
}

#[tokio::test]
async fn test_unit_of_work_dropped_mid_flight_releases_transaction() {
    let token = txretry::CancellationToken::new();
    let runner = TransactionRunner::default().with_cancellation(token.clone());
    let mut session = ScriptedSession::default();

    let cancel = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
    });

    let result = runner
        .run(&mut session, |s| {
            s.calls += 1;
            Box::pin(async {
                std::future::pending::<()>().await;
                Ok::<u32, ScriptError>(0)
            })
        })
        .await;
    cancel.await.unwrap();

    assert!(matches!(result, Err(RunError::Cancelled { attempts: 1 })));
    assert_eq!(session.calls, 1);
    assert_eq!(session.drop_rollbacks, 1);
    assert!(!session.open);
}
