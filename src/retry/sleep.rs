use futures::future::BoxFuture;
use std::time::Duration;

/// Timed suspension used between attempts.
///
/// The default [`TokioSleeper`] yields to the runtime for the whole wait.
/// Tests swap in a recording implementation to observe the backoff schedule.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}
