//! Cancellable repeating tasks

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs an async closure once per period until cancelled or dropped.
///
/// The first run happens one full period after spawning. A tick that
/// overruns the period delays the next one instead of bursting.
#[derive(Debug)]
pub struct RepeatingTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.child_token();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(task = name, period_ms = period.as_millis() as u64, "Repeating task started");

            loop {
                tokio::select! {
                    () = child.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // Cancellation wins over a tick that became ready at the same time.
                if child.is_cancelled() {
                    break;
                }
                f().await;
            }

            debug!(task = name, "Repeating task stopped");
        });

        Self { token, handle }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
