use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::warn;

use crate::BackendError;
use crate::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Runs `task` under the policy's per-attempt timeout, retrying with
/// exponential backoff while `should_retry` classifies the error as
/// transient. A timed-out attempt is retried the same way.
pub(crate) async fn task_with_timeout_and_exponential_backoff<F, T, P>(
    op_name: &'static str,
    policy: BackoffPolicy,
    should_retry: fn(&Error) -> bool,
    task: F,
) -> Result<P>
where
    F: Fn() -> T,
    T: std::future::Future<Output = Result<P>>,
{
    let mut retries = 0;
    let mut delay = Duration::from_millis(policy.base_delay_ms);
    let timeout_duration = Duration::from_millis(policy.timeout_ms);

    loop {
        let e = match timeout(timeout_duration, task()).await {
            Ok(Ok(r)) => {
                return Ok(r);
            }
            Ok(Err(error)) => {
                if !should_retry(&error) {
                    return Err(error);
                }
                warn!("{op_name} failed with error: {:?}", &error);
                error
            }
            Err(_) => {
                warn!("{op_name} attempt timed out after {:?}", timeout_duration);
                BackendError::RetriesExhausted { operation: op_name }.into()
            }
        };

        retries += 1;
        if retries >= policy.max_retries {
            warn!("{op_name} failed after {} retries", retries);
            return Err(e);
        }

        sleep(jittered(delay)).await;
        delay = (delay * 2).min(Duration::from_millis(policy.max_delay_ms));
    }
}

/// Uniformly random delay up to the current backoff cap
fn jittered(delay: Duration) -> Duration {
    let max = delay.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(1..=max))
}
