use std::future::Future;

use tracing::trace;
use ws_core::{Error, Result};

use crate::config::PollSettings;

/// Polls `check` until it yields `true`, sleeping `settings.interval()`
/// between attempts. Errors from `check` count as a failed attempt.
///
/// Fails with [`Error::Timeout`] naming `what` once the attempt cap is spent.
pub async fn poll_until<F, Fut>(settings: PollSettings, what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    poll_for(settings, what, || {
        let attempt = check();
        async move { Ok(attempt.await?.then_some(())) }
    })
    .await
}

/// Like [`poll_until`], but yields the first value `step` produces.
pub async fn poll_for<T, F, Fut>(settings: PollSettings, what: &str, mut step: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let attempts = settings.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match step().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => {
                trace!(what, attempt, error = %e, "poll attempt failed");
                last_error = Some(e.to_string());
            }
        }
        if attempt < attempts {
            tokio::time::sleep(settings.interval()).await;
        }
    }

    let mut message = format!(
        "{} not reached after {} attempts ({}ms apart)",
        what, attempts, settings.interval_ms
    );
    if let Some(e) = last_error {
        message.push_str(&format!("; last error: {}", e));
    }
    Err(Error::Timeout(message))
}
