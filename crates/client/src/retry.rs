//! Bounded retry for transient source failures.

use std::future::Future;

use crate::error::Result;

/// The number of attempts made before a discovery is considered failed.
///
/// Attempts rotate through a source's mirror list, so with three mirrors
/// every mirror is tried once.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Runs `attempt` up to `max_attempts` times, stopping early on success or
/// on an error that is not transient.
///
/// The closure receives the zero-based attempt number so callers can rotate
/// mirrors with `attempt % mirrors.len()`. Failed attempts are logged with
/// increasing severity.
pub async fn with_retries<T, F, Fut>(what: &str, max_attempts: usize, mut attempt: F) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    debug_assert!(max_attempts > 0);

    let mut n = 0;
    loop {
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && n + 1 < max_attempts => {
                if n == 0 {
                    tracing::info!("retrying {what} after attempt {attempt} failed: {err}", attempt = n + 1);
                } else {
                    tracing::warn!("retrying {what} after attempt {attempt} failed: {err}", attempt = n + 1);
                }
            }
            Err(err) => return Err(err),
        }
        n += 1;
    }
}
