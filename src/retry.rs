use std::future::Future;
use std::time::Duration;

use crate::error::RegistryError;

/// Retries a registry operation with exponential backoff while it keeps
/// failing with a retryable error (a writer conflict). Any other error is
/// returned on the first attempt.
pub async fn with_retry<F, Fut, T>(
    max_retries: u32,
    base_delay_ms: u64,
    operation_name: &str,
    mut f: F,
) -> Result<T, RegistryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RegistryError>>,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt > max_retries {
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt,
                        "All retry attempts exhausted"
                    );
                    return Err(e);
                }

                let delay = Duration::from_millis(base_delay_ms * 2u64.pow(attempt - 1));
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_retries = max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after conflict"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
