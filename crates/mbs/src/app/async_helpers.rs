use std::future::Future;
use std::time::Duration;

use crate::error::AppError;

/// Await `future` for at most `timeout`, mapping its error with `map_error`.
pub(super) async fn run_with_timeout<T, E, F, M>(
    timeout: Duration,
    timeout_operation: &'static str,
    future: F,
    map_error: M,
) -> Result<T, AppError>
where
    F: Future<Output = Result<T, E>>,
    M: FnOnce(E) -> AppError,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(map_error(error)),
        Err(_) => Err(AppError::timeout(timeout_operation, timeout.as_secs())),
    }
}
