use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

/// Only 5xx answers from the API server are worth retrying; 409 on create and
/// 404 on read are handled by callers, anything else is a request bug.
pub fn is_server_error(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code >= 500)
}

/// Run a cluster call under the bounded backoff policy: 3 attempts,
/// exponential delay from 100ms.
pub async fn with_backoff<T, F, Fut>(op: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    op.retry(
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_times(3),
    )
    .when(is_server_error)
    .notify(|err, dur| {
        debug!(msg = "retrying Kubernetes call", %err, backoff = ?dur);
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    use kube::core::ErrorResponse;
    use kube::core::response::StatusSummary;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(Box::new(ErrorResponse {
            status: Some(StatusSummary::Failure),
            message: "boom".to_string(),
            reason: "TestReason".to_string(),
            code,
            details: None,
            metadata: None,
        }))
    }

    #[test]
    fn test_server_errors_are_retryable() {
        assert!(is_server_error(&api_error(500)));
        assert!(is_server_error(&api_error(503)));
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        assert!(!is_server_error(&api_error(404)));
        assert!(!is_server_error(&api_error(409)));
        assert!(!is_server_error(&api_error(422)));
    }

    #[tokio::test]
    async fn test_with_backoff_gives_up_after_bounded_attempts() {
        let mut calls = 0u32;
        let result: Result<(), _> = with_backoff(|| {
            calls += 1;
            async { Err(api_error(500)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 4, "initial call plus three retries");
    }

    #[tokio::test]
    async fn test_with_backoff_does_not_retry_conflict() {
        let mut calls = 0u32;
        let result: Result<(), _> = with_backoff(|| {
            calls += 1;
            async { Err(api_error(409)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
