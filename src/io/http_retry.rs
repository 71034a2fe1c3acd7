//! Retry helper shared by the credential manager and the relay
//!
//! A request is re-issued after `retry_delay` when it returns a 5xx, times
//! out, or fails in transport, up to `retry_count` extra attempts. The last
//! attempt's response is returned as-is, success or not. Shutdown is never
//! retried: it aborts the in-flight attempt or the delay and surfaces as
//! `RetryError::Cancelled`.

use crate::infra::config::HttpSettings;
use crate::infra::shutdown;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RetryError<E = reqwest::Error> {
    #[error("request cancelled")]
    Cancelled,
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(E),
}

/// Response side of an attempt
pub trait RetryableResponse {
    fn status_code(&self) -> u16;
}

/// Error side of an attempt
pub trait RetryableError: std::fmt::Display {
    fn is_timeout(&self) -> bool;
}

impl RetryableResponse for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }
}

impl RetryableError for reqwest::Error {
    fn is_timeout(&self) -> bool {
        reqwest::Error::is_timeout(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl From<&HttpSettings> for RetryPolicy {
    fn from(http: &HttpSettings) -> Self {
        Self { retry_count: http.retry_count, retry_delay: http.retry_delay }
    }
}

/// Client shared by auth and relay, with the configured per-request timeout
pub fn build_client(http: &HttpSettings) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(http.timeout)
        .user_agent(concat!("geotrack/", env!("CARGO_PKG_VERSION")))
        .build()
}

fn is_server_error(status: u16) -> bool {
    status >= 500
}

/// Issue `request()` until it yields a non-5xx response or attempts run out
pub async fn send_with_retry<F, Fut, R, E>(
    policy: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
    mut request: F,
) -> Result<R, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    R: RetryableResponse,
    E: RetryableError,
{
    let mut attempt: u32 = 0;
    loop {
        if shutdown::is_signalled(&shutdown) {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;
        let last = attempt > policy.retry_count;

        let outcome = tokio::select! {
            _ = shutdown::signalled(&mut shutdown) => return Err(RetryError::Cancelled),
            outcome = request() => outcome,
        };

        match outcome {
            Ok(response) => {
                let status = response.status_code();
                if last || !is_server_error(status) {
                    return Ok(response);
                }
                warn!(attempt = %attempt, status = %status, "http_retry_server_error");
            }
            Err(e) if e.is_timeout() => {
                if last {
                    return Err(RetryError::Timeout);
                }
                warn!(attempt = %attempt, "http_retry_timeout");
            }
            Err(e) => {
                if last {
                    return Err(RetryError::Transport(e));
                }
                warn!(attempt = %attempt, error = %e, "http_retry_transport_error");
            }
        }

        tokio::select! {
            _ = shutdown::signalled(&mut shutdown) => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(policy.retry_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Status(u16);

    impl RetryableResponse for Status {
        fn status_code(&self) -> u16 {
            self.0
        }
    }

    #[derive(Debug)]
    enum FakeError {
        Timeout,
        Refused,
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl RetryableError for FakeError {
        fn is_timeout(&self) -> bool {
            matches!(self, FakeError::Timeout)
        }
    }

    fn policy(retry_count: u32) -> RetryPolicy {
        RetryPolicy { retry_count, retry_delay: Duration::from_secs(2) }
    }

    /// Fails with 500 until `succeed_on`, then returns 200
    fn flaky(
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    ) -> impl FnMut() -> std::future::Ready<Result<Status, FakeError>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(Ok(Status(if n >= succeed_on { 200 } else { 500 })))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_last_allowed_attempt() {
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        let response = send_with_retry(policy(3), rx, flaky(calls.clone(), 4)).await.unwrap();
        assert_eq!(response.0, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_5xx_when_retries_exhausted() {
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        let response = send_with_retry(policy(2), rx, flaky(calls.clone(), 4)).await.unwrap();
        assert_eq!(response.0, 500);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let response = send_with_retry(policy(3), rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok::<_, FakeError>(Status(401)))
        })
        .await
        .unwrap();
        assert_eq!(response.0, 401);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_then_reported() {
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = send_with_retry(policy(1), rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err::<Status, _>(FakeError::Timeout))
        })
        .await;
        assert!(matches!(result, Err(RetryError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_surfaces_on_last_attempt() {
        let (_tx, rx) = watch::channel(false);
        let result = send_with_retry(policy(0), rx, || std::future::ready(Err::<Status, _>(FakeError::Refused))).await;
        assert!(matches!(result, Err(RetryError::Transport(FakeError::Refused))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay_is_not_retried() {
        let (tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let task = tokio::spawn(async move {
            send_with_retry(policy(5), rx, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Ok::<_, FakeError>(Status(503)))
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(true).unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_sends_nothing() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let result = send_with_retry(policy(3), rx, flaky(calls.clone(), 1)).await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
