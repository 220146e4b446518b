//! Image reachability check run before text recognition.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use thiserror::Error;

use super::error::{StageError, UnreachableCause};
use crate::retry::RetryPolicy;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("HTTP {0}")]
    NotFound(u16),
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    Transport(String),
}

impl ProbeError {
    fn cause(&self) -> UnreachableCause {
        match self {
            ProbeError::Timeout => UnreachableCause::Timeout,
            ProbeError::NotFound(_) | ProbeError::Transport(_) => UnreachableCause::NotFound,
        }
    }
}

#[async_trait]
pub trait ImageProbe: Send + Sync {
    /// Succeeds when `url` answers with a 2xx status.
    async fn probe(&self, url: &str) -> Result<(), ProbeError>;
}

/// Probes with `HEAD`, falling back to a one-byte ranged `GET` for servers
/// that reject `HEAD`.
pub struct HttpProbe {
    http: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, StageError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StageError::Configuration(format!("failed to build probe client: {e}")))?;
        Ok(Self { http })
    }
}

fn classify(status: StatusCode) -> Result<(), ProbeError> {
    if status.is_success() {
        Ok(())
    } else if status.is_client_error() {
        Err(ProbeError::NotFound(status.as_u16()))
    } else {
        Err(ProbeError::Transport(format!("HTTP {}", status.as_u16())))
    }
}

fn transport(e: reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout
    } else {
        ProbeError::Transport(e.to_string())
    }
}

#[async_trait]
impl ImageProbe for HttpProbe {
    async fn probe(&self, url: &str) -> Result<(), ProbeError> {
        let resp = self.http.head(url).send().await.map_err(transport)?;
        if resp.status() != StatusCode::METHOD_NOT_ALLOWED {
            return classify(resp.status());
        }
        let resp = self
            .http
            .get(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(transport)?;
        classify(resp.status())
    }
}

/// Probes `url` under `policy`. Every probe failure is retried since freshly
/// uploaded objects may not be visible yet.
pub async fn ensure_reachable(
    probe: &dyn ImageProbe,
    policy: &RetryPolicy,
    url: &str,
) -> Result<(), StageError> {
    policy
        .run(|_| probe.probe(url), |_| true)
        .await
        .map_err(|e| StageError::Unreachable {
            cause: e.cause(),
            url: url.to_string(),
            detail: format!("{e} after {} attempt(s)", policy.max_attempts),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
        error: ProbeError,
    }

    #[async_trait]
    impl ImageProbe for Flaky {
        async fn probe(&self, _url: &str) -> Result<(), ProbeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_probe_recovers_within_budget() {
        let probe = Flaky {
            calls: AtomicU32::new(0),
            fail_first: 2,
            error: ProbeError::NotFound(404),
        };
        ensure_reachable(&probe, &RetryPolicy::immediate(3), "https://cdn.example/a.jpg")
            .await
            .unwrap();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_probe_exhaustion_reports_cause() {
        let probe = Flaky {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            error: ProbeError::Timeout,
        };
        let err = ensure_reachable(&probe, &RetryPolicy::immediate(3), "https://cdn.example/a.jpg")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 408);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_classify_statuses() {
        assert!(classify(StatusCode::PARTIAL_CONTENT).is_ok());
        assert_eq!(classify(StatusCode::NOT_FOUND), Err(ProbeError::NotFound(404)));
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY),
            Err(ProbeError::Transport(_))
        ));
    }
}
