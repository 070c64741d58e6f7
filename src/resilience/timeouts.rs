//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap backend calls with the per-request timeout
//! - Disable the timeout while a debugger is attached to the backend
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors

use std::future::Future;
use std::time::Duration;

use crate::error::ForwardError;

/// An optional deadline applied to each backend operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTimeout(Option<Duration>);

impl OperationTimeout {
    /// Build the timeout for one request. An attached debugger disables it so
    /// interactive sessions are not cut off.
    pub fn for_request(configured: Duration, debugger_attached: bool) -> Self {
        if debugger_attached || configured.is_zero() {
            Self(None)
        } else {
            Self(Some(configured))
        }
    }

    pub fn infinite() -> Self {
        Self(None)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.0
    }

    /// Run `fut`, failing with [`ForwardError::Timeout`] when it takes too long.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, ForwardError>
    where
        F: Future<Output = Result<T, ForwardError>>,
    {
        match self.0 {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| ForwardError::Timeout)?,
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debugger_disables_timeout() {
        let t = OperationTimeout::for_request(Duration::from_secs(30), true);
        assert_eq!(t.duration(), None);
        let t = OperationTimeout::for_request(Duration::from_secs(30), false);
        assert_eq!(t.duration(), Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_operation_is_timeout() {
        let t = OperationTimeout::for_request(Duration::from_millis(50), false);
        let result: Result<(), ForwardError> = t
            .run(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ForwardError::Timeout)));
    }
}
