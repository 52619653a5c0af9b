//! Request identity and the unit-of-work abstraction

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::WorkError;

/// Free-form caller metadata carried alongside a request
pub type Metadata = serde_json::Value;

/// Future produced by one attempt of a unit of work
pub type WorkFuture<T> = BoxFuture<'static, Result<T, WorkError>>;

/// A re-invocable unit of work
///
/// Each invocation is one attempt; retries call it again.
pub type Work<T> = Arc<dyn Fn() -> WorkFuture<T> + Send + Sync>;

/// Wrap an async closure as a `Work`
pub fn work<T, F, Fut>(f: F) -> Work<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, WorkError>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Unique, time-ordered request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }

    #[tokio::test]
    async fn test_work_is_reinvocable() {
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c = counter.clone();
        let w: Work<u32> = work(move || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1) }
        });

        assert_eq!(w().await, Ok(1));
        assert_eq!(w().await, Ok(2));
    }
}
