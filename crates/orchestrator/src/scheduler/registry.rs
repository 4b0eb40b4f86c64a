use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Result;

pub type JobFuture = BoxFuture<'static, Result<()>>;
pub type JobCallable = Arc<dyn Fn(Value) -> JobFuture + Send + Sync>;

/// Named callables that persisted jobs resolve to.
#[derive(Clone, Default)]
pub struct CallableRegistry {
    callables: Arc<RwLock<HashMap<String, JobCallable>>>,
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: impl Into<String>, callable: JobCallable) {
        let name = name.into();
        tracing::debug!(callable = %name, "Registered scheduler callable");
        self.callables.write().await.insert(name, callable);
    }

    pub async fn get(&self, name: &str) -> Option<JobCallable> {
        self.callables.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.callables.read().await.contains_key(name)
    }
}

impl std::fmt::Debug for CallableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallableRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = CallableRegistry::new();
        assert!(!registry.contains("noop").await);

        registry
            .register("noop", Arc::new(|_args| async { Ok(()) }.boxed()))
            .await;

        let callable = registry.get("noop").await.unwrap();
        callable(Value::Null).await.unwrap();
        assert!(registry.get("missing").await.is_none());
    }
}
