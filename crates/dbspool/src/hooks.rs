//! Commit and abort hooks.

use std::future::Future;

use futures_util::future::BoxFuture;

use crate::error::BoxError;

type HookFuture = BoxFuture<'static, Result<(), BoxError>>;

/// A registered hook, invoked at most once.
pub(crate) type Hook = Box<dyn FnOnce() -> HookFuture + Send>;

pub(crate) fn boxed<F, Fut>(hook: F) -> Hook
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Box::new(move || Box::pin(hook()) as HookFuture)
}

/// Hooks registered on one transaction, in registration order.
#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) pre_commit: Vec<Hook>,
    pub(crate) post_commit: Vec<Hook>,
    pub(crate) post_abort: Vec<Hook>,
}

/// Run hooks in order, stopping at the first failure.
pub(crate) async fn run_all(hooks: Vec<Hook>) -> Result<(), BoxError> {
    for hook in hooks {
        hook().await?;
    }
    Ok(())
}

/// Run every hook in order; failures are logged and skipped.
pub(crate) async fn run_best_effort(hooks: Vec<Hook>, txn: u64, kind: &'static str) {
    for hook in hooks {
        if let Err(e) = hook().await {
            tracing::warn!(txn, hook = kind, error = %e, "hook failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    fn recording(log: &Arc<Mutex<Vec<u32>>>, n: u32, fail: bool) -> Hook {
        let log = Arc::clone(log);
        boxed(move || async move {
            log.lock().push(n);
            let result: Result<(), BoxError> = if fail {
                Err(format!("hook {n} failed").into())
            } else {
                Ok(())
            };
            result
        })
    }

    #[tokio::test]
    async fn test_run_all_stops_at_first_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = vec![
            recording(&log, 1, false),
            recording(&log, 2, true),
            recording(&log, 3, false),
        ];
        let err = run_all(hooks).await.unwrap_err();
        assert_eq!(err.to_string(), "hook 2 failed");
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_best_effort_runs_everything() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = vec![
            recording(&log, 1, true),
            recording(&log, 2, false),
            recording(&log, 3, true),
        ];
        run_best_effort(hooks, 1, "post-commit").await;
        assert_eq!(*log.lock(), vec![1, 2, 3]);
    }
}
