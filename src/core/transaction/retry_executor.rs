use super::{Transaction, TransactionService};
use crate::config::RetryConfig;
use crate::error::{AppError, ErrorContext, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Decides whether a failed attempt may be run again in a fresh transaction
#[derive(Clone)]
pub struct RestartPolicy {
    predicate: Arc<dyn Fn(&AppError) -> bool + Send + Sync>,
}

impl RestartPolicy {
    /// No failure is restartable
    pub fn never() -> Self {
        Self::from_fn(|_| false)
    }

    /// Optimistic-lock conflicts anywhere in the error chain are restartable
    pub fn concurrency_conflicts() -> Self {
        Self::from_fn(AppError::is_concurrency_conflict)
    }

    pub fn from_fn<F>(predicate: F) -> Self
    where
        F: Fn(&AppError) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    pub fn is_restartable(&self, error: &AppError) -> bool {
        (self.predicate)(error)
    }
}

impl std::fmt::Debug for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RestartPolicy")
    }
}

/// Runs a unit of work in one transaction per attempt, retrying restartable
/// failures after a fixed wait.
#[derive(Clone)]
pub struct RetryTransactionExecutor {
    transaction_service: Arc<dyn TransactionService>,
    max_retries: u32,
    wait_time: Duration,
    restart_policy: RestartPolicy,
}

impl RetryTransactionExecutor {
    pub fn new(
        transaction_service: Arc<dyn TransactionService>,
        max_retries: u32,
        wait_time: Duration,
        restart_policy: RestartPolicy,
    ) -> Self {
        Self {
            transaction_service,
            max_retries,
            wait_time,
            restart_policy,
        }
    }

    pub fn from_config(
        config: &RetryConfig,
        transaction_service: Arc<dyn TransactionService>,
        restart_policy: RestartPolicy,
    ) -> Self {
        Self::new(transaction_service, config.max_retries, config.wait_time(), restart_policy)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Same executor with a different retry budget
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self.clone()
        }
    }

    pub async fn execute<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_context(work, ErrorContext::new("transaction", "execute"))
            .await
    }

    /// Exactly one attempt
    pub async fn execute_once<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.with_max_retries(0)
            .execute_with_context(work, ErrorContext::new("transaction", "execute_once"))
            .await
    }

    pub async fn execute_with_context<T, F, Fut>(&self, mut work: F, context: ErrorContext) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            debug!(
                correlation_id = %context.correlation_id,
                component = %context.component,
                operation = %context.operation,
                attempt = attempt,
                "Executing unit of work in transaction"
            );

            match self.run_attempt(&mut work).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            correlation_id = %context.correlation_id,
                            attempt = attempt,
                            "Unit of work succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !self.restart_policy.is_restartable(&error) {
                        debug!(
                            correlation_id = %context.correlation_id,
                            error = %error,
                            "Failure is not restartable"
                        );
                        return Err(error);
                    }

                    if attempt >= max_attempts {
                        warn!(
                            correlation_id = %context.correlation_id,
                            attempt = attempt,
                            max_attempts = max_attempts,
                            error = %error,
                            "Maximum retry attempts reached"
                        );
                        return Err(error);
                    }

                    warn!(
                        correlation_id = %context.correlation_id,
                        attempt = attempt,
                        wait_ms = self.wait_time.as_millis() as u64,
                        error = %error,
                        "Restartable failure, retrying in a new transaction"
                    );
                    tokio::time::sleep(self.wait_time).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One begin/complete pair, whatever happens in between
    async fn run_attempt<T, F, Fut>(&self, work: &mut F) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tx = self.transaction_service.begin().await?;

        match work(tx.clone()).await {
            Ok(value) => {
                self.transaction_service.complete(&tx).await?;
                Ok(value)
            }
            Err(error) => {
                tx.set_rollback_only();
                if let Err(complete_error) = self.transaction_service.complete(&tx).await {
                    error!(
                        transaction_id = %tx.id(),
                        error = %complete_error,
                        "Failed to complete rolled back transaction"
                    );
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policies() {
        let conflict = AppError::modification("update trigger")
            .with_source(AppError::ConcurrencyConflict("stale".to_string()));
        let missing = AppError::NotFound("trigger".to_string());

        assert!(RestartPolicy::concurrency_conflicts().is_restartable(&conflict));
        assert!(!RestartPolicy::concurrency_conflicts().is_restartable(&missing));
        assert!(!RestartPolicy::never().is_restartable(&conflict));
        assert!(RestartPolicy::from_fn(|e| e.is_not_found()).is_restartable(&missing));
    }
}
