//! Retry engine with an escalation ladder: direct → context-refresh →
//! user-guided, each rung preceded by exponential backoff (C3) — spec §4.3.
//!
//! Generalizes the teacher's `retry_with_backoff`
//! (`crates/ccswarm/src/utils/retry_enhanced.rs`), which runs a flat retry
//! loop with a single backoff formula, into the spec's three-rung ladder
//! with early-termination rules and a structured result.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CcoreError;

/// Configuration for [`execute_with_retry`] (spec §3).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub enable_context_refresh: bool,
    pub enable_user_guidance: bool,
    /// Error kinds that abort retries immediately when encountered,
    /// regardless of how many attempts remain (spec §4.3).
    pub skip_retry_for_errors: HashSet<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            enable_context_refresh: true,
            enable_user_guidance: false,
            skip_retry_for_errors: HashSet::new(),
        }
    }
}

/// How the final attempt (successful or not) was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    None,
    Direct,
    ContextRefresh,
    UserGuidance,
}

/// Result of [`execute_with_retry`]. Never an `Err` — the engine always
/// returns a structure (spec §4.3's "the retry engine never throws").
#[derive(Debug)]
pub struct RetryResult<T> {
    pub success: bool,
    pub result: Option<T>,
    pub error: Option<CcoreError>,
    pub attempts: u32,
    pub recovery_action: RecoveryAction,
}

/// Sentinel returned by a user-guidance callback to cancel further retries.
pub const USER_GUIDANCE_CANCEL: &str = "__cancel__";

fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = config.backoff_multiplier.powi(attempt as i32 - 1);
    let millis = (config.initial_delay.as_millis() as f64 * factor) as u64;
    Duration::from_millis(millis).min(config.max_delay)
}

/// Drives `operation` through up to `config.max_attempts` attempts,
/// escalating recovery per attempt (spec §4.3):
///
/// - attempt 1: direct, no delay.
/// - attempt 2: context refresh (if enabled and `context_refresh` is
///   `Some`), preceded by exponential backoff.
/// - attempt 3+: user guidance (if enabled and `user_guidance` is `Some`),
///   preceded by exponential backoff.
pub async fn execute_with_retry<F, Fut, T>(
    config: &RetryConfig,
    mut operation: F,
    mut context_refresh: Option<impl FnMut() -> futures_result::BoxFuture<'static, Result<(), CcoreError>>>,
    mut user_guidance: Option<
        impl FnMut(&CcoreError) -> futures_result::BoxFuture<'static, Option<String>>,
    >,
) -> RetryResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CcoreError>>,
{
    let mut last_error: Option<CcoreError> = None;
    let mut attempt: u32 = 0;

    while attempt < config.max_attempts {
        attempt += 1;

        let recovery_action = if attempt == 1 {
            RecoveryAction::Direct
        } else if attempt == 2 && config.enable_context_refresh && context_refresh.is_some() {
            RecoveryAction::ContextRefresh
        } else if attempt >= 2 && config.enable_user_guidance && user_guidance.is_some() {
            RecoveryAction::UserGuidance
        } else {
            RecoveryAction::Direct
        };

        if attempt > 1 {
            tokio::time::sleep(backoff_delay(config, attempt)).await;
        }

        if recovery_action == RecoveryAction::ContextRefresh {
            if let Some(refresh) = context_refresh.as_mut() {
                if let Err(e) = refresh().await {
                    last_error = Some(e);
                    continue;
                }
            }
        }

        if recovery_action == RecoveryAction::UserGuidance {
            if let Some(guidance) = user_guidance.as_mut() {
                let last = last_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                let input = guidance(&CcoreError::Other(last)).await;
                match input {
                    Some(ref s) if s == USER_GUIDANCE_CANCEL => {
                        return RetryResult {
                            success: false,
                            result: None,
                            error: last_error,
                            attempts: attempt,
                            recovery_action,
                        };
                    }
                    _ => {}
                }
            }
        }

        match operation(attempt).await {
            Ok(value) => {
                return RetryResult {
                    success: true,
                    result: Some(value),
                    error: None,
                    attempts: attempt,
                    recovery_action,
                };
            }
            Err(e) => {
                if e.is_critical() {
                    return RetryResult {
                        success: false,
                        result: None,
                        error: Some(e),
                        attempts: attempt,
                        recovery_action,
                    };
                }
                if !e.is_retryable() && attempt == 1 {
                    return RetryResult {
                        success: false,
                        result: None,
                        error: Some(e),
                        attempts: attempt,
                        recovery_action,
                    };
                }
                let kind_name = error_kind_name(&e);
                if config.skip_retry_for_errors.contains(&kind_name) {
                    return RetryResult {
                        success: false,
                        result: None,
                        error: Some(e),
                        attempts: attempt,
                        recovery_action,
                    };
                }
                last_error = Some(e);
            }
        }
    }

    RetryResult {
        success: false,
        result: None,
        error: last_error,
        attempts: attempt,
        recovery_action: RecoveryAction::None,
    }
}

fn error_kind_name(e: &CcoreError) -> String {
    match e {
        CcoreError::Session(_) => "session".to_string(),
        CcoreError::Agent(_) => "agent".to_string(),
        CcoreError::FileOperation(_) => "file_operation".to_string(),
        CcoreError::Validation(_) => "validation".to_string(),
        CcoreError::ContextOverflow(_) => "context_overflow".to_string(),
        CcoreError::Io(_) => "io".to_string(),
        CcoreError::Other(_) => "other".to_string(),
    }
}

/// A single named operation for [`execute_batch_with_retry`]. The operation
/// is boxed because a `Vec` of batch operations must hold one concrete type,
/// while each caller-supplied closure has its own anonymous type.
pub struct BatchOperation<T> {
    pub name: String,
    pub operation: Box<dyn FnMut(u32) -> futures_result::BoxFuture<'static, Result<T, CcoreError>> + Send>,
}

impl<T> BatchOperation<T> {
    pub fn new(
        name: impl Into<String>,
        operation: impl FnMut(u32) -> futures_result::BoxFuture<'static, Result<T, CcoreError>>
            + Send
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            operation: Box::new(operation),
        }
    }
}

/// One batch member's retry outcome.
pub struct BatchResult<T> {
    pub name: String,
    pub result: RetryResult<T>,
}

/// Batch mode (spec §4.3). Sequential mode stops on first failure if
/// `stop_on_first_failure`; parallel mode always runs every operation and
/// ignores `stop_on_first_failure`.
pub async fn execute_batch_with_retry<T>(
    config: &RetryConfig,
    operations: Vec<BatchOperation<T>>,
    parallel: bool,
    stop_on_first_failure: bool,
) -> Vec<BatchResult<T>>
where
    T: Send + 'static,
{
    if parallel {
        let mut handles = Vec::new();
        for op in operations {
            let config = config.clone();
            let name = op.name;
            let mut operation = op.operation;
            handles.push(tokio::spawn(async move {
                let result =
                    execute_with_retry::<_, _, T>(&config, move |a| operation(a), no_refresh(), no_guidance())
                        .await;
                BatchResult { name, result }
            }));
        }
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(r) = handle.await {
                results.push(r);
            }
        }
        results
    } else {
        let mut results = Vec::with_capacity(operations.len());
        for op in operations {
            let mut operation = op.operation;
            let result =
                execute_with_retry::<_, _, T>(config, move |a| operation(a), no_refresh(), no_guidance())
                    .await;
            let failed = !result.success;
            results.push(BatchResult {
                name: op.name,
                result,
            });
            if failed && stop_on_first_failure {
                break;
            }
        }
        results
    }
}

/// Helper module so `execute_with_retry`'s generic bounds don't force every
/// caller to spell out `Pin<Box<dyn Future<...>>>` — kept tiny and local
/// rather than pulling in the `futures` crate for one alias.
pub mod futures_result {
    use std::future::Future;
    use std::pin::Pin;

    pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
}

fn no_refresh() -> Option<
    impl FnMut() -> futures_result::BoxFuture<'static, Result<(), CcoreError>>,
> {
    None::<fn() -> futures_result::BoxFuture<'static, Result<(), CcoreError>>>
}

fn no_guidance(
) -> Option<impl FnMut(&CcoreError) -> futures_result::BoxFuture<'static, Option<String>>> {
    None::<fn(&CcoreError) -> futures_result::BoxFuture<'static, Option<String>>>
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FileOperationError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn recoverable(msg: &str) -> CcoreError {
        CcoreError::FileOperation(FileOperationError::new("read", "x", msg))
    }

    #[tokio::test]
    async fn max_attempts_one_with_failing_operation_returns_none_recovery() {
        let config = RetryConfig {
            max_attempts: 1,
            ..Default::default()
        };

        let result: RetryResult<()> =
            execute_with_retry(&config, |_a| async { Err(recoverable("nope")) }, no_refresh(), no_guidance())
                .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.recovery_action, RecoveryAction::None);
    }

    #[tokio::test]
    async fn s6_retry_escalation_ladder() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            enable_context_refresh: true,
            enable_user_guidance: true,
            skip_retry_for_errors: HashSet::new(),
        };

        let refresh_calls = Arc::new(AtomicU32::new(0));
        let guidance_calls = Arc::new(AtomicU32::new(0));

        let refresh_calls_clone = Arc::clone(&refresh_calls);
        let refresh = move || -> futures_result::BoxFuture<'static, Result<(), CcoreError>> {
            let calls = Arc::clone(&refresh_calls_clone);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        let guidance_calls_clone = Arc::clone(&guidance_calls);
        let guidance = move |_err: &CcoreError| -> futures_result::BoxFuture<'static, Option<String>> {
            let calls = Arc::clone(&guidance_calls_clone);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Some("continue".to_string())
            })
        };

        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = execute_with_retry::<_, _, &'static str>(
            &config,
            move |_a| {
                let calls = Arc::clone(&attempt_count_clone);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(recoverable("transient"))
                    } else {
                        Ok("done")
                    }
                }
            },
            Some(refresh),
            Some(guidance),
        )
        .await;

        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.recovery_action, RecoveryAction::UserGuidance);
        assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(guidance_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_error_aborts_only_on_the_first_attempt() {
        use crate::error::ValidationError;
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        };

        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result: RetryResult<&'static str> = execute_with_retry(
            &config,
            move |_a| {
                let calls = Arc::clone(&attempt_count_clone);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n == 1 {
                        Err(recoverable("transient"))
                    } else if n == 2 {
                        Err(CcoreError::Validation(ValidationError("bad input".to_string())))
                    } else {
                        Ok("done")
                    }
                }
            },
            no_refresh(),
            no_guidance(),
        )
        .await;

        // The validation error surfaced on attempt 2, not attempt 1, so the
        // ladder keeps going and attempt 3 succeeds.
        assert!(result.success);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn critical_errors_abort_immediately() {
        use crate::error::{SessionError, SessionErrorCode};
        let config = RetryConfig::default();

        let result: RetryResult<()> = execute_with_retry(
            &config,
            |_a| async {
                Err(CcoreError::Session(SessionError::new(
                    SessionErrorCode::MaxDepthExceeded,
                    "too deep",
                )))
            },
            no_refresh(),
            no_guidance(),
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn sequential_batch_stops_on_first_failure() {
        let config = RetryConfig {
            max_attempts: 1,
            ..Default::default()
        };

        let ran = Arc::new(AtomicU32::new(0));
        let ran_clone = Arc::clone(&ran);
        let ops = vec![
            BatchOperation::new("a", {
                let ran = Arc::clone(&ran_clone);
                move |_a: u32| {
                    let ran = Arc::clone(&ran);
                    Box::pin(async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(recoverable("boom"))
                    }) as futures_result::BoxFuture<'static, Result<(), CcoreError>>
                }
            }),
            BatchOperation::new("b", {
                let ran = Arc::clone(&ran_clone);
                move |_a: u32| {
                    let ran = Arc::clone(&ran);
                    Box::pin(async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), CcoreError>(())
                    }) as futures_result::BoxFuture<'static, Result<(), CcoreError>>
                }
            }),
        ];

        let results = execute_batch_with_retry(&config, ops, false, true).await;
        assert_eq!(results.len(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
