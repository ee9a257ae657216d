use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::utils::retry::task_with_timeout_and_exponential_backoff;
use crate::BackoffPolicy;
use crate::CoordinationError;
use crate::Error;

fn conflict() -> Error {
    Error::Coordination(CoordinationError::Conflict {
        volume_id: "vol-1".to_string(),
        expected: 1,
        found: 2,
    })
}

fn test_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 3,
        timeout_ms: 50,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

/// # Case 1: A transient error is retried until the task succeeds
///
/// ## Validation criterias:
/// 1. The task runs three times
/// 2. The final result is Ok
#[tokio::test]
async fn test_retry_case1_transient_error_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();

    let result = task_with_timeout_and_exponential_backoff(
        "test_op",
        test_policy(),
        |e| e.is_retryable(),
        move || {
            let attempts = attempts_clone.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok(42u64)
                }
            }
        },
    )
    .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

/// # Case 2: A non-retryable error surfaces immediately
///
/// ## Validation criterias:
/// 1. The task runs exactly once
#[tokio::test]
async fn test_retry_case2_non_retryable_error_surfaces() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();

    let result: crate::Result<u64> = task_with_timeout_and_exponential_backoff(
        "test_op",
        test_policy(),
        |e| e.is_retryable(),
        move || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::Coordination(CoordinationError::CapacityExceeded {
                    requested: 10,
                }))
            }
        },
    )
    .await;

    assert!(matches!(
        result,
        Err(Error::Coordination(CoordinationError::CapacityExceeded { .. }))
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

/// # Case 3: Retries are bounded by the policy
///
/// ## Validation criterias:
/// 1. The task runs max_retries times and the last error is returned
#[tokio::test]
async fn test_retry_case3_retries_bounded() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();

    let result: crate::Result<u64> = task_with_timeout_and_exponential_backoff(
        "test_op",
        test_policy(),
        |e| e.is_retryable(),
        move || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            }
        },
    )
    .await;

    assert!(matches!(
        result,
        Err(Error::Coordination(CoordinationError::Conflict { .. }))
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}
