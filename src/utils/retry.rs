//! Retry wrapper around the `backoff` crate.
//!
//! Errors opt into retrying through [`Transient`]; anything else fails on the first attempt.

use crate::config::RetryConfig;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Classifies an error as safe to retry.
pub trait Transient {
	fn is_transient(&self) -> bool;
}

/// Run `operation` until it succeeds, fails permanently, or the backoff budget is spent.
///
/// The last error is returned once retries are exhausted.
pub async fn retry_transient<T, E, F, Fut>(
	config: &RetryConfig,
	what: &str,
	mut operation: F,
) -> Result<T, E>
where
	E: Transient + Display,
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
{
	backoff::future::retry_notify(
		config.backoff(),
		|| {
			let attempt = operation();
			async move {
				attempt.await.map_err(|e| {
					if e.is_transient() {
						backoff::Error::transient(e)
					} else {
						backoff::Error::permanent(e)
					}
				})
			}
		},
		|e: E, wait: Duration| {
			warn!(
				"{} failed, retrying in {:?}: {}",
				what, wait, e
			);
		},
	)
	.await
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	#[derive(Debug)]
	struct TestError {
		transient: bool,
	}

	impl Display for TestError {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			write!(f, "test error (transient: {})", self.transient)
		}
	}

	impl Transient for TestError {
		fn is_transient(&self) -> bool {
			self.transient
		}
	}

	fn fast_retry() -> RetryConfig {
		RetryConfig {
			initial_interval_ms: 1,
			max_interval_ms: 5,
			multiplier: 2.0,
			max_elapsed_ms: 200,
		}
	}

	#[tokio::test]
	async fn transient_errors_are_retried_until_success() {
		let calls = AtomicU32::new(0);
		let result: Result<u32, TestError> = retry_transient(&fast_retry(), "flaky op", || async {
			let n = calls.fetch_add(1, Ordering::SeqCst);
			if n < 2 {
				Err(TestError { transient: true })
			} else {
				Ok(n)
			}
		})
		.await;

		assert_eq!(result.expect("eventually succeeds"), 2);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn permanent_errors_fail_immediately() {
		let calls = AtomicU32::new(0);
		let result: Result<(), TestError> = retry_transient(&fast_retry(), "bad op", || async {
			calls.fetch_add(1, Ordering::SeqCst);
			Err(TestError { transient: false })
		})
		.await;

		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn exhausted_budget_returns_last_error() {
		let result: Result<(), TestError> = retry_transient(&fast_retry(), "dead op", || async {
			Err(TestError { transient: true })
		})
		.await;

		assert!(result.expect_err("gives up").transient);
	}
}
