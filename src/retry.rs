//! Helpers for [`keen_retry`]'s retry API.
//!
//! Our retryable operations all have the shape `RetryResult<(), (), T, E>`: we
//! never need to hand an input back to the retry loop, because each attempt
//! rebuilds its request from shared state.

use async_openai::error::OpenAIError;
use keen_retry::RetryResult;
use reqwest::StatusCode;

/// A [`RetryResult`] that carries no input.
pub type SimpleRetryResult<T, E = anyhow::Error> = RetryResult<(), (), T, E>;

/// `?` for functions returning [`SimpleRetryResult`]. Accepts an expression
/// that is itself a [`SimpleRetryResult`], and converts the error with
/// [`From`].
macro_rules! try_with_retry_result {
    ($result:expr) => {
        match $result {
            ::keen_retry::RetryResult::Ok { output, .. } => output,
            ::keen_retry::RetryResult::Transient { error, .. } => {
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            ::keen_retry::RetryResult::Fatal { error, .. } => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

pub(crate) use try_with_retry_result;

/// Build a [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> SimpleRetryResult<T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build a [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> SimpleRetryResult<T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Convert a [`Result`] into a [`SimpleRetryResult`].
pub trait IntoRetryResult<T, E> {
    /// Errors are worth retrying.
    fn into_transient(self) -> SimpleRetryResult<T, E>;

    /// Errors are final.
    fn into_fatal(self) -> SimpleRetryResult<T, E>;

    /// Ask `is_transient` whether each error is worth retrying.
    fn into_retry_result(self, is_transient: impl FnOnce(&E) -> bool)
    -> SimpleRetryResult<T, E>;
}

impl<T, E> IntoRetryResult<T, E> for Result<T, E> {
    fn into_transient(self) -> SimpleRetryResult<T, E> {
        self.into_retry_result(|_| true)
    }

    fn into_fatal(self) -> SimpleRetryResult<T, E> {
        self.into_retry_result(|_| false)
    }

    fn into_retry_result(
        self,
        is_transient: impl FnOnce(&E) -> bool,
    ) -> SimpleRetryResult<T, E> {
        match self {
            Ok(output) => retry_result_ok(output),
            Err(error) if is_transient(&error) => RetryResult::Transient { input: (), error },
            Err(error) => retry_result_fatal(error),
        }
    }
}

/// Is this error a known transient error?
///
/// Errors are assumed to be permanent until they have been seen in the wild
/// and shown to clear up on their own. Otherwise we'd spend minutes backing
/// off on errors that will never resolve.
pub trait IsKnownTransient {
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        match self.status() {
            Some(status) => status.is_known_transient(),
            // Connection resets, DNS hiccups and so on don't carry enough
            // detail to tell apart. Retry them.
            None => true,
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        matches!(
            *self,
            StatusCode::TOO_MANY_REQUESTS
                | StatusCode::INTERNAL_SERVER_ERROR
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
        )
    }
}

impl IsKnownTransient for OpenAIError {
    fn is_known_transient(&self) -> bool {
        match self {
            OpenAIError::Reqwest(err) => err.is_known_transient(),
            OpenAIError::ApiError(err) => {
                let code = err.code.as_deref().unwrap_or_default();
                let kind = err.r#type.as_deref().unwrap_or_default();
                code == "rate_limit_exceeded"
                    || kind == "server_error"
                    || kind == "rate_limit_error"
            }
            _ => false,
        }
    }
}
