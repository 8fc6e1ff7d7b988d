//! Support utilities for [`keen_retry`]'s retry API.
//!
//! Recognition backends return [`RetryResult`] values, so that the caller can
//! tell "try again later" apart from "this will never work". The macros here
//! give us `?`-like early returns for the three common cases.

use keen_retry::RetryResult;
use reqwest::StatusCode;

/// Macro which implements `?`-like behavior for [`RetryResult`].
macro_rules! try_retry_result {
    ($result:expr) => {
        match $result {
            ::keen_retry::RetryResult::Ok { output, .. } => output,
            ::keen_retry::RetryResult::Transient { input, error } => {
                return ::keen_retry::RetryResult::Transient {
                    input,
                    error: From::from(error),
                };
            }
            ::keen_retry::RetryResult::Fatal { input, error } => {
                return ::keen_retry::RetryResult::Fatal {
                    input,
                    error: From::from(error),
                };
            }
        }
    };
}

/// On error, return a [`RetryResult::Fatal`] value.
macro_rules! try_fatal {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

/// On error, return either a [`RetryResult::Transient`] or [`RetryResult::Fatal`]
/// value, depending on the return value of [`IsKnownTransient::is_known_transient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) if IsKnownTransient::is_known_transient(&error) => {
                debug!("Potentially transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

// Here's a trick to export a macro within a crate as if it were a normal
// symbol.
pub(crate) use {try_fatal, try_potentially_transient, try_retry_result};

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Transient`] value.
pub(crate) fn retry_result_transient<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Transient { input: (), error }
}

/// Build an [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient. The prevents us
/// from doing large numbers of retries with exponential backoff on errors that
/// will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Connection resets, DNS hiccups and body read failures all end up
            // here, and `reqwest` doesn't tell them apart well enough to be
            // pickier.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

impl IsKnownTransient for std::io::Error {
    fn is_known_transient(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self.kind(),
            ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;

    fn classify(result: Result<u32, std::io::Error>) -> RetryResult<(), (), u32, anyhow::Error> {
        let value = try_potentially_transient!(result);
        retry_result_ok(value + 1)
    }

    #[test]
    fn status_codes() {
        assert!(StatusCode::TOO_MANY_REQUESTS.is_known_transient());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_known_transient());
        assert!(!StatusCode::UNAUTHORIZED.is_known_transient());
        assert!(!StatusCode::BAD_REQUEST.is_known_transient());
    }

    #[test]
    fn potentially_transient_macro_classifies_errors() {
        assert!(matches!(classify(Ok(1)), RetryResult::Ok { output: 2, .. }));

        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(classify(Err(timed_out)), RetryResult::Transient { .. }));

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(classify(Err(denied)), RetryResult::Fatal { .. }));
    }

    #[test]
    fn fatal_macro_never_retries() {
        fn parse(input: &str) -> RetryResult<(), (), u32, anyhow::Error> {
            let value = try_fatal!(input.parse::<u32>());
            retry_result_ok(value)
        }
        fn chained(input: &str) -> RetryResult<(), (), u32, anyhow::Error> {
            let value = try_retry_result!(parse(input));
            retry_result_ok(value * 2)
        }

        assert!(matches!(chained("21"), RetryResult::Ok { output: 42, .. }));
        assert!(matches!(chained("x"), RetryResult::Fatal { .. }));
    }
}
