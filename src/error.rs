//! Grepable error codes shared by the transport's error enums.

/// Stable code and retryable flag for an error, for logs and callers that
/// decide whether to try again.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}
