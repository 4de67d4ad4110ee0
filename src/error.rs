//! Error types for coordinator operations.
//!
//! This module provides structured error handling for llm-coordinator,
//! covering the full taxonomy the HTTP layer, the coordinator, and the
//! plugin registry report through.
//!
//! # Error Kinds
//!
//! The main error type is [`CoordinatorError`]. Kinds fall into three bands:
//! - Admission failures raised by the HTTP layer before a run starts
//!   (validation, auth, limits, timeouts)
//! - Provider failures, with a distinguished rate-limit sub-kind that
//!   drives priority fallback
//! - Internal failures (broken or missing manifests, invariant violations)
//!
//! # Error Handling Example
//!
//! ```rust,no_run
//! use llm_coordinator::CoordinatorError;
//!
//! fn handle_error(err: CoordinatorError) {
//!     if err.is_rate_limit() {
//!         // advance to the next priority entry
//!     }
//!     // Wire code and HTTP status for the error envelope
//!     let code = err.code();
//!     let status = err.http_status();
//!     println!("{status} {code}: {err}");
//! }
//! ```
//!
//! # Result Type
//!
//! Use [`CoordResult<T>`] as a convenient alias for
//! `Result<T, CoordinatorError>`.

use crate::logging::{log_error, log_warn};
use thiserror::Error;

/// Convenient result type for coordinator operations.
pub type CoordResult<T> = std::result::Result<T, CoordinatorError>;

/// Errors that can occur while admitting, coordinating, or serving a run.
///
/// Each variant maps onto one wire-level error code (see [`code()`](Self::code))
/// and one HTTP status (see [`http_status()`](Self::http_status)).
///
/// # Creating Errors
///
/// Use the constructor methods, which log at the appropriate level:
///
/// ```rust
/// use llm_coordinator::CoordinatorError;
///
/// let err = CoordinatorError::validation("llmPriority must not be empty");
/// let err = CoordinatorError::manifest("unknown provider id: acme");
/// let err = CoordinatorError::provider_rate_limit("acme", "429 from upstream");
/// ```
///
/// # Wire Codes
///
/// | Variant | Code | Status |
/// |---------|------|--------|
/// | `Validation` | `validation_error` | 400 |
/// | `UnsupportedMediaType` | `unsupported_media_type` | 415 |
/// | `PayloadTooLarge` | `payload_too_large` | 413 |
/// | `RequestTimeout` | `request_timeout` | 408 |
/// | `Timeout` | `timeout` | 504 |
/// | `ServerBusy` | `server_busy` | 503 |
/// | `QueueTimeout` | `queue_timeout` | 503 |
/// | `ClientAborted` | `client_aborted` | 499 |
/// | `Unauthorized` | `unauthorized` | 401 |
/// | `Forbidden` | `forbidden` | 403 |
/// | `RateLimited` | `rate_limited` | 429 |
/// | `Manifest` | `manifest_error` | 500 |
/// | `Provider` | `provider_error` / `provider_rate_limit` | 502 |
/// | `ToolExecution` | `tool_execution_failed` | 500 |
/// | `StreamIdleTimeout` | `stream_idle_timeout` | n/a (SSE terminal) |
/// | `Internal` | `internal_error` | 500 |
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The call spec failed schema validation.
    #[error("Invalid spec: {message}")]
    Validation {
        /// What was wrong with the spec.
        message: String,
    },

    /// Request body was not JSON.
    #[error("Unsupported media type: {content_type}")]
    UnsupportedMediaType {
        /// The Content-Type header the client sent.
        content_type: String,
    },

    /// Request body exceeded the configured byte limit.
    #[error("Request body exceeds {limit_bytes} bytes")]
    PayloadTooLarge {
        /// The configured limit.
        limit_bytes: usize,
    },

    /// The client did not deliver the body within the read timeout.
    #[error("Timed out reading request body after {timeout_ms}ms")]
    RequestTimeout {
        /// The body-read deadline that expired.
        timeout_ms: u64,
    },

    /// The run exceeded the total request deadline.
    #[error("Request exceeded the {timeout_ms}ms deadline")]
    Timeout {
        /// The deadline that expired.
        timeout_ms: u64,
    },

    /// The route's limiter queue was full.
    #[error("Server busy")]
    ServerBusy,

    /// A queued request waited past the queue deadline.
    #[error("Timed out waiting for a free slot after {waited_ms}ms")]
    QueueTimeout {
        /// How long the request waited.
        waited_ms: u64,
    },

    /// The client disconnected before the request completed.
    #[error("Client aborted the request")]
    ClientAborted,

    /// No configured API key matched the presented credentials.
    #[error("Unauthorized")]
    Unauthorized,

    /// A caller-provided predicate rejected otherwise-valid credentials.
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Why the predicate refused the request.
        message: String,
    },

    /// The client's token bucket is empty.
    #[error("Rate limited")]
    RateLimited,

    /// Unknown artifact id or a manifest that could not be used.
    #[error("Manifest error: {message}")]
    Manifest {
        /// Details about the missing or broken manifest.
        message: String,
    },

    /// An upstream provider call failed.
    ///
    /// `rate_limit` distinguishes the sub-kind that triggers priority
    /// fallback in the coordinator (HTTP 429 or a retry-word sentinel,
    /// after the retry-delay sequence was exhausted).
    #[error("Provider {provider} failed: {message}")]
    Provider {
        /// Id of the provider that failed.
        provider: String,
        /// Description of the failure.
        message: String,
        /// Whether this is the rate-limit sub-kind.
        rate_limit: bool,
    },

    /// A tool invocation failed.
    ///
    /// Captured as an in-band tool result for the model; only surfaced to
    /// HTTP clients when no priority entries remain.
    #[error("Tool execution failed: {tool_name} - {message}")]
    ToolExecution {
        /// The name of the tool that failed.
        tool_name: String,
        /// Details about the failure.
        message: String,
    },

    /// The stream produced no event within the idle window.
    #[error("Stream produced no event for {idle_ms}ms")]
    StreamIdleTimeout {
        /// The idle window that expired.
        idle_ms: u64,
    },

    /// Internal error (bug or broken invariant).
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoordinatorError {
    /// The wire-level error code used in the HTTP error envelope and in
    /// terminal SSE error events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::UnsupportedMediaType { .. } => "unsupported_media_type",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::Timeout { .. } => "timeout",
            Self::ServerBusy => "server_busy",
            Self::QueueTimeout { .. } => "queue_timeout",
            Self::ClientAborted => "client_aborted",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden { .. } => "forbidden",
            Self::RateLimited => "rate_limited",
            Self::Manifest { .. } => "manifest_error",
            Self::Provider { rate_limit, .. } => {
                if *rate_limit {
                    "provider_rate_limit"
                } else {
                    "provider_error"
                }
            }
            Self::ToolExecution { .. } => "tool_execution_failed",
            Self::StreamIdleTimeout { .. } => "stream_idle_timeout",
            Self::Internal(_) => "internal_error",
        }
    }

    /// The HTTP status this error maps onto when it reaches the server edge.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::UnsupportedMediaType { .. } => 415,
            Self::PayloadTooLarge { .. } => 413,
            Self::RequestTimeout { .. } => 408,
            Self::Timeout { .. } => 504,
            Self::ServerBusy | Self::QueueTimeout { .. } => 503,
            Self::ClientAborted => 499,
            Self::Unauthorized => 401,
            Self::Forbidden { .. } => 403,
            Self::RateLimited => 429,
            Self::Manifest { .. } => 500,
            Self::Provider { .. } => 502,
            Self::ToolExecution { .. } => 500,
            Self::StreamIdleTimeout { .. } => 504,
            Self::Internal(_) => 500,
        }
    }

    /// Whether this error is the provider rate-limit sub-kind that makes
    /// the coordinator advance to the next priority entry.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::Provider { rate_limit: true, .. })
    }

    /// A message safe to put in client-facing envelopes.
    ///
    /// Internal and manifest errors are sanitized; everything else carries
    /// its own display text.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal server error".to_string(),
            Self::Manifest { .. } => "Server configuration error".to_string(),
            other => other.to_string(),
        }
    }

    // =========================================================================
    // Constructor methods with automatic logging
    // =========================================================================
    //
    // These methods log the error at the appropriate level. Use them instead
    // of constructing variants directly.

    /// Create a spec validation error (logs at WARN level).
    pub fn validation(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(
            error_type = "validation_error",
            message = %message,
            "Call spec validation failed"
        );
        Self::Validation { message }
    }

    pub fn unsupported_media_type(content_type: impl Into<String>) -> Self {
        let content_type = content_type.into();
        log_warn!(
            error_type = "unsupported_media_type",
            content_type = %content_type,
            "Rejected non-JSON request body"
        );
        Self::UnsupportedMediaType { content_type }
    }

    pub fn payload_too_large(limit_bytes: usize) -> Self {
        log_warn!(
            error_type = "payload_too_large",
            limit_bytes = limit_bytes,
            "Request body exceeded the configured limit"
        );
        Self::PayloadTooLarge { limit_bytes }
    }

    pub fn request_timeout(timeout_ms: u64) -> Self {
        log_warn!(
            error_type = "request_timeout",
            timeout_ms = timeout_ms,
            "Body read timed out"
        );
        Self::RequestTimeout { timeout_ms }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        log_warn!(
            error_type = "timeout",
            timeout_ms = timeout_ms,
            "Request exceeded its total deadline"
        );
        Self::Timeout { timeout_ms }
    }

    pub fn queue_timeout(waited_ms: u64) -> Self {
        log_warn!(
            error_type = "queue_timeout",
            waited_ms = waited_ms,
            "Queued request timed out waiting for a permit"
        );
        Self::QueueTimeout { waited_ms }
    }

    pub fn manifest(message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(
            error_type = "manifest_error",
            message = %message,
            "Plugin manifest lookup failed"
        );
        Self::Manifest { message }
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        let provider = provider.into();
        let message = message.into();
        log_error!(
            error_type = "provider_error",
            provider = %provider,
            message = %message,
            "Provider call failed"
        );
        Self::Provider {
            provider,
            message,
            rate_limit: false,
        }
    }

    pub fn provider_rate_limit(provider: impl Into<String>, message: impl Into<String>) -> Self {
        let provider = provider.into();
        let message = message.into();
        log_warn!(
            error_type = "provider_rate_limit",
            provider = %provider,
            message = %message,
            "Provider rate limit exhausted the retry-delay sequence"
        );
        Self::Provider {
            provider,
            message,
            rate_limit: true,
        }
    }

    pub fn tool_execution(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        let tool_name = tool_name.into();
        let message = message.into();
        log_warn!(
            error_type = "tool_execution_failed",
            tool_name = %tool_name,
            message = %message,
            "Tool invocation failed"
        );
        Self::ToolExecution { tool_name, message }
    }

    pub fn stream_idle_timeout(idle_ms: u64) -> Self {
        log_warn!(
            error_type = "stream_idle_timeout",
            idle_ms = idle_ms,
            "Stream idle watchdog fired"
        );
        Self::StreamIdleTimeout { idle_ms }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(
            error_type = "forbidden",
            message = %message,
            "Authorization predicate refused the request"
        );
        Self::Forbidden { message }
    }
}
