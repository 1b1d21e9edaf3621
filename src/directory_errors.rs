// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Directory-service error types for dnsync.
//!
//! Every failure of a [`DirectoryClient`](crate::directory::DirectoryClient) call is a
//! [`DirectoryError`]. The engine only cares about one property of it, its
//! [`FailureClass`]: retryable failures get bounded exponential backoff, permanent
//! failures mark the hostname `Failed` straight away.

use thiserror::Error;

/// Outcome class of a failed directory call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Transient: network, timeout, rate limit, server-side fault
    Retryable,
    /// Will not succeed on retry: authentication, invalid hostname, policy rejection
    Permanent,
}

impl FailureClass {
    /// Metric/log label for this class.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Permanent => "permanent",
        }
    }
}

/// Errors returned by directory-service operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The request did not complete within the configured timeout
    #[error("directory request '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Directory operation name (e.g. `dnsrecord_add`)
        operation: String,
        /// Timeout in milliseconds
        timeout_ms: u64,
    },

    /// The directory service could not be reached
    #[error("connection to directory service failed: {reason}")]
    Connection {
        /// Transport error text
        reason: String,
    },

    /// The directory service is throttling us (HTTP 429)
    #[error("directory service rate limited request '{operation}'")]
    RateLimited {
        /// Directory operation name
        operation: String,
    },

    /// The directory service returned a server-side error (HTTP 5xx or internal fault)
    #[error("directory service error during '{operation}' (status {status}): {message}")]
    ServerError {
        /// Directory operation name
        operation: String,
        /// HTTP status or RPC error code
        status: u16,
        /// Error text from the server
        message: String,
    },

    /// Login rejected or session could not be re-established
    #[error("authentication to directory service failed: {reason}")]
    Authentication {
        /// Reason reported by the server
        reason: String,
    },

    /// The hostname is not acceptable to the directory (outside the zone, bad label)
    #[error("invalid hostname '{hostname}': {reason}")]
    InvalidHostname {
        /// The offending hostname
        hostname: String,
        /// Why it was rejected
        reason: String,
    },

    /// The directory refused the operation on policy grounds (ACI, CA profile, ...)
    #[error("directory rejected '{operation}': {message} (code {code})")]
    Rejected {
        /// Directory operation name
        operation: String,
        /// RPC error code
        code: i64,
        /// Error text from the server
        message: String,
    },

    /// The response could not be understood
    #[error("unexpected response to '{operation}': {reason}")]
    UnexpectedResponse {
        /// Directory operation name
        operation: String,
        /// What was wrong with it
        reason: String,
    },

    /// Key or CSR generation failed before anything was sent
    #[error("failed to prepare certificate request for '{hostname}': {reason}")]
    CertificateRequest {
        /// Hostname the request was for
        hostname: String,
        /// Underlying error text
        reason: String,
    },
}

impl DirectoryError {
    /// Classify this error for retry purposes.
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Timeout { .. }
            | Self::Connection { .. }
            | Self::RateLimited { .. }
            | Self::ServerError { .. } => FailureClass::Retryable,
            Self::Authentication { .. }
            | Self::InvalidHostname { .. }
            | Self::Rejected { .. }
            | Self::UnexpectedResponse { .. }
            | Self::CertificateRequest { .. } => FailureClass::Permanent,
        }
    }

    /// Whether the engine may retry the call that produced this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Retryable
    }
}

#[cfg(test)]
#[path = "directory_errors_tests.rs"]
mod directory_errors_tests;
