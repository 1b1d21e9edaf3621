// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared context for reconciliation tasks.
//!
//! The engine hands every spawned task an `Arc<Context>` containing:
//! - the directory client
//! - the proxy config publisher (for storing certificate material)
//! - the retry policy for directory calls
//! - the certificate policy

use crate::config::Config;
use crate::directory::DirectoryClient;
use crate::publisher::{Publisher, PublisherSettings};
use crate::reconcilers::certificates::CertificatePolicy;
use crate::reconcilers::retry::RetryPolicy;
use std::sync::Arc;

/// Shared, read-only state of all reconciliation tasks.
#[derive(Clone)]
pub struct Context {
    /// Directory service client
    pub directory: Arc<dyn DirectoryClient>,

    /// Writes certificate files and the proxy configuration
    pub publisher: Publisher,

    /// How directory calls are retried
    pub retry: RetryPolicy,

    /// Certificate automation settings
    pub certificates: CertificatePolicy,
}

impl Context {
    /// Build the context from configuration around an existing directory client.
    #[must_use]
    pub fn from_config(config: &Config, directory: Arc<dyn DirectoryClient>) -> Self {
        Self {
            directory,
            publisher: Publisher::new(PublisherSettings::from_config(config)),
            retry: RetryPolicy::from_config(config),
            certificates: CertificatePolicy::from_config(config),
        }
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod context_tests;
