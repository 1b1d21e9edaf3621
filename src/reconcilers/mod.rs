// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reconciliation of service hostnames into DNS records and certificates.
//!
//! # Reconciliation Architecture
//!
//! dnsync follows the controller pattern, with a single owner of state:
//!
//! 1. **Observe** - [`crate::source`] turns orchestrator watch events into
//!    [`crate::events::ServiceEvent`]s and feeds them to the engine in order
//! 2. **Diff** - the [`engine`] compares each service's desired hostnames with the
//!    state store and decides which hostnames need work
//! 3. **Converge** - [`tasks`] apply DNS record changes and [`certificates`] work
//!    through the directory, concurrently across hostnames and strictly ordered per
//!    hostname ([`locks`]), retrying transient failures ([`retry`])
//! 4. **Publish** - the engine folds task reports back into the store, republishes the
//!    proxy TLS configuration, and broadcasts a snapshot for the catalog
//!
//! # Example
//!
//! ```rust,no_run
//! use dnsync::config::Config;
//! use dnsync::context::Context;
//! use dnsync::directory::MemoryDirectory;
//! use dnsync::events::{EngineInput, EventKind, ServiceEvent};
//! use dnsync::reconcilers::{Engine, EngineSettings};
//! use std::sync::Arc;
//!
//! # async fn run(config: Config) -> anyhow::Result<()> {
//! let ctx = Context::from_config(&config, Arc::new(MemoryDirectory::new()));
//! let engine = Engine::new(Arc::new(ctx), EngineSettings::from_config(&config));
//!
//! let (tx, rx) = tokio::sync::mpsc::channel(16);
//! let running = tokio::spawn(engine.run(rx));
//!
//! let event = ServiceEvent::new("default/web", EventKind::Created)
//!     .with("dns.managed", "true")
//!     .with("dns.hostname", "web");
//! tx.send(EngineInput::Event(event)).await?;
//! drop(tx);
//! running.await??;
//! # Ok(())
//! # }
//! ```

pub mod certificates;
pub mod engine;
pub mod locks;
pub mod retry;
pub mod tasks;

pub use certificates::{CertificateAction, CertificateOutcome, CertificatePolicy};
pub use engine::{Engine, EngineSettings};
pub use retry::{retry_directory_call, RetryPolicy};
pub use tasks::{ReconciliationTask, RecordOutcome, TaskReason, TaskReport};
