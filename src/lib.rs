// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! # dnsync - service hostnames into DNS and TLS, automatically
//!
//! dnsync watches Kubernetes `Service` objects, derives the hostnames each service
//! claims from its labels, annotations and Traefik router rules, and keeps a FreeIPA
//! directory in step: one A/AAAA record per hostname, and a CA-issued certificate per
//! hostname that Traefik picks up through its file provider.
//!
//! ## Overview
//!
//! - Every service event is diffed against an in-memory state store, producing
//!   per-hostname reconciliation tasks
//! - Tasks for different hostnames run concurrently; tasks for one hostname run one at a
//!   time, in order
//! - Transient directory failures are retried with exponential backoff
//! - Certificates are reissued before they expire by a periodic sweep
//! - Periodic resyncs repair anything missed while the watch was down
//!
//! ## Modules
//!
//! - [`extractor`] - Hostname extraction from service metadata
//! - [`reconcilers`] - The reconciliation engine, tasks and certificate lifecycle
//! - [`directory`] - The directory client trait, the FreeIPA client and an in-memory one
//! - [`publisher`] - Certificate files and the Traefik TLS configuration
//! - [`source`] - Kubernetes service watch and resync
//! - [`catalog`] - Read-only HTML/JSON catalog of managed services
//! - [`state`] - The state store and its snapshots
//! - [`config`] - YAML configuration
//!
//! ## Example
//!
//! ```rust
//! use dnsync::extractor::{extract, ExtractorSettings};
//! use dnsync::extractor::ServiceMetadata;
//!
//! let settings = ExtractorSettings {
//!     managed_label: "dns.managed".to_string(),
//!     hostname_label: "dns.hostname".to_string(),
//!     hostname_delimiter: ",".to_string(),
//!     extract_from_rules: true,
//!     router_prefix: "traefik.http.routers.".to_string(),
//!     zone: "example.com".to_string(),
//! };
//!
//! let mut metadata = ServiceMetadata::new();
//! metadata.insert("dns.managed".to_string(), "true".to_string());
//! metadata.insert(
//!     "traefik.http.routers.web.rule".to_string(),
//!     "Host(`a.example.com`) || Host(`b.example.com`)".to_string(),
//! );
//!
//! let extraction = extract(&settings, &metadata);
//! assert_eq!(extraction.hostnames.len(), 2);
//! ```

pub mod catalog;
pub mod config;
pub mod constants;
pub mod context;
pub mod directory;
pub mod directory_errors;
pub mod events;
pub mod extractor;
pub mod labels;
pub mod metrics;
pub mod publisher;
pub mod reconcilers;
pub mod source;
pub mod state;
