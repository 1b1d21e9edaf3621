// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Inputs to the reconciliation engine.

use crate::extractor::ServiceMetadata;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tokio::time::Instant;

/// What happened to a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Removed,
}

/// One observation of an orchestrator service.
///
/// Carries the service's full metadata at observation time, not a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    /// Stable identity, `<namespace>/<name>`
    pub service_id: String,
    /// Display name
    pub name: String,
    /// Lifecycle transition
    pub kind: EventKind,
    /// Merged labels and annotations
    pub metadata: ServiceMetadata,
    /// Load-balancer ingress addresses reported by the orchestrator
    pub addresses: BTreeSet<IpAddr>,
}

impl ServiceEvent {
    /// An event with no metadata. The display name is the part after the last `/`.
    #[must_use]
    pub fn new(service_id: &str, kind: EventKind) -> Self {
        let name = service_id
            .rsplit('/')
            .next()
            .unwrap_or(service_id)
            .to_string();
        Self {
            service_id: service_id.to_string(),
            name,
            kind,
            metadata: ServiceMetadata::new(),
            addresses: BTreeSet::new(),
        }
    }

    /// Add one metadata entry.
    #[must_use]
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the ingress addresses.
    #[must_use]
    pub fn with_addresses(mut self, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        self.addresses = addresses.into_iter().collect();
        self
    }
}

/// Every service the orchestrator listed, and when the listing was requested.
///
/// A listing can reach the engine after watch events that are newer than it. The
/// engine compares `listed_at` with when it last saw each service, and leaves services
/// observed since then to their events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    /// When the list request was started
    pub listed_at: Instant,
    /// One `Updated` event per listed service
    pub services: Vec<ServiceEvent>,
}

impl Inventory {
    #[must_use]
    pub fn new(listed_at: Instant, services: Vec<ServiceEvent>) -> Self {
        Self {
            listed_at,
            services,
        }
    }

    /// A listing taken at this instant.
    #[must_use]
    pub fn taken_now(services: Vec<ServiceEvent>) -> Self {
        Self::new(Instant::now(), services)
    }
}

/// Message on the engine's input channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineInput {
    /// A single watch event
    Event(ServiceEvent),
    /// A full inventory listing; services missing from it are treated as removed
    Resync(Inventory),
}
