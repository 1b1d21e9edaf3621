// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

// Common test utilities for scenario and integration tests

#![allow(dead_code)]

use dnsync::config::Config;
use dnsync::context::Context;
use dnsync::directory::{DirectoryClient, MemoryDirectory};
use dnsync::events::{EventKind, ServiceEvent};
use dnsync::reconcilers::{Engine, EngineSettings};
use kube::api::{Api, DeleteParams, PostParams};
use kube::client::Client;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub const ZONE: &str = "example.com";
pub const LB_ADDRESS: &str = "10.0.0.10";

/// Configuration with certificates written under `dir` and millisecond retries.
pub fn test_config(dir: &Path, certificates: bool) -> Config {
    let raw = format!(
        r#"
directory:
  server: ipa.example.com
  zone: {ZONE}
  username: dns-automation
  password: secret
  request_timeout_secs: 5
load_balancer_addresses: ["{LB_ADDRESS}"]
certificates:
  enabled: {certificates}
  validity_days: 365
  renew_threshold_days: 30
  cert_dir: {certs}
  proxy_config_file: {config_file}
retry:
  max_attempts: 4
  initial_interval_millis: 1
  max_interval_secs: 1
  randomization_factor: 0.0
"#,
        certs = dir.join("certs").display(),
        config_file = dir.join("dynamic").join("certificates.yml").display(),
    );
    let config = Config::from_yaml(&raw).expect("test configuration parses");
    config.validate().expect("test configuration is valid");
    config
}

/// An engine wired to a fresh in-memory directory.
pub struct Scenario {
    pub engine: Engine,
    pub directory: Arc<MemoryDirectory>,
    pub dir: TempDir,
}

impl Scenario {
    pub fn new(certificates: bool) -> Self {
        Self::with_directory(MemoryDirectory::new().with_zone(ZONE), certificates)
    }

    pub fn with_directory(directory: MemoryDirectory, certificates: bool) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let config = test_config(dir.path(), certificates);
        let directory = Arc::new(directory);
        let client: Arc<dyn DirectoryClient> = directory.clone();
        let ctx = Arc::new(Context::from_config(&config, client));
        Self {
            engine: Engine::new(ctx, EngineSettings::from_config(&config)),
            directory,
            dir,
        }
    }

    /// Feed one event and wait for every task it caused.
    pub async fn apply(&mut self, event: ServiceEvent) {
        self.engine.handle_event(&event);
        self.engine.drain().await;
    }

    /// Serial of the certificate the store records as serving for `hostname`.
    pub fn serial(&self, hostname: &str) -> String {
        self.engine
            .store()
            .get(hostname)
            .and_then(|e| e.certificate.as_ref())
            .and_then(|c| c.serial.clone())
            .expect("hostname has a serving certificate")
    }

    pub fn proxy_config(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("dynamic").join("certificates.yml"))
            .unwrap_or_default()
    }
}

/// A managed service claiming `hostnames` through the hostname label.
pub fn labelled(id: &str, kind: EventKind, hostnames: &str) -> ServiceEvent {
    ServiceEvent::new(id, kind)
        .with("dns.managed", "true")
        .with("dns.hostname", hostnames)
}

/// A managed service claiming hostnames through a Traefik router rule.
pub fn routed(id: &str, kind: EventKind, router: &str, rule: &str) -> ServiceEvent {
    ServiceEvent::new(id, kind)
        .with("dns.managed", "true")
        .with(&format!("traefik.http.routers.{router}.rule"), rule)
}

/// Get a Kubernetes client or skip the test if not in a cluster
pub async fn get_kube_client_or_skip() -> Option<Client> {
    match Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) => {
            eprintln!("Skipping integration test: not running in Kubernetes cluster: {e}");
            None
        }
    }
}

/// Create a test namespace
pub async fn create_test_namespace(
    client: &Client,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let namespaces: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(client.clone());

    let ns = serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": name,
            "labels": {
                "test": "integration",
                "managed-by": "dnsync-test"
            }
        }
    }))?;

    match namespaces.create(&PostParams::default(), &ns).await {
        Ok(_) => {
            println!("Created test namespace: {name}");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            println!("Test namespace already exists: {name}");
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}

/// Cleanup test namespace
pub async fn cleanup_test_namespace(
    client: &Client,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let namespaces: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(client.clone());

    match namespaces.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            println!("Deleted test namespace: {name}");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(Box::new(e)),
    }
}
