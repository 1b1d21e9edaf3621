// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Integration tests against a live Kubernetes cluster.
//!
//! They create a namespace and a labelled `Service`, then check that the listing the
//! resync loop relies on turns it into the event the engine expects.
//!
//! Run with: cargo test --test cluster_integration -- --ignored

mod common;

use common::{cleanup_test_namespace, create_test_namespace, get_kube_client_or_skip, Scenario};
use dnsync::events::{EngineInput, EventKind};
use dnsync::source::{self, SourceSettings};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams, PostParams};
use std::time::Duration;

const TEST_NAMESPACE: &str = "dnsync-integration";

fn labelled_service() -> Service {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": "shop",
            "namespace": TEST_NAMESPACE,
            "labels": {
                "dns.managed": "true",
                "dns.category": "Commerce"
            },
            "annotations": {
                "traefik.http.routers.shop.rule": "Host(`shop.example.com`)"
            }
        },
        "spec": {
            "type": "ClusterIP",
            "ports": [{ "port": 80, "targetPort": 8080 }]
        }
    }))
    .expect("valid service manifest")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test cluster_integration -- --ignored
async fn test_kubernetes_connectivity() {
    let Some(client) = get_kube_client_or_skip().await else {
        return;
    };

    let services: Api<Service> = Api::all(client);
    let list = services
        .list(&ListParams::default().limit(5))
        .await
        .unwrap_or_else(|e| panic!("Failed to list services: {e}"));
    assert!(!list.items.is_empty(), "Expected at least the kubernetes service");
}

#[tokio::test]
#[ignore]
async fn test_listed_service_drives_engine() {
    let Some(client) = get_kube_client_or_skip().await else {
        return;
    };

    create_test_namespace(&client, TEST_NAMESPACE)
        .await
        .expect("namespace created");

    let settings = SourceSettings {
        namespace: Some(TEST_NAMESPACE.to_string()),
        resync_interval: Duration::from_secs(300),
        api_timeout: Duration::from_secs(10),
    };
    let api = source::service_api(client.clone(), &settings);
    match api.create(&PostParams::default(), &labelled_service()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => panic!("Failed to create service: {e}"),
    }

    let inventory = source::list_services(&api, settings.api_timeout)
        .await
        .expect("services listed");
    let shop = inventory
        .services
        .iter()
        .find(|e| e.service_id == format!("{TEST_NAMESPACE}/shop"))
        .expect("created service is listed");
    assert_eq!(shop.kind, EventKind::Updated);
    assert_eq!(shop.metadata.get("dns.category").map(String::as_str), Some("Commerce"));

    let mut scenario = Scenario::new(false);
    scenario.engine.handle_input(EngineInput::Resync(inventory));
    scenario.engine.drain().await;
    assert!(scenario.directory.record("shop.example.com").await.is_some());

    cleanup_test_namespace(&client, TEST_NAMESPACE)
        .await
        .expect("namespace deleted");
}
