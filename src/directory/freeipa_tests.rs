// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `freeipa.rs`

#[cfg(test)]
mod tests {
    use crate::directory::freeipa::*;
    use crate::directory::{DirectoryClient, RecordChange};
    use crate::directory_errors::{DirectoryError, FailureClass};
    use serde_json::{json, Value};
    use std::collections::BTreeSet;
    use std::net::IpAddr;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RPC_PATH: &str = "/ipa/session/json";
    const LOGIN_PATH: &str = "/ipa/session/login_password";

    fn settings(server: &MockServer) -> FreeIpaSettings {
        FreeIpaSettings {
            base_url: server.uri(),
            zone: "example.com".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            organization: None,
            request_timeout: Duration::from_secs(2),
            verify_tls: true,
        }
    }

    fn addresses(list: &[&str]) -> BTreeSet<IpAddr> {
        list.iter().map(|a| a.parse().unwrap()).collect()
    }

    fn ok(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "result": { "result": result, "value": "", "summary": null },
            "error": null,
            "id": 0
        }))
    }

    fn rpc_error(code: i64, name: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "result": null,
            "error": { "code": code, "name": name, "message": format!("{name} raised") },
            "id": 0
        }))
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Set-Cookie", "ipa_session=MagBearerToken=abc; Path=/ipa; Secure"),
            )
            .mount(server)
            .await;
    }

    fn rpc(method_name: &str) -> Mock {
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(body_partial_json(json!({ "method": method_name })))
            .respond_with(ResponseTemplate::new(500))
    }

    async fn rpc_bodies(server: &MockServer, method_name: &str) -> Vec<Value> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.url.path() == RPC_PATH)
            .filter_map(|r| serde_json::from_slice::<Value>(&r.body).ok())
            .filter(|b| b["method"] == method_name)
            .collect()
    }

    #[test]
    fn test_build_base_url() {
        assert_eq!(build_base_url("ipa.example.com"), "https://ipa.example.com");
        assert_eq!(build_base_url("https://ipa.example.com/"), "https://ipa.example.com");
        assert_eq!(build_base_url("http://127.0.0.1:8080"), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_settings_debug_redacts_password() {
        let settings = FreeIpaSettings {
            base_url: "https://ipa.example.com".to_string(),
            zone: "example.com".to_string(),
            username: "admin".to_string(),
            password: "hunter2".to_string(),
            organization: None,
            request_timeout: Duration::from_secs(1),
            verify_tls: true,
        };
        assert!(!format!("{settings:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn test_upsert_creates_missing_record() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(body_partial_json(json!({ "method": "dnsrecord_show" })))
            .respond_with(rpc_error(4001, "NotFound"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(header("cookie", "ipa_session=MagBearerToken=abc"))
            .and(body_partial_json(json!({
                "method": "dnsrecord_add",
                "params": [["example.com", "web"], { "arecord": ["10.0.0.1"] }]
            })))
            .respond_with(ok(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = FreeIpaClient::new(settings(&server)).unwrap();
        let change = client
            .upsert_record("web.example.com", &addresses(&["10.0.0.1"]))
            .await
            .unwrap();
        assert_eq!(change, RecordChange::Created);

        let add = rpc_bodies(&server, "dnsrecord_add").await;
        assert_eq!(add[0]["params"][1]["version"], "2.251");
    }

    #[tokio::test]
    async fn test_upsert_unchanged_makes_no_write() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(body_partial_json(json!({ "method": "dnsrecord_show" })))
            .respond_with(ok(json!({
                "idnsname": ["web"],
                "arecord": ["10.0.0.1"],
                "aaaarecord": ["fd00::1"]
            })))
            .expect(1)
            .mount(&server)
            .await;
        rpc("dnsrecord_add").expect(0).mount(&server).await;
        rpc("dnsrecord_del").expect(0).mount(&server).await;

        let client = FreeIpaClient::new(settings(&server)).unwrap();
        let change = client
            .upsert_record("web.example.com", &addresses(&["10.0.0.1", "fd00::1"]))
            .await
            .unwrap();
        assert_eq!(change, RecordChange::Unchanged);
    }

    #[tokio::test]
    async fn test_upsert_updates_only_the_difference() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(body_partial_json(json!({ "method": "dnsrecord_show" })))
            .respond_with(ok(json!({ "arecord": ["10.0.0.1", "10.0.0.9"] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(body_partial_json(json!({
                "method": "dnsrecord_add",
                "params": [["example.com", "web"], { "arecord": ["10.0.0.2"] }]
            })))
            .respond_with(ok(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(body_partial_json(json!({
                "method": "dnsrecord_del",
                "params": [["example.com", "web"], { "arecord": ["10.0.0.9"] }]
            })))
            .respond_with(ok(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = FreeIpaClient::new(settings(&server)).unwrap();
        let change = client
            .upsert_record("web.example.com", &addresses(&["10.0.0.1", "10.0.0.2"]))
            .await
            .unwrap();
        assert_eq!(change, RecordChange::Updated);
    }

    #[tokio::test]
    async fn test_apex_uses_at_sign() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(body_partial_json(json!({
                "method": "dnsrecord_del",
                "params": [["example.com", "@"], { "del_all": true }]
            })))
            .respond_with(ok(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = FreeIpaClient::new(settings(&server)).unwrap();
        let change = client.delete_record("example.com").await.unwrap();
        assert_eq!(change, RecordChange::Deleted);
    }

    #[tokio::test]
    async fn test_delete_missing_record_is_absent() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(body_partial_json(json!({ "method": "dnsrecord_del" })))
            .respond_with(rpc_error(4001, "NotFound"))
            .mount(&server)
            .await;

        let client = FreeIpaClient::new(settings(&server)).unwrap();
        let change = client.delete_record("gone.example.com").await.unwrap();
        assert_eq!(change, RecordChange::Absent);
    }

    #[tokio::test]
    async fn test_hostname_outside_zone_is_permanent_without_request() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        let client = FreeIpaClient::new(settings(&server)).unwrap();
        let err = client
            .upsert_record("web.other.org", &addresses(&["10.0.0.1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidHostname { .. }));
        assert_eq!(err.class(), FailureClass::Permanent);
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_error_classification() {
        let cases: Vec<(ResponseTemplate, FailureClass)> = vec![
            (ResponseTemplate::new(503), FailureClass::Retryable),
            (ResponseTemplate::new(429), FailureClass::Retryable),
            (rpc_error(903, "InternalError"), FailureClass::Retryable),
            (rpc_error(907, "NetworkError"), FailureClass::Retryable),
            (rpc_error(2100, "ACIError"), FailureClass::Permanent),
            (rpc_error(3009, "ValidationError"), FailureClass::Permanent),
            (rpc_error(1100, "KerberosError"), FailureClass::Permanent),
        ];

        for (response, expected) in cases {
            let server = MockServer::start().await;
            mount_login(&server).await;
            Mock::given(method("POST"))
                .and(path(RPC_PATH))
                .respond_with(response)
                .mount(&server)
                .await;

            let client = FreeIpaClient::new(settings(&server)).unwrap();
            let err = client.delete_record("web.example.com").await.unwrap_err();
            assert_eq!(err.class(), expected, "unexpected class for {err}");
        }
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .respond_with(ok(json!({})).set_delay(Duration::from_millis(800)))
            .mount(&server)
            .await;

        let mut settings = settings(&server);
        settings.request_timeout = Duration::from_millis(100);
        let client = FreeIpaClient::new(settings).unwrap();
        let err = client.delete_record("web.example.com").await.unwrap_err();
        assert!(matches!(err, DirectoryError::Timeout { .. }), "got {err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_expired_session_relogs_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(
                ResponseTemplate::new(200).insert_header("Set-Cookie", "ipa_session=fresh; Path=/ipa"),
            )
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .respond_with(ok(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = FreeIpaClient::new(settings(&server)).unwrap();
        let change = client.delete_record("web.example.com").await.unwrap();
        assert_eq!(change, RecordChange::Deleted);
    }

    #[tokio::test]
    async fn test_rejected_login_is_authentication_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(
                ResponseTemplate::new(401).insert_header("X-IPA-Rejection-Reason", "invalid-password"),
            )
            .mount(&server)
            .await;

        let client = FreeIpaClient::new(settings(&server)).unwrap();
        let err = client.delete_record("web.example.com").await.unwrap_err();
        assert_eq!(
            err,
            DirectoryError::Authentication {
                reason: "invalid-password".to_string()
            }
        );
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_request_certificate_flow() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(body_partial_json(json!({ "method": "host_add" })))
            .respond_with(rpc_error(4002, "DuplicateEntry"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(body_partial_json(json!({
                "method": "service_add",
                "params": [["HTTP/web.example.com"], { "force": true }]
            })))
            .respond_with(ok(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(body_partial_json(json!({ "method": "cert_request" })))
            .respond_with(ok(json!({ "serial_number": 42 })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(body_partial_json(json!({ "method": "cert_show", "params": [["42"]] })))
            .respond_with(ok(json!({
                "certificate": "MIIBszCCAVmgAwIBAgIUY2VydA==",
                "valid_not_before": "Mon Jan 06 10:00:00 2025 UTC",
                "valid_not_after": "Thu Jan 06 10:00:00 2028 UTC"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = FreeIpaClient::new(settings(&server)).unwrap();
        let issued = client
            .request_certificate("web.example.com", 730)
            .await
            .unwrap();

        assert_eq!(issued.info.serial, "42");
        assert_eq!(
            issued.info.not_after.to_rfc3339(),
            "2028-01-06T10:00:00+00:00"
        );
        assert!(issued.info.not_before.is_some());
        assert!(issued
            .material
            .certificate_pem
            .starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(issued.material.private_key_pem.contains("PRIVATE KEY"));

        let requests = rpc_bodies(&server, "cert_request").await;
        let csr = requests[0]["params"][0][0].as_str().unwrap();
        assert!(csr.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        assert_eq!(requests[0]["params"][1]["principal"], "HTTP/web.example.com");
    }

    #[tokio::test]
    async fn test_certificate_status_picks_latest_live_certificate() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(body_partial_json(json!({
                "method": "cert_find",
                "params": [[], { "subject": "web.example.com", "exactly": true }]
            })))
            .respond_with(ok(json!([
                { "serial_number": 1, "valid_not_after": "Sat Jan 06 10:00:00 2024 UTC", "revoked": false },
                { "serial_number": 3, "valid_not_after": "Sun Jan 06 10:00:00 2030 UTC", "revoked": true },
                { "serial_number": 2, "valid_not_after": "Thu Jan 06 10:00:00 2028 UTC", "revoked": false }
            ])))
            .mount(&server)
            .await;

        let client = FreeIpaClient::new(settings(&server)).unwrap();
        let info = client
            .get_certificate_status("web.example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.serial, "2");
    }

    #[tokio::test]
    async fn test_certificate_status_none_when_ca_is_empty() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(path(RPC_PATH))
            .and(body_partial_json(json!({ "method": "cert_find" })))
            .respond_with(ok(json!([])))
            .mount(&server)
            .await;

        let client = FreeIpaClient::new(settings(&server)).unwrap();
        assert!(client
            .get_certificate_status("web.example.com")
            .await
            .unwrap()
            .is_none());
    }
}
