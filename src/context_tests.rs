// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `context.rs`

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::context::Context;
    use crate::directory::MemoryDirectory;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_from_config_wires_every_policy() {
        let config = Config::from_yaml(
            r"
directory:
  server: ipa.example.com
  zone: example.com
  username: admin
load_balancer_addresses: [10.0.0.1]
certificates:
  enabled: true
  validity_days: 365
  renew_threshold_days: 20
  cert_dir: /tmp/certs
retry:
  max_attempts: 2
",
        )
        .unwrap();

        let ctx = Context::from_config(&config, Arc::new(MemoryDirectory::new()));
        assert_eq!(ctx.retry.max_attempts, 2);
        assert_eq!(ctx.retry.operation_timeout, Duration::from_secs(240));
        assert_eq!(ctx.certificates.validity_days, 365);
        assert_eq!(ctx.certificates.renew_threshold, chrono::Duration::days(20));
        assert!(ctx.certificates.enabled);
        assert!(ctx
            .publisher
            .cert_path("web.example.com", "1")
            .starts_with(Path::new("/tmp/certs")));
    }
}
