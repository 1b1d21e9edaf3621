// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `extractor.rs`

#[cfg(test)]
mod tests {
    use crate::extractor::*;
    use std::collections::BTreeSet;

    fn settings() -> ExtractorSettings {
        ExtractorSettings {
            managed_label: "dns.managed".to_string(),
            hostname_label: "dns.hostname".to_string(),
            hostname_delimiter: ",".to_string(),
            extract_from_rules: true,
            router_prefix: "traefik.http.routers.".to_string(),
            zone: "example.com".to_string(),
        }
    }

    fn metadata(pairs: &[(&str, &str)]) -> ServiceMetadata {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| (*n).to_string()).collect()
    }

    #[test]
    fn test_unmanaged_service_yields_nothing() {
        let meta = metadata(&[("traefik.http.routers.web.rule", "Host(`web.example.com`)")]);
        let extraction = extract(&settings(), &meta);
        assert!(extraction.hostnames.is_empty());
        assert!(extraction.warnings.is_empty());

        let meta = metadata(&[
            ("dns.managed", "false"),
            ("traefik.http.routers.web.rule", "Host(`web.example.com`)"),
        ]);
        assert!(extract(&settings(), &meta).hostnames.is_empty());
    }

    #[test]
    fn test_two_routers_contribute_independently() {
        let meta = metadata(&[
            ("dns.managed", "true"),
            ("traefik.http.routers.web.rule", "Host(`web.example.com`)"),
            (
                "traefik.http.routers.api.rule",
                "Host(`api.example.com`) && PathPrefix(`/v1`)",
            ),
            ("traefik.http.routers.web.tls", "true"),
        ]);

        let extraction = extract(&settings(), &meta);
        assert_eq!(
            extraction.hostnames,
            set(&["api.example.com", "web.example.com"])
        );
        assert!(extraction.warnings.is_empty());
    }

    #[test]
    fn test_explicit_label_overrides_rules() {
        let meta = metadata(&[
            ("dns.managed", "true"),
            ("dns.hostname", "grafana, metrics.example.com ,,Dash.Example.COM."),
            ("traefik.http.routers.web.rule", "Host(`web.example.com`)"),
        ]);

        let extraction = extract(&settings(), &meta);
        assert_eq!(
            extraction.hostnames,
            set(&[
                "dash.example.com",
                "grafana.example.com",
                "metrics.example.com"
            ])
        );
    }

    #[test]
    fn test_rule_extraction_can_be_disabled() {
        let mut settings = settings();
        settings.extract_from_rules = false;
        let meta = metadata(&[
            ("dns.managed", "true"),
            ("traefik.http.routers.web.rule", "Host(`web.example.com`)"),
        ]);
        assert!(extract(&settings, &meta).hostnames.is_empty());
    }

    #[test]
    fn test_malformed_rule_is_a_warning_not_a_failure() {
        let meta = metadata(&[
            ("dns.managed", "true"),
            ("traefik.http.routers.broken.rule", "Host(`broken.example.com`"),
            ("traefik.http.routers.web.rule", "Host(`web.example.com`)"),
        ]);

        let extraction = extract(&settings(), &meta);
        assert_eq!(extraction.hostnames, set(&["web.example.com"]));
        assert_eq!(extraction.warnings.len(), 1);
        assert!(matches!(
            &extraction.warnings[0],
            ExtractionWarning::MalformedRule { router, .. } if router == "broken"
        ));
    }

    #[test]
    fn test_hosts_outside_zone_are_skipped_with_warning() {
        let meta = metadata(&[
            ("dns.managed", "true"),
            (
                "traefik.http.routers.web.rule",
                "Host(`web.example.com`, `web.other.org`)",
            ),
        ]);

        let extraction = extract(&settings(), &meta);
        assert_eq!(extraction.hostnames, set(&["web.example.com"]));
        assert!(matches!(
            &extraction.warnings[0],
            ExtractionWarning::OutsideZone { hostname, .. } if hostname == "web.other.org"
        ));
    }

    #[test]
    fn test_suffix_lookalike_is_outside_zone() {
        assert!(in_zone("web.example.com", "example.com"));
        assert!(in_zone("example.com", "example.com"));
        assert!(!in_zone("webexample.com", "example.com"));
        assert!(!in_zone("example.com.evil.org", "example.com"));
    }

    #[test]
    fn test_parse_host_rule_variants() {
        assert_eq!(
            parse_host_rule("Host(`a.example.com`)").unwrap(),
            vec!["a.example.com"]
        );
        assert_eq!(
            parse_host_rule("Host(\"a.example.com\", `b.example.com`)").unwrap(),
            vec!["a.example.com", "b.example.com"]
        );
        assert_eq!(
            parse_host_rule("(Host(`a.example.com`) || Host(`b.example.com`)) && !Path(`/x`)")
                .unwrap(),
            vec!["a.example.com", "b.example.com"]
        );
        assert!(parse_host_rule("PathPrefix(`/api`)").unwrap().is_empty());
        assert!(parse_host_rule("HostRegexp(`{sub:[a-z]+}.example.com`)")
            .unwrap()
            .is_empty());
        assert!(parse_host_rule("HostSNI(`*`)").unwrap().is_empty());
    }

    #[test]
    fn test_parse_host_rule_rejects_broken_syntax() {
        for rule in [
            "Host(`a.example.com`",
            "Host(`a.example.com)",
            "Host()",
            "Host(``)",
            "Host(a.example.com)",
            "Host(`a.example.com` `b.example.com`)",
            "Host(`a.example.com`,)",
            "Host(`a.example.com`))",
        ] {
            assert!(parse_host_rule(rule).is_err(), "expected error for {rule}");
        }
    }

    #[test]
    fn test_invalid_hostname_from_label() {
        let meta = metadata(&[("dns.managed", "true"), ("dns.hostname", "bad_name,ok")]);
        let extraction = extract(&settings(), &meta);
        assert_eq!(extraction.hostnames, set(&["ok.example.com"]));
        assert!(matches!(
            &extraction.warnings[0],
            ExtractionWarning::InvalidHostname { hostname, .. } if hostname == "bad_name.example.com"
        ));
    }

    #[test]
    fn test_validate_hostname() {
        assert!(validate_hostname("web.example.com").is_ok());
        assert!(validate_hostname("a-1.b2.example.com").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("web..example.com").is_err());
        assert!(validate_hostname("-web.example.com").is_err());
        assert!(validate_hostname(&format!("{}.example.com", "a".repeat(64))).is_err());
    }

    /// Random rule generator: every generated rule set must extract exactly the
    /// distinct host literals it was built from, regardless of rule shape or order.
    #[test]
    fn test_extraction_equals_distinct_literals_across_rules() {
        const POOL: &[&str] = &[
            "web", "api", "grafana", "auth", "files", "git", "wiki", "status",
        ];
        const DECORATIONS: &[&str] = &[
            "",
            " && PathPrefix(`/api`)",
            " && Method(`GET`)",
            " || PathPrefix(`/static`)",
        ];

        for _ in 0..200 {
            let router_count = rand::random_range(1..5usize);
            let mut expected = BTreeSet::new();
            let mut meta = metadata(&[("dns.managed", "true")]);

            for router in 0..router_count {
                let literal_count = rand::random_range(1..4usize);
                let mut literals = Vec::new();
                for _ in 0..literal_count {
                    let host = format!(
                        "{}.example.com",
                        POOL[rand::random_range(0..POOL.len())]
                    );
                    expected.insert(host.clone());
                    literals.push(format!("`{host}`"));
                }
                let predicate = if rand::random_range(0..2u8) == 0 {
                    format!("Host({})", literals.join(", "))
                } else {
                    literals
                        .iter()
                        .map(|l| format!("Host({l})"))
                        .collect::<Vec<_>>()
                        .join(" || ")
                };
                let decoration = DECORATIONS[rand::random_range(0..DECORATIONS.len())];
                meta.insert(
                    format!("traefik.http.routers.r{router}.rule"),
                    format!("({predicate}){decoration}"),
                );
            }

            let extraction = extract(&settings(), &meta);
            assert_eq!(extraction.hostnames, expected, "metadata: {meta:?}");
            assert!(extraction.warnings.is_empty(), "metadata: {meta:?}");
        }
    }
}
