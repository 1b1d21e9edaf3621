// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Private key and certificate signing request generation.

use chrono::{DateTime, Datelike, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

/// A PKCS#10 request and the key it was signed with.
pub struct SigningRequest {
    /// CSR, PEM
    pub csr_pem: String,
    /// Private key, PEM
    pub private_key_pem: String,
}

fn params_for(fqdn: &str, organization: Option<&str>) -> Result<CertificateParams, rcgen::Error> {
    let mut params = CertificateParams::new(vec![fqdn.to_string()])?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, fqdn);
    if let Some(org) = organization {
        name.push(DnType::OrganizationName, org);
    }
    params.distinguished_name = name;
    Ok(params)
}

/// Generate a fresh key and a CSR with `CN=<fqdn>` and a DNS SAN for `fqdn`.
///
/// # Errors
///
/// Returns the rcgen error if key generation or CSR serialization fails.
pub fn signing_request(
    fqdn: &str,
    organization: Option<&str>,
) -> Result<SigningRequest, rcgen::Error> {
    let key_pair = KeyPair::generate()?;
    let csr = params_for(fqdn, organization)?.serialize_request(&key_pair)?;
    Ok(SigningRequest {
        csr_pem: csr.pem()?,
        private_key_pem: key_pair.serialize_pem(),
    })
}

/// Generate a self-signed certificate valid between `not_before` and `not_after`.
///
/// Returns `(certificate_pem, private_key_pem)`.
///
/// # Errors
///
/// Returns the rcgen error if key generation or signing fails.
#[allow(clippy::cast_possible_truncation)]
pub fn self_signed(
    fqdn: &str,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Result<(String, String), rcgen::Error> {
    let key_pair = KeyPair::generate()?;
    let mut params = params_for(fqdn, None)?;
    // Day precision is enough for certificate validity.
    params.not_before =
        rcgen::date_time_ymd(not_before.year(), not_before.month() as u8, not_before.day() as u8);
    params.not_after =
        rcgen::date_time_ymd(not_after.year(), not_after.month() as u8, not_after.day() as u8);
    let certificate = params.self_signed(&key_pair)?;
    Ok((certificate.pem(), key_pair.serialize_pem()))
}
