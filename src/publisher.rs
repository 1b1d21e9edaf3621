// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Traefik dynamic configuration and certificate files.
//!
//! Every issued certificate gets its own pair of files in the certificate directory,
//! named after the hostname and the CA serial: `<hostname>.<serial>.crt` and
//! `<hostname>.<serial>.key`. One YAML file for Traefik's file provider lists the pair
//! currently served for each hostname:
//!
//! ```yaml
//! tls:
//!   certificates:
//!     - certFile: /certs/services/web.example.com.4711.crt
//!       keyFile: /certs/services/web.example.com.4711.key
//!   options:
//!     default:
//!       minVersion: VersionTLS12
//!       sniStrict: false
//! ```
//!
//! A reissue writes a new pair next to the old one, republishes the configuration
//! (which now differs, so Traefik's watcher reloads it), and only then retires the old
//! pair. The served key and certificate always belong together.
//!
//! Every file is written to a temporary sibling, flushed, and renamed over the target,
//! so Traefik never reads a partial file.

use crate::config::Config;
use crate::directory::CertificateMaterial;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// File mode for certificates
const CERT_FILE_MODE: u32 = 0o644;
/// File mode for private keys
const KEY_FILE_MODE: u32 = 0o600;
/// File mode for the proxy configuration
const CONFIG_FILE_MODE: u32 = 0o644;
/// Extension of certificate files
const CERT_SUFFIX: &str = "crt";
/// Extension of key files
const KEY_SUFFIX: &str = "key";

/// Filesystem failures while publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Writing or renaming a file failed
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Deleting a file failed
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be serialized
    #[error("failed to render proxy configuration: {0}")]
    Render(#[from] serde_yaml::Error),
}

#[derive(Debug, Serialize)]
struct DynamicConfig {
    tls: TlsSection,
}

#[derive(Debug, Serialize)]
struct TlsSection {
    certificates: Vec<CertificateEntry>,
    options: BTreeMap<String, TlsOptions>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CertificateEntry {
    cert_file: String,
    key_file: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TlsOptions {
    min_version: String,
    sni_strict: bool,
}

/// Where and how the publisher writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherSettings {
    /// Directory holding `<hostname>.crt` / `<hostname>.key`
    pub cert_dir: PathBuf,
    /// Traefik dynamic configuration file
    pub config_file: PathBuf,
    /// `tls.options.default.minVersion`
    pub min_tls_version: String,
    /// `tls.options.default.sniStrict`
    pub sni_strict: bool,
}

impl PublisherSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            cert_dir: config.certificates.cert_dir.clone(),
            config_file: config.certificates.proxy_config_file.clone(),
            min_tls_version: config.certificates.min_tls_version.clone(),
            sni_strict: config.certificates.sni_strict,
        }
    }
}

/// A certificate the proxy configuration lists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServedCertificate {
    /// Hostname the certificate is for
    pub hostname: String,
    /// CA serial, which names the material files
    pub serial: String,
}

impl ServedCertificate {
    #[must_use]
    pub fn new(hostname: &str, serial: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            serial: serial.to_string(),
        }
    }
}

/// Writes certificate material and the proxy configuration.
#[derive(Debug, Clone)]
pub struct Publisher {
    settings: PublisherSettings,
}

impl Publisher {
    #[must_use]
    pub fn new(settings: PublisherSettings) -> Self {
        Self { settings }
    }

    /// Path of the certificate file for `hostname` issued as `serial`.
    #[must_use]
    pub fn cert_path(&self, hostname: &str, serial: &str) -> PathBuf {
        self.settings
            .cert_dir
            .join(format!("{}.{CERT_SUFFIX}", material_stem(hostname, serial)))
    }

    /// Path of the key file for `hostname` issued as `serial`.
    #[must_use]
    pub fn key_path(&self, hostname: &str, serial: &str) -> PathBuf {
        self.settings
            .cert_dir
            .join(format!("{}.{KEY_SUFFIX}", material_stem(hostname, serial)))
    }

    /// Write the certificate and key for `hostname` issued as `serial`.
    ///
    /// Nothing references a new pair until the configuration is republished.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Write`] if either file cannot be written.
    pub async fn store_material(
        &self,
        hostname: &str,
        serial: &str,
        material: &CertificateMaterial,
    ) -> Result<(), PublishError> {
        write_atomic(
            &self.key_path(hostname, serial),
            material.private_key_pem.as_bytes(),
            KEY_FILE_MODE,
        )
        .await?;
        write_atomic(
            &self.cert_path(hostname, serial),
            material.certificate_pem.as_bytes(),
            CERT_FILE_MODE,
        )
        .await?;
        info!(
            hostname = %hostname,
            serial = %serial,
            dir = %self.settings.cert_dir.display(),
            "Stored certificate material"
        );
        Ok(())
    }

    /// Whether both files of the certificate `serial` for `hostname` exist.
    pub async fn has_material(&self, hostname: &str, serial: &str) -> bool {
        let cert = fs::try_exists(self.cert_path(hostname, serial)).await.unwrap_or(false);
        let key = fs::try_exists(self.key_path(hostname, serial)).await.unwrap_or(false);
        cert && key
    }

    /// Delete every material file of `hostname` except the pair issued as `keep`.
    ///
    /// Returns the number of files removed. A missing certificate directory is fine.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Remove`] if listing the directory or deleting a file fails.
    pub async fn retire(&self, hostname: &str, keep: Option<&str>) -> Result<usize, PublishError> {
        let dir = &self.settings.cert_dir;
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(PublishError::Remove {
                    path: dir.clone(),
                    source,
                })
            }
        };
        let keep = keep.map(sanitize_serial);

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(PublishError::Remove {
                        path: dir.clone(),
                        source,
                    })
                }
            };
            let name = entry.file_name();
            let Some((host, serial)) = name.to_str().and_then(parse_material_name) else {
                continue;
            };
            if host != hostname || keep.as_deref() == Some(serial) {
                continue;
            }
            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed certificate file");
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(PublishError::Remove { path, source }),
            }
        }

        if removed > 0 {
            info!(hostname = %hostname, files = removed, "Retired certificate material");
        }
        Ok(removed)
    }

    /// Render the configuration for `served` (any order; output is sorted).
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Render`] if serialization fails.
    pub fn render(&self, served: &[ServedCertificate]) -> Result<String, PublishError> {
        let mut sorted: Vec<&ServedCertificate> = served.iter().collect();
        sorted.sort();
        sorted.dedup();

        let certificates = sorted
            .into_iter()
            .map(|c| CertificateEntry {
                cert_file: self.cert_path(&c.hostname, &c.serial).display().to_string(),
                key_file: self.key_path(&c.hostname, &c.serial).display().to_string(),
            })
            .collect();

        let mut options = BTreeMap::new();
        options.insert(
            "default".to_string(),
            TlsOptions {
                min_version: self.settings.min_tls_version.clone(),
                sni_strict: self.settings.sni_strict,
            },
        );

        Ok(serde_yaml::to_string(&DynamicConfig {
            tls: TlsSection {
                certificates,
                options,
            },
        })?)
    }

    /// Atomically rewrite the configuration to list `served`.
    ///
    /// Returns `false` without writing when the file already has this content. Any
    /// change of the served set, a reissue included, changes the content.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if rendering or writing fails.
    pub async fn publish(&self, served: &[ServedCertificate]) -> Result<bool, PublishError> {
        let rendered = self.render(served)?;
        let path = &self.settings.config_file;

        if let Ok(existing) = fs::read_to_string(path).await {
            if existing == rendered {
                debug!(path = %path.display(), "Proxy configuration unchanged");
                return Ok(false);
            }
        }

        write_atomic(path, rendered.as_bytes(), CONFIG_FILE_MODE).await?;
        info!(
            path = %path.display(),
            certificates = served.len(),
            "Published proxy configuration"
        );
        Ok(true)
    }
}

/// Serials become part of file names; keep only ASCII alphanumerics.
fn sanitize_serial(serial: &str) -> String {
    let cleaned: String = serial.chars().filter(char::is_ascii_alphanumeric).collect();
    if cleaned.is_empty() {
        "0".to_string()
    } else {
        cleaned
    }
}

fn material_stem(hostname: &str, serial: &str) -> String {
    format!("{hostname}.{}", sanitize_serial(serial))
}

/// Split `<hostname>.<serial>.crt|key` into hostname and serial.
fn parse_material_name(name: &str) -> Option<(&str, &str)> {
    let stem = name
        .strip_suffix(&format!(".{CERT_SUFFIX}"))
        .or_else(|| name.strip_suffix(&format!(".{KEY_SUFFIX}")))?;
    let (host, serial) = stem.rsplit_once('.')?;
    let valid = !host.is_empty()
        && !host.starts_with('.')
        && !serial.is_empty()
        && serial.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some((host, serial))
}

/// Write `contents` to a temp file beside `path`, flush it, and rename it into place.
async fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), PublishError> {
    let write_err = |source| PublishError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).await.map_err(write_err)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{name}.{:016x}.tmp", rand::random::<u64>()));

    let result = async {
        let mut file = create_with_mode(&tmp, mode).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        set_mode(&tmp, mode).await?;
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp).await;
        return Err(write_err(e));
    }
    Ok(())
}

/// Create a new file that has `mode` from the start, never a wider one.
#[cfg(unix)]
async fn create_with_mode(path: &Path, mode: u32) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .await
}

#[cfg(not(unix))]
async fn create_with_mode(path: &Path, _mode: u32) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
#[path = "publisher_tests.rs"]
mod publisher_tests;
