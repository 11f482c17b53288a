//! Credential Acquirer
//!
//! Fingerprint: ask the CA container's own `step` tool first, fall back to
//! hashing the first certificate served by `/roots`. Root certificate: always
//! the API, pinned to the pass fingerprint. Each method runs at most once per
//! call; retries belong to the next reconciliation pass.

use base64::Engine;
use rustls_pemfile::certs;
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::ca_api::CaApi;
use super::error::{Result, TrustError};
use super::runtime::ContainerRuntime;
use super::types::{CaEndpoint, Fingerprint, PEM_CERT_BEGIN, PEM_CERT_END};

/// Root certificate inside the step-ca container.
pub const CA_ROOT_PATH: &str = "/home/step/certs/root_ca.crt";

/// Intermediate certificate inside the step-ca container.
pub const CA_INTERMEDIATE_PATH: &str = "/home/step/certs/intermediate_ca.crt";

/// Retrieves fingerprints and certificates from the CA
pub struct CredentialAcquirer {
    runtime: Arc<dyn ContainerRuntime>,
    api: Arc<dyn CaApi>,
}

impl CredentialAcquirer {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, api: Arc<dyn CaApi>) -> Self {
        Self { runtime, api }
    }

    /// Root fingerprint: exec method first, `/roots` on any failure.
    pub async fn get_fingerprint(&self, container_id: Option<&str>, base_url: &str) -> Result<Fingerprint> {
        let exec_error = match container_id {
            Some(id) => match self.fingerprint_via_exec(id).await {
                Ok(fingerprint) => {
                    debug!(container = %id, "Fingerprint obtained inside the CA container");
                    return Ok(fingerprint);
                }
                Err(e) => {
                    warn!(
                        container = %id,
                        error = %e,
                        "In-container fingerprint failed, falling back to the roots API"
                    );
                    e.to_string()
                }
            },
            None => "no CA container".to_string(),
        };

        match self.fingerprint_via_api(base_url).await {
            Ok(fingerprint) => {
                info!(ca = %base_url, "Fingerprint derived from the roots API");
                Ok(fingerprint)
            }
            Err(api_error) => Err(TrustError::AcquisitionFailed(format!(
                "exec: {}; api: {}",
                exec_error, api_error
            ))),
        }
    }

    async fn fingerprint_via_exec(&self, container_id: &str) -> Result<Fingerprint> {
        let output = self
            .runtime
            .exec(container_id, &["step", "certificate", "fingerprint", CA_ROOT_PATH])
            .await?;

        if !output.success() {
            return Err(TrustError::Command(format!(
                "step certificate fingerprint exited {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        output
            .stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(Fingerprint::parse)
            .ok_or_else(|| {
                TrustError::Command(format!(
                    "unrecognisable fingerprint output: {:?}",
                    output.stdout.trim()
                ))
            })
    }

    async fn fingerprint_via_api(&self, base_url: &str) -> Result<Fingerprint> {
        let root = self.first_root(base_url).await?;
        fingerprint_of_pem(&root)
    }

    async fn first_root(&self, base_url: &str) -> Result<String> {
        let roots = self.api.roots(base_url).await?;
        let first = roots
            .first()
            .ok_or_else(|| TrustError::AcquisitionFailed("roots response is empty".into()))?;
        extract_first_certificate(first)
            .ok_or_else(|| TrustError::AcquisitionFailed("roots entry is not a PEM certificate".into()))
    }

    /// Root certificate PEM, fetched once per endpoint and pinned to its fingerprint.
    pub async fn get_root_certificate(&self, ca: &CaEndpoint) -> Result<String> {
        let pem = ca
            .root_cell()
            .get_or_try_init(|| async {
                let root = self
                    .first_root(&ca.base_url)
                    .await
                    .map_err(|e| match e {
                        TrustError::AcquisitionFailed(_) => e,
                        other => TrustError::AcquisitionFailed(other.to_string()),
                    })?;

                let actual = fingerprint_of_pem(&root)?;
                if actual != ca.fingerprint {
                    return Err(TrustError::AcquisitionFailed(format!(
                        "root fingerprint {} does not match expected {}",
                        actual, ca.fingerprint
                    )));
                }
                Ok(root)
            })
            .await?;
        Ok(pem.clone())
    }

    /// Intermediate certificate: read inside the CA container, else `/intermediates`.
    pub async fn get_intermediate_certificate(&self, ca: &CaEndpoint) -> Result<String> {
        let exec_error = match &ca.container_id {
            Some(id) => match self.runtime.exec(id, &["cat", CA_INTERMEDIATE_PATH]).await {
                Ok(output) if output.success() => match extract_first_certificate(&output.stdout) {
                    Some(pem) => return Ok(pem),
                    None => "intermediate file is not a PEM certificate".to_string(),
                },
                Ok(output) => format!("cat exited {}: {}", output.exit_code, output.stderr.trim()),
                Err(e) => e.to_string(),
            },
            None => "no CA container".to_string(),
        };
        warn!(ca = %ca, error = %exec_error, "Reading the intermediate in the CA container failed, using the API");

        let api_result = self.api.intermediates(&ca.base_url).await.and_then(|list| {
            list.first()
                .and_then(|entry| extract_first_certificate(entry))
                .ok_or_else(|| TrustError::AcquisitionFailed("no PEM intermediate in response".into()))
        });

        api_result.map_err(|api_error| {
            TrustError::AcquisitionFailed(format!("exec: {}; api: {}", exec_error, api_error))
        })
    }
}

/// DER bytes of the first certificate in `text`, skipping any surrounding noise.
pub fn first_certificate_der(text: &str) -> Option<Vec<u8>> {
    let mut reader = Cursor::new(text.as_bytes());
    let der = certs(&mut reader).next()?.ok()?;
    if der.is_empty() {
        return None;
    }
    Some(der.to_vec())
}

/// Re-armours DER bytes as a single `CERTIFICATE` block with 64-column lines.
fn encode_certificate(der: &[u8]) -> String {
    let body = base64::engine::general_purpose::STANDARD.encode(der);
    let mut pem = format!("{}\n", PEM_CERT_BEGIN);
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(PEM_CERT_END);
    pem.push('\n');
    pem
}

/// The first certificate in `text` as a normalised PEM block.
pub fn extract_first_certificate(text: &str) -> Option<String> {
    first_certificate_der(text).map(|der| encode_certificate(&der))
}

/// SHA-256 over the DER bytes of a PEM certificate, as `step` prints it.
pub fn fingerprint_of_pem(pem: &str) -> Result<Fingerprint> {
    let der = first_certificate_der(pem)
        .ok_or_else(|| TrustError::AcquisitionFailed("not a PEM certificate".into()))?;

    let digest = Sha256::digest(&der);
    Fingerprint::parse(&hex::encode(digest))
        .ok_or_else(|| TrustError::AcquisitionFailed("digest is not a fingerprint".into()))
}
