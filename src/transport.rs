//! HTTP delivery: batch/single request bodies, Basic auth, optional deflate
//! compression, optional certificate pinning. A single attempt per call —
//! retry/backoff scheduling belongs to the queue and pipeline, not here.

use crate::error::{PipelineError, PipelineResult};
use crate::event::Event;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::{Arc, Once};
use std::time::Duration;
use url::Url;

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

fn ensure_crypto_provider() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Verifies a certificate's SHA-256 DER digest against a configured pin set.
/// An empty pin set disables pinning (every certificate passes).
pub struct CertificatePinVerifier {
    pins: Vec<[u8; 32]>,
}

impl CertificatePinVerifier {
    pub fn new(pins: &[String]) -> PipelineResult<Self> {
        let mut decoded = Vec::with_capacity(pins.len());
        for pin in pins {
            let bytes = BASE64
                .decode(pin)
                .map_err(|e| PipelineError::config(format!("invalid certificate pin '{pin}': {e}")))?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| PipelineError::config(format!("certificate pin '{pin}' is not a 32-byte SHA-256 digest")))?;
            decoded.push(arr);
        }
        Ok(Self { pins: decoded })
    }

    pub fn is_enabled(&self) -> bool {
        !self.pins.is_empty()
    }

    /// Computes the SHA-256 digest of a DER-encoded certificate and checks
    /// it against the configured pin set. Returns `true` when pinning is
    /// disabled or the digest is present in the pin set.
    pub fn verify_der(&self, der: &[u8]) -> bool {
        if self.pins.is_empty() {
            return true;
        }
        let digest: [u8; 32] = Sha256::digest(der).into();
        self.pins.iter().any(|pin| pin == &digest)
    }
}

/// `rustls::client::danger::ServerCertVerifier` that layers pin checking on
/// top of (or instead of, when `allow_self_signed` is set) standard
/// webpki trust-chain evaluation.
struct PinningVerifier {
    pin_verifier: CertificatePinVerifier,
    allow_self_signed: bool,
    validate_chain: bool,
    trust_verifier: Arc<WebPkiServerVerifier>,
}

impl std::fmt::Debug for PinningVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinningVerifier").field("pinned", &self.pin_verifier.is_enabled()).finish()
    }
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, TlsError> {
        if !self.allow_self_signed {
            self.trust_verifier.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        }

        if self.pin_verifier.is_enabled() {
            let chain: Vec<&CertificateDer<'_>> = if self.validate_chain {
                std::iter::once(end_entity).chain(intermediates.iter()).collect()
            } else {
                vec![end_entity]
            };
            let matched = chain.iter().any(|cert| self.pin_verifier.verify_der(cert.as_ref()));
            if !matched {
                return Err(TlsError::General("certificate pin mismatch".into()));
            }
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.trust_verifier.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.trust_verifier.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.trust_verifier.supported_verify_schemes()
    }
}

/// Wire envelope for a batch delivery — never carries `project_id`, which
/// travels as the `X-Project-Id` header instead.
#[derive(serde::Serialize)]
struct BatchBody<'a> {
    events: &'a [Event],
}

/// Builds the JSON body for a delivery: a bare event when `events` has
/// exactly one element, `{"events": [...]}` otherwise. Compresses with
/// deflate when enabled and the body exceeds the configured threshold.
pub fn build_body(
    events: &[Event],
    compression_enabled: bool,
    compression_threshold_bytes: usize,
) -> PipelineResult<(Vec<u8>, bool)> {
    let json = if events.len() == 1 {
        serde_json::to_vec(&events[0])?
    } else {
        serde_json::to_vec(&BatchBody { events })?
    };

    if compression_enabled && json.len() >= compression_threshold_bytes {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;
        Ok((compressed, true))
    } else {
        Ok((json, false))
    }
}

/// Thin wrapper around `reqwest::Client` that applies auth, compression, and
/// (optionally) certificate pinning. Never retries — success/failure is
/// reported back to the caller, which owns retry scheduling.
pub struct Transport {
    client: reqwest::Client,
    endpoint_url: Url,
    public_id: String,
    compression_enabled: bool,
    compression_threshold_bytes: usize,
}

/// Certificate-pinning options, grouped so `Transport::new` doesn't need a
/// five-argument tail of booleans.
pub struct CertPinConfig {
    pub pins: Vec<String>,
    pub allow_self_signed: bool,
    pub validate_chain: bool,
}

impl Transport {
    pub fn new(
        endpoint_url: Url,
        public_id: String,
        compression_enabled: bool,
        compression_threshold_bytes: usize,
        request_timeout: Duration,
        pin_config: CertPinConfig,
    ) -> PipelineResult<Self> {
        let pin_verifier = CertificatePinVerifier::new(&pin_config.pins)?;

        let client = if pin_verifier.is_enabled() || pin_config.allow_self_signed {
            ensure_crypto_provider();
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let trust_verifier = WebPkiServerVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| PipelineError::config(format!("failed to build TLS trust verifier: {e}")))?;

            let verifier = Arc::new(PinningVerifier {
                pin_verifier,
                allow_self_signed: pin_config.allow_self_signed,
                validate_chain: pin_config.validate_chain,
                trust_verifier,
            });

            let tls_config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(verifier)
                .with_no_client_auth();

            reqwest::Client::builder()
                .use_preconfigured_tls(tls_config)
                .timeout(request_timeout)
                .build()
                .map_err(PipelineError::Network)?
        } else {
            reqwest::Client::builder().timeout(request_timeout).build().map_err(PipelineError::Network)?
        };

        Ok(Self { client, endpoint_url, public_id, compression_enabled, compression_threshold_bytes })
    }

    fn auth_header(&self) -> String {
        let credentials = format!("{}:", self.public_id);
        format!("Basic {}", BASE64.encode(credentials))
    }

    /// Sends a single delivery attempt. HTTP 2xx is success; everything
    /// else (including transport errors) is failure. Never retries.
    pub async fn send(&self, project_id: &str, events: &[Event]) -> PipelineResult<()> {
        let (body, compressed) = build_body(events, self.compression_enabled, self.compression_threshold_bytes)?;

        let mut request = self
            .client
            .post(self.endpoint_url.clone())
            .header("Authorization", self.auth_header())
            .header("Content-Type", "application/json")
            .header("X-Project-Id", project_id);
        if compressed {
            request = request.header("Content-Encoding", "deflate");
        }

        let response = request.body(body).send().await.map_err(PipelineError::Network)?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        Err(PipelineError::ServerRejected { status, message })
    }

    pub fn endpoint_host(&self) -> String {
        self.endpoint_url.host_str().unwrap_or_default().to_string()
    }
}
