//! TLS material construction for the login and streaming connections.
//!
//! Key material arrives as PEM, either a single bundle (chain plus key) or
//! split certificate/key files. Everything is parsed and validated up front
//! so that a listener with unusable material fails at `start` with a typed
//! error instead of at the first connection attempt.

use std::fs;
use std::path::Path;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use tracing::{debug, warn};

use crate::config::{KeyMaterial, SecureSocket, TrustMaterial};
use crate::error::{ListenerError, Result};

/// Parsed and validated TLS material, ready to apply to an HTTP client.
#[derive(Debug)]
pub struct TlsMaterial {
    identity: Option<reqwest::Identity>,
    trust_anchors: Vec<reqwest::Certificate>,
}

impl TlsMaterial {
    pub fn from_secure_socket(socket: &SecureSocket) -> Result<Self> {
        let identity = match &socket.key {
            Some(key) => Some(build_identity(key)?),
            None => None,
        };
        let trust_anchors = match &socket.trust {
            Some(trust) => build_trust_anchors(trust)?,
            None => Vec::new(),
        };
        Ok(Self {
            identity,
            trust_anchors,
        })
    }

    pub fn apply(self, mut builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        for anchor in self.trust_anchors {
            builder = builder.add_root_certificate(anchor);
        }
        if let Some(identity) = self.identity {
            builder = builder.identity(identity);
        }
        builder
    }
}

/// Builds the HTTP client shared by login and streaming, carrying the TLS
/// material and the per-request network guard.
pub fn build_http_client(
    secure_socket: Option<&SecureSocket>,
    read_timeout: Duration,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(read_timeout);
    if let Some(socket) = secure_socket {
        builder = TlsMaterial::from_secure_socket(socket)?.apply(builder);
    }
    builder
        .build()
        .map_err(|e| ListenerError::Configuration(format!("http client construction failed: {e}")))
}

fn build_identity(key: &KeyMaterial) -> Result<reqwest::Identity> {
    let (pem, password) = match key {
        KeyMaterial::Bundle { path, password } => (read_pem(path)?, password.as_ref()),
        KeyMaterial::Files {
            cert_path,
            key_path,
            key_password,
        } => {
            let mut combined = read_pem(cert_path)?;
            combined.push(b'\n');
            combined.extend_from_slice(&read_pem(key_path)?);
            (combined, key_password.as_ref())
        }
    };

    if password.is_some() {
        return Err(ListenerError::Configuration(
            "password-protected private keys are not supported; provide an unencrypted PEM key"
                .to_string(),
        ));
    }

    // Validate before handing the buffer to the client: the key must decode
    // under one of the supported encodings and at least one certificate must
    // accompany it.
    decode_private_key(&pem)?;
    let cert_count = rustls_pemfile::certs(&mut pem.as_slice())
        .filter(|c| c.is_ok())
        .count();
    if cert_count == 0 {
        return Err(ListenerError::Configuration(
            "key material contains no certificate".to_string(),
        ));
    }

    debug!(certificates = cert_count, "client identity material loaded");
    reqwest::Identity::from_pem(&pem)
        .map_err(|e| ListenerError::Configuration(format!("unusable client identity: {e}")))
}

/// Decodes the first private key in the buffer, trying PKCS#1 (RSA), then
/// SEC1 (EC), then PKCS#8.
fn decode_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    if let Some(Ok(key)) = rustls_pemfile::rsa_private_keys(&mut &*pem).next() {
        return Ok(PrivateKeyDer::from(key));
    }
    if let Some(Ok(key)) = rustls_pemfile::ec_private_keys(&mut &*pem).next() {
        return Ok(PrivateKeyDer::from(key));
    }
    if let Some(Ok(key)) = rustls_pemfile::pkcs8_private_keys(&mut &*pem).next() {
        return Ok(PrivateKeyDer::from(key));
    }
    Err(ListenerError::Configuration(
        "no usable private key in key material (expected PKCS#1, SEC1 or PKCS#8 PEM)".to_string(),
    ))
}

fn build_trust_anchors(trust: &TrustMaterial) -> Result<Vec<reqwest::Certificate>> {
    let pem = match trust {
        TrustMaterial::File { path } => read_pem(path)?,
        TrustMaterial::Pem(text) => text.clone().into_bytes(),
    };

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| ListenerError::Configuration(format!("unreadable trust material: {e}")))?;

    // An empty trust store would silently trust nothing and fail every
    // connection later; reject it here instead.
    if certs.is_empty() {
        return Err(ListenerError::Configuration(
            "trust material contains no certificates".to_string(),
        ));
    }

    let mut store = RootCertStore::empty();
    let mut anchors = Vec::with_capacity(certs.len());
    for der in certs {
        if let Err(e) = store.add(der.clone()) {
            warn!(error = %e, "skipping certificate rejected as trust anchor");
            continue;
        }
        let anchor = reqwest::Certificate::from_der(der.as_ref())
            .map_err(|e| ListenerError::Configuration(format!("unusable trust anchor: {e}")))?;
        anchors.push(anchor);
    }
    if anchors.is_empty() {
        return Err(ListenerError::Configuration(
            "no certificate in trust material is usable as a trust anchor".to_string(),
        ));
    }
    debug!(anchors = anchors.len(), "trust material loaded");
    Ok(anchors)
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        ListenerError::Configuration(format!("cannot read {}: {e}", path.display()))
    })
}
