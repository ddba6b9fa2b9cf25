//! TLS material shared by both transport variants.

use std::{fs, path::Path, sync::Arc};

use anyhow::Context;
use rcgen::generate_simple_self_signed;
use rustls::{
    SupportedProtocolVersion,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
};

use crate::radtunnel::tunnel::transport::{ALPN, TlsDialOptions, TlsListenOptions};

const TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// QUIC mandates TLS 1.3; TLS over TCP also accepts 1.2.
fn versions(quic: bool) -> &'static [&'static SupportedProtocolVersion] {
    if quic { TLS13_ONLY } else { rustls::DEFAULT_VERSIONS }
}

pub fn load_or_generate_cert(
    opts: &TlsListenOptions,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    match (&opts.cert_file, &opts.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let certs = load_certs(cert_file)?;
            let key = load_key(key_file)?;
            Ok((certs, key))
        }
        (None, None) => {
            let rcgen::CertifiedKey { cert, signing_key } =
                generate_simple_self_signed(["localhost".to_string()])?;
            tracing::info!("tunnel: no cert_file/key_file configured; using a generated self-signed certificate");
            let cert_der = cert.der().clone();
            let key_der =
                PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
            Ok((vec![cert_der], key_der))
        }
        _ => anyhow::bail!(
            "tunnel: tls requires both cert_file and key_file (or neither to auto-generate)"
        ),
    }
}

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("tls: parse certificates in {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("tls: no certificate found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let key = rustls_pemfile::private_key(&mut rd)?;
    let Some(k) = key else {
        anyhow::bail!("tls: no private key found in {}", path.display());
    };
    Ok(k)
}

pub fn server_config(opts: &TlsListenOptions, quic: bool) -> anyhow::Result<rustls::ServerConfig> {
    let (certs, key) = load_or_generate_cert(opts)?;
    let mut cfg = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(versions(quic))?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    cfg.alpn_protocols = vec![ALPN.to_vec()];
    Ok(cfg)
}

pub fn client_config(opts: &TlsDialOptions, quic: bool) -> anyhow::Result<rustls::ClientConfig> {
    let builder =
        rustls::ClientConfig::builder_with_provider(provider()).with_protocol_versions(versions(quic))?;

    let mut cfg = if opts.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        match &opts.ca_file {
            Some(ca_file) => {
                for cert in load_certs(ca_file)? {
                    roots
                        .add(cert)
                        .with_context(|| format!("tls: add root from {}", ca_file.display()))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    cfg.alpn_protocols = vec![ALPN.to_vec()];
    Ok(cfg)
}

pub fn server_name_str(name: &str) -> &str {
    if name.trim().is_empty() { "localhost" } else { name.trim() }
}

pub fn server_name(name: &str) -> anyhow::Result<ServerName<'static>> {
    let name = server_name_str(name);
    ServerName::try_from(name.to_string())
        .with_context(|| format!("tls: invalid server name {name:?}"))
}

/// Certificate verifier that treats any certificate as valid.
///
/// NOTE: vulnerable to MITM. Only enabled by `insecure_skip_verify`.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_configured_cert_is_rejected() {
        let opts = TlsListenOptions {
            cert_file: Some("cert.pem".into()),
            key_file: None,
        };
        let err = load_or_generate_cert(&opts).unwrap_err();
        assert!(err.to_string().contains("both cert_file and key_file"));
    }

    #[test]
    fn generated_cert_builds_server_and_client_configs() {
        let cfg = server_config(&TlsListenOptions::default(), true).unwrap();
        assert_eq!(cfg.alpn_protocols, vec![ALPN.to_vec()]);

        let insecure = TlsDialOptions {
            insecure_skip_verify: true,
            ..Default::default()
        };
        assert!(client_config(&insecure, true).is_ok());
        assert!(client_config(&TlsDialOptions::default(), false).is_ok());
    }

    #[test]
    fn server_name_defaults_to_localhost() {
        assert_eq!(server_name("  ").unwrap(), ServerName::try_from("localhost").unwrap());
        assert!(server_name("127.0.0.1").is_ok());
    }
}
