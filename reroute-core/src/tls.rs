//! TLS setup for upstream connections and the host listener.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use anyhow::{Context as _, Result};
use hyper_rustls::ConfigBuilderExt as _;
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        self, ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::{CryptoProvider, aws_lc_rs, verify_tls12_signature, verify_tls13_signature},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};
use tracing::debug;

/// Accepts any upstream certificate. Used for rules with `secure: false`.
///
/// Handshake signatures are still checked, only the certificate chain and
/// hostname are not.
#[derive(Debug)]
pub struct NoVerifier(Arc<CryptoProvider>);

impl NoVerifier {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self(provider)
    }
}

impl ServerCertVerifier for NoVerifier {
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
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
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
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Client configuration for upstream connections.
///
/// With `verify` the platform's native roots are trusted, without it any
/// certificate is accepted. ALPN is pinned to `http/1.1` since upstream
/// connections are always HTTP/1.1.
pub fn client_config(verify: bool) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(aws_lc_rs::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?;

    let mut config = if verify {
        builder
            .with_native_roots()
            .context("Failed to load native root certificates")?
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier::new(provider)))
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    debug!("Built upstream TLS config (verify: {})", verify);
    Ok(Arc::new(config))
}

/// Loads a PEM certificate chain and private key into a listener acceptor.
pub fn load_tls_acceptor(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<TlsAcceptor> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let cert_file = File::open(cert_path)
        .with_context(|| format!("Failed to open certificate file {}", cert_path.display()))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<_, _>>()
            .with_context(|| format!("Failed to parse certificate file {}", cert_path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", cert_path.display());
    }

    let key_file = File::open(key_path)
        .with_context(|| format!("Failed to open private key file {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("Failed to parse private key file {}", key_path.display()))?
        .with_context(|| format!("No private key found in {}", key_path.display()))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS configuration")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!("Loaded listener certificate from {}", cert_path.display());
    Ok(TlsAcceptor::from(Arc::new(config)))
}
