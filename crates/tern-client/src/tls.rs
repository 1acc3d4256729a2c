// TLS upgrade: rustls client config, PEM loading, and a verifier that can
// record (instead of reject) an unverifiable server certificate.
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::warn;

use crate::config::TlsOptions;
use crate::error::{Error, TlsError};

static INIT_CRYPTO: Once = Once::new();

/// Install the ring provider as the process default once.
pub fn install_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        // Another component may have installed one already.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Result of a completed upgrade.
pub(crate) struct Upgraded {
    pub(crate) stream: TlsStream<TcpStream>,
    pub(crate) authorized: bool,
}

pub(crate) async fn upgrade(
    options: &TlsOptions,
    host: &str,
    tcp: TcpStream,
) -> Result<Upgraded, TlsError> {
    let authorized = Arc::new(AtomicBool::new(false));
    let connector = connector(options, Arc::clone(&authorized))?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|err| TlsError::Config(format!("invalid server name {host:?}: {err}")))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(classify_handshake_error)?;
    Ok(Upgraded {
        stream,
        authorized: authorized.load(Ordering::Acquire),
    })
}

fn connector(options: &TlsOptions, authorized: Arc<AtomicBool>) -> Result<TlsConnector, TlsError> {
    install_crypto_provider();
    let roots = load_roots(options.ca_pem.as_deref())?;
    let inner = if roots.is_empty() {
        None
    } else {
        Some(
            WebPkiServerVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|err| TlsError::Config(err.to_string()))?,
        )
    };
    let verifier = RecordingVerifier {
        inner,
        reject_unauthorized: options.reject_unauthorized,
        authorized,
        algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
    };
    let builder = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier));
    let config = match (&options.cert_pem, &options.key_pem) {
        (Some(cert_pem), Some(key_pem)) => {
            let certs = load_certs(cert_pem)?;
            let key = PrivateKeyDer::from_pem_slice(key_pem)
                .map_err(|err| TlsError::Config(format!("parse client key: {err:?}")))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|err| TlsError::Config(err.to_string()))?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TlsError::Config(format!("parse certificate pem: {err:?}")))?;
    if certs.is_empty() {
        return Err(TlsError::Config("no certificates found in pem".to_string()));
    }
    Ok(certs)
}

/// Trust anchors for server verification. A configured CA bundle replaces
/// the bundled public roots rather than extending them.
fn load_roots(ca_pem: Option<&[u8]>) -> Result<RootCertStore, TlsError> {
    let Some(pem) = ca_pem else {
        return Ok(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        });
    };
    let mut roots = RootCertStore::empty();
    for cert in load_certs(pem)? {
        roots
            .add(cert)
            .map_err(|err| TlsError::Config(format!("add ca certificate: {err}")))?;
    }
    Ok(roots)
}

fn classify_handshake_error(err: io::Error) -> TlsError {
    let inner = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());
    match inner {
        Some(rustls::Error::InvalidCertificate(cert_err)) => {
            TlsError::Verification(describe_certificate_error(cert_err))
        }
        Some(other) => TlsError::Handshake(other.to_string()),
        None => TlsError::Handshake(err.to_string()),
    }
}

/// I/O errors after the upgrade that actually carry a TLS alert, such as a
/// server rejecting the client certificate under TLS 1.3.
pub(crate) fn handshake_io_error(err: io::Error) -> Error {
    let is_tls = err
        .get_ref()
        .is_some_and(|inner| inner.is::<rustls::Error>());
    if is_tls {
        Error::Tls(classify_handshake_error(err))
    } else {
        Error::Connection(err)
    }
}

fn describe_certificate_error(err: &CertificateError) -> String {
    match err {
        CertificateError::UnknownIssuer => "unable to verify the first certificate".to_string(),
        other => format!("{other:?}"),
    }
}

/// Delegates to webpki, and when `reject_unauthorized` is off records the
/// failure in `authorized` and lets the handshake continue.
#[derive(Debug)]
struct RecordingVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    reject_unauthorized: bool,
    authorized: Arc<AtomicBool>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let result = match &self.inner {
            Some(inner) => inner.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ),
            None => Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer,
            )),
        };
        match result {
            Ok(verified) => {
                self.authorized.store(true, Ordering::Release);
                Ok(verified)
            }
            Err(err) if !self.reject_unauthorized => {
                warn!(error = %err, server = ?server_name, "accepting unverified server certificate");
                self.authorized.store(false, Ordering::Release);
                Ok(ServerCertVerified::assertion())
            }
            Err(err) => Err(err),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ca_falls_back_to_bundled_roots() {
        let roots = load_roots(None).expect("roots");
        assert_eq!(roots.len(), webpki_roots::TLS_SERVER_ROOTS.len());
        assert!(!roots.is_empty());
    }

    #[test]
    fn garbage_pem_is_a_config_error() {
        assert!(matches!(
            load_certs(b"not a pem"),
            Err(TlsError::Config(_))
        ));
    }

    #[test]
    fn unknown_issuer_maps_to_verification() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer),
        );
        match classify_handshake_error(err) {
            TlsError::Verification(message) => {
                assert_eq!(message, "unable to verify the first certificate")
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
