// Throwaway PKI and rustls server configs for TLS tests.
use anyhow::{Context, Result, anyhow};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType,
};
use rcgen::string::Ia5String;
use rustls::RootCertStore;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Once};

static INIT_CRYPTO: Once = Once::new();

/// Install the ring provider for rustls once per process.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// A CA plus server and client leaf certificates, all PEM encoded.
///
/// The server certificate is valid for `localhost` and `127.0.0.1`.
#[derive(Clone)]
pub struct TestPki {
    pub ca_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
}

impl TestPki {
    pub fn generate() -> Result<Self> {
        let mut ca_params = CertificateParams::default();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "tern test ca");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_key = KeyPair::generate().context("generate ca key")?;
        let ca_cert = ca_params.self_signed(&ca_key).context("self-sign ca")?;
        let ca_pem = ca_cert.pem();
        let issuer = Issuer::new(ca_params, ca_key);

        let mut server_params = CertificateParams::default();
        server_params.subject_alt_names = vec![
            SanType::DnsName(Ia5String::try_from("localhost").context("dns san")?),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ];
        server_params
            .distinguished_name
            .push(DnType::CommonName, "tern test server");
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_key = KeyPair::generate().context("generate server key")?;
        let server_cert = server_params
            .signed_by(&server_key, &issuer)
            .context("sign server cert")?;

        let mut client_params = CertificateParams::new(vec!["tern-client".to_string()])
            .context("client cert params")?;
        client_params
            .distinguished_name
            .push(DnType::CommonName, "tern test client");
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client_key = KeyPair::generate().context("generate client key")?;
        let client_cert = client_params
            .signed_by(&client_key, &issuer)
            .context("sign client cert")?;

        Ok(Self {
            ca_pem,
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
            client_cert_pem: client_cert.pem(),
            client_key_pem: client_key.serialize_pem(),
        })
    }

    /// Server identity without client authentication.
    pub fn server_tls(&self) -> ServerTls {
        ServerTls {
            cert_pem: self.server_cert_pem.clone(),
            key_pem: self.server_key_pem.clone(),
            client_ca_pem: None,
        }
    }

    /// Server identity that demands a client certificate signed by this CA.
    pub fn server_tls_verify(&self) -> ServerTls {
        ServerTls {
            client_ca_pem: Some(self.ca_pem.clone()),
            ..self.server_tls()
        }
    }
}

/// TLS settings for the mock server.
#[derive(Clone)]
pub struct ServerTls {
    pub cert_pem: String,
    pub key_pem: String,
    /// `Some` requires client certificates and advertises `tls_verify`.
    pub client_ca_pem: Option<String>,
}

impl ServerTls {
    pub fn requires_client_cert(&self) -> bool {
        self.client_ca_pem.is_some()
    }

    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        init_crypto();
        let certs = parse_certs(&self.cert_pem)?;
        let key = PrivateKeyDer::from_pem_slice(self.key_pem.as_bytes())
            .map_err(|err| anyhow!("parse server key: {err:?}"))?;
        let builder = rustls::ServerConfig::builder();
        let builder = match &self.client_ca_pem {
            Some(ca_pem) => {
                let mut roots = RootCertStore::empty();
                for cert in parse_certs(ca_pem)? {
                    roots.add(cert).context("add client ca")?;
                }
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .context("build client verifier")?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };
        let config = builder
            .with_single_cert(certs, key)
            .context("server certificate")?;
        Ok(Arc::new(config))
    }
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| anyhow!("parse certificate pem: {err:?}"))
}
