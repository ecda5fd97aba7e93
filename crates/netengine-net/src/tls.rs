//! TLS setup for both transport roles.
//!
//! Certificates and keys are read from PEM files. Giving the server a CA
//! bundle turns on mandatory mutual authentication; giving the client a
//! certificate and key lets it present one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Errors raised while building a TLS configuration.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// A PEM file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A PEM file did not contain what it should.
    #[error("invalid PEM in {}: {reason}", path.display())]
    Pem { path: PathBuf, reason: String },

    /// The name the client verifies the server against is not valid.
    #[error("invalid server name: {0}")]
    ServerName(String),

    /// rustls refused the assembled configuration.
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),

    /// The client certificate verifier could not be built.
    #[error("client verifier error: {0}")]
    Verifier(String),
}

/// Server-side TLS material.
#[derive(Debug, Clone)]
pub struct ServerTlsSettings {
    /// PEM certificate chain presented to clients.
    pub cert_path: PathBuf,
    /// PEM private key matching `cert_path`.
    pub key_path: PathBuf,
    /// PEM CA bundle; when set, clients must present a certificate it signed.
    pub client_ca_path: Option<PathBuf>,
}

/// Client-side TLS material.
#[derive(Debug, Clone)]
pub struct ClientTlsSettings {
    /// PEM CA bundle used to verify the server.
    pub ca_path: PathBuf,
    /// DNS name expected in the server certificate.
    pub server_name: String,
    /// Optional PEM certificate + key pair for mutual authentication.
    pub identity: Option<(PathBuf, PathBuf)>,
}

/// A ready-to-use server TLS acceptor plus whether it demands client certs.
#[derive(Clone)]
pub struct ServerTls {
    pub acceptor: TlsAcceptor,
    pub mutual: bool,
}

/// A ready-to-use client TLS connector plus the name it verifies.
#[derive(Clone)]
pub struct ClientTls {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read_pem(path)?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Pem {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TlsError::Pem {
            path: path.to_path_buf(),
            reason: "no certificates found".into(),
        });
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_pem(path)?;
    PrivateKeyDer::from_pem_slice(&pem).map_err(|e| TlsError::Pem {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

impl ServerTlsSettings {
    /// Load the PEM files and build an acceptor.
    pub fn build(&self) -> Result<ServerTls, TlsError> {
        let provider = provider();
        let certs = load_certs(&self.cert_path)?;
        let key = load_key(&self.key_path)?;

        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;

        let config = match &self.client_ca_path {
            Some(ca_path) => {
                let roots = Arc::new(load_roots(ca_path)?);
                let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider)
                    .build()
                    .map_err(|e| TlsError::Verifier(e.to_string()))?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)?
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key)?,
        };

        Ok(ServerTls {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            mutual: self.client_ca_path.is_some(),
        })
    }
}

impl ClientTlsSettings {
    /// Load the PEM files and build a connector.
    pub fn build(&self) -> Result<ClientTls, TlsError> {
        let roots = load_roots(&self.ca_path)?;
        let builder = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);

        let config = match &self.identity {
            Some((cert_path, key_path)) => {
                builder.with_client_auth_cert(load_certs(cert_path)?, load_key(key_path)?)?
            }
            None => builder.with_no_client_auth(),
        };

        let server_name = ServerName::try_from(self.server_name.clone())
            .map_err(|e| TlsError::ServerName(e.to_string()))?;

        Ok(ClientTls {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

/// Throwaway PKI for the TLS tests.
#[cfg(test)]
pub(crate) mod test_certs {
    use std::path::{Path, PathBuf};

    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, SanType};

    /// Paths of a CA plus one leaf certificate it signed.
    pub struct TestPki {
        pub ca_cert: PathBuf,
        pub leaf_cert: PathBuf,
        pub leaf_key: PathBuf,
    }

    /// Write a CA and a `localhost` leaf certificate into `dir`.
    pub fn write_test_pki(dir: &Path) -> TestPki {
        let mut ca_params = CertificateParams::default();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "NetEngine Test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let mut leaf_params = CertificateParams::default();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "localhost");
        leaf_params.subject_alt_names = vec![SanType::DnsName("localhost".try_into().unwrap())];
        let leaf_key = KeyPair::generate().unwrap();
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        let pki = TestPki {
            ca_cert: dir.join("ca.pem"),
            leaf_cert: dir.join("leaf.pem"),
            leaf_key: dir.join("leaf.key"),
        };
        std::fs::write(&pki.ca_cert, ca_cert.pem()).unwrap();
        std::fs::write(&pki.leaf_cert, leaf_cert.pem()).unwrap();
        std::fs::write(&pki.leaf_key, leaf_key.serialize_pem()).unwrap();
        pki
    }
}

#[cfg(test)]
mod tests {
    use super::test_certs::write_test_pki;
    use super::*;

    #[test]
    fn test_server_and_client_configs_build() {
        let dir = tempfile::tempdir().unwrap();
        let pki = write_test_pki(dir.path());

        let server = ServerTlsSettings {
            cert_path: pki.leaf_cert.clone(),
            key_path: pki.leaf_key.clone(),
            client_ca_path: None,
        }
        .build()
        .unwrap();
        assert!(!server.mutual);

        let client = ClientTlsSettings {
            ca_path: pki.ca_cert.clone(),
            server_name: "localhost".into(),
            identity: None,
        }
        .build();
        assert!(client.is_ok());
    }

    #[test]
    fn test_client_ca_enables_mutual_auth() {
        let dir = tempfile::tempdir().unwrap();
        let pki = write_test_pki(dir.path());

        let server = ServerTlsSettings {
            cert_path: pki.leaf_cert,
            key_path: pki.leaf_key,
            client_ca_path: Some(pki.ca_cert),
        }
        .build()
        .unwrap();
        assert!(server.mutual);
    }

    #[test]
    fn test_missing_file_reported_with_path() {
        let settings = ServerTlsSettings {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
            client_ca_path: None,
        };
        match settings.build() {
            Err(TlsError::Read { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/cert.pem"))
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn test_empty_pem_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "").unwrap();

        let settings = ClientTlsSettings {
            ca_path: empty,
            server_name: "localhost".into(),
            identity: None,
        };
        assert!(matches!(settings.build(), Err(TlsError::Pem { .. })));
    }
}
