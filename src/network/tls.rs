//! Mutual-TLS setup for links. Both sides present a certificate signed by the
//! shared CA and verify the other against it.

use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
    ServerName,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Certificate parsing failed: {0}")]
    CertParse(String),

    #[error("Private key loading failed: {0}")]
    KeyLoad(String),

    #[error("Invalid server name: {0}")]
    ServerName(String),

    #[error("TLS configuration failed: {0}")]
    Config(#[from] rustls::Error),

    #[error("Client verifier creation failed: {0}")]
    Verifier(String),

    #[error("IO error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Paths of the PEM files making up one endpoint's identity.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn read_pem(path: &Path) -> Result<String, TlsError> {
    fs::read_to_string(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_certificate(path: &Path) -> Result<CertificateDer<'static>, TlsError> {
    let pem = read_pem(path)?;
    let (label, der) = pem_rfc7468::decode_vec(pem.as_bytes())
        .map_err(|e| TlsError::CertParse(format!("PEM decode of {:?} failed: {}", path, e)))?;
    if label != "CERTIFICATE" {
        return Err(TlsError::CertParse(format!(
            "{:?} holds a {} block, expected CERTIFICATE",
            path, label
        )));
    }
    Ok(CertificateDer::from(der))
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)
            .map_err(|source| TlsError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .permissions()
            .mode()
            & 0o777;

        if mode & 0o077 != 0 {
            return Err(TlsError::KeyLoad(format!(
                "Private key file {:?} has insecure permissions {:o}. Must be 0600",
                path, mode
            )));
        }
    }

    let pem = read_pem(path)?;
    let (label, der) = pem_rfc7468::decode_vec(pem.as_bytes())
        .map_err(|e| TlsError::KeyLoad(format!("PEM decode of {:?} failed: {}", path, e)))?;

    match label {
        "PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der))),
        "RSA PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(der))),
        "EC PRIVATE KEY" => Ok(PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(der))),
        other => Err(TlsError::KeyLoad(format!(
            "Unsupported key block {} in {:?}",
            other, path
        ))),
    }
}

fn root_store(ca_cert: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    roots
        .add(load_certificate(ca_cert)?)
        .map_err(|e| TlsError::CertParse(format!("Failed to add CA to root store: {}", e)))?;
    Ok(roots)
}

/// Acceptor side: client certificates are mandatory.
pub fn server_config(files: &TlsFiles) -> Result<Arc<ServerConfig>, TlsError> {
    let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(&files.ca_cert)?))
        .build()
        .map_err(|e| TlsError::Verifier(e.to_string()))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            vec![load_certificate(&files.cert)?],
            load_private_key(&files.key)?,
        )?;

    Ok(Arc::new(config))
}

/// Dialer side.
pub fn client_config(files: &TlsFiles) -> Result<Arc<ClientConfig>, TlsError> {
    let config = ClientConfig::builder()
        .with_root_certificates(root_store(&files.ca_cert)?)
        .with_client_auth_cert(
            vec![load_certificate(&files.cert)?],
            load_private_key(&files.key)?,
        )?;

    Ok(Arc::new(config))
}

pub fn server_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(name.to_string()).map_err(|e| TlsError::ServerName(format!("{}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file() {
        let err = load_certificate(Path::new("/nonexistent/ca.pem")).unwrap_err();
        assert!(matches!(err, TlsError::Io { .. }));
    }

    #[test]
    fn test_wrong_pem_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.pem");
        let pem = pem_rfc7468::encode_string(
            "PUBLIC KEY",
            pem_rfc7468::LineEnding::LF,
            &[1, 2, 3, 4],
        )
        .unwrap();
        fs::write(&path, pem).unwrap();

        assert!(matches!(
            load_certificate(&path),
            Err(TlsError::CertParse(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_permissions_enforced() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pem");
        let pem = pem_rfc7468::encode_string(
            "PRIVATE KEY",
            pem_rfc7468::LineEnding::LF,
            &[0u8; 16],
        )
        .unwrap();
        fs::write(&path, pem).unwrap();

        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(load_private_key(&path), Err(TlsError::KeyLoad(_))));

        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        assert!(matches!(
            load_private_key(&path),
            Ok(PrivateKeyDer::Pkcs8(_))
        ));
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("tunnel.example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("bad name!").is_err());
    }
}
