//! Identity material and certificate renewal.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::SigningKey;

use crate::authority::CertificateAuthority;
use crate::cert::{
    CertKeyPair, Certificate, CertificateSigningRequest, TAG_BOOTSTRAP, TAG_LAUNCH_REQUEST,
};
use crate::error::{TrustError, TrustResult};
use crate::keys::{decode_signing_key, AuthorityKeys};

/// How this process proves who it is to the authority.
#[derive(Debug, Clone)]
pub enum Identity {
    /// Certificate issued by the authority (or a cert-granting bootstrap
    /// certificate) with its private key.
    Certificate(CertKeyPair),
    /// Key enrolled with the authority out of band.
    Static {
        entity_name: String,
        key: SigningKey,
    },
}

impl Identity {
    pub fn entity_name(&self) -> &str {
        match self {
            Self::Certificate(pair) => &pair.certificate.entity_name,
            Self::Static { entity_name, .. } => entity_name,
        }
    }

    /// Load a certificate (JSON) and its private key (base64 PKCS#8 DER).
    pub fn from_files(certificate: &Path, private_key: &Path) -> TrustResult<Self> {
        let cert_json = std::fs::read(certificate).map_err(|e| TrustError::Io {
            message: format!("failed to read {}: {}", certificate.display(), e),
        })?;
        let cert: Certificate = serde_json::from_slice(&cert_json)?;

        let key_text = std::fs::read_to_string(private_key).map_err(|e| TrustError::Io {
            message: format!("failed to read {}: {}", private_key.display(), e),
        })?;
        let key_der = BASE64
            .decode(key_text.trim())
            .map_err(|e| TrustError::Signature {
                message: format!("invalid base64 private key: {}", e),
            })?;
        let key = decode_signing_key(&key_der)?;

        if cert.public_key()? != key.verifying_key() {
            return Err(TrustError::config(format!(
                "private key in {} does not match certificate for {}",
                private_key.display(),
                cert.entity_name
            )));
        }
        Ok(Self::Certificate(CertKeyPair::new(cert, key)))
    }

    /// Load from the files named by `TESSERA_CERTIFICATE` and
    /// `TESSERA_PRIVATE_KEY`. `Ok(None)` when neither is set.
    pub fn from_env() -> TrustResult<Option<Self>> {
        let cert = std::env::var("TESSERA_CERTIFICATE").ok().filter(|v| !v.is_empty());
        let key = std::env::var("TESSERA_PRIVATE_KEY").ok().filter(|v| !v.is_empty());

        match (cert, key) {
            (Some(cert), Some(key)) => Self::from_files(Path::new(&cert), Path::new(&key)).map(Some),
            (None, None) => Ok(None),
            _ => Err(TrustError::config(
                "TESSERA_CERTIFICATE and TESSERA_PRIVATE_KEY must be set together",
            )),
        }
    }
}

/// Obtain a new certificate and key from the authority, proving possession
/// of `current`.
///
/// A cert-granting certificate is exchanged for a regular one: the
/// bootstrap tags are dropped and its launch request is forwarded.
pub async fn renew_certificate(
    authority: &dyn CertificateAuthority,
    keys: &AuthorityKeys,
    current: &CertKeyPair,
) -> TrustResult<CertKeyPair> {
    let old = &current.certificate;
    let mut tags = old.tags.clone();
    let launch_request = if old.is_cert_granting() {
        tags.remove(TAG_BOOTSTRAP);
        tags.remove(TAG_LAUNCH_REQUEST)
    } else {
        None
    };

    let (candidate, key) = Certificate::generate(&old.entity_name, old.entity_type, &old.host, tags)?;
    let csr = CertificateSigningRequest::new(candidate.clone(), old.clone(), &current.key, launch_request)?;
    let signed = authority.certificate_sign(&csr).await?;

    if signed.key != candidate.key {
        return Err(TrustError::Signature {
            message: "authority signed a different key".to_string(),
        });
    }
    signed.check(keys)?;

    Ok(CertKeyPair::new(signed, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::EntityType;
    use crate::keys::encode_signing_key;
    use crate::test_support::FakeAuthority;
    use serial_test::serial;
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    fn write_identity(dir: &Path, pair: &CertKeyPair) -> (std::path::PathBuf, std::path::PathBuf) {
        let cert_path = dir.join("cert.json");
        let key_path = dir.join("key.b64");
        std::fs::write(&cert_path, serde_json::to_vec(&pair.certificate).unwrap()).unwrap();
        std::fs::write(&key_path, BASE64.encode(encode_signing_key(&pair.key).unwrap())).unwrap();
        (cert_path, key_path)
    }

    fn bootstrap_pair(authority: &FakeAuthority) -> CertKeyPair {
        let tags = BTreeMap::from([
            (TAG_LAUNCH_REQUEST.to_string(), "launch-proof".to_string()),
            (TAG_BOOTSTRAP.to_string(), "1".to_string()),
            ("TaskID".to_string(), "task-7".to_string()),
        ]);
        let (mut cert, key) = Certificate::generate("bob", EntityType::Service, "h", tags).unwrap();
        cert.sign(&authority.key).unwrap();
        CertKeyPair::new(cert, key)
    }

    #[test]
    fn test_from_files() {
        let authority = FakeAuthority::new();
        let pair = bootstrap_pair(&authority);
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_identity(dir.path(), &pair);

        let identity = Identity::from_files(&cert_path, &key_path).unwrap();
        assert_eq!(identity.entity_name(), "bob");
    }

    #[test]
    fn test_from_files_rejects_mismatched_key() {
        let authority = FakeAuthority::new();
        let pair = bootstrap_pair(&authority);
        let other = bootstrap_pair(&authority);
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, _) = write_identity(dir.path(), &pair);
        let other_dir = tempfile::tempdir().unwrap();
        let (_, other_key) = write_identity(other_dir.path(), &other);

        assert!(matches!(
            Identity::from_files(&cert_path, &other_key),
            Err(TrustError::Config { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::remove_var("TESSERA_CERTIFICATE");
        std::env::remove_var("TESSERA_PRIVATE_KEY");
        assert!(Identity::from_env().unwrap().is_none());

        std::env::set_var("TESSERA_CERTIFICATE", "/nonexistent/cert.json");
        assert!(Identity::from_env().is_err());

        let authority = FakeAuthority::new();
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_identity(dir.path(), &bootstrap_pair(&authority));
        std::env::set_var("TESSERA_CERTIFICATE", &cert_path);
        std::env::set_var("TESSERA_PRIVATE_KEY", &key_path);
        assert!(Identity::from_env().unwrap().is_some());

        std::env::remove_var("TESSERA_CERTIFICATE");
        std::env::remove_var("TESSERA_PRIVATE_KEY");
    }

    #[tokio::test]
    async fn test_renew_upgrades_cert_granting() {
        let authority = FakeAuthority::new();
        let pair = bootstrap_pair(&authority);

        let renewed = renew_certificate(&*authority, &authority.keys, &pair)
            .await
            .unwrap();
        assert!(!renewed.certificate.is_cert_granting());
        assert_eq!(renewed.certificate.tags.get("TaskID").unwrap(), "task-7");
        assert_eq!(
            authority.last_launch_request().as_deref(),
            Some("launch-proof")
        );
        renewed.certificate.check(&authority.keys).unwrap();
    }

    #[tokio::test]
    async fn test_renew_propagates_authority_failure() {
        let authority = FakeAuthority::new();
        authority.fail_certs.store(true, Ordering::SeqCst);
        let pair = bootstrap_pair(&authority);
        assert!(matches!(
            renew_certificate(&*authority, &authority.keys, &pair).await,
            Err(TrustError::AuthorityUnavailable { .. })
        ));
    }
}
