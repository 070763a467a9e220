use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

/// How long a freshly minted certificate stays valid.
const LEAF_VALIDITY: Duration = Duration::days(7);

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("invalid certificate or key: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("no private key found in {0}")]
    MissingKey(String),
}

/// Key material for the TLS listener, in both DER (for rustls) and PEM
/// (for persistence) forms.
pub struct LeafIdentity {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
}

/// Mint a self-signed ECDSA P-256 leaf certificate for `hostname`.
///
/// Validity starts now and lasts a week; the serial number is the current
/// time in nanoseconds, so restarts produce distinct certificates. The key
/// usages cover what a TLS server needs and nothing more.
pub fn self_signed(hostname: &str) -> Result<LeafIdentity, TlsError> {
    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

    let now = OffsetDateTime::now_utc();
    let mut params = CertificateParams::new(vec![hostname.to_string()])?;
    params.serial_number = Some(SerialNumber::from(now.unix_timestamp_nanos() as u64));
    params.not_before = now;
    params.not_after = now + LEAF_VALIDITY;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Self-signed");
    params.distinguished_name = dn;

    let cert = params.self_signed(&key)?;
    Ok(LeafIdentity {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        cert_der: cert.der().clone(),
        key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
    })
}

/// Write the minted pair next to the working directory, where operators (and
/// clients that want to pin the certificate) expect to find it.
pub fn persist(leaf: &LeafIdentity) -> Result<(), TlsError> {
    fs::write("privkey.pem", leaf.key_pem.as_bytes())?;
    fs::write("cert.pem", leaf.cert_pem.as_bytes())?;
    Ok(())
}

/// Load an externally supplied certificate chain and private key.
pub fn load_identity(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let mut cert_reader = BufReader::new(fs::File::open(cert_path)?);
    let chain = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;

    let mut key_reader = BufReader::new(fs::File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| TlsError::MissingKey(key_path.display().to_string()))?;

    Ok((chain, key))
}

/// Build the rustls server configuration for the TLS listener, advertising
/// HTTP/2 and HTTP/1.1 via ALPN.
pub fn server_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_identity_has_pem_forms() {
        let leaf = self_signed("proxy.example.com").unwrap();
        assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(leaf.key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(!leaf.cert_der.is_empty());
    }

    #[test]
    fn minted_identity_builds_a_server_config() {
        let leaf = self_signed("proxy.example.com").unwrap();
        let config = server_config(vec![leaf.cert_der.clone()], leaf.key_der).unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn consecutive_mints_produce_distinct_certificates() {
        let first = self_signed("proxy.example.com").unwrap();
        let second = self_signed("proxy.example.com").unwrap();
        assert_ne!(first.cert_der, second.cert_der);
    }
}
