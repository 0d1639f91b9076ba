use std::path::Path;

use poem::listener::RustlsCertificate;

use crate::CloakwayError;

#[derive(Debug, Clone)]
pub struct TlsCertificateAndPrivateKey {
    certificate: Vec<u8>,
    private_key: Vec<u8>,
}

impl TlsCertificateAndPrivateKey {
    pub async fn from_files<P: AsRef<Path>>(
        certificate_path: P,
        key_path: P,
    ) -> Result<Self, CloakwayError> {
        let certificate = tokio::fs::read(certificate_path).await?;
        let private_key = tokio::fs::read(key_path).await?;
        Self::from_bytes(certificate, private_key)
    }

    pub fn from_bytes(certificate: Vec<u8>, private_key: Vec<u8>) -> Result<Self, CloakwayError> {
        let parsed = rustls_pemfile::certs(&mut &certificate[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(CloakwayError::Io)?;
        if parsed.is_empty() {
            return Err(CloakwayError::NoCertificates);
        }

        if !has_private_key(&private_key) {
            return Err(CloakwayError::NoKeys);
        }

        Ok(Self {
            certificate,
            private_key,
        })
    }

    /// Generates a throwaway self-signed certificate for deployments without
    /// provisioned certificate files.
    pub fn self_signed(common_name: &str) -> Result<Self, CloakwayError> {
        let certified = rcgen::generate_simple_self_signed(vec![common_name.to_owned()])?;
        Ok(Self {
            certificate: certified.cert.pem().into_bytes(),
            private_key: certified.key_pair.serialize_pem().into_bytes(),
        })
    }
}

fn has_private_key(pem: &[u8]) -> bool {
    matches!(
        rustls_pemfile::pkcs8_private_keys(&mut &pem[..]).next(),
        Some(Ok(_))
    ) || matches!(
        rustls_pemfile::ec_private_keys(&mut &pem[..]).next(),
        Some(Ok(_))
    ) || matches!(
        rustls_pemfile::rsa_private_keys(&mut &pem[..]).next(),
        Some(Ok(_))
    )
}

impl From<TlsCertificateAndPrivateKey> for RustlsCertificate {
    fn from(val: TlsCertificateAndPrivateKey) -> Self {
        RustlsCertificate::new()
            .cert(val.certificate)
            .key(val.private_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_roundtrips_through_validation() {
        let generated = TlsCertificateAndPrivateKey::self_signed("front.example.com")
            .expect("self-signed generation");
        TlsCertificateAndPrivateKey::from_bytes(
            generated.certificate.clone(),
            generated.private_key.clone(),
        )
        .expect("generated material parses back");
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        let result =
            TlsCertificateAndPrivateKey::from_bytes(b"not pem".to_vec(), b"not pem".to_vec());
        assert!(matches!(result, Err(CloakwayError::NoCertificates)));
    }
}
