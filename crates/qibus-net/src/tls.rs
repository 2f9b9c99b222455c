//! TLS configuration shared by the `tcps://` and `quic://` transports.
//!
//! Clients skip certificate verification (peers on a robot's local bus use
//! self-signed certificates). Servers load a certificate pair from the
//! file named by `QILOOP_CERT_CONF` (two lines: certificate path, key path)
//! or generate a self-signed one.

use std::sync::Arc;

use crate::errors::NetError;

/// ALPN protocol identifier used by the QUIC transport.
pub(crate) const ALPN_PROTOCOL: &[u8] = b"qi-messaging";

/// Environment variable naming the certificate configuration file.
pub(crate) const CERT_CONF_ENV: &str = "QILOOP_CERT_CONF";

/// Client TLS config that accepts any certificate.
pub(crate) fn client_config(alpn: bool) -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
        .with_no_client_auth();
    if alpn {
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    }
    config
}

/// Server TLS config from `QILOOP_CERT_CONF` or a generated self-signed
/// certificate.
pub(crate) fn server_config(alpn: bool) -> Result<rustls::ServerConfig, NetError> {
    let (certs, key) = match std::env::var(CERT_CONF_ENV) {
        Ok(conf_path) => load_cert_conf(&conf_path)?,
        Err(_) => generate_self_signed()?,
    };

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NetError::Tls(format!("invalid certificate: {e}")))?;
    if alpn {
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    }
    Ok(config)
}

type CertPair =
    (Vec<rustls::pki_types::CertificateDer<'static>>, rustls::pki_types::PrivateKeyDer<'static>);

/// Load the two-line certificate configuration file.
fn load_cert_conf(conf_path: &str) -> Result<CertPair, NetError> {
    let conf = std::fs::read_to_string(conf_path)
        .map_err(|e| NetError::Tls(format!("cannot read {conf_path}: {e}")))?;
    let mut lines = conf.lines().map(str::trim).filter(|l| !l.is_empty());
    let (Some(cert_path), Some(key_path)) = (lines.next(), lines.next()) else {
        return Err(NetError::Tls(format!(
            "{conf_path}: expected certificate path and key path lines"
        )));
    };

    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| NetError::Tls(format!("cannot read certificate {cert_path}: {e}")))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| NetError::Tls(format!("cannot read key {key_path}: {e}")))?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| NetError::Tls(format!("cannot parse certificate: {e}")))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| NetError::Tls(format!("cannot parse key: {e}")))?
        .ok_or_else(|| NetError::Tls(format!("no private key found in {key_path}")))?;

    Ok((certs, key))
}

/// Generate a self-signed certificate for `localhost`.
fn generate_self_signed() -> Result<CertPair, NetError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| NetError::Tls(format!("cannot generate certificate: {e}")))?;

    tracing::warn!("no {CERT_CONF_ENV} set, using a self-signed certificate");

    let cert_der = cert.cert.der().clone();
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    Ok((vec![cert_der], key.into()))
}

/// Certificate verifier that accepts any certificate.
#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_server_config_builds() {
        // No QILOOP_CERT_CONF in the test environment.
        let config = server_config(true).unwrap();
        assert_eq!(config.alpn_protocols, vec![ALPN_PROTOCOL.to_vec()]);
    }

    #[test]
    fn client_config_builds() {
        let config = client_config(true);
        assert_eq!(config.alpn_protocols, vec![ALPN_PROTOCOL.to_vec()]);
    }
}
