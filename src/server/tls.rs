//! TLS for the HTTP listener.
//!
//! A configured PEM pair wins. Otherwise, with auto-generation on, every
//! start serves a fresh self-signed certificate for the loopback names and
//! the configured host. Peers on loopback accept it without verification.

use crate::config::McpSettings;
use crate::error::ServerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

type KeyPair = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Build the acceptor for `settings`.
pub fn acceptor(settings: &McpSettings) -> Result<TlsAcceptor, ServerError> {
    let (certs, key) = if settings.has_tls_key_pair() {
        load_key_pair(
            Path::new(settings.tls_cert_path.trim()),
            Path::new(settings.tls_key_path.trim()),
        )?
    } else if settings.tls_auto_generate {
        self_signed(&settings.host)?
    } else {
        return Err(ServerError::Tls(
            "no certificate configured and auto-generation is disabled".to_string(),
        ));
    };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &Path) -> Result<BufReader<File>, ServerError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ServerError::Tls(format!("cannot open {}: {e}", path.display())))
}

fn load_key_pair(cert_path: &Path, key_path: &Path) -> Result<KeyPair, ServerError> {
    let certs = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("bad certificate in {}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "no certificate in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|e| ServerError::Tls(format!("bad private key in {}: {e}", key_path.display())))?
        .ok_or_else(|| ServerError::Tls(format!("no private key in {}", key_path.display())))?;
    Ok((certs, key))
}

/// Names the generated certificate is valid for.
fn subject_names(host: &str) -> Vec<String> {
    let mut names: Vec<String> = ["localhost", "127.0.0.1", "::1"]
        .iter()
        .map(|n| n.to_string())
        .collect();
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if !host.is_empty() && !names.iter().any(|n| n.eq_ignore_ascii_case(host)) {
        names.push(host.to_string());
    }
    names
}

fn self_signed(host: &str) -> Result<KeyPair, ServerError> {
    let names = subject_names(host);
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names.clone())
        .map_err(|e| ServerError::Tls(format!("certificate generation failed: {e}")))?;
    info!(names = ?names, "Generated self-signed MCP certificate");
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((vec![cert.der().clone()], key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use uuid::Uuid;

    #[test]
    fn configured_host_is_added_once() {
        assert_eq!(subject_names("127.0.0.1").len(), 3);
        assert_eq!(subject_names("[::1]").len(), 3);
        assert_eq!(subject_names("LOCALHOST").len(), 3);
        assert_eq!(subject_names("mcp.internal").last().map(String::as_str), Some("mcp.internal"));
    }

    #[test]
    fn auto_generated_certificate_builds_an_acceptor() {
        let settings = McpSettings {
            tls_enabled: true,
            ..Default::default()
        };
        assert!(acceptor(&settings).is_ok());
    }

    #[test]
    fn pem_pair_on_disk_is_loaded() {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("generate");
        let dir = std::env::temp_dir();
        let cert_path = dir.join(format!("mcp-cert-{}.pem", Uuid::new_v4()));
        let key_path = dir.join(format!("mcp-key-{}.pem", Uuid::new_v4()));
        std::fs::write(&cert_path, cert.pem()).expect("write cert");
        std::fs::write(&key_path, key_pair.serialize_pem()).expect("write key");

        let settings = McpSettings {
            tls_enabled: true,
            tls_auto_generate: false,
            tls_cert_path: cert_path.display().to_string(),
            tls_key_path: key_path.display().to_string(),
            ..Default::default()
        };
        let result = acceptor(&settings);
        std::fs::remove_file(&cert_path).ok();
        std::fs::remove_file(&key_path).ok();
        assert!(result.is_ok());
    }

    #[test]
    fn missing_material_is_fatal() {
        let settings = McpSettings {
            tls_enabled: true,
            tls_auto_generate: false,
            ..Default::default()
        };
        let err = acceptor(&settings).err().expect("no certificate");
        assert_eq!(FailureKind::classify(&err), FailureKind::Fatal);

        let settings = McpSettings {
            tls_enabled: true,
            tls_cert_path: "/nonexistent/cert.pem".to_string(),
            tls_key_path: "/nonexistent/key.pem".to_string(),
            ..Default::default()
        };
        let err = acceptor(&settings).err().expect("unreadable certificate");
        assert_eq!(FailureKind::classify(&err), FailureKind::Fatal);
    }
}
