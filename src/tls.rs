//! TLS material for the daemon and trust-on-first-use pinning for the client
//!
//! The server loads a PEM cert/key pair, generating a self-signed pair on
//! first run when none is supplied. The client does not use a CA: it pins
//! the SHA-256 fingerprint of the first certificate a host presents in a
//! known_hosts file and refuses the connection if it later changes.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};

pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STASH_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Stash");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("stash");
    }
    PathBuf::from(".stash")
}

fn default_cert_paths() -> (PathBuf, PathBuf) {
    let dir = config_dir();
    (dir.join("cert.pem"), dir.join("key.pem"))
}

pub fn known_hosts_path() -> PathBuf {
    config_dir().join("known_hosts")
}

/// Loads the server certificate and key, generating and persisting a
/// self-signed pair first when neither file exists yet.
pub fn server_config(
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<rustls::ServerConfig> {
    let (cert_path, key_path) = match (cert, key) {
        (Some(c), Some(k)) => (c, k),
        (None, None) => default_cert_paths(),
        _ => return Err(anyhow!("--tls-cert and --tls-key must be given together")),
    };

    if !cert_path.exists() || !key_path.exists() {
        generate_self_signed(&cert_path, &key_path)?;
    }

    let certs = {
        let mut rd = BufReader::new(fs::File::open(&cert_path).context("open cert")?);
        let mut out = Vec::new();
        for c in rustls_pemfile::certs(&mut rd) {
            out.push(c.context("read cert")?);
        }
        if out.is_empty() {
            return Err(anyhow!("no certificates in {}", cert_path.display()));
        }
        out
    };
    let key = load_private_key(&key_path)?;

    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server tls config")?;
    Ok(cfg)
}

fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<()> {
    if let Some(dir) = cert_path.parent() {
        fs::create_dir_all(dir).context("create cert dir")?;
    }
    let cert = rcgen::generate_simple_self_signed(vec![
        "stashd.local".to_string(),
        "localhost".to_string(),
    ])
    .context("generate self-signed cert")?;
    fs::write(cert_path, cert.serialize_pem().context("serialize cert")?)
        .context("write cert pem")?;
    fs::write(key_path, cert.serialize_private_key_pem()).context("write key pem")?;
    eprintln!(
        "stashd: generated self-signed certificate at {}",
        cert_path.display()
    );
    Ok(())
}

fn load_private_key(key_path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut rd = BufReader::new(fs::File::open(key_path).context("open key")?);
    if let Some(k) = rustls_pemfile::pkcs8_private_keys(&mut rd).next() {
        return Ok(PrivateKeyDer::from(k.context("pkcs8 key")?));
    }
    let mut rd = BufReader::new(fs::File::open(key_path).context("reopen key")?);
    let k = rustls_pemfile::rsa_private_keys(&mut rd)
        .next()
        .context("no usable private key found")?
        .context("rsa key")?;
    Ok(PrivateKeyDer::from(k))
}

fn read_known_hosts(path: &Path) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Ok(f) = fs::File::open(path) {
        for line in BufReader::new(f).lines().map_while(|l| l.ok()) {
            if line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }
    map
}

fn write_known_hosts(path: &Path, map: &HashMap<String, String>) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).context("create known_hosts dir")?;
    }

    // Temp file + rename so a concurrent reader never sees a torn file
    let temp_path = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&temp_path).context("create temp known_hosts")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = f.metadata()?.permissions();
            perms.set_mode(0o600);
            f.set_permissions(perms)?;
        }
        writeln!(f, "# stash TOFU known_hosts - format version 1")?;
        for (host, fp) in map.iter() {
            writeln!(f, "{host}={fp}")?;
        }
        f.flush()?;
        f.sync_all()?;
    }
    fs::rename(&temp_path, path).context("replace known_hosts")?;
    Ok(())
}

fn cert_fingerprint(cert: &CertificateDer<'_>) -> String {
    let mut h = Sha256::new();
    h.update(cert.as_ref());
    h.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug)]
struct TofuVerifier {
    hostport: String,
    known_path: PathBuf,
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fp = cert_fingerprint(end_entity);
        let mut map = read_known_hosts(&self.known_path);
        match map.get(&self.hostport) {
            Some(pinned) if pinned == &fp => Ok(ServerCertVerified::assertion()),
            Some(_) => Err(rustls::Error::General(
                "server certificate changed; refusing connection (TOFU)".into(),
            )),
            None => {
                map.insert(self.hostport.clone(), fp);
                if let Err(e) = write_known_hosts(&self.known_path, &map) {
                    eprintln!("stash: could not record host fingerprint: {e:#}");
                }
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}

/// Client config that pins by fingerprint instead of chain-validating.
pub fn client_config_tofu(host: &str, port: u16, known_path: PathBuf) -> rustls::ClientConfig {
    let verifier = TofuVerifier {
        hostport: format!("{host}:{port}"),
        known_path,
    };
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth()
}

pub fn server_name_for(host: &str) -> ServerName<'static> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        ServerName::IpAddress(ip.into())
    } else {
        ServerName::try_from(host.to_string())
            .unwrap_or_else(|_| ServerName::try_from("localhost".to_string()).unwrap())
    }
}
