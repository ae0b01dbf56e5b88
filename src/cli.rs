//! Shared CLI helpers and small reusable Clap fragments

use clap::Parser;
use std::path::PathBuf;

use crate::client::Client;
use crate::protocol::Dialect;

/// Common daemon options used by stashd
#[derive(Clone, Debug, Parser)]
pub struct DaemonOpts {
    /// Bind address (host:port); overrides the settings file
    #[arg(long)]
    pub bind: Option<String>,

    /// Storage root directory; overrides the settings file
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Mirror directory for sync jobs; overrides the settings file
    #[arg(long)]
    pub mirror: Option<PathBuf>,

    /// TOML settings file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Wire dialect (http or line); overrides the settings file
    #[arg(long)]
    pub dialect: Option<Dialect>,

    /// Serve TLS; a self-signed certificate is generated when none is given
    #[arg(long)]
    pub tls: bool,

    /// Certificate chain PEM (requires --tls-key)
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Private key PEM (requires --tls-cert)
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Write operation log entries to file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

impl DaemonOpts {
    /// Passing a certificate or key implies TLS.
    pub fn tls_enabled(&self) -> bool {
        self.tls || self.tls_cert.is_some() || self.tls_key.is_some()
    }
}

/// Connection options shared by every stash subcommand
#[derive(Clone, Debug, Parser)]
pub struct ClientOpts {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port
    #[arg(long, default_value_t = 9041)]
    pub port: u16,

    /// Wire dialect (http or line)
    #[arg(long, default_value = "http")]
    pub dialect: Dialect,

    /// Connect over TLS, pinning the server certificate on first use
    #[arg(long)]
    pub tls: bool,
}

impl ClientOpts {
    pub fn client(&self) -> Client {
        Client::new(self.host.clone(), self.port)
            .dialect(self.dialect)
            .with_tls(self.tls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_opts_defaults() {
        let opts = ClientOpts::try_parse_from(["stash"]).unwrap();
        assert_eq!(opts.host, "127.0.0.1");
        assert_eq!(opts.port, 9041);
        assert_eq!(opts.dialect, Dialect::Http);
        assert!(!opts.tls);
    }

    #[test]
    fn test_dialect_flag_rejects_unknown() {
        assert!(ClientOpts::try_parse_from(["stash", "--dialect", "grpc"]).is_err());
        let opts = ClientOpts::try_parse_from(["stash", "--dialect", "line"]).unwrap();
        assert_eq!(opts.dialect, Dialect::Line);
    }

    #[test]
    fn test_cert_flag_implies_tls() {
        let opts =
            DaemonOpts::try_parse_from(["stashd", "--tls-cert", "c.pem", "--tls-key", "k.pem"])
                .unwrap();
        assert!(opts.tls_enabled());
        let plain = DaemonOpts::try_parse_from(["stashd"]).unwrap();
        assert!(!plain.tls_enabled());
    }
}
