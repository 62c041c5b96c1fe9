//! Server settings, read once from `TZLEDGER_*` environment variables.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "tzledger".into(),
            max_connections: 256,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: Option<String>) -> io::Result<Option<T>> {
    match raw {
        None => Ok(None),
        Some(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, format!("{name}: cannot parse {s:?}"))),
    }
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let defaults = Self::default();
        let tls_cert = lookup("TZLEDGER_TLS_CERT").map(PathBuf::from);
        let tls_key = lookup("TZLEDGER_TLS_KEY").map(PathBuf::from);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both TZLEDGER_TLS_CERT and TZLEDGER_TLS_KEY must be set, or neither",
            ));
        }

        let max_connections =
            parse_var("TZLEDGER_MAX_CONNECTIONS", lookup("TZLEDGER_MAX_CONNECTIONS"))?.unwrap_or(defaults.max_connections);
        if max_connections == 0 {
            return Err(io::Error::new(ErrorKind::InvalidInput, "TZLEDGER_MAX_CONNECTIONS must be positive"));
        }

        Ok(Self {
            bind: lookup("TZLEDGER_BIND").unwrap_or(defaults.bind),
            port: parse_var("TZLEDGER_PORT", lookup("TZLEDGER_PORT"))?.unwrap_or(defaults.port),
            data_dir: lookup("TZLEDGER_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("TZLEDGER_PASSWORD").unwrap_or(defaults.password),
            max_connections,
            metrics_port: parse_var("TZLEDGER_METRICS_PORT", lookup("TZLEDGER_METRICS_PORT"))?,
            tls_cert,
            tls_key,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Load the certificate chain and key, if TLS is configured.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?)).collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}
