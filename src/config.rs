use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// Process settings, read once from `BERTH_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub admin_user: String,
    pub admin_password: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            admin_user: "admin".into(),
            admin_password: "berth".into(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparsable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "BERTH_PORT").unwrap_or(defaults.port),
            bind: lookup("BERTH_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("BERTH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parsed(&lookup, "BERTH_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "BERTH_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "BERTH_METRICS_PORT"),
            tls_cert: lookup("BERTH_TLS_CERT"),
            tls_key: lookup("BERTH_TLS_KEY"),
            admin_user: lookup("BERTH_ADMIN_USER").unwrap_or(defaults.admin_user),
            admin_password: lookup("BERTH_ADMIN_PASSWORD").unwrap_or(defaults.admin_password),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("berth.wal")
    }

    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref())
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both BERTH_TLS_CERT and BERTH_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = config_from(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.wal_path(), PathBuf::from("./data/berth.wal"));
    }

    #[test]
    fn values_are_read_from_environment() {
        let config = config_from(&[
            ("BERTH_PORT", "6000"),
            ("BERTH_BIND", "127.0.0.1"),
            ("BERTH_DATA_DIR", "/var/lib/berth"),
            ("BERTH_MAX_CONNECTIONS", "8"),
            ("BERTH_COMPACT_THRESHOLD", "50"),
            ("BERTH_METRICS_PORT", "9100"),
            ("BERTH_ADMIN_USER", "root"),
            ("BERTH_ADMIN_PASSWORD", "s3cret"),
        ]);
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/berth/berth.wal"));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.admin_user, "root");
        assert_eq!(config.admin_password, "s3cret");
    }

    #[test]
    fn unparsable_numbers_fall_back() {
        let config = config_from(&[
            ("BERTH_PORT", "not-a-port"),
            ("BERTH_MAX_CONNECTIONS", "-3"),
            ("BERTH_METRICS_PORT", "99999"),
        ]);
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.metrics_port, None);
    }

    fn tls_error(result: io::Result<Option<TlsAcceptor>>) -> io::Error {
        match result {
            Err(e) => e,
            Ok(_) => panic!("expected TLS setup to fail"),
        }
    }

    #[test]
    fn tls_requires_both_paths() {
        assert!(load_tls_acceptor(None, None).unwrap().is_none());
        let err = tls_error(load_tls_acceptor(Some("cert.pem"), None));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = tls_error(config_from(&[("BERTH_TLS_KEY", "key.pem")]).tls_acceptor());
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn tls_missing_files_error() {
        let err = tls_error(load_tls_acceptor(
            Some("/nonexistent/cert.pem"),
            Some("/nonexistent/key.pem"),
        ));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
