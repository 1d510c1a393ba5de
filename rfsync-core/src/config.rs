//! YAML service configuration.
//!
//! Relative paths inside the file are resolved against the directory the
//! file lives in, so a config can travel together with its TLS material and
//! password file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Per-subscriber queue depth when the config does not set one.
pub const DEFAULT_BUFFER_SIZE: usize = 25;

const fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

const fn default_true() -> bool {
    true
}

/// Which side of the protocol this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Server,
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(rename = "type")]
    pub service_type: ServiceType,

    /// `host:port` to listen on (server) or dial (client).
    pub address: String,

    /// Watched root (server) or mirror root (client).
    pub path: PathBuf,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub client: ClientSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSection {
    /// Password file; when set every connection must Join first.
    pub pw_file: Option<PathBuf>,
    pub tls: Option<ServerTls>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTls {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSection {
    /// Empty or absent skips the Join handshake.
    pub username: Option<String>,
    pub password: Option<String>,

    /// Pull files that changed while the client was offline before subscribing.
    #[serde(default = "default_true")]
    pub initial_sync: bool,

    #[serde(default)]
    pub tls: ClientTls,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            initial_sync: true,
            tls: ClientTls::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientTls {
    pub enable: bool,
    /// PEM bundle of trust anchors for the server certificate.
    pub ca_file: Option<PathBuf>,
    /// Accept any server certificate (self-signed deployments).
    pub insecure_skip_verify: bool,
    /// Name to verify; defaults to the host part of `address`.
    pub server_name: Option<String>,
}

/// Check if a path is an accessible directory.
fn check_dir(dir: &Path) -> Result<(), &'static str> {
    match dir.metadata() {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err("is not a directory"),
        Err(e) if e.kind() == ErrorKind::NotFound => Err("does not exist"),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => Err("permission denied"),
        Err(_) => Err("is not accessible"),
    }
}

fn check_file(file: &Path) -> Result<(), &'static str> {
    match file.metadata() {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err("is not a file"),
        Err(e) if e.kind() == ErrorKind::NotFound => Err("does not exist"),
        Err(_) => Err("is not accessible"),
    }
}

impl Config {
    /// Read and parse `path`, resolving relative paths against its directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_relative_to(base);
        Ok(config)
    }

    /// Load and validate in one step.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Collect every semantic problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if let Err(e) = check_dir(&self.path) {
            errors.push(format!("path {} {e}", self.path.display()));
        }
        if self.address.rsplit_once(':').is_none() {
            errors.push(format!("address {:?} is not host:port", self.address));
        }
        if self.buffer_size == 0 {
            errors.push("bufferSize must be greater than zero".to_string());
        }

        match self.service_type {
            ServiceType::Server => {
                if let Some(tls) = &self.server.tls {
                    if let Err(e) = check_file(&tls.cert) {
                        errors.push(format!("server.tls.cert {e}"));
                    }
                    if let Err(e) = check_file(&tls.key) {
                        errors.push(format!("server.tls.key {e}"));
                    }
                }
            }
            ServiceType::Client => {
                let tls = &self.client.tls;
                if tls.enable && tls.ca_file.is_none() && !tls.insecure_skip_verify {
                    errors.push(
                        "client.tls requires caFile or insecureSkipVerify".to_string(),
                    );
                }
                if let Some(ca) = &tls.ca_file {
                    if let Err(e) = check_file(ca) {
                        errors.push(format!("client.tls.caFile {e}"));
                    }
                }
                if self.username().is_some() && self.client.password.is_none() {
                    errors.push("client.username is set without client.password".to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Configured username, treating an empty string as absent.
    pub fn username(&self) -> Option<&str> {
        self.client.username.as_deref().filter(|name| !name.is_empty())
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.path);
        if let Some(pw) = self.server.pw_file.as_mut() {
            resolve(pw);
        }
        if let Some(tls) = self.server.tls.as_mut() {
            resolve(&mut tls.cert);
            resolve(&mut tls.key);
        }
        if let Some(ca) = self.client.tls.ca_file.as_mut() {
            resolve(ca);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, yaml: &str) -> PathBuf {
        let path = dir.path().join("config.yml");
        fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn minimal_server_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("share")).unwrap();
        let path = write_config(&dir, "type: server\naddress: 127.0.0.1:9800\npath: share\n");

        let config = Config::load_validated(&path).unwrap();
        assert_eq!(config.service_type, ServiceType::Server);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.path, dir.path().join("share"));
        assert!(config.server.pw_file.is_none());
        assert!(config.client.initial_sync);
    }

    #[test]
    fn client_section_parses_camel_case_keys() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "type: client\naddress: example.org:9800\npath: /tmp\nclient:\n  username: alice\n  password: pw\n  initialSync: false\n  tls:\n    enable: true\n    insecureSkipVerify: true\n",
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.username(), Some("alice"));
        assert!(!config.client.initial_sync);
        assert!(config.client.tls.enable);
        assert!(config.client.tls.insecure_skip_verify);
    }

    #[test]
    fn validation_collects_every_problem() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "type: client\naddress: nowhere\npath: missing\nbufferSize: 0\nclient:\n  username: bob\n  tls:\n    enable: true\n",
        );

        let err = Config::load_validated(&path).unwrap_err();
        let ConfigError::Invalid(problems) = err else {
            panic!("expected validation failure, got {err}");
        };
        assert_eq!(problems.len(), 5, "problems: {problems:?}");
    }

    #[test]
    fn empty_username_counts_as_absent() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "type: client\naddress: h:1\npath: .\nclient:\n  username: \"\"\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.username(), None);
    }

    #[test]
    fn unknown_service_type_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "type: relay\naddress: h:1\npath: .\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }
}
