//! Process settings, built once at startup and shared as `Arc<Settings>`.
//!
//! Settings are read from `tandem.toml` in a directory, then overlaid with
//! `tandem.<mode>.toml` when it exists, then optionally overridden from
//! `TANDEM_*` environment variables:
//!
//! | Variable                     | Field                 |
//! |------------------------------|-----------------------|
//! | `TANDEM_MODE`                | `mode`                |
//! | `TANDEM_BIND_ADDR`           | `bind_addr`           |
//! | `TANDEM_PROTOCOL`            | `protocol`            |
//! | `TANDEM_CORS_WHITELIST`      | `cors_whitelist` (comma-separated) |
//! | `TANDEM_RESPONSE_CHUNK_SIZE` | `response_chunk_size` |
//! | `TANDEM_MAX_REQUEST_SIZE`    | `max_request_size`    |
//! | `TANDEM_AUTH_SCHEME`         | `auth_scheme`         |
//!
//! ```toml
//! bind_addr = "0.0.0.0:8000"
//! protocol = "single_shot"
//! cors_whitelist = ["127.0.0.1", "10.0.0.0"]
//! ```

use std::path::{Path, PathBuf};
use std::{env, fs, io};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::transport::{DEFAULT_CHUNK_SIZE, ProtocolKind};

/// Default cap on a request's head plus body, in bytes.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Errors raised while loading [`Settings`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

/// Everything the server, dispatcher and middleware read from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Free-form deployment mode, such as `dev` or `prod`; selects the
    /// overlay file.
    pub mode: String,
    pub bind_addr: String,
    /// Which transport shape the TCP server adapts connections to.
    pub protocol: ProtocolKind,
    /// Client hosts that receive CORS headers. `*` admits everyone.
    pub cors_whitelist: Vec<String>,
    /// Largest body frame sent per message on a streaming transport.
    pub response_chunk_size: usize,
    pub max_request_size: usize,
    /// Prefix stripped from the `Authorization` header, e.g. `Bearer`.
    pub auth_scheme: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: "dev".to_owned(),
            bind_addr: "127.0.0.1:8080".to_owned(),
            protocol: ProtocolKind::Streaming,
            cors_whitelist: Vec::new(),
            response_chunk_size: DEFAULT_CHUNK_SIZE,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            auth_scheme: "Bearer".to_owned(),
        }
    }
}

impl Settings {
    /// Parses settings from TOML text; absent keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Loads `tandem.toml` and the `tandem.<mode>.toml` overlay from `dir`.
    ///
    /// Keys in the overlay replace keys in the base file. A missing file is
    /// not an error; defaults are used for whatever no file provides.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when a file exists but cannot be read, and
    /// [`ConfigError::Parse`] when it is not valid TOML for [`Settings`].
    pub fn load(dir: impl AsRef<Path>, mode: &str) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let mut table = toml::Table::new();
        for name in ["tandem.toml".to_owned(), format!("tandem.{mode}.toml")] {
            let path = dir.join(name);
            match read_table(&path)? {
                Some(layer) => {
                    info!(path = %path.display(), "loaded settings");
                    table.extend(layer);
                }
                None => warn!(path = %path.display(), "settings file not found, using defaults"),
            }
        }
        table.insert("mode".to_owned(), toml::Value::String(mode.to_owned()));

        let path = dir.join("tandem.toml");
        toml::Value::Table(table)
            .try_into()
            .map_err(|source| ConfigError::Parse { path, source })
    }

    /// Overrides fields from `TANDEM_*` environment variables.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Env`] when a variable is set to an unusable value.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_vars(|name| env::var(name).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(mode) = var("TANDEM_MODE") {
            self.mode = mode;
        }
        if let Some(addr) = var("TANDEM_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(value) = var("TANDEM_PROTOCOL") {
            self.protocol = match value.trim().to_ascii_lowercase().as_str() {
                "streaming" => ProtocolKind::Streaming,
                "single_shot" | "single-shot" => ProtocolKind::SingleShot,
                _ => {
                    return Err(ConfigError::Env {
                        var: "TANDEM_PROTOCOL",
                        value,
                    });
                }
            };
        }
        if let Some(list) = var("TANDEM_CORS_WHITELIST") {
            self.cors_whitelist = list
                .split(',')
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(value) = var("TANDEM_RESPONSE_CHUNK_SIZE") {
            self.response_chunk_size = parse_size("TANDEM_RESPONSE_CHUNK_SIZE", value)?;
        }
        if let Some(value) = var("TANDEM_MAX_REQUEST_SIZE") {
            self.max_request_size = parse_size("TANDEM_MAX_REQUEST_SIZE", value)?;
        }
        if let Some(scheme) = var("TANDEM_AUTH_SCHEME") {
            self.auth_scheme = scheme;
        }
        Ok(self)
    }
}

fn read_table(path: &Path) -> Result<Option<toml::Table>, ConfigError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_owned(),
                source,
            });
        }
    };
    text.parse::<toml::Table>()
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
}

fn parse_size(var: &'static str, value: String) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Env { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn empty_toml_is_all_defaults() {
        assert_eq!(Settings::from_toml_str("").unwrap(), Settings::default());
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let settings = Settings::from_toml_str(
            r#"
            protocol = "single_shot"
            cors_whitelist = ["127.0.0.1"]
            response_chunk_size = 4
            "#,
        )
        .unwrap();
        assert_eq!(settings.protocol, ProtocolKind::SingleShot);
        assert_eq!(settings.cors_whitelist, ["127.0.0.1"]);
        assert_eq!(settings.response_chunk_size, 4);
        assert_eq!(settings.bind_addr, "127.0.0.1:8080");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Settings::from_toml_str("bnd_addr = \"x\"").is_err());
    }

    #[test]
    fn mode_overlay_wins_over_base() {
        let dir = env::temp_dir().join(format!("tandem-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("tandem.toml"), "bind_addr = \"0.0.0.0:1\"\nauth_scheme = \"Token\"\n").unwrap();
        fs::write(dir.join("tandem.prod.toml"), "bind_addr = \"0.0.0.0:2\"\n").unwrap();

        let settings = Settings::load(&dir, "prod").unwrap();
        assert_eq!(settings.mode, "prod");
        assert_eq!(settings.bind_addr, "0.0.0.0:2");
        assert_eq!(settings.auth_scheme, "Token");

        let settings = Settings::load(&dir, "dev").unwrap();
        assert_eq!(settings.bind_addr, "0.0.0.0:1");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let settings = Settings::load("/nonexistent/tandem", "test").unwrap();
        assert_eq!(settings.mode, "test");
        assert_eq!(settings.max_request_size, DEFAULT_MAX_REQUEST_SIZE);
    }

    #[test]
    fn environment_overrides() {
        let vars = HashMap::from([
            ("TANDEM_PROTOCOL", "single-shot"),
            ("TANDEM_CORS_WHITELIST", "127.0.0.1, 10.0.0.1,"),
            ("TANDEM_MAX_REQUEST_SIZE", "2048"),
        ]);
        let settings = Settings::default()
            .apply_vars(|name| vars.get(name).map(|v| (*v).to_owned()))
            .unwrap();
        assert_eq!(settings.protocol, ProtocolKind::SingleShot);
        assert_eq!(settings.cors_whitelist, ["127.0.0.1", "10.0.0.1"]);
        assert_eq!(settings.max_request_size, 2048);

        let err = Settings::default()
            .apply_vars(|name| (name == "TANDEM_RESPONSE_CHUNK_SIZE").then(|| "0".to_owned()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "TANDEM_RESPONSE_CHUNK_SIZE", .. }));
    }
}
