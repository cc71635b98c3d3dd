//! Configuration handling for samlvpn
//!
//! The configuration is a TOML file with kebab-case keys. Optional values
//! that are left out (or set to zero/empty) fall back to the defaults below.

use crate::auth::UrlError;
use crate::openvpn::ParseError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Placeholder in `browser-command` replaced by the authorization URL
pub const URL_MARKER: &str = "%s";

pub const DEFAULT_SERVER_ADDRESS: &str = "0.0.0.0:35001";
pub const DEFAULT_SERVER_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_CREDENTIALS_PERMISSIONS: u32 = 0o400;

const CREDENTIALS_FILE_NAME: &str = "samlvpn-credentials";

/// Config file name looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = "samlvpn.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("Could not stat {field} {}: {source}", .path.display())]
    PathNotFound {
        field: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("browser-command must contain exactly one %s element, found {0}")]
    UrlMarker(usize),
    #[error("temp-credentials-permissions {0:#o} must be within 0o777 and owner-readable")]
    InvalidPermissions(u32),
    #[error("redirect-url {url} is not a valid URL: {source}")]
    InvalidRedirectUrl { url: String, source: url::ParseError },
    #[error("openvpn-config-file: {0}")]
    Endpoint(#[from] ParseError),
    #[error("Cannot build authorization URL: {0}")]
    AuthorizationUrl(#[from] UrlError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Absolute path to the patched OpenVPN binary
    #[serde(default)]
    pub openvpn_binary: PathBuf,

    /// Absolute path to the OpenVPN config file
    #[serde(default)]
    pub openvpn_config_file: PathBuf,

    /// Address the SAML callback listener binds to
    #[serde(default = "default_server_address")]
    pub server_address: SocketAddr,

    /// Seconds to wait for the SAML callback before giving up
    #[serde(default)]
    pub server_timeout: u64,

    /// Command used to open the authorization URL, `%s` marks the URL
    #[serde(default)]
    pub browser_command: Vec<String>,

    /// Page the browser is sent to once the callback has been received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,

    /// Run the browser command instead of printing it
    #[serde(default)]
    pub run_command: bool,

    /// How many times to start over when OpenVPN reports AUTH_FAILED
    #[serde(default)]
    pub auth_failed_retries: u32,

    #[serde(default)]
    pub temp_credentials_file_path: PathBuf,

    #[serde(default)]
    pub temp_credentials_permissions: u32,
}

fn default_server_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 35001))
}

/// Default location of the temporary credentials file
///
/// Uses the per-user cache directory when there is one, otherwise a dotfile
/// in the home directory.
pub fn default_credentials_path() -> PathBuf {
    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir.join(CREDENTIALS_FILE_NAME);
    }
    dirs::home_dir()
        .unwrap_or_default()
        .join(format!(".{}", CREDENTIALS_FILE_NAME))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openvpn_binary: PathBuf::from("/usr/local/bin/openvpn-saml"),
            openvpn_config_file: PathBuf::new(),
            server_address: default_server_address(),
            server_timeout: DEFAULT_SERVER_TIMEOUT_SECS,
            browser_command: default_browser_command(),
            redirect_url: None,
            run_command: false,
            auth_failed_retries: 0,
            temp_credentials_file_path: default_credentials_path(),
            temp_credentials_permissions: DEFAULT_CREDENTIALS_PERMISSIONS,
        }
    }
}

fn default_browser_command() -> Vec<String> {
    let opener = if cfg!(target_os = "macos") {
        vec!["open"]
    } else if cfg!(windows) {
        vec!["cmd", "/C", "start", ""]
    } else {
        vec!["xdg-open"]
    };
    opener
        .into_iter()
        .chain([URL_MARKER])
        .map(String::from)
        .collect()
}

/// Find the config file to use
///
/// An explicit path always wins. Otherwise `./samlvpn.toml`, then
/// `<config dir>/samlvpn/config.toml`.
pub fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("samlvpn").join("config.toml"))
        .filter(|path| path.exists())
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_with_defaults(&content)
    }

    /// Parse TOML content and fill in defaults for optionals left unset
    pub fn parse_with_defaults(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.apply_defaults();
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.server_timeout == 0 {
            self.server_timeout = DEFAULT_SERVER_TIMEOUT_SECS;
        }
        if self.temp_credentials_file_path.as_os_str().is_empty() {
            self.temp_credentials_file_path = default_credentials_path();
        }
        if self.temp_credentials_permissions == 0 {
            self.temp_credentials_permissions = DEFAULT_CREDENTIALS_PERMISSIONS;
        }
        if self.redirect_url.as_deref().is_some_and(str::is_empty) {
            self.redirect_url = None;
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout)
    }

    /// Check the configuration, returning every problem found
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        check_path(&mut errors, "openvpn-binary", &self.openvpn_binary);
        check_path(&mut errors, "openvpn-config-file", &self.openvpn_config_file);

        let markers = self
            .browser_command
            .iter()
            .filter(|arg| *arg == URL_MARKER)
            .count();
        if markers != 1 {
            errors.push(ConfigError::UrlMarker(markers));
        }

        let mode = self.temp_credentials_permissions;
        if mode > 0o777 || mode & 0o400 == 0 {
            errors.push(ConfigError::InvalidPermissions(mode));
        }

        if let Some(url) = &self.redirect_url {
            if let Err(source) = Url::parse(url) {
                errors.push(ConfigError::InvalidRedirectUrl {
                    url: url.clone(),
                    source,
                });
            }
        }

        errors
    }
}

fn check_path(errors: &mut Vec<ConfigError>, field: &'static str, path: &Path) {
    if path.as_os_str().is_empty() {
        errors.push(ConfigError::MissingField(field));
        return;
    }
    if let Err(source) = std::fs::metadata(path) {
        errors.push(ConfigError::PathNotFound {
            field,
            path: path.to_path_buf(),
            source,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_config(dir: &TempDir) -> Config {
        let binary = dir.path().join("openvpn");
        let ovpn = dir.path().join("client.ovpn");
        std::fs::write(&binary, "").unwrap();
        std::fs::write(&ovpn, "remote vpn.example.com 443\n").unwrap();

        Config {
            openvpn_binary: binary,
            openvpn_config_file: ovpn,
            browser_command: vec!["firefox".into(), "%s".into()],
            ..Config::default()
        }
    }

    #[test]
    fn test_parse_applies_defaults() {
        let config = Config::parse_with_defaults(
            r#"
            openvpn-binary = "/opt/openvpn/openvpn"
            openvpn-config-file = "/etc/openvpn/client.ovpn"
            browser-command = ["firefox", "%s"]
            "#,
        )
        .unwrap();

        assert_eq!(config.server_address.to_string(), DEFAULT_SERVER_ADDRESS);
        assert_eq!(config.server_timeout(), Duration::from_secs(120));
        assert_eq!(config.temp_credentials_permissions, 0o400);
        assert_eq!(config.temp_credentials_file_path, default_credentials_path());
        assert_eq!(config.auth_failed_retries, 0);
        assert!(!config.run_command);
        assert!(config.redirect_url.is_none());
    }

    #[test]
    fn test_parse_overrides() {
        let config = Config::parse_with_defaults(
            r#"
            openvpn-binary = "/opt/openvpn/openvpn"
            openvpn-config-file = "/etc/openvpn/client.ovpn"
            server-address = "127.0.0.1:40000"
            server-timeout = 30
            browser-command = ["open", "-a", "Safari", "%s"]
            redirect-url = "https://intranet.example.com/"
            run-command = true
            auth-failed-retries = 3
            temp-credentials-file-path = "/tmp/creds"
            temp-credentials-permissions = 0o600
            "#,
        )
        .unwrap();

        assert_eq!(config.server_address.port(), 40000);
        assert_eq!(config.server_timeout(), Duration::from_secs(30));
        assert_eq!(config.browser_command.len(), 4);
        assert_eq!(
            config.redirect_url.as_deref(),
            Some("https://intranet.example.com/")
        );
        assert!(config.run_command);
        assert_eq!(config.auth_failed_retries, 3);
        assert_eq!(config.temp_credentials_file_path, PathBuf::from("/tmp/creds"));
        assert_eq!(config.temp_credentials_permissions, 0o600);
    }

    #[test]
    fn test_empty_redirect_url_is_unset() {
        let config = Config::parse_with_defaults(r#"redirect-url = """#).unwrap();
        assert!(config.redirect_url.is_none());
    }

    #[test]
    fn test_parse_rejects_invalid_toml() {
        let result = Config::parse_with_defaults("server-address = not-quoted");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_ok() {
        let dir = TempDir::new().unwrap();
        let config = valid_config(&dir);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = Config {
            openvpn_binary: PathBuf::new(),
            openvpn_config_file: PathBuf::from("/definitely/not/here.ovpn"),
            browser_command: vec!["firefox".into()],
            ..Config::default()
        };

        let errors = config.validate();

        assert_eq!(errors.len(), 3);
        assert!(matches!(errors[0], ConfigError::MissingField("openvpn-binary")));
        assert!(matches!(
            errors[1],
            ConfigError::PathNotFound {
                field: "openvpn-config-file",
                ..
            }
        ));
        assert!(matches!(errors[2], ConfigError::UrlMarker(0)));
    }

    #[test]
    fn test_validate_marker_must_be_single_element() {
        let dir = TempDir::new().unwrap();

        let mut config = valid_config(&dir);
        config.browser_command = vec!["firefox".into(), "--url=%s".into()];
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ConfigError::UrlMarker(0)));

        config.browser_command = vec!["%s".into(), "%s".into()];
        let errors = config.validate();
        assert!(matches!(errors[0], ConfigError::UrlMarker(2)));
    }

    #[test]
    fn test_validate_permissions_and_redirect() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.temp_credentials_permissions = 0o200;
        config.redirect_url = Some("not a url".into());

        let errors = config.validate();

        assert_eq!(errors.len(), 2);
        assert!(errors[0].to_string().contains("0o200"));
        assert!(matches!(errors[1], ConfigError::InvalidRedirectUrl { .. }));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("samlvpn.toml");
        let config = valid_config(&dir);

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded.openvpn_binary, config.openvpn_binary);
        assert_eq!(loaded.browser_command, config.browser_command);
        assert_eq!(loaded.temp_credentials_permissions, 0o400);
    }

    #[test]
    fn test_find_config_file_prefers_explicit() {
        let explicit = Path::new("/etc/samlvpn/work.toml");

        assert_eq!(
            find_config_file(Some(explicit)),
            Some(explicit.to_path_buf())
        );
    }

    #[test]
    fn test_default_credentials_path_file_name() {
        let path = default_credentials_path();
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.ends_with(CREDENTIALS_FILE_NAME));
    }
}
