//! Dev server configuration.

use crate::edge_functions::Declaration;
use crate::geo::GeoMode;
use crate::proxy::HeaderRule;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

/// PEM certificate and key for the primary listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Address of the framework's own dev server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameworkConfig {
    #[serde(default = "default_framework_host")]
    pub host: String,
    pub port: u16,
}

fn default_framework_host() -> String {
    "localhost".to_string()
}

impl FrameworkConfig {
    /// Origin URL of the framework server.
    pub fn origin(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Identity of the emulated site.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteInfo {
    pub id: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
}

/// Connection info for the local blob store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobsContext {
    pub url: String,
    pub url_uncached: String,
    pub token: String,
}

/// Per-function settings from the site configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionSettings {
    /// Cron expression for scheduled functions.
    pub schedule: Option<String>,
}

/// Local (serverless) functions settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionsSettings {
    /// User function directories, lowest precedence first.
    pub directories: Vec<PathBuf>,
    /// Directory of functions generated by frameworks or integrations.
    pub internal_directory: Option<PathBuf>,
    /// Packaging manifest describing zipped functions.
    pub manifest: Option<PathBuf>,
    /// Timeout for synchronous invocations, in seconds.
    pub timeout: u64,
    /// Timeout for background invocations, in seconds.
    pub background_timeout: u64,
    /// Settings keyed by function name.
    pub config: HashMap<String, FunctionSettings>,
}

impl Default for FunctionsSettings {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            internal_directory: None,
            manifest: None,
            timeout: 30,
            background_timeout: 900,
            config: HashMap::new(),
        }
    }
}

impl FunctionsSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn background_timeout(&self) -> Duration {
        Duration::from_secs(self.background_timeout)
    }
}

/// Edge functions settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeFunctionsSettings {
    /// Whether edge functions are served at all.
    pub enabled: bool,
    /// User edge function directories.
    pub directories: Vec<PathBuf>,
    /// Directories of framework/integration generated edge functions.
    pub internal_directories: Vec<PathBuf>,
    /// Declarations from the site configuration file.
    pub declarations: Vec<Declaration>,
    /// Configuration file to watch for declaration changes.
    pub config_path: Option<PathBuf>,
    /// Deploy-time manifest written by frameworks.
    pub deploy_manifest: Option<PathBuf>,
    /// Port the isolate listens on.
    pub isolate_port: u16,
    /// Feature flags forwarded to the isolate.
    pub feature_flags: BTreeMap<String, bool>,
    /// Command run for every build; edge functions are off when empty.
    pub bundler: Vec<String>,
    /// Long-running isolate server, started before the first build.
    pub isolate: Vec<String>,
}

impl Default for EdgeFunctionsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directories: Vec::new(),
            internal_directories: Vec::new(),
            declarations: Vec::new(),
            config_path: None,
            deploy_manifest: None,
            isolate_port: 8971,
            feature_flags: BTreeMap::new(),
            bundler: Vec::new(),
            isolate: Vec::new(),
        }
    }
}

/// Geolocation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoSettings {
    pub mode: GeoMode,
    /// Country code forcing a mock location.
    pub country: Option<String>,
}

/// JWT handling for role-gated rules and client contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtSettings {
    /// Dot path of the roles claim.
    pub role_path: String,
    /// Secret used to sign tokens when set.
    pub secret: Option<String>,
}

impl Default for JwtSettings {
    fn default() -> Self {
        Self {
            role_path: "app_metadata.authorization.roles".to_string(),
            secret: None,
        }
    }
}

/// Configuration for the dev server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port of the primary listener.
    pub port: u16,
    /// TLS for the primary listener.
    pub tls: Option<TlsConfig>,
    /// Plain HTTP listener for isolate pass-back when TLS is on.
    pub secondary_port: Option<u16>,
    /// Project root.
    pub project_dir: PathBuf,
    /// Directory served as static files.
    pub dist_dir: PathBuf,
    /// Framework dev server; static files are served directly when absent.
    pub framework: Option<FrameworkConfig>,
    /// How long to wait for the framework server, in seconds.
    pub framework_timeout: u64,
    /// Environment variables exposed to functions.
    pub env: HashMap<String, String>,
    /// Verbose logging and isolate debug headers.
    pub debug: bool,
    /// Never reach out to remote services.
    pub offline: bool,
    /// Maximum buffered request body size in bytes.
    pub max_body_size: usize,
    /// Request body read timeout in seconds.
    pub body_timeout: u64,
    pub functions: FunctionsSettings,
    pub edge_functions: EdgeFunctionsSettings,
    pub site: SiteInfo,
    pub account_id: Option<String>,
    pub blobs: Option<BlobsContext>,
    pub geo: GeoSettings,
    pub jwt: JwtSettings,
    /// Addon name to origin URL.
    pub addons: BTreeMap<String, String>,
    /// Origin of the image transformation service.
    pub image_proxy: Option<String>,
    /// Path-scoped custom response headers.
    pub headers: Vec<HeaderRule>,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            tls: None,
            secondary_port: None,
            project_dir: PathBuf::from("."),
            dist_dir: PathBuf::from("public"),
            framework: None,
            framework_timeout: 600,
            env: HashMap::new(),
            debug: false,
            offline: false,
            max_body_size: 6 * 1024 * 1024, // 6MB
            body_timeout: 30,
            functions: FunctionsSettings::default(),
            edge_functions: EdgeFunctionsSettings::default(),
            site: SiteInfo::default(),
            account_id: None,
            blobs: None,
            geo: GeoSettings::default(),
            jwt: JwtSettings::default(),
            addons: BTreeMap::new(),
            image_proxy: None,
            headers: Vec::new(),
        }
    }
}

impl DevConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a TOML config file; missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `EDGEDEV_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    key: key.to_string(),
                    value,
                })
        }

        if let Some(host) = lookup("EDGEDEV_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("EDGEDEV_PORT") {
            self.port = parse("EDGEDEV_PORT", port)?;
        }
        if let Some(dist) = lookup("EDGEDEV_DIST_DIR") {
            self.dist_dir = PathBuf::from(dist);
        }
        if let Some(port) = lookup("EDGEDEV_FRAMEWORK_PORT") {
            let port = parse("EDGEDEV_FRAMEWORK_PORT", port)?;
            match self.framework.as_mut() {
                Some(framework) => framework.port = port,
                None => {
                    self.framework = Some(FrameworkConfig {
                        host: default_framework_host(),
                        port,
                    })
                }
            }
        }
        if let Some(debug) = lookup("EDGEDEV_DEBUG") {
            self.debug = parse("EDGEDEV_DEBUG", debug)?;
        }
        if let Some(offline) = lookup("EDGEDEV_OFFLINE") {
            self.offline = parse("EDGEDEV_OFFLINE", offline)?;
        }
        Ok(self)
    }

    /// Set the host address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the project directory.
    pub fn project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = dir.into();
        self
    }

    /// Set the static files directory.
    pub fn dist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dist_dir = dir.into();
        self
    }

    /// Proxy to a framework dev server on the given port.
    pub fn framework_port(mut self, port: u16) -> Self {
        self.framework = Some(FrameworkConfig {
            host: default_framework_host(),
            port,
        });
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a functions directory.
    pub fn functions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.functions.directories.push(dir.into());
        self
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve a possibly relative path against the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    /// Absolute static files directory.
    pub fn dist_path(&self) -> PathBuf {
        self.resolve(&self.dist_dir)
    }

    pub fn body_timeout(&self) -> Duration {
        Duration::from_secs(self.body_timeout)
    }

    pub fn framework_timeout(&self) -> Duration {
        Duration::from_secs(self.framework_timeout)
    }

    /// Scheme of the primary listener.
    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_bind_addr() {
        let config = DevConfig::new().host("0.0.0.0").port(9000).env("A", "1");
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
        assert_eq!(config.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(config.scheme(), "http");
    }

    #[test]
    fn test_partial_toml() {
        let config: DevConfig = toml::from_str(
            r#"
            port = 3999
            dist_dir = "dist"

            [framework]
            port = 5173

            [functions]
            directories = ["netlify/functions"]

            [functions.config.cron-job]
            schedule = "@daily"

            [addons]
            search = "https://search.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 3999);
        assert_eq!(config.framework.as_ref().unwrap().origin(), "http://localhost:5173");
        assert_eq!(config.functions.timeout, 30);
        assert_eq!(
            config.functions.config["cron-job"].schedule.as_deref(),
            Some("@daily")
        );
        assert_eq!(config.jwt.role_path, "app_metadata.authorization.roles");
        assert!(config.edge_functions.enabled);
    }

    #[test]
    fn test_env_overrides() {
        let config = DevConfig::new()
            .with_overrides(|key| match key {
                "EDGEDEV_PORT" => Some("7777".to_string()),
                "EDGEDEV_FRAMEWORK_PORT" => Some("3000".to_string()),
                "EDGEDEV_OFFLINE" => Some("true".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.port, 7777);
        assert_eq!(config.framework.unwrap().port, 3000);
        assert!(config.offline);

        let err = DevConfig::new()
            .with_overrides(|key| (key == "EDGEDEV_PORT").then(|| "nope".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }
}
