//! Geolocation of the developer machine, cached in the project state file.

use crate::runtime::GeoSettings;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// How long a cached location stays fresh.
pub const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const STATE_KEY: &str = "geolocation";
const LOOKUP_URL: &str = "https://netlifind.netlify.app";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// How the location is obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoMode {
    /// Use the cached location while fresh, else look it up.
    #[default]
    Cache,
    /// Always look the location up.
    Update,
    /// Never look anything up.
    Mock,
}

/// A named code, such as a country or subdivision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub code: String,
    pub name: String,
}

/// A geographic location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    pub city: String,
    pub country: Place,
    pub subdivision: Place,
    pub timezone: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Geolocation {
    /// Default location used when nothing better is known.
    pub fn mock() -> Self {
        Self {
            city: "San Francisco".to_string(),
            country: Place {
                code: "US".to_string(),
                name: "United States".to_string(),
            },
            subdivision: Place {
                code: "CA".to_string(),
                name: "California".to_string(),
            },
            timezone: "UTC".to_string(),
            latitude: 0.0,
            longitude: 0.0,
        }
    }

    /// Mock location placed in the given country.
    pub fn mock_in_country(code: &str) -> Self {
        Self {
            city: "Mock City".to_string(),
            country: Place {
                code: code.to_string(),
                name: "Mock Country".to_string(),
            },
            subdivision: Place {
                code: "SD".to_string(),
                name: "Mock Subdivision".to_string(),
            },
            timezone: "UTC".to_string(),
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

/// Errors looking up or persisting a location.
#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("geolocation lookup failed: {0}")]
    Lookup(String),
    #[error("geolocation lookup timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Source of the current location.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self) -> Result<Geolocation, GeoError>;
}

/// Looks the location up over HTTPS.
pub struct HttpGeoLookup {
    url: String,
}

impl HttpGeoLookup {
    pub fn new() -> Self {
        Self {
            url: LOOKUP_URL.to_string(),
        }
    }
}

impl Default for HttpGeoLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct LookupResponse {
    geo: Geolocation,
}

#[async_trait]
impl GeoLookup for HttpGeoLookup {
    async fn lookup(&self) -> Result<Geolocation, GeoError> {
        let fetch = async {
            let bytes = crate::proxy::fetch_bytes(&self.url)
                .await
                .map_err(|e| GeoError::Lookup(e.to_string()))?;
            let response: LookupResponse = serde_json::from_slice(&bytes)?;
            Ok(response.geo)
        };
        tokio::time::timeout(LOOKUP_TIMEOUT, fetch)
            .await
            .map_err(|_| GeoError::Timeout)?
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedLocation {
    data: Geolocation,
    timestamp: i64,
}

/// Resolves the location according to mode, cache state and connectivity.
pub struct GeoResolver {
    state_path: PathBuf,
    lookup: Box<dyn GeoLookup>,
    ttl: Duration,
}

impl GeoResolver {
    /// Resolver persisting to `<project>/.netlify/state.json`.
    pub fn new(project_dir: &Path, lookup: Box<dyn GeoLookup>) -> Self {
        Self {
            state_path: project_dir.join(".netlify").join("state.json"),
            lookup,
            ttl: CACHE_TTL,
        }
    }

    /// Resolve the location.
    ///
    /// A configured country always yields a mock in that country. Offline
    /// resolution never performs a lookup and accepts a stale cache.
    pub async fn resolve(&self, mode: GeoMode, country: Option<&str>, offline: bool) -> Geolocation {
        if let Some(code) = country {
            return Geolocation::mock_in_country(code);
        }
        if mode == GeoMode::Mock {
            return Geolocation::mock();
        }

        let cached = self.read_cache().await;
        if mode == GeoMode::Cache {
            if let Some(cached) = &cached {
                let age_ms = Utc::now().timestamp_millis() - cached.timestamp;
                if age_ms >= 0 && (age_ms as u128) < self.ttl.as_millis() {
                    debug!("Using cached geolocation");
                    return cached.data.clone();
                }
            }
        }

        if offline {
            return cached.map(|c| c.data).unwrap_or_else(Geolocation::mock);
        }

        match self.lookup.lookup().await {
            Ok(location) => {
                if let Err(err) = self.write_cache(&location).await {
                    warn!("Could not save geolocation: {}", err);
                }
                location
            }
            Err(err) => {
                warn!("Could not look up geolocation, using mock location: {}", err);
                Geolocation::mock()
            }
        }
    }

    async fn read_state(&self) -> Value {
        match tokio::fs::read(&self.state_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|_| json!({})),
            Err(_) => json!({}),
        }
    }

    async fn read_cache(&self) -> Option<CachedLocation> {
        let state = self.read_state().await;
        state
            .get(STATE_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    async fn write_cache(&self, location: &Geolocation) -> Result<(), GeoError> {
        let mut state = self.read_state().await;
        let entry = serde_json::to_value(CachedLocation {
            data: location.clone(),
            timestamp: Utc::now().timestamp_millis(),
        })?;
        match state.as_object_mut() {
            Some(map) => {
                map.insert(STATE_KEY.to_string(), entry);
            }
            None => state = json!({ STATE_KEY: entry }),
        }
        if let Some(parent) = self.state_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.state_path, serde_json::to_vec_pretty(&state)?).await?;
        Ok(())
    }
}

/// Location shared by every request of a session, resolved on first use.
pub struct GeoContext {
    resolver: GeoResolver,
    mode: GeoMode,
    country: Option<String>,
    offline: bool,
    location: OnceCell<Geolocation>,
}

impl GeoContext {
    pub fn new(resolver: GeoResolver, settings: &GeoSettings, offline: bool) -> Self {
        Self {
            resolver,
            mode: settings.mode,
            country: settings.country.clone(),
            offline,
            location: OnceCell::new(),
        }
    }

    pub async fn location(&self) -> &Geolocation {
        self.location
            .get_or_init(|| {
                self.resolver
                    .resolve(self.mode, self.country.as_deref(), self.offline)
            })
            .await
    }
}
