use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::TagFilter;
use crate::OverpassError;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub overpass: OverpassConfig,
    pub geocoder: GeocoderConfig,
    pub output: OutputSettings,
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Overpass endpoint selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverpassConfig {
    pub servers: Vec<String>,
    /// Index into `servers` of the endpoint that gets queried
    pub server_index: usize,
    /// Client-side bound; keep above the 25 s the query asks the server for
    pub timeout_secs: u64,
    pub user_agent: String,
}

/// Geocoding service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocoderConfig {
    pub base_url: String,
    pub user_agent: String,
    pub limit: u32,
    pub timeout_secs: u64,
}

/// Output layer settings, passed explicitly to every sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    pub output_dir: PathBuf,
    /// Replace existing layers instead of failing
    pub overwrite: bool,
    /// Width of generated text fields; longer values are not written
    pub text_field_width: usize,
}

const DEFAULT_USER_AGENT: &str = concat!("overpass-features/", env!("CARGO_PKG_VERSION"));

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            limit: 10,
            timeout_secs: 30,
        }
    }
}

impl Default for OverpassConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "https://overpass-api.de/api/interpreter".to_string(),
                "https://overpass.kumi.systems/api/interpreter".to_string(),
                "https://maps.mail.ru/osm/tools/overpass/api/interpreter".to_string(),
            ],
            server_index: 0,
            timeout_secs: 60,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            overwrite: false,
            text_field_width: 255,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3002,
            },
            overpass: OverpassConfig::default(),
            geocoder: GeocoderConfig::default(),
            output: OutputSettings::default(),
        }
    }
}

impl OverpassConfig {
    /// Endpoint the client talks to
    pub fn endpoint(&self) -> Option<&str> {
        self.servers.get(self.server_index).map(String::as_str)
    }
}

impl Config {
    /// Load configuration from environment variables and defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(host) = std::env::var("OVERPASS_HOST") {
            config.server.host = host;
        }

        if let Ok(port) = std::env::var("OVERPASS_PORT") {
            if let Ok(port) = port.parse() {
                config.server.port = port;
            }
        }

        if let Ok(server) = std::env::var("OVERPASS_SERVER") {
            config.overpass.servers.insert(0, server);
            config.overpass.server_index = 0;
        }

        if let Ok(url) = std::env::var("OVERPASS_GEOCODER_URL") {
            config.geocoder.base_url = url;
        }

        if let Ok(output_dir) = std::env::var("OVERPASS_OUTPUT_DIR") {
            config.output.output_dir = PathBuf::from(output_dir);
        }

        if let Ok(overwrite) = std::env::var("OVERPASS_OVERWRITE") {
            config.output.overwrite = matches!(overwrite.as_str(), "1" | "true" | "yes");
        }

        config
    }

    /// Replace the endpoint list with one loaded from a [`ServerList`] file
    pub fn with_servers(mut self, servers: ServerList) -> Self {
        self.overpass.servers = servers.0;
        self.overpass.server_index = 0;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.server.port == 0 {
            return Err(OverpassError::Config("Invalid port number".to_string()).into());
        }

        if self.overpass.endpoint().is_none() {
            return Err(OverpassError::Config(format!(
                "Overpass server index {} out of range ({} servers configured)",
                self.overpass.server_index,
                self.overpass.servers.len()
            ))
            .into());
        }

        if self.output.text_field_width == 0 {
            return Err(
                OverpassError::Config("Text field width must be greater than 0".to_string())
                    .into(),
            );
        }

        Ok(())
    }
}

/// Overpass endpoints, stored as a JSON array of URLs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerList(pub Vec<String>);

impl ServerList {
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let list: ServerList = serde_json::from_str(json)?;
        if list.0.is_empty() {
            return Err(OverpassError::Config("Server list is empty".to_string()).into());
        }
        Ok(list)
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

/// Value vocabulary entry for one tag key
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeyVocabulary {
    /// Whether the "any value" choice is offered
    pub allows_any: bool,
    pub values: Vec<String>,
}

/// Legal tag keys and values offered to users.
///
/// On disk this is a JSON object mapping each key to its values, where the
/// literal `"*"` stands for "any value". The sentinel is resolved while
/// loading and only survives as [`KeyVocabulary::allows_any`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TagVocabulary {
    keys: BTreeMap<String, KeyVocabulary>,
}

impl TagVocabulary {
    pub const ANY_VALUE_SENTINEL: &'static str = "*";

    pub fn from_json(json: &str) -> crate::Result<Self> {
        let raw: BTreeMap<String, Vec<String>> = serde_json::from_str(json)?;
        let keys = raw
            .into_iter()
            .map(|(key, values)| {
                let mut entry = KeyVocabulary::default();
                for value in values {
                    if value == Self::ANY_VALUE_SENTINEL {
                        entry.allows_any = true;
                    } else {
                        entry.values.push(value);
                    }
                }
                (key, entry)
            })
            .collect();
        Ok(Self { keys })
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn keys(&self) -> impl Iterator<Item = (&String, &KeyVocabulary)> {
        self.keys.iter()
    }

    pub fn get(&self, key: &str) -> Option<&KeyVocabulary> {
        self.keys.get(key)
    }

    /// Build a filter from user choices, checked against the vocabulary.
    ///
    /// No values selects "any value" and is only allowed where the key
    /// offers it.
    pub fn filter_for(&self, key: &str, values: &[String]) -> Result<TagFilter, OverpassError> {
        let entry = self.keys.get(key).ok_or_else(|| {
            OverpassError::InvalidRequest(format!("unknown tag key '{}'", key))
        })?;

        if values.is_empty() {
            if entry.allows_any {
                return Ok(TagFilter::wildcard(key));
            }
            return Err(OverpassError::InvalidRequest(format!(
                "tag key '{}' requires at least one value",
                key
            )));
        }

        if let Some(unknown) = values.iter().find(|v| !entry.values.contains(v)) {
            return Err(OverpassError::InvalidRequest(format!(
                "'{}' is not a known value for tag key '{}'",
                unknown, key
            )));
        }

        TagFilter::any_of(key, values.iter().cloned())
    }
}
