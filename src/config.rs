use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub login: LoginConfig,
    #[serde(default)]
    pub subject: SubjectConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub web: WebConfig,
}

/// Where the key, certificate and CA bundle live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_ssl_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_key_file")]
    pub key_file: String,
    #[serde(default = "default_cert_file")]
    pub cert_file: String,
    #[serde(default = "default_ca_file")]
    pub ca_file: String,
}

/// Lutron device-login service. The client secret is the public value shipped
/// in the vendor app, not a credential of this installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_client_secret")]
    pub client_secret: String,
    #[serde(default = "default_redirect_page")]
    pub redirect_page: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

/// Subject placed in the certificate signing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectConfig {
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default = "default_locality")]
    pub locality: String,
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default = "default_common_name")]
    pub common_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_leap_port")]
    pub leap_port: u16,
    #[serde(default = "default_bridge_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_port")]
    pub port: u16,
}

fn default_ssl_dir() -> PathBuf {
    PathBuf::from("/ssl/lutron")
}

fn default_key_file() -> String {
    "caseta.key".to_string()
}

fn default_cert_file() -> String {
    "caseta.crt".to_string()
}

fn default_ca_file() -> String {
    "caseta-bridge.crt".to_string()
}

fn default_base_url() -> String {
    "https://device-login.lutron.com/".to_string()
}

fn default_client_id() -> String {
    "e001a4471eb6152b7b3f35e549905fd8589dfcf57eb680b6fb37f20878c28e5a".to_string()
}

fn default_client_secret() -> String {
    "b07fee362538d6df3b129dc3026a72d27e1005a3d1e5839eed5ed18c63a89b27".to_string()
}

fn default_redirect_page() -> String {
    "lutron_app_oauth_redirect".to_string()
}

fn default_device_type() -> String {
    "Caseta,RA2Select".to_string()
}

fn default_http_timeout() -> u64 {
    30
}

fn default_country() -> String {
    "US".to_string()
}

fn default_state() -> String {
    "Pennsylvania".to_string()
}

fn default_locality() -> String {
    "Coopersburg".to_string()
}

fn default_organization() -> String {
    "Lutron Electronics Co., Inc.".to_string()
}

fn default_common_name() -> String {
    "Lutron Caseta App".to_string()
}

fn default_leap_port() -> u16 {
    8081
}

fn default_bridge_timeout() -> u64 {
    10
}

fn default_web_port() -> u16 {
    5817
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_ssl_dir(),
            key_file: default_key_file(),
            cert_file: default_cert_file(),
            ca_file: default_ca_file(),
        }
    }
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            client_id: default_client_id(),
            client_secret: default_client_secret(),
            redirect_page: default_redirect_page(),
            device_type: default_device_type(),
            timeout_secs: default_http_timeout(),
        }
    }
}

impl Default for SubjectConfig {
    fn default() -> Self {
        Self {
            country: default_country(),
            state: default_state(),
            locality: default_locality(),
            organization: default_organization(),
            common_name: default_common_name(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            leap_port: default_leap_port(),
            timeout_secs: default_bridge_timeout(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
        }
    }
}

impl LoginConfig {
    pub fn redirect_uri(&self) -> String {
        format!("{}{}", self.base_url, self.redirect_page)
    }

    pub fn token_url(&self) -> String {
        format!("{}oauth/token", self.base_url)
    }

    pub fn pairing_url(&self) -> String {
        format!("{}api/v1/remotepairing/application/user", self.base_url)
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to the built-in defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::write(path, &toml_str)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        let base = url::Url::parse(&self.login.base_url)
            .map_err(|e| format!("Invalid login.base_url '{}': {}", self.login.base_url, e))?;
        if !self.login.base_url.ends_with('/') {
            return Err(format!(
                "login.base_url must end with '/' (got '{}')",
                base
            ));
        }
        if self.login.client_id.trim().is_empty() {
            return Err("login.client_id must not be empty".to_string());
        }
        if self.login.timeout_secs == 0 || self.bridge.timeout_secs == 0 {
            return Err("Timeouts must be at least one second".to_string());
        }
        if self.bridge.leap_port == 0 || self.web.port == 0 {
            return Err("Ports must be non-zero".to_string());
        }
        let names = [
            &self.storage.key_file,
            &self.storage.cert_file,
            &self.storage.ca_file,
        ];
        if names.iter().any(|n| n.is_empty()) {
            return Err("Storage file names must not be empty".to_string());
        }
        if names[0] == names[1] || names[1] == names[2] || names[0] == names[2] {
            return Err("Storage file names must be distinct".to_string());
        }
        Ok(())
    }
}
