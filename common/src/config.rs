use serde::{Deserialize, Serialize};

use crate::url;

/// Bump when the persisted layout changes incompatibly. Fields appended at the
/// end of the record do not need a bump; they pick up their defaults on load.
pub const CONFIG_VERSION: u8 = 0;
pub const MAX_USER_WIFI: usize = 4;
pub const MAX_STRING_LENGTH: usize = 32;
pub const MAX_URL_LENGTH: usize = 256;

pub const SHORT_CAPACITY: usize = MAX_STRING_LENGTH - 1;
pub const LONG_CAPACITY: usize = MAX_URL_LENGTH - 1;

pub type ShortString = heapless::String<SHORT_CAPACITY>;
pub type LongString = heapless::String<LONG_CAPACITY>;

const fn env_or(value: Option<&'static str>, fallback: &'static str) -> &'static str {
    match value {
        Some(value) => value,
        None => fallback,
    }
}

pub const DEFAULT_NAME: &str = env_or(option_env!("HARD_STATUS_DEFAULT_NAME"), "hard-status");
pub const DEFAULT_PASSWORD: &str = env_or(option_env!("HARD_STATUS_DEFAULT_PASSWORD"), "changeme");
pub const DEFAULT_WEB_LOGIN: &str = "admin";
pub const DEFAULT_API_URL: &str = env_or(
    option_env!("HARD_STATUS_DEFAULT_API_URL"),
    "http://192.168.0.2/concourse?url=http://192.168.0.3",
);
pub const DEFAULT_OTA_URL: &str = env_or(
    option_env!("HARD_STATUS_DEFAULT_OTA_URL"),
    "http://192.168.0.4/repository/firmware/hard-status-esp32-lolin32.bin",
);
pub const DEFAULT_OTA_AUTH: &str = env_or(
    option_env!("HARD_STATUS_DEFAULT_OTA_AUTH"),
    "dXNlcjpwYXNzd29yZA==",
);
pub const DEFAULT_WIFI0_SSID: &str = env_or(
    option_env!("HARD_STATUS_DEFAULT_WIFI0_SSID"),
    "hard-status-setup",
);
pub const DEFAULT_WIFI0_PSK: &str = env_or(option_env!("HARD_STATUS_DEFAULT_WIFI0_PSK"), "changeme");
pub const DEFAULT_BRIGHTNESS: u8 = 64;
pub const DEFAULT_API_CHECK_DELAY_MS: u16 = 10_000;
pub const DEFAULT_OTA_CHECK_DELAY_MS: u16 = 60_000;

pub const MIN_CHECK_DELAY_MS: u16 = 1_000;
pub const MIN_WPA_PASSWORD_LEN: usize = 8;

pub fn truncated<const N: usize>(value: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for ch in value.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub login: ShortString,
    pub password: ShortString,
}

impl Credential {
    pub fn new(login: &str, password: &str) -> Self {
        Self {
            login: truncated(login),
            password: truncated(password),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.login.is_empty()
    }

    pub fn matches(&self, login: &str, password: &str) -> bool {
        self.login.as_str() == login && self.password.as_str() == password
    }
}

/// The single persisted settings record of the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub schema_version: u8,
    pub max_user_wifi: u8,
    pub max_string_length: u8,
    pub name: ShortString,
    pub web_access: Credential,
    pub hotspot: Credential,
    pub wifi_networks: heapless::Vec<Credential, MAX_USER_WIFI>,
    pub brightness: u8,
    pub api_url: LongString,
    pub ota_url: LongString,
    pub ota_auth: LongString,
    pub api_check_delay_ms: u16,
    pub ota_check_delay_ms: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let mut wifi_networks = heapless::Vec::new();
        if !DEFAULT_WIFI0_SSID.is_empty() {
            let _ = wifi_networks.push(Credential::new(DEFAULT_WIFI0_SSID, DEFAULT_WIFI0_PSK));
        }

        Self {
            schema_version: CONFIG_VERSION,
            max_user_wifi: MAX_USER_WIFI as u8,
            max_string_length: MAX_STRING_LENGTH as u8,
            name: truncated(DEFAULT_NAME),
            web_access: Credential::new(DEFAULT_WEB_LOGIN, DEFAULT_PASSWORD),
            hotspot: Credential::new(DEFAULT_NAME, DEFAULT_PASSWORD),
            wifi_networks,
            brightness: DEFAULT_BRIGHTNESS,
            api_url: truncated(DEFAULT_API_URL),
            ota_url: truncated(DEFAULT_OTA_URL),
            ota_auth: truncated(DEFAULT_OTA_AUTH),
            api_check_delay_ms: DEFAULT_API_CHECK_DELAY_MS,
            ota_check_delay_ms: DEFAULT_OTA_CHECK_DELAY_MS,
        }
    }
}

impl DeviceConfig {
    pub fn status_url(&self) -> Result<url::ClientUrl, url::ParseError> {
        url::parse(&self.api_url).map(|parsed| parsed.to_client_form())
    }

    pub fn firmware_url(&self) -> Result<url::ClientUrl, url::ParseError> {
        url::parse(&self.ota_url).map(|parsed| parsed.to_client_form())
    }

    pub fn wifi_settings_differ(&self, other: &DeviceConfig) -> bool {
        self.wifi_networks != other.wifi_networks || self.hotspot != other.hotspot
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub login: String,
    #[serde(rename = "passwordSet")]
    pub password_set: bool,
}

impl From<&Credential> for CredentialView {
    fn from(credential: &Credential) -> Self {
        Self {
            login: credential.login.to_string(),
            password_set: !credential.password.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u8,
    #[serde(rename = "maxUserWifi")]
    pub max_user_wifi: u8,
    pub name: String,
    #[serde(rename = "webAccess")]
    pub web_access: CredentialView,
    pub hotspot: CredentialView,
    pub wifi: Vec<CredentialView>,
    pub brightness: u8,
    #[serde(rename = "apiUrl")]
    pub api_url: String,
    #[serde(rename = "otaUrl")]
    pub ota_url: String,
    #[serde(rename = "otaAuthSet")]
    pub ota_auth_set: bool,
    #[serde(rename = "apiCheckDelayMs")]
    pub api_check_delay_ms: u16,
    #[serde(rename = "otaCheckDelayMs")]
    pub ota_check_delay_ms: u16,
}

impl From<&DeviceConfig> for ConfigView {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            schema_version: config.schema_version,
            max_user_wifi: config.max_user_wifi,
            name: config.name.to_string(),
            web_access: CredentialView::from(&config.web_access),
            hotspot: CredentialView::from(&config.hotspot),
            wifi: config.wifi_networks.iter().map(CredentialView::from).collect(),
            brightness: config.brightness,
            api_url: config.api_url.to_string(),
            ota_url: config.ota_url.to_string(),
            ota_auth_set: !config.ota_auth.is_empty(),
            api_check_delay_ms: config.api_check_delay_ms,
            ota_check_delay_ms: config.ota_check_delay_ms,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialUpdate {
    pub login: String,
    /// `None` keeps the password currently stored for the same login.
    #[serde(default)]
    pub password: Option<String>,
}

/// Partial update submitted by the web UI. Omitted fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "webLogin", default)]
    pub web_login: Option<String>,
    #[serde(rename = "webPassword", default)]
    pub web_password: Option<String>,
    #[serde(rename = "hotspotSsid", default)]
    pub hotspot_ssid: Option<String>,
    #[serde(rename = "hotspotPassword", default)]
    pub hotspot_password: Option<String>,
    #[serde(default)]
    pub wifi: Option<Vec<CredentialUpdate>>,
    #[serde(default)]
    pub brightness: Option<u8>,
    #[serde(rename = "apiUrl", default)]
    pub api_url: Option<String>,
    #[serde(rename = "otaUrl", default)]
    pub ota_url: Option<String>,
    #[serde(rename = "otaAuth", default)]
    pub ota_auth: Option<String>,
    #[serde(rename = "apiCheckDelayMs", default)]
    pub api_check_delay_ms: Option<u16>,
    #[serde(rename = "otaCheckDelayMs", default)]
    pub ota_check_delay_ms: Option<u16>,
}

fn fits_short(value: &str) -> bool {
    value.len() <= SHORT_CAPACITY
}

fn fits_long(value: &str) -> bool {
    value.len() <= LONG_CAPACITY
}

fn has_control_chars(value: &str) -> bool {
    value.chars().any(char::is_control)
}

fn valid_wpa_password(password: &str) -> bool {
    password.is_empty() || (MIN_WPA_PASSWORD_LEN..=SHORT_CAPACITY).contains(&password.len())
}

impl ConfigUpdate {
    fn text_fields(&self) -> impl Iterator<Item = &str> + '_ {
        let singles = [
            &self.name,
            &self.web_login,
            &self.web_password,
            &self.hotspot_ssid,
            &self.hotspot_password,
            &self.api_url,
            &self.ota_url,
            &self.ota_auth,
        ]
        .into_iter()
        .filter_map(|field| field.as_deref());
        let networks = self.wifi.iter().flatten().flat_map(|network| {
            std::iter::once(network.login.as_str()).chain(network.password.as_deref())
        });
        singles.chain(networks)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        // Stored strings are NUL-terminated.
        if self.text_fields().any(has_control_chars) {
            return Err("text fields cannot contain control characters");
        }

        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err("name cannot be empty");
            }
            if !fits_short(name) {
                return Err("name must be at most 31 bytes");
            }
        }

        if let Some(login) = &self.web_login {
            if login.trim().is_empty() || !fits_short(login) {
                return Err("webLogin must be 1-31 bytes");
            }
        }
        if let Some(password) = &self.web_password {
            if password.is_empty() || !fits_short(password) {
                return Err("webPassword must be 1-31 bytes");
            }
        }

        if let Some(ssid) = &self.hotspot_ssid {
            if ssid.trim().is_empty() || !fits_short(ssid) {
                return Err("hotspotSsid must be 1-31 bytes");
            }
        }
        if let Some(password) = &self.hotspot_password {
            if !valid_wpa_password(password) {
                return Err("hotspotPassword must be empty or 8-31 bytes");
            }
        }

        if let Some(networks) = &self.wifi {
            if networks.len() > MAX_USER_WIFI {
                return Err("at most 4 wifi networks can be stored");
            }
            for network in networks {
                if network.login.trim().is_empty() || !fits_short(&network.login) {
                    return Err("wifi ssid must be 1-31 bytes");
                }
                if let Some(password) = &network.password {
                    if !valid_wpa_password(password) {
                        return Err("wifi password must be empty or 8-31 bytes");
                    }
                }
            }
        }

        if let Some(api_url) = &self.api_url {
            if !fits_long(api_url) {
                return Err("apiUrl must be at most 255 bytes");
            }
            if url::parse(api_url).is_err() {
                return Err("apiUrl must be an absolute http:// or https:// url");
            }
        }
        if let Some(ota_url) = &self.ota_url {
            if !fits_long(ota_url) {
                return Err("otaUrl must be at most 255 bytes");
            }
            if !ota_url.is_empty() && url::parse(ota_url).is_err() {
                return Err("otaUrl must be empty or an absolute http:// or https:// url");
            }
        }
        if let Some(ota_auth) = &self.ota_auth {
            if !fits_long(ota_auth) {
                return Err("otaAuth must be at most 255 bytes");
            }
        }

        if self
            .api_check_delay_ms
            .is_some_and(|delay| delay < MIN_CHECK_DELAY_MS)
        {
            return Err("apiCheckDelayMs must be at least 1000");
        }
        if self
            .ota_check_delay_ms
            .is_some_and(|delay| delay < MIN_CHECK_DELAY_MS)
        {
            return Err("otaCheckDelayMs must be at least 1000");
        }

        Ok(())
    }

    /// Builds the full record that results from applying this update to `current`.
    pub fn apply_to(&self, current: &DeviceConfig) -> DeviceConfig {
        let mut next = current.clone();

        if let Some(name) = &self.name {
            next.name = truncated(name.trim());
        }
        if let Some(login) = &self.web_login {
            next.web_access.login = truncated(login.trim());
        }
        if let Some(password) = &self.web_password {
            next.web_access.password = truncated(password);
        }
        if let Some(ssid) = &self.hotspot_ssid {
            next.hotspot.login = truncated(ssid.trim());
        }
        if let Some(password) = &self.hotspot_password {
            next.hotspot.password = truncated(password);
        }

        if let Some(networks) = &self.wifi {
            next.wifi_networks.clear();
            for network in networks.iter().take(MAX_USER_WIFI) {
                let login = network.login.trim();
                let password = match &network.password {
                    Some(password) => password.as_str(),
                    None => current
                        .wifi_networks
                        .iter()
                        .find(|stored| stored.login.as_str() == login)
                        .map(|stored| stored.password.as_str())
                        .unwrap_or_default(),
                };
                let _ = next.wifi_networks.push(Credential::new(login, password));
            }
        }

        if let Some(brightness) = self.brightness {
            next.brightness = brightness;
        }
        if let Some(api_url) = &self.api_url {
            next.api_url = truncated(api_url.trim());
        }
        if let Some(ota_url) = &self.ota_url {
            next.ota_url = truncated(ota_url.trim());
        }
        if let Some(ota_auth) = &self.ota_auth {
            next.ota_auth = truncated(ota_auth.trim());
        }
        if let Some(delay) = self.api_check_delay_ms {
            next.api_check_delay_ms = delay;
        }
        if let Some(delay) = self.ota_check_delay_ms {
            next.ota_check_delay_ms = delay;
        }

        next
    }
}
