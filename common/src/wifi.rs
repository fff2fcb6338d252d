use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::config::Credential;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiState {
    Disconnected,
    Connecting(usize),
    Connected(usize),
    Onboarding,
}

impl WifiState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting(_) => "connecting",
            Self::Connected(_) => "connected",
            Self::Onboarding => "onboarding",
        }
    }

    pub fn network(self) -> Option<usize> {
        match self {
            Self::Connecting(index) | Self::Connected(index) => Some(index),
            Self::Disconnected | Self::Onboarding => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("network `{0}` not found")]
    NotFound(String),
    #[error("authentication with `{0}` failed")]
    AuthFailed(String),
    #[error("no link after {0} ms")]
    Timeout(u32),
    #[error("radio error: {0}")]
    Radio(String),
}

/// Station and access point control of the radio.
pub trait WifiRadio {
    fn connect(&mut self, credential: &Credential, timeout_ms: u32) -> Result<(), ConnectionError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    fn start_hotspot(&mut self, credential: &Credential) -> Result<(), ConnectionError>;
    fn stop_hotspot(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WifiSettings {
    pub connect_timeout_ms: u32,
    pub retry_interval_ms: u64,
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            retry_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WifiStatus {
    pub state: &'static str,
    pub network: Option<usize>,
    #[serde(rename = "hotspotUp")]
    pub hotspot_up: bool,
    pub attempts: u32,
    pub failures: u32,
    #[serde(rename = "lastConnected")]
    pub last_connected: Option<usize>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
}

/// Connects to the first reachable stored network, falling back to the
/// device's own access point.
pub struct WifiManager {
    settings: WifiSettings,
    state: WifiState,
    hotspot_up: bool,
    hotspot: Option<Credential>,
    retry_cursor: Option<usize>,
    next_retry_ms: u64,
    attempts: u32,
    failures: u32,
    last_connected: Option<usize>,
    last_error: Option<ConnectionError>,
}

impl WifiManager {
    pub fn new(settings: WifiSettings) -> Self {
        Self {
            settings,
            state: WifiState::Disconnected,
            hotspot_up: false,
            hotspot: None,
            retry_cursor: None,
            next_retry_ms: 0,
            attempts: 0,
            failures: 0,
            last_connected: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> WifiState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, WifiState::Connected(_))
    }

    pub fn is_onboarding(&self) -> bool {
        self.state == WifiState::Onboarding
    }

    pub fn status(&self) -> WifiStatus {
        WifiStatus {
            state: self.state.label(),
            network: self.state.network(),
            hotspot_up: self.hotspot_up,
            attempts: self.attempts,
            failures: self.failures,
            last_connected: self.last_connected,
            last_error: self.last_error.as_ref().map(ToString::to_string),
        }
    }

    pub fn start<R: WifiRadio>(
        &mut self,
        radio: &mut R,
        networks: &[Credential],
        hotspot: &Credential,
        now_ms: u64,
    ) {
        self.retry_cursor = None;

        for (index, credential) in networks.iter().enumerate() {
            self.state = WifiState::Connecting(index);
            if self.attempt(radio, index, credential) {
                self.state = WifiState::Connected(index);
                return;
            }
        }

        if networks.is_empty() {
            warn!("no wifi networks stored");
        } else {
            warn!("none of the {} stored wifi networks answered", networks.len());
        }
        self.enter_onboarding(radio, hotspot, now_ms);
    }

    /// Drops the link and queues a fresh pass over `networks` for the next
    /// ticks. A running hotspot stays up until a network answers.
    pub fn restart<R: WifiRadio>(
        &mut self,
        radio: &mut R,
        networks: &[Credential],
        hotspot: &Credential,
        now_ms: u64,
    ) {
        info!("restarting wifi");
        radio.disconnect();
        self.retry_cursor = None;

        if self.hotspot_up && self.hotspot.as_ref() != Some(hotspot) {
            radio.stop_hotspot();
            self.hotspot_up = false;
            self.ensure_hotspot(radio, hotspot);
        }

        if networks.is_empty() {
            self.enter_onboarding(radio, hotspot, now_ms);
        } else {
            self.state = WifiState::Connecting(0);
        }
    }

    pub fn tick<R: WifiRadio>(
        &mut self,
        radio: &mut R,
        networks: &[Credential],
        hotspot: &Credential,
        now_ms: u64,
    ) {
        match self.state {
            WifiState::Disconnected => {}
            WifiState::Connected(index) => {
                if !radio.is_connected() {
                    warn!("lost link to wifi network {index}; reconnecting");
                    radio.disconnect();
                    self.state = WifiState::Connecting(0);
                }
            }
            WifiState::Connecting(index) => {
                let Some(credential) = networks.get(index) else {
                    self.enter_onboarding(radio, hotspot, now_ms);
                    return;
                };
                if self.attempt(radio, index, credential) {
                    self.stop_hotspot(radio);
                    self.state = WifiState::Connected(index);
                } else if index + 1 < networks.len() {
                    self.state = WifiState::Connecting(index + 1);
                } else {
                    self.enter_onboarding(radio, hotspot, now_ms);
                }
            }
            WifiState::Onboarding => {
                self.ensure_hotspot(radio, hotspot);

                let index = match self.retry_cursor {
                    Some(index) => index,
                    None if now_ms >= self.next_retry_ms => {
                        if !networks.is_empty() {
                            debug!("retrying stored wifi networks in the background");
                        }
                        0
                    }
                    None => return,
                };

                let Some(credential) = networks.get(index) else {
                    self.finish_retry_pass(now_ms);
                    return;
                };

                if self.attempt(radio, index, credential) {
                    self.stop_hotspot(radio);
                    self.retry_cursor = None;
                    self.state = WifiState::Connected(index);
                    info!("left onboarding");
                } else if index + 1 < networks.len() {
                    self.retry_cursor = Some(index + 1);
                } else {
                    self.finish_retry_pass(now_ms);
                }
            }
        }
    }

    fn attempt<R: WifiRadio>(&mut self, radio: &mut R, index: usize, credential: &Credential) -> bool {
        self.attempts = self.attempts.saturating_add(1);
        info!("wifi connect attempt to `{}` (network {index})", credential.login);

        match radio.connect(credential, self.settings.connect_timeout_ms) {
            Ok(()) => {
                info!("wifi connected to `{}`", credential.login);
                self.last_connected = Some(index);
                true
            }
            Err(err) => {
                warn!("wifi connect to `{}` failed: {err}", credential.login);
                self.failures = self.failures.saturating_add(1);
                self.last_error = Some(err);
                false
            }
        }
    }

    fn enter_onboarding<R: WifiRadio>(&mut self, radio: &mut R, hotspot: &Credential, now_ms: u64) {
        self.state = WifiState::Onboarding;
        self.retry_cursor = None;
        self.next_retry_ms = now_ms.saturating_add(self.settings.retry_interval_ms);
        self.ensure_hotspot(radio, hotspot);
    }

    fn ensure_hotspot<R: WifiRadio>(&mut self, radio: &mut R, hotspot: &Credential) {
        if self.hotspot_up {
            return;
        }
        match radio.start_hotspot(hotspot) {
            Ok(()) => {
                info!("onboarding hotspot `{}` started", hotspot.login);
                self.hotspot_up = true;
                self.hotspot = Some(hotspot.clone());
            }
            Err(err) => warn!("failed to start onboarding hotspot `{}`: {err}", hotspot.login),
        }
    }

    fn stop_hotspot<R: WifiRadio>(&mut self, radio: &mut R) {
        if self.hotspot_up {
            radio.stop_hotspot();
            self.hotspot_up = false;
            info!("onboarding hotspot stopped");
        }
    }

    fn finish_retry_pass(&mut self, now_ms: u64) {
        self.retry_cursor = None;
        self.next_retry_ms = now_ms.saturating_add(self.settings.retry_interval_ms);
    }
}

#[derive(Debug, Default)]
struct SimulatedAir {
    networks: BTreeMap<String, String>,
    connected: Option<String>,
    hotspot: Option<String>,
    hotspot_fails: bool,
    attempts: Vec<String>,
    hotspot_at_attempt: Vec<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedRadio {
    air: Arc<Mutex<SimulatedAir>>,
}

impl SimulatedRadio {
    pub fn new<'a>(networks: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let radio = Self::default();
        for (ssid, password) in networks {
            radio.add_network(ssid, password);
        }
        radio
    }

    fn with_air<T>(&self, f: impl FnOnce(&mut SimulatedAir) -> T) -> T {
        let mut air = self
            .air
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut air)
    }

    pub fn add_network(&self, ssid: &str, password: &str) {
        self.with_air(|air| {
            air.networks.insert(ssid.to_string(), password.to_string());
        });
    }

    pub fn remove_network(&self, ssid: &str) {
        self.with_air(|air| {
            air.networks.remove(ssid);
            if air.connected.as_deref() == Some(ssid) {
                air.connected = None;
            }
        });
    }

    pub fn fail_hotspot(&self, fail: bool) {
        self.with_air(|air| air.hotspot_fails = fail);
    }

    pub fn attempts(&self) -> Vec<String> {
        self.with_air(|air| air.attempts.clone())
    }

    pub fn attempt_log(&self) -> Vec<(String, bool)> {
        self.with_air(|air| {
            air.attempts
                .iter()
                .cloned()
                .zip(air.hotspot_at_attempt.iter().copied())
                .collect()
        })
    }

    pub fn connected_to(&self) -> Option<String> {
        self.with_air(|air| air.connected.clone())
    }

    pub fn hotspot(&self) -> Option<String> {
        self.with_air(|air| air.hotspot.clone())
    }
}

impl WifiRadio for SimulatedRadio {
    fn connect(&mut self, credential: &Credential, _timeout_ms: u32) -> Result<(), ConnectionError> {
        self.with_air(|air| {
            let ssid = credential.login.to_string();
            air.attempts.push(ssid.clone());
            let hotspot_up = air.hotspot.is_some();
            air.hotspot_at_attempt.push(hotspot_up);
            match air.networks.get(&ssid) {
                None => Err(ConnectionError::NotFound(ssid)),
                Some(password) if password.as_str() != credential.password.as_str() => {
                    Err(ConnectionError::AuthFailed(ssid))
                }
                Some(_) => {
                    air.connected = Some(ssid);
                    Ok(())
                }
            }
        })
    }

    fn disconnect(&mut self) {
        self.with_air(|air| air.connected = None);
    }

    fn is_connected(&self) -> bool {
        self.with_air(|air| air.connected.is_some())
    }

    fn start_hotspot(&mut self, credential: &Credential) -> Result<(), ConnectionError> {
        self.with_air(|air| {
            if air.hotspot_fails {
                return Err(ConnectionError::Radio("access point refused to start".to_string()));
            }
            air.hotspot = Some(credential.login.to_string());
            Ok(())
        })
    }

    fn stop_hotspot(&mut self) {
        self.with_air(|air| air.hotspot = None);
    }
}
