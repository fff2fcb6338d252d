use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::config::{ConfigUpdate, ConfigView, DeviceConfig};
use crate::ota::{
    FirmwareSlots, OtaController, OtaError, OtaSettings, OtaState, OtaStatus, UpdateDescriptor,
};
use crate::store::{BlockStorage, ConfigStore, StorageError};
use crate::url::ClientUrl;
use crate::wifi::{WifiManager, WifiRadio, WifiSettings, WifiStatus};

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub wifi: WifiSettings,
    pub ota: OtaSettings,
    pub firmware_version: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            wifi: WifiSettings::default(),
            ota: OtaSettings::default(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Work the platform runtime performs on behalf of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    PollStatus {
        url: ClientUrl,
    },
    CheckFirmware {
        url: ClientUrl,
        auth: Option<String>,
    },
    Restart,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("a firmware update is in progress")]
    OtaBusy,
    #[error("{0}")]
    Invalid(&'static str),
    #[error("failed to persist config: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    #[serde(rename = "wifiRestarted")]
    pub wifi_restarted: bool,
    pub config: ConfigView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Indicator {
    Normal,
    Onboarding,
    Updating,
    UpdateFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub name: String,
    #[serde(rename = "firmwareVersion")]
    pub firmware_version: String,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    pub brightness: u8,
    pub onboarding: bool,
    pub indicator: Indicator,
    pub wifi: WifiStatus,
    pub ota: OtaStatus,
}

/// Owns the stored config, the radio and the firmware slots; the only writer of all three.
pub struct Device<S, R, P> {
    store: ConfigStore<S>,
    config: DeviceConfig,
    radio: R,
    wifi: WifiManager,
    ota: OtaController<P>,
    boot_ms: u64,
    next_poll_ms: u64,
    next_firmware_check_ms: u64,
    firmware_check_requested: bool,
}

impl<S, R, P> Device<S, R, P>
where
    S: BlockStorage,
    R: WifiRadio,
    P: FirmwareSlots,
{
    pub fn boot(storage: S, mut radio: R, slots: P, settings: DeviceSettings, now_ms: u64) -> Self {
        let mut store = ConfigStore::new(storage);
        let config = store.load();
        info!(
            "booting `{}` firmware {} with {} stored wifi networks",
            config.name,
            settings.firmware_version,
            config.wifi_networks.len()
        );

        let mut wifi = WifiManager::new(settings.wifi);
        wifi.start(&mut radio, &config.wifi_networks, &config.hotspot, now_ms);

        Self {
            store,
            config,
            radio,
            wifi,
            ota: OtaController::new(slots, &settings.firmware_version, settings.ota),
            boot_ms: now_ms,
            next_poll_ms: now_ms,
            next_firmware_check_ms: now_ms,
            firmware_check_requested: false,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn config_view(&self) -> ConfigView {
        ConfigView::from(&self.config)
    }

    pub fn storage(&self) -> &S {
        self.store.storage()
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn slots(&self) -> &P {
        self.ota.slots()
    }

    pub fn ota_state(&self) -> OtaState {
        self.ota.state()
    }

    pub fn ota_status(&self) -> OtaStatus {
        self.ota.status()
    }

    pub fn firmware_version(&self) -> &str {
        self.ota.running_version()
    }

    pub fn authorize(&self, login: &str, password: &str) -> bool {
        self.config.web_access.matches(login, password)
    }

    fn ensure_not_busy(&self) -> Result<(), UpdateError> {
        if self.ota.state().is_busy() {
            Err(UpdateError::OtaBusy)
        } else {
            Ok(())
        }
    }

    pub fn update_config(
        &mut self,
        update: ConfigUpdate,
        now_ms: u64,
    ) -> Result<UpdateOutcome, UpdateError> {
        self.ensure_not_busy()?;
        update.validate().map_err(UpdateError::Invalid)?;

        let next = update.apply_to(&self.config);
        if next == self.config {
            debug!("config update changed nothing");
            return Ok(UpdateOutcome {
                wifi_restarted: false,
                config: self.config_view(),
            });
        }

        self.store.save(&next)?;
        let wifi_changed = next.wifi_settings_differ(&self.config);
        if next.api_check_delay_ms != self.config.api_check_delay_ms {
            self.next_poll_ms = now_ms;
        }
        self.config = next;
        info!("config updated");

        if wifi_changed {
            self.restart_wifi(now_ms);
        }

        Ok(UpdateOutcome {
            wifi_restarted: wifi_changed,
            config: self.config_view(),
        })
    }

    pub fn factory_reset(&mut self, now_ms: u64) -> Result<UpdateOutcome, UpdateError> {
        self.ensure_not_busy()?;

        self.config = self.store.reset();
        self.next_poll_ms = now_ms;
        self.next_firmware_check_ms = now_ms;
        self.restart_wifi(now_ms);

        Ok(UpdateOutcome {
            wifi_restarted: true,
            config: self.config_view(),
        })
    }

    fn restart_wifi(&mut self, now_ms: u64) {
        self.wifi.restart(
            &mut self.radio,
            &self.config.wifi_networks,
            &self.config.hotspot,
            now_ms,
        );
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<DeviceAction> {
        let mut actions = Vec::new();

        self.wifi.tick(
            &mut self.radio,
            &self.config.wifi_networks,
            &self.config.hotspot,
            now_ms,
        );

        self.ota.tick(now_ms);
        if self.ota.state() == OtaState::Load && !self.wifi.is_connected() {
            let _ = self.ota.abort_transfer("wifi link lost during download");
        }

        if self.ota.state().is_busy() || !self.wifi.is_connected() {
            return actions;
        }

        if now_ms >= self.next_poll_ms {
            self.next_poll_ms = now_ms.saturating_add(u64::from(self.config.api_check_delay_ms));
            match self.config.status_url() {
                Ok(url) => actions.push(DeviceAction::PollStatus { url }),
                Err(err) => warn!("skipping status poll, apiUrl is unusable: {err}"),
            }
        }

        if self.firmware_check_requested || now_ms >= self.next_firmware_check_ms {
            if let Some(action) = self.firmware_check(now_ms) {
                actions.push(action);
            }
        }

        actions
    }

    fn firmware_check(&mut self, now_ms: u64) -> Option<DeviceAction> {
        self.next_firmware_check_ms =
            now_ms.saturating_add(u64::from(self.config.ota_check_delay_ms));
        self.firmware_check_requested = false;

        if self.ota.state() != OtaState::Idle {
            return None;
        }
        if self.config.ota_url.is_empty() {
            debug!("no otaUrl configured; skipping firmware check");
            return None;
        }

        let url = match self.config.firmware_url() {
            Ok(url) => url,
            Err(err) => {
                warn!("skipping firmware check, otaUrl is unusable: {err}");
                return None;
            }
        };
        self.ota.update_available().ok()?;

        let auth = (!self.config.ota_auth.is_empty()).then(|| self.config.ota_auth.to_string());
        Some(DeviceAction::CheckFirmware { url, auth })
    }

    /// Operator "check now". Runs on the spot when online, otherwise once the link is up.
    pub fn request_firmware_check(&mut self, now_ms: u64) -> Result<Vec<DeviceAction>, UpdateError> {
        if self.ota.state() != OtaState::Idle {
            return Err(UpdateError::OtaBusy);
        }
        if !self.wifi.is_connected() {
            info!("firmware check queued until wifi is connected");
            self.firmware_check_requested = true;
            return Ok(Vec::new());
        }
        Ok(self.firmware_check(now_ms).into_iter().collect())
    }

    pub fn begin_firmware_update(&mut self, descriptor: UpdateDescriptor) -> Result<(), OtaError> {
        self.ota.accept_descriptor(descriptor)
    }

    pub fn firmware_check_failed(&mut self, reason: &str) {
        if let Err(err) = self.ota.reject_descriptor(reason) {
            debug!("ignoring failed firmware check: {err}");
        }
    }

    pub fn write_firmware_chunk(&mut self, chunk: &[u8]) -> Result<(), OtaError> {
        self.ota.write_chunk(chunk)
    }

    pub fn abort_firmware_update(&mut self, reason: &str) {
        if let Err(err) = self.ota.abort_transfer(reason) {
            debug!("nothing to abort: {err}");
        }
    }

    /// Verifies the received image and switches the boot slot.
    pub fn complete_firmware_update(&mut self) -> Result<Vec<DeviceAction>, OtaError> {
        self.ota.finish_transfer()?;
        self.ota.flash()?;
        Ok(vec![DeviceAction::Restart])
    }

    pub fn acknowledge_ota_error(&mut self) -> Result<(), OtaError> {
        self.ota.acknowledge()
    }

    pub fn request_restart(&self) -> Result<Vec<DeviceAction>, UpdateError> {
        self.ensure_not_busy()?;
        Ok(vec![DeviceAction::Restart])
    }

    pub fn indicator(&self) -> Indicator {
        match self.ota.state() {
            OtaState::Error => Indicator::UpdateFailed,
            OtaState::Load | OtaState::Flash => Indicator::Updating,
            OtaState::Idle | OtaState::Push if self.wifi.is_onboarding() => Indicator::Onboarding,
            OtaState::Idle | OtaState::Push => Indicator::Normal,
        }
    }

    pub fn status(&self, now_ms: u64) -> DeviceStatus {
        DeviceStatus {
            name: self.config.name.to_string(),
            firmware_version: self.ota.running_version().to_string(),
            uptime_ms: now_ms.saturating_sub(self.boot_ms),
            brightness: self.config.brightness,
            onboarding: self.wifi.is_onboarding(),
            indicator: self.indicator(),
            wifi: self.wifi.status(),
            ota: self.ota.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{truncated, Credential, CredentialUpdate, DEFAULT_NAME};
    use crate::layout;
    use crate::ota::MemorySlots;
    use crate::store::MemoryStorage;
    use crate::wifi::{SimulatedRadio, WifiState};
    use pretty_assertions::assert_eq;

    type TestDevice = Device<MemoryStorage, SimulatedRadio, MemorySlots>;

    const API_DELAY: u16 = 2_000;
    const OTA_DELAY: u16 = 5_000;

    fn stored_config() -> DeviceConfig {
        let mut config = DeviceConfig::default();
        config.wifi_networks.clear();
        config
            .wifi_networks
            .push(Credential::new("office", "office-pass"))
            .unwrap();
        config.api_url = truncated("http://ci.local:8080/status?team=main");
        config.ota_url = truncated("https://fw.example.com/hard-status.bin");
        config.api_check_delay_ms = API_DELAY;
        config.ota_check_delay_ms = OTA_DELAY;
        config
    }

    fn settings() -> DeviceSettings {
        DeviceSettings {
            wifi: WifiSettings {
                connect_timeout_ms: 100,
                retry_interval_ms: 1_000,
            },
            ota: OtaSettings {
                error_recovery_ms: 10_000,
            },
            firmware_version: "1.0.0".to_string(),
        }
    }

    fn boot_online() -> (TestDevice, MemoryStorage, SimulatedRadio, MemorySlots) {
        let storage = MemoryStorage::with_block(layout::encode(&stored_config()).to_vec());
        let radio = SimulatedRadio::new([("office", "office-pass")]);
        let slots = MemorySlots::new(b"factory image", 1 << 16);
        let device = Device::boot(storage.clone(), radio.clone(), slots.clone(), settings(), 0);
        (device, storage, radio, slots)
    }

    fn descriptor(image: &[u8]) -> UpdateDescriptor {
        UpdateDescriptor {
            status: 200,
            content_length: Some(image.len() as u64),
            version: Some("1.1.0".to_string()),
            sha256: None,
        }
    }

    #[test]
    fn first_boot_persists_defaults_and_onboards() {
        let storage = MemoryStorage::new();
        let radio = SimulatedRadio::default();
        let device = Device::boot(
            storage.clone(),
            radio.clone(),
            MemorySlots::new(b"factory image", 1024),
            settings(),
            0,
        );

        assert_eq!(device.config().name.as_str(), DEFAULT_NAME);
        assert!(storage.block().is_some());
        assert_eq!(radio.hotspot().as_deref(), Some(DEFAULT_NAME));

        let status = device.status(1_500);
        assert!(status.onboarding);
        assert_eq!(status.indicator, Indicator::Onboarding);
        assert_eq!(status.uptime_ms, 1_500);
    }

    #[test]
    fn schedules_polls_and_firmware_checks() {
        let (mut device, _, _, _) = boot_online();

        let actions = device.tick(0);
        assert_eq!(actions.len(), 2);
        match &actions[0] {
            DeviceAction::PollStatus { url } => {
                assert_eq!(url.host, "ci.local");
                assert_eq!(url.port, 8080);
                assert_eq!(url.request_target(), "/status?team=main");
            }
            other => panic!("unexpected action {other:?}"),
        }
        match &actions[1] {
            DeviceAction::CheckFirmware { url, auth } => {
                assert!(url.secure);
                assert_eq!(auth.as_deref(), Some(crate::config::DEFAULT_OTA_AUTH));
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(device.ota_state(), OtaState::Push);

        device.firmware_check_failed("connection refused");
        assert_eq!(device.ota_state(), OtaState::Idle);

        assert!(device.tick(1_000).is_empty());
        assert!(matches!(
            device.tick(u64::from(API_DELAY)).as_slice(),
            [DeviceAction::PollStatus { .. }]
        ));
        let at_ota_delay = device.tick(u64::from(OTA_DELAY));
        assert!(at_ota_delay
            .iter()
            .any(|action| matches!(action, DeviceAction::CheckFirmware { .. })));
    }

    #[test]
    fn unusable_status_url_skips_the_cycle() {
        let mut config = stored_config();
        config.api_url = truncated("ci.local/status");
        config.ota_url.clear();
        let storage = MemoryStorage::with_block(layout::encode(&config).to_vec());
        let radio = SimulatedRadio::new([("office", "office-pass")]);
        let mut device = Device::boot(
            storage,
            radio,
            MemorySlots::new(b"factory image", 1024),
            settings(),
            0,
        );

        assert!(device.tick(0).is_empty());
        assert_eq!(device.ota_state(), OtaState::Idle);
    }

    #[test]
    fn firmware_update_end_to_end() {
        let (mut device, _, _, slots) = boot_online();
        let image = b"the next firmware".to_vec();

        let actions = device.request_firmware_check(10).unwrap();
        assert!(matches!(actions.as_slice(), [DeviceAction::CheckFirmware { .. }]));

        device.begin_firmware_update(descriptor(&image)).unwrap();
        assert_eq!(device.indicator(), Indicator::Updating);
        for chunk in image.chunks(5) {
            device.write_firmware_chunk(chunk).unwrap();
        }
        assert!(device.tick(20).is_empty());

        assert_eq!(device.complete_firmware_update().unwrap(), vec![DeviceAction::Restart]);
        assert_eq!(slots.boot_slot(), "ota_1");
        assert_eq!(slots.region("ota_1"), Some(image));
    }

    #[test]
    fn config_is_locked_while_loading() {
        let (mut device, storage, _, _) = boot_online();
        device.request_firmware_check(0).unwrap();
        device.begin_firmware_update(descriptor(b"abcdef")).unwrap();
        let writes = storage.write_count();

        let update = ConfigUpdate {
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            device.update_config(update, 5),
            Err(UpdateError::OtaBusy)
        ));
        assert!(matches!(device.factory_reset(5), Err(UpdateError::OtaBusy)));
        assert!(matches!(device.request_restart(), Err(UpdateError::OtaBusy)));
        assert_eq!(storage.write_count(), writes);
        assert_eq!(device.config().name.as_str(), DEFAULT_NAME);
    }

    #[test]
    fn link_loss_aborts_download() {
        let (mut device, _, radio, slots) = boot_online();
        device.request_firmware_check(0).unwrap();
        device.begin_firmware_update(descriptor(b"abcdef")).unwrap();
        device.write_firmware_chunk(b"abc").unwrap();

        radio.remove_network("office");
        device.tick(100);

        assert_eq!(device.ota_state(), OtaState::Error);
        assert_eq!(device.indicator(), Indicator::UpdateFailed);
        assert!(device.write_firmware_chunk(b"def").is_err());
        assert_eq!(slots.boot_slot(), "ota_0");

        device.acknowledge_ota_error().unwrap();
        assert_eq!(device.ota_state(), OtaState::Idle);
    }

    #[test]
    fn credential_change_restarts_wifi() {
        let (mut device, storage, radio, _) = boot_online();
        radio.add_network("lab", "lab-password");

        let update = ConfigUpdate {
            wifi: Some(vec![
                CredentialUpdate {
                    login: "lab".to_string(),
                    password: Some("lab-password".to_string()),
                },
                CredentialUpdate {
                    login: "office".to_string(),
                    password: None,
                },
            ]),
            ..Default::default()
        };
        let outcome = device.update_config(update, 50).unwrap();

        assert!(outcome.wifi_restarted);
        assert_eq!(outcome.config.wifi.len(), 2);
        assert_eq!(device.status(50).wifi.state, WifiState::Connecting(0).label());

        device.tick(60);
        assert_eq!(device.status(60).wifi.state, WifiState::Connected(0).label());
        assert_eq!(radio.connected_to().as_deref(), Some("lab"));
        assert_eq!(
            device.config().wifi_networks[1],
            Credential::new("office", "office-pass")
        );

        let stored = layout::decode(&storage.block().unwrap(), &DeviceConfig::default()).unwrap();
        assert_eq!(&stored, device.config());
    }

    #[test]
    fn onboarding_update_returns_before_trying_networks() {
        let radio = SimulatedRadio::default();
        let mut device = Device::boot(
            MemoryStorage::new(),
            radio.clone(),
            MemorySlots::new(b"factory image", 1024),
            settings(),
            0,
        );
        let boot_attempts = radio.attempts().len();

        let update = ConfigUpdate {
            wifi: Some(
                ["n0", "n1", "n2", "n3"]
                    .iter()
                    .map(|ssid| CredentialUpdate {
                        login: ssid.to_string(),
                        password: Some("wrong-pass".to_string()),
                    })
                    .collect(),
            ),
            ..Default::default()
        };
        assert!(device.update_config(update, 100).unwrap().wifi_restarted);
        assert_eq!(radio.attempts().len(), boot_attempts);
        assert_eq!(radio.hotspot().as_deref(), Some(DEFAULT_NAME));

        for now in [110, 120, 130, 140] {
            device.tick(now);
        }

        assert_eq!(
            radio.attempt_log()[boot_attempts..].to_vec(),
            vec![
                ("n0".to_string(), true),
                ("n1".to_string(), true),
                ("n2".to_string(), true),
                ("n3".to_string(), true),
            ]
        );
        assert!(device.status(140).onboarding);
        assert_eq!(radio.hotspot().as_deref(), Some(DEFAULT_NAME));
    }

    #[test]
    fn plain_update_keeps_wifi_up() {
        let (mut device, _, radio, _) = boot_online();
        let attempts = radio.attempts().len();

        let outcome = device
            .update_config(
                ConfigUpdate {
                    brightness: Some(3),
                    ..Default::default()
                },
                50,
            )
            .unwrap();

        assert!(!outcome.wifi_restarted);
        assert_eq!(device.status(60).brightness, 3);
        assert_eq!(radio.attempts().len(), attempts);
    }

    #[test]
    fn rejected_updates_change_nothing() {
        let (mut device, storage, _, _) = boot_online();

        let invalid = ConfigUpdate {
            web_password: Some(String::new()),
            ..Default::default()
        };
        assert!(matches!(
            device.update_config(invalid, 0),
            Err(UpdateError::Invalid("webPassword must be 1-31 bytes"))
        ));

        storage.fail_writes(true);
        let update = ConfigUpdate {
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            device.update_config(update, 0),
            Err(UpdateError::Storage(_))
        ));
        assert_eq!(device.config(), &stored_config());
    }

    #[test]
    fn saved_updates_load_back_unchanged() {
        let (mut device, storage, _, _) = boot_online();

        let nul = ConfigUpdate {
            name: Some("lab\0lamp".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            device.update_config(nul, 0),
            Err(UpdateError::Invalid(_))
        ));

        let update = ConfigUpdate {
            name: Some("lab lamp ünïcode".to_string()),
            ota_auth: Some("ci:s3cr3t".to_string()),
            ..Default::default()
        };
        device.update_config(update, 0).unwrap();

        let loaded = ConfigStore::new(storage.clone()).load();
        assert_eq!(&loaded, device.config());
        assert_eq!(loaded.name.as_str(), "lab lamp ünïcode");
    }

    #[test]
    fn factory_reset_restores_defaults() {
        let (mut device, storage, radio, _) = boot_online();

        let outcome = device.factory_reset(100).unwrap();

        assert!(outcome.wifi_restarted);
        assert_eq!(device.config(), &DeviceConfig::default());
        assert_eq!(
            storage.block(),
            Some(layout::encode(&DeviceConfig::default()).to_vec())
        );

        device.tick(110);
        assert_eq!(radio.hotspot().as_deref(), Some(DEFAULT_NAME));
        assert!(device.authorize("admin", crate::config::DEFAULT_PASSWORD));
        assert!(!device.authorize("admin", "wrong"));
    }

    #[test]
    fn firmware_check_waits_for_wifi() {
        let storage = MemoryStorage::with_block(layout::encode(&stored_config()).to_vec());
        let radio = SimulatedRadio::default();
        let mut device = Device::boot(
            storage,
            radio.clone(),
            MemorySlots::new(b"factory image", 1024),
            settings(),
            0,
        );

        assert!(device.request_firmware_check(0).unwrap().is_empty());
        assert!(device.tick(10).is_empty());

        radio.add_network("office", "office-pass");
        assert!(device.tick(999).is_empty());

        // The background pass starts once the retry interval has passed.
        let actions = device.tick(1_000);
        assert!(device.status(1_000).wifi.state == "connected");
        assert!(actions
            .iter()
            .any(|action| matches!(action, DeviceAction::CheckFirmware { .. })));
    }
}
