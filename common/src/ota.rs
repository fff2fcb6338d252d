use core::fmt::Write as _;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DEFAULT_ERROR_RECOVERY_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OtaState {
    Idle,
    Push,
    Load,
    Flash,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaEvent {
    UpdateAvailable,
    DescriptorAccepted,
    DescriptorRejected,
    TransferVerified,
    TransferFailed,
    FlashFailed,
    Acknowledged,
}

impl OtaState {
    pub fn on(self, event: OtaEvent) -> Option<OtaState> {
        use OtaEvent::*;

        match (self, event) {
            (Self::Idle, UpdateAvailable) => Some(Self::Push),
            (Self::Push, DescriptorAccepted) => Some(Self::Load),
            (Self::Push, DescriptorRejected) => Some(Self::Idle),
            (Self::Load, TransferVerified) => Some(Self::Flash),
            (Self::Load, TransferFailed) => Some(Self::Error),
            (Self::Flash, FlashFailed) => Some(Self::Error),
            (Self::Error, Acknowledged) => Some(Self::Idle),
            _ => None,
        }
    }

    pub fn is_busy(self) -> bool {
        matches!(self, Self::Load | Self::Flash)
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Push => 1,
            Self::Load => 2,
            Self::Flash => 3,
            Self::Error => 9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("firmware transfer failed: {0}")]
    Transfer(String),
    #[error("firmware integrity check failed: {0}")]
    Integrity(String),
    #[error("firmware flash failed: {0}")]
    Flash(String),
    #[error("invalid update descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("no update: {0}")]
    NoUpdate(String),
    #[error("`{operation}` is not allowed in state {state:?}")]
    InvalidState {
        state: OtaState,
        operation: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SlotError(pub String);

/// Two firmware regions and the selector that picks the one to boot.
///
/// Writes only ever target the region that is not running.
pub trait FirmwareSlots {
    fn running_slot(&self) -> String;
    fn boot_slot(&self) -> String;
    fn capacity(&self) -> usize;
    fn begin(&mut self, len: usize) -> Result<(), SlotError>;
    fn write(&mut self, chunk: &[u8]) -> Result<(), SlotError>;
    /// Validates the written image and makes it the boot slot.
    fn commit(&mut self) -> Result<(), SlotError>;
    fn abort(&mut self);
}

/// Response metadata of a firmware check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateDescriptor {
    pub status: u16,
    pub content_length: Option<u64>,
    pub version: Option<String>,
    pub sha256: Option<String>,
}

/// Dotted numeric versions compare numerically; anything else is newer when it differs.
pub fn is_newer_version(offered: &str, running: &str) -> bool {
    fn numeric(version: &str) -> Option<Vec<u64>> {
        version
            .trim()
            .trim_start_matches(['v', 'V'])
            .split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect()
    }

    match (numeric(offered), numeric(running)) {
        (Some(mut offered), Some(mut running)) => {
            let len = offered.len().max(running.len());
            offered.resize(len, 0);
            running.resize(len, 0);
            offered > running
        }
        _ => offered.trim() != running.trim(),
    }
}

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn hex_digest(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct OtaStatus {
    pub state: OtaState,
    pub code: u8,
    #[serde(rename = "inProgress")]
    pub in_progress: bool,
    #[serde(rename = "bytesWritten")]
    pub bytes_written: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: Option<u64>,
    #[serde(rename = "progressPct")]
    pub progress_pct: Option<u8>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastSha256")]
    pub last_sha256: Option<String>,
    #[serde(rename = "offeredVersion")]
    pub offered_version: Option<String>,
    #[serde(rename = "runningVersion")]
    pub running_version: String,
    #[serde(rename = "runningSlot")]
    pub running_slot: String,
    #[serde(rename = "bootSlot")]
    pub boot_slot: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaSettings {
    pub error_recovery_ms: u64,
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            error_recovery_ms: DEFAULT_ERROR_RECOVERY_MS,
        }
    }
}

pub struct OtaController<P> {
    slots: P,
    settings: OtaSettings,
    running_version: String,
    state: OtaState,
    bytes_written: u64,
    total_bytes: Option<u64>,
    expected_sha256: Option<String>,
    hasher: Sha256,
    offered_version: Option<String>,
    last_error: Option<String>,
    last_sha256: Option<String>,
    error_since_ms: Option<u64>,
    clock_ms: u64,
}

impl<P: FirmwareSlots> OtaController<P> {
    pub fn new(slots: P, running_version: &str, settings: OtaSettings) -> Self {
        Self {
            slots,
            settings,
            running_version: running_version.to_string(),
            state: OtaState::Idle,
            bytes_written: 0,
            total_bytes: None,
            expected_sha256: None,
            hasher: Sha256::new(),
            offered_version: None,
            last_error: None,
            last_sha256: None,
            error_since_ms: None,
            clock_ms: 0,
        }
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn running_version(&self) -> &str {
        &self.running_version
    }

    pub fn slots(&self) -> &P {
        &self.slots
    }

    fn transition(&mut self, event: OtaEvent, operation: &'static str) -> Result<(), OtaError> {
        match self.state.on(event) {
            Some(next) => {
                debug!("ota {:?} --{event:?}--> {next:?}", self.state);
                self.state = next;
                Ok(())
            }
            None => Err(OtaError::InvalidState {
                state: self.state,
                operation,
            }),
        }
    }

    fn require(&self, state: OtaState, operation: &'static str) -> Result<(), OtaError> {
        if self.state == state {
            Ok(())
        } else {
            Err(OtaError::InvalidState {
                state: self.state,
                operation,
            })
        }
    }

    pub fn update_available(&mut self) -> Result<(), OtaError> {
        self.transition(OtaEvent::UpdateAvailable, "update_available")
    }

    fn validate_descriptor(&self, descriptor: &UpdateDescriptor) -> Result<usize, OtaError> {
        match descriptor.status {
            200 => {}
            304 => return Err(OtaError::NoUpdate("firmware not modified".to_string())),
            status => {
                return Err(OtaError::InvalidDescriptor(format!(
                    "unexpected http status {status}"
                )))
            }
        }

        let len = descriptor
            .content_length
            .filter(|len| *len > 0)
            .ok_or_else(|| OtaError::InvalidDescriptor("missing content length".to_string()))?;
        let capacity = self.slots.capacity();
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= capacity)
            .ok_or_else(|| {
                OtaError::InvalidDescriptor(format!(
                    "image of {len} bytes exceeds slot capacity of {capacity}"
                ))
            })?;

        if let Some(version) = &descriptor.version {
            if !is_newer_version(version, &self.running_version) {
                return Err(OtaError::NoUpdate(format!(
                    "offered {version}, running {}",
                    self.running_version
                )));
            }
        }

        if let Some(sha256) = &descriptor.sha256 {
            if !is_sha256_hex(sha256.trim()) {
                return Err(OtaError::InvalidDescriptor(
                    "x-firmware-sha256 must be 64 hex characters".to_string(),
                ));
            }
        }

        Ok(len)
    }

    pub fn accept_descriptor(&mut self, descriptor: UpdateDescriptor) -> Result<(), OtaError> {
        self.require(OtaState::Push, "accept_descriptor")?;

        let len = match self.validate_descriptor(&descriptor) {
            Ok(len) => len,
            Err(err) => {
                match &err {
                    OtaError::NoUpdate(reason) => debug!("no firmware update: {reason}"),
                    other => {
                        warn!("firmware update refused: {other}");
                        self.last_error = Some(other.to_string());
                    }
                }
                self.transition(OtaEvent::DescriptorRejected, "accept_descriptor")?;
                return Err(err);
            }
        };

        if let Err(err) = self.slots.begin(len) {
            warn!("failed to open update slot: {err}");
            self.last_error = Some(err.to_string());
            self.transition(OtaEvent::DescriptorRejected, "accept_descriptor")?;
            return Err(OtaError::Flash(err.0));
        }

        info!(
            "firmware update {} accepted ({len} bytes)",
            descriptor.version.as_deref().unwrap_or("(unversioned)")
        );
        self.bytes_written = 0;
        self.total_bytes = Some(len as u64);
        self.expected_sha256 = descriptor.sha256.map(|sha| sha.trim().to_ascii_lowercase());
        self.hasher = Sha256::new();
        self.offered_version = descriptor.version;
        self.last_error = None;
        self.transition(OtaEvent::DescriptorAccepted, "accept_descriptor")
    }

    pub fn reject_descriptor(&mut self, reason: &str) -> Result<(), OtaError> {
        self.require(OtaState::Push, "reject_descriptor")?;
        warn!("firmware check failed: {reason}");
        self.last_error = Some(reason.to_string());
        self.transition(OtaEvent::DescriptorRejected, "reject_descriptor")
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), OtaError> {
        self.require(OtaState::Load, "write_chunk")?;

        let written = self.bytes_written.saturating_add(chunk.len() as u64);
        if let Some(total) = self.total_bytes.filter(|total| written > *total) {
            return Err(self.fail_transfer(OtaError::Transfer(format!(
                "image is longer than the announced {total} bytes"
            ))));
        }

        if let Err(err) = self.slots.write(chunk) {
            return Err(self.fail_transfer(OtaError::Transfer(err.0)));
        }
        self.hasher.update(chunk);
        self.bytes_written = written;
        Ok(())
    }

    pub fn finish_transfer(&mut self) -> Result<(), OtaError> {
        self.require(OtaState::Load, "finish_transfer")?;

        let total = self.total_bytes.unwrap_or_default();
        if self.bytes_written != total {
            return Err(self.fail_transfer(OtaError::Transfer(format!(
                "received {} of {total} bytes",
                self.bytes_written
            ))));
        }

        let digest = hex_digest(&core::mem::take(&mut self.hasher).finalize());
        if let Some(expected) = &self.expected_sha256 {
            if *expected != digest {
                let err = OtaError::Integrity(format!(
                    "sha256 mismatch (expected {expected}, got {digest})"
                ));
                return Err(self.fail_transfer(err));
            }
        }

        info!("firmware image verified ({total} bytes, sha256 {digest})");
        self.last_sha256 = Some(digest);
        self.transition(OtaEvent::TransferVerified, "finish_transfer")
    }

    pub fn abort_transfer(&mut self, reason: &str) -> Result<(), OtaError> {
        self.require(OtaState::Load, "abort_transfer")?;
        self.fail_transfer(OtaError::Transfer(reason.to_string()));
        Ok(())
    }

    fn fail_transfer(&mut self, err: OtaError) -> OtaError {
        warn!("{err}");
        self.slots.abort();
        self.last_error = Some(err.to_string());
        self.state = self
            .state
            .on(OtaEvent::TransferFailed)
            .unwrap_or(OtaState::Error);
        self.error_since_ms = Some(self.clock_ms);
        err
    }

    /// Switches the boot selector. On success the caller restarts the device.
    pub fn flash(&mut self) -> Result<(), OtaError> {
        self.require(OtaState::Flash, "flash")?;

        match self.slots.commit() {
            Ok(()) => {
                info!(
                    "firmware committed; next boot from {}",
                    self.slots.boot_slot()
                );
                Ok(())
            }
            Err(err) => {
                warn!("firmware commit failed: {err}");
                self.last_error = Some(err.to_string());
                self.transition(OtaEvent::FlashFailed, "flash")?;
                self.error_since_ms = Some(self.clock_ms);
                Err(OtaError::Flash(err.0))
            }
        }
    }

    pub fn acknowledge(&mut self) -> Result<(), OtaError> {
        self.transition(OtaEvent::Acknowledged, "acknowledge")?;
        self.error_since_ms = None;
        self.bytes_written = 0;
        self.total_bytes = None;
        Ok(())
    }

    pub fn tick(&mut self, now_ms: u64) {
        self.clock_ms = now_ms;
        if self.state != OtaState::Error {
            self.error_since_ms = None;
            return;
        }

        let since = *self.error_since_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(since) >= self.settings.error_recovery_ms {
            info!("ota error expired; back to idle");
            let _ = self.acknowledge();
        }
    }

    pub fn status(&self) -> OtaStatus {
        let progress_pct = self
            .total_bytes
            .filter(|total| *total > 0)
            .map(|total| (self.bytes_written.saturating_mul(100) / total).min(100) as u8);

        OtaStatus {
            state: self.state,
            code: self.state.code(),
            in_progress: self.state.is_busy(),
            bytes_written: self.bytes_written,
            total_bytes: self.total_bytes,
            progress_pct,
            last_error: self.last_error.clone(),
            last_sha256: self.last_sha256.clone(),
            offered_version: self.offered_version.clone(),
            running_version: self.running_version.clone(),
            running_slot: self.slots.running_slot(),
            boot_slot: self.slots.boot_slot(),
        }
    }
}

const SLOT_LABELS: [&str; 2] = ["ota_0", "ota_1"];

#[derive(Debug)]
struct SlotBank {
    regions: [Vec<u8>; 2],
    running: usize,
    boot: usize,
    capacity: usize,
    pending: Option<(Vec<u8>, usize)>,
    fail_writes: bool,
    fail_commit: bool,
}

#[derive(Debug, Clone)]
pub struct MemorySlots {
    bank: Arc<Mutex<SlotBank>>,
}

impl MemorySlots {
    pub fn new(running_image: &[u8], capacity: usize) -> Self {
        Self {
            bank: Arc::new(Mutex::new(SlotBank {
                regions: [running_image.to_vec(), Vec::new()],
                running: 0,
                boot: 0,
                capacity,
                pending: None,
                fail_writes: false,
                fail_commit: false,
            })),
        }
    }

    fn with_bank<T>(&self, f: impl FnOnce(&mut SlotBank) -> T) -> T {
        let mut bank = self
            .bank
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut bank)
    }

    pub fn region(&self, label: &str) -> Option<Vec<u8>> {
        let index = SLOT_LABELS.iter().position(|slot| *slot == label)?;
        Some(self.with_bank(|bank| bank.regions[index].clone()))
    }

    pub fn running_image(&self) -> Vec<u8> {
        self.with_bank(|bank| bank.regions[bank.running].clone())
    }

    pub fn fail_writes(&self, fail: bool) {
        self.with_bank(|bank| bank.fail_writes = fail);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.with_bank(|bank| bank.fail_commit = fail);
    }
}

impl FirmwareSlots for MemorySlots {
    fn running_slot(&self) -> String {
        self.with_bank(|bank| SLOT_LABELS[bank.running].to_string())
    }

    fn boot_slot(&self) -> String {
        self.with_bank(|bank| SLOT_LABELS[bank.boot].to_string())
    }

    fn capacity(&self) -> usize {
        self.with_bank(|bank| bank.capacity)
    }

    fn begin(&mut self, len: usize) -> Result<(), SlotError> {
        self.with_bank(|bank| {
            if len > bank.capacity {
                return Err(SlotError(format!("{len} bytes do not fit the update slot")));
            }
            bank.pending = Some((Vec::with_capacity(len), len));
            Ok(())
        })
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), SlotError> {
        self.with_bank(|bank| {
            if bank.fail_writes {
                return Err(SlotError("flash write failed".to_string()));
            }
            let (buffer, _) = bank
                .pending
                .as_mut()
                .ok_or_else(|| SlotError("no update in progress".to_string()))?;
            buffer.extend_from_slice(chunk);
            Ok(())
        })
    }

    fn commit(&mut self) -> Result<(), SlotError> {
        self.with_bank(|bank| {
            let (image, len) = bank
                .pending
                .take()
                .ok_or_else(|| SlotError("no update in progress".to_string()))?;
            if bank.fail_commit {
                return Err(SlotError("image validation failed".to_string()));
            }
            if image.len() != len {
                return Err(SlotError(format!(
                    "image has {} bytes, expected {len}",
                    image.len()
                )));
            }
            let target = 1 - bank.running;
            bank.regions[target] = image;
            bank.boot = target;
            Ok(())
        })
    }

    fn abort(&mut self) {
        self.with_bank(|bank| bank.pending = None);
    }
}
