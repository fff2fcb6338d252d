//! Flat binary layout of [`DeviceConfig`].
//!
//! ```text
//! offset  size  field
//! 0       1     schema_version
//! 1       1     max_user_wifi
//! 2       1     max_string_length
//! 3       32    name
//! 35      64    web_access (login, password)
//! 99      64    hotspot
//! 163     256   wifi[4]
//! 419     1     brightness
//! 420     256   api_url
//! 676     256   ota_url
//! 932     256   ota_auth
//! 1188    2     api_check_delay_ms (LE)
//! 1190    2     ota_check_delay_ms (LE)
//! 1192    4     crc32 of everything before it (LE)
//! ```
//!
//! Strings are NUL padded. A block with the current version that stops at a
//! field boundary decodes with the missing trailing fields taken from defaults.

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::config::{
    truncated, Credential, DeviceConfig, CONFIG_VERSION, MAX_STRING_LENGTH, MAX_URL_LENGTH,
    MAX_USER_WIFI,
};
use crate::store::StorageError;

const HEADER_LEN: usize = 3;
const CREDENTIAL_LEN: usize = 2 * MAX_STRING_LENGTH;

pub const PAYLOAD_LEN: usize = HEADER_LEN
    + MAX_STRING_LENGTH
    + 2 * CREDENTIAL_LEN
    + MAX_USER_WIFI * CREDENTIAL_LEN
    + 1
    + 3 * MAX_URL_LENGTH
    + 2 * 2;
pub const CRC_LEN: usize = 4;
pub const RECORD_LEN: usize = PAYLOAD_LEN + CRC_LEN;

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn encode(config: &DeviceConfig) -> [u8; RECORD_LEN] {
    let mut block = [0_u8; RECORD_LEN];
    let mut writer = Writer {
        buf: &mut block[..PAYLOAD_LEN],
        pos: 0,
    };

    writer.u8(config.schema_version);
    writer.u8(config.max_user_wifi);
    writer.u8(config.max_string_length);
    writer.str(&config.name, MAX_STRING_LENGTH);
    writer.credential(&config.web_access);
    writer.credential(&config.hotspot);
    for slot in 0..MAX_USER_WIFI {
        match config.wifi_networks.get(slot) {
            Some(credential) => writer.credential(credential),
            None => writer.skip(CREDENTIAL_LEN),
        }
    }
    writer.u8(config.brightness);
    writer.str(&config.api_url, MAX_URL_LENGTH);
    writer.str(&config.ota_url, MAX_URL_LENGTH);
    writer.str(&config.ota_auth, MAX_URL_LENGTH);
    writer.u16(config.api_check_delay_ms);
    writer.u16(config.ota_check_delay_ms);
    debug_assert_eq!(writer.pos, PAYLOAD_LEN);

    let crc = CHECKSUM.checksum(&block[..PAYLOAD_LEN]);
    block[PAYLOAD_LEN..].copy_from_slice(&crc.to_le_bytes());
    block
}

pub fn stored_version(block: &[u8]) -> Option<u8> {
    block.first().copied()
}

pub fn decode(block: &[u8], defaults: &DeviceConfig) -> Result<DeviceConfig, StorageError> {
    if block.len() < 1 + CRC_LEN {
        return Err(StorageError::Truncated { offset: block.len() });
    }

    let (payload, trailer) = block.split_at(block.len() - CRC_LEN);
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = CHECKSUM.checksum(payload);
    if stored != computed {
        return Err(StorageError::ChecksumMismatch { stored, computed });
    }

    let version = payload[0];
    if version != CONFIG_VERSION {
        return Err(StorageError::VersionMismatch {
            stored: version,
            expected: CONFIG_VERSION,
        });
    }

    let mut config = defaults.clone();
    config.schema_version = version;

    let mut reader = Reader {
        buf: payload,
        pos: 1,
    };

    if let Some(max_user_wifi) = reader.u8()? {
        if usize::from(max_user_wifi) != MAX_USER_WIFI {
            return Err(StorageError::LayoutMismatch {
                field: "max_user_wifi",
            });
        }
        config.max_user_wifi = max_user_wifi;
    }
    if let Some(max_string_length) = reader.u8()? {
        if usize::from(max_string_length) != MAX_STRING_LENGTH {
            return Err(StorageError::LayoutMismatch {
                field: "max_string_length",
            });
        }
        config.max_string_length = max_string_length;
    }

    if let Some(name) = reader.str(MAX_STRING_LENGTH)? {
        config.name = truncated(name);
    }
    if let Some(credential) = reader.credential()? {
        config.web_access = credential;
    }
    if let Some(credential) = reader.credential()? {
        config.hotspot = credential;
    }

    let mut networks = heapless::Vec::new();
    let mut saw_networks = false;
    for _ in 0..MAX_USER_WIFI {
        let Some(credential) = reader.credential()? else {
            break;
        };
        saw_networks = true;
        if !credential.is_empty() {
            let _ = networks.push(credential);
        }
    }
    if saw_networks {
        config.wifi_networks = networks;
    }

    if let Some(brightness) = reader.u8()? {
        config.brightness = brightness;
    }
    if let Some(api_url) = reader.str(MAX_URL_LENGTH)? {
        config.api_url = truncated(api_url);
    }
    if let Some(ota_url) = reader.str(MAX_URL_LENGTH)? {
        config.ota_url = truncated(ota_url);
    }
    if let Some(ota_auth) = reader.str(MAX_URL_LENGTH)? {
        config.ota_auth = truncated(ota_auth);
    }
    if let Some(delay) = reader.u16()? {
        config.api_check_delay_ms = delay;
    }
    if let Some(delay) = reader.u16()? {
        config.ota_check_delay_ms = delay;
    }

    Ok(config)
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn u8(&mut self, value: u8) {
        self.buf[self.pos] = value;
        self.pos += 1;
    }

    fn u16(&mut self, value: u16) {
        self.buf[self.pos..self.pos + 2].copy_from_slice(&value.to_le_bytes());
        self.pos += 2;
    }

    // Leaves at least one trailing NUL in the field.
    fn str(&mut self, value: &str, field_len: usize) {
        let bytes = value.as_bytes();
        let len = bytes.len().min(field_len - 1);
        self.buf[self.pos..self.pos + len].copy_from_slice(&bytes[..len]);
        self.pos += field_len;
    }

    fn credential(&mut self, credential: &Credential) {
        self.str(&credential.login, MAX_STRING_LENGTH);
        self.str(&credential.password, MAX_STRING_LENGTH);
    }

    fn skip(&mut self, len: usize) {
        self.pos += len;
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<Option<&'a [u8]>, StorageError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(StorageError::Truncated { offset: self.pos });
        }
        let field = &self.buf[self.pos..end];
        self.pos = end;
        Ok(Some(field))
    }

    fn u8(&mut self) -> Result<Option<u8>, StorageError> {
        Ok(self.take(1)?.map(|field| field[0]))
    }

    fn u16(&mut self) -> Result<Option<u16>, StorageError> {
        Ok(self
            .take(2)?
            .map(|field| u16::from_le_bytes([field[0], field[1]])))
    }

    fn str(&mut self, field_len: usize) -> Result<Option<&'a str>, StorageError> {
        let Some(field) = self.take(field_len)? else {
            return Ok(None);
        };
        let len = field
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(field_len - 1);
        core::str::from_utf8(&field[..len])
            .map(Some)
            .map_err(|_| StorageError::Corrupt("string field is not valid utf-8"))
    }

    fn credential(&mut self) -> Result<Option<Credential>, StorageError> {
        let Some(login) = self.str(MAX_STRING_LENGTH)? else {
            return Ok(None);
        };
        let password = self
            .str(MAX_STRING_LENGTH)?
            .ok_or(StorageError::Truncated { offset: self.pos })?;
        Ok(Some(Credential::new(login, password)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigUpdate;
    use pretty_assertions::assert_eq;

    fn custom_config() -> DeviceConfig {
        let update: ConfigUpdate = serde_json::from_str(
            r#"{
                "name": "lobby-lamp",
                "wifi": [
                    {"login": "office", "password": "office-secret"},
                    {"login": "guest", "password": ""}
                ],
                "brightness": 7,
                "apiUrl": "https://ci.example.com/api/status?pipeline=main",
                "otaUrl": "https://fw.example.com/hard-status.bin",
                "apiCheckDelayMs": 5000
            }"#,
        )
        .unwrap();
        update.apply_to(&DeviceConfig::default())
    }

    #[test]
    fn layout_offsets_are_stable() {
        assert_eq!(PAYLOAD_LEN, 1192);
        assert_eq!(RECORD_LEN, 1196);
    }

    #[test]
    fn decodes_what_it_encodes() {
        let config = custom_config();
        let block = encode(&config);

        assert_eq!(stored_version(&block), Some(CONFIG_VERSION));
        assert_eq!(decode(&block, &DeviceConfig::default()).unwrap(), config);
    }

    #[test]
    fn equal_records_encode_identically() {
        assert_eq!(encode(&DeviceConfig::default()), encode(&DeviceConfig::default()));
        assert_ne!(encode(&DeviceConfig::default()), encode(&custom_config()));
    }

    #[test]
    fn rejects_other_versions() {
        let mut config = custom_config();
        config.schema_version = 255;
        let block = encode(&config);

        assert_eq!(
            decode(&block, &DeviceConfig::default()),
            Err(StorageError::VersionMismatch {
                stored: 255,
                expected: CONFIG_VERSION,
            })
        );
    }

    #[test]
    fn rejects_flipped_bits() {
        let mut block = encode(&custom_config());
        block[40] ^= 0x01;

        assert!(matches!(
            decode(&block, &DeviceConfig::default()),
            Err(StorageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn missing_trailing_fields_take_defaults() {
        let config = custom_config();
        let full = encode(&config);

        // An older build that ended the record after brightness.
        let cut = HEADER_LEN
            + MAX_STRING_LENGTH
            + 2 * CREDENTIAL_LEN
            + MAX_USER_WIFI * CREDENTIAL_LEN
            + 1;
        let mut short = full[..cut].to_vec();
        short.extend_from_slice(&CHECKSUM.checksum(&short).to_le_bytes());

        let defaults = DeviceConfig::default();
        let decoded = decode(&short, &defaults).unwrap();

        assert_eq!(decoded.name, config.name);
        assert_eq!(decoded.wifi_networks, config.wifi_networks);
        assert_eq!(decoded.brightness, 7);
        assert_eq!(decoded.api_url, defaults.api_url);
        assert_eq!(decoded.api_check_delay_ms, defaults.api_check_delay_ms);
    }

    #[test]
    fn field_cut_in_half_is_corruption() {
        let full = encode(&custom_config());
        let mut short = full[..HEADER_LEN + 10].to_vec();
        short.extend_from_slice(&CHECKSUM.checksum(&short).to_le_bytes());

        assert_eq!(
            decode(&short, &DeviceConfig::default()),
            Err(StorageError::Truncated { offset: HEADER_LEN })
        );
    }

    #[test]
    fn foreign_wifi_capacity_is_rejected() {
        let mut config = custom_config();
        config.max_user_wifi = 8;

        assert_eq!(
            decode(&encode(&config), &DeviceConfig::default()),
            Err(StorageError::LayoutMismatch {
                field: "max_user_wifi"
            })
        );
    }
}
