use base64::{prelude::BASE64_STANDARD, Engine as _};
use serde::Serialize;

use hard_status_common::{DeviceStatus, OtaError, UpdateError};

pub const AUTH_CHALLENGE: &str = "Basic realm=\"hard-status\"";

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Outcome of the last status API poll.
#[derive(Debug, Clone, Serialize)]
pub struct PollReport {
    #[serde(rename = "httpStatus")]
    pub http_status: Option<u16>,
    pub bytes: usize,
    pub error: Option<String>,
    pub epoch: i64,
}

impl PollReport {
    pub fn success(http_status: u16, bytes: usize) -> Self {
        Self {
            http_status: Some(http_status),
            bytes,
            error: None,
            epoch: chrono::Utc::now().timestamp(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            http_status: None,
            bytes: 0,
            error: Some(error.into()),
            epoch: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub device: DeviceStatus,
    #[serde(rename = "lastPoll")]
    pub last_poll: Option<PollReport>,
}

/// Splits an `Authorization: Basic ...` header value into login and password.
pub fn parse_basic_auth(header: Option<&str>) -> Option<(String, String)> {
    let value = header?.trim();
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (login, password) = decoded.split_once(':')?;
    Some((login.to_string(), password.to_string()))
}

pub fn update_error_status(err: &UpdateError) -> u16 {
    match err {
        UpdateError::OtaBusy => 409,
        UpdateError::Invalid(_) => 400,
        UpdateError::Storage(_) => 500,
    }
}

pub fn ota_error_status(err: &OtaError) -> u16 {
    match err {
        OtaError::InvalidState { .. } => 409,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hard_status_common::{OtaState, StorageError};

    fn header(credentials: &str) -> String {
        format!("Basic {}", BASE64_STANDARD.encode(credentials))
    }

    #[test]
    fn parses_basic_credentials() {
        let value = header("admin:change:me");
        assert_eq!(
            parse_basic_auth(Some(&value)),
            Some(("admin".to_string(), "change:me".to_string()))
        );

        let lower = value.replacen("Basic", "basic", 1);
        assert!(parse_basic_auth(Some(&lower)).is_some());
    }

    #[test]
    fn rejects_malformed_authorization() {
        assert_eq!(parse_basic_auth(None), None);
        assert_eq!(parse_basic_auth(Some("Bearer abc")), None);
        assert_eq!(parse_basic_auth(Some("Basic !!!")), None);
        let no_colon = header("admin");
        assert_eq!(parse_basic_auth(Some(&no_colon)), None);
    }

    #[test]
    fn maps_errors_to_http_status() {
        assert_eq!(update_error_status(&UpdateError::OtaBusy), 409);
        assert_eq!(update_error_status(&UpdateError::Invalid("bad")), 400);
        assert_eq!(
            update_error_status(&UpdateError::Storage(StorageError::Io("disk".to_string()))),
            500
        );
        assert_eq!(
            ota_error_status(&OtaError::InvalidState {
                state: OtaState::Idle,
                operation: "acknowledge",
            }),
            409
        );
        assert_eq!(ota_error_status(&OtaError::Flash("boom".to_string())), 500);
    }
}
