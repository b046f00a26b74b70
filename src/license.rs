// =============================================================================
// License / Session-Lock Client — validate, heartbeat, release
// =============================================================================
//
// Contract with the cloud service:
//   POST /validate   {license_key, device_fingerprint}
//                    -> {valid, expiration_iso, days_until_expiration,
//                        session_conflict, estimated_wait_seconds}
//   POST /heartbeat  every 20s; the server treats last heartbeat + 40s as
//                    session-active.
//   POST /release    on clean shutdown.
//
// At most one engine instance per license may be past login. Receiving
// session_conflict=true while holding a position is LICENSE_CONFLICT: the
// position is managed to its natural exit, no new entries, no forced flatten.
//
// Network failures leave the state Unknown; the risk gate treats Unknown as
// usable so a flaky cloud link never flattens a healthy book.
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Engine-side view of the license.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LicenseState {
    Valid { days_left: i64 },
    Expired,
    /// Another device validated while our heartbeat was active.
    Conflict,
    /// No successful validation yet (startup or cloud unreachable).
    Unknown,
}

impl LicenseState {
    /// Whether the engine may trade on this state at startup.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

impl std::fmt::Display for LicenseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Valid { days_left } => write!(f, "VALID({days_left}d)"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Conflict => write!(f, "CONFLICT"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Wire shape of POST /validate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(default)]
    pub expiration_iso: Option<String>,
    #[serde(default)]
    pub days_until_expiration: i64,
    #[serde(default)]
    pub session_conflict: bool,
    #[serde(default)]
    pub estimated_wait_seconds: Option<u64>,
}

impl ValidateResponse {
    /// Map a service response to the engine-side state.
    pub fn to_state(&self) -> LicenseState {
        if self.session_conflict {
            LicenseState::Conflict
        } else if self.valid {
            LicenseState::Valid {
                days_left: self.days_until_expiration,
            }
        } else {
            LicenseState::Expired
        }
    }
}

#[derive(Debug, Serialize)]
struct LicenseRequest<'a> {
    license_key: &'a str,
    device_fingerprint: &'a str,
}

/// HTTP client for the license service.
pub struct LicenseClient {
    http: reqwest::Client,
    base_url: String,
    license_key: String,
    device_fingerprint: String,
}

impl LicenseClient {
    pub fn new(base_url: impl Into<String>, license_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            license_key: license_key.into(),
            device_fingerprint: device_fingerprint(),
        }
    }

    /// POST /validate. Returns the raw response; callers map it with
    /// `to_state` so conflict handling stays in one place.
    pub async fn validate(&self) -> Result<ValidateResponse> {
        let url = format!("{}/validate", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&LicenseRequest {
                license_key: &self.license_key,
                device_fingerprint: &self.device_fingerprint,
            })
            .send()
            .await
            .context("license validate request failed")?
            .error_for_status()
            .context("license validate returned an error status")?;

        let body: ValidateResponse = resp
            .json()
            .await
            .context("license validate response was not valid JSON")?;

        info!(
            valid = body.valid,
            conflict = body.session_conflict,
            days_left = body.days_until_expiration,
            "license validated"
        );
        Ok(body)
    }

    /// POST /heartbeat. Failures are logged by the caller; a missed beat is
    /// not an emergency until the server expires the session (40s).
    pub async fn heartbeat(&self) -> Result<()> {
        let url = format!("{}/heartbeat", self.base_url);
        self.http
            .post(&url)
            .json(&LicenseRequest {
                license_key: &self.license_key,
                device_fingerprint: &self.device_fingerprint,
            })
            .send()
            .await
            .context("license heartbeat request failed")?
            .error_for_status()
            .context("license heartbeat returned an error status")?;
        Ok(())
    }

    /// POST /release on clean shutdown. Best-effort.
    pub async fn release(&self) -> Result<()> {
        let url = format!("{}/release", self.base_url);
        match self
            .http
            .post(&url)
            .json(&LicenseRequest {
                license_key: &self.license_key,
                device_fingerprint: &self.device_fingerprint,
            })
            .send()
            .await
        {
            Ok(_) => {
                info!("license session released");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "license release failed (ignored on shutdown)");
                Ok(())
            }
        }
    }
}

/// Stable per-host fingerprint sent with every license call.
fn device_fingerprint() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("{}-{}", host, std::process::id())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_response_maps_to_valid() {
        let r = ValidateResponse {
            valid: true,
            expiration_iso: Some("2026-01-01T00:00:00Z".to_string()),
            days_until_expiration: 120,
            session_conflict: false,
            estimated_wait_seconds: None,
        };
        assert_eq!(r.to_state(), LicenseState::Valid { days_left: 120 });
    }

    #[test]
    fn conflict_wins_over_valid() {
        // A conflicted-but-valid license is still a conflict for this device.
        let r = ValidateResponse {
            valid: true,
            expiration_iso: None,
            days_until_expiration: 10,
            session_conflict: true,
            estimated_wait_seconds: Some(40),
        };
        assert_eq!(r.to_state(), LicenseState::Conflict);
    }

    #[test]
    fn invalid_maps_to_expired() {
        let r = ValidateResponse {
            valid: false,
            expiration_iso: None,
            days_until_expiration: -3,
            session_conflict: false,
            estimated_wait_seconds: None,
        };
        assert_eq!(r.to_state(), LicenseState::Expired);
    }

    #[test]
    fn response_parses_with_missing_optionals() {
        let r: ValidateResponse = serde_json::from_str(r#"{ "valid": true }"#).unwrap();
        assert!(r.valid);
        assert!(!r.session_conflict);
        assert_eq!(r.days_until_expiration, 0);
    }
}
