use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Username/secret pair presented to a device. The secret never appears in logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &format_args!("[{} chars]", self.password.len()))
            .finish()
    }
}

/// Identity and configuration of one registered device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    /// Stable key; the device's network address
    pub id: String,
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing)]
    pub credentials: Credentials,
    pub manufacturer: String,
    pub model: String,
    pub firmware_version: String,
    pub serial_number: String,
    /// Empty when the device would not hand out a stream URI
    pub stream_uri: String,
    pub display_name: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CameraRecord {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Metadata returned by GetDeviceInformation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub firmware_version: String,
    pub serial_number: String,
}

/// One media profile as reported by GetProfiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaProfile {
    pub token: String,
    pub name: String,
    /// Encoder FrameRateLimit, when the profile carries a video encoder
    pub frame_rate_limit: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraState {
    /// Never polled
    Unknown,
    Online,
    /// Reachable, but returned malformed or partial data
    Issue,
    Offline,
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraState::Unknown => write!(f, "unknown"),
            CameraState::Online => write!(f, "online"),
            CameraState::Issue => write!(f, "issue"),
            CameraState::Offline => write!(f, "offline"),
        }
    }
}

/// Derived liveness of one camera. Owned by the health monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraStatus {
    pub camera_id: String,
    pub state: CameraState,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub current_fps: f32,
}

impl CameraStatus {
    pub fn unknown(camera_id: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            state: CameraState::Unknown,
            last_seen_at: None,
            consecutive_failures: 0,
            current_fps: 0.0,
        }
    }
}

/// A device that answered a discovery probe. Lives for one discovery cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryCandidate {
    pub address: String,
    pub port: u16,
    pub probe_response_raw: String,
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveryCandidate {
    /// Candidate for an operator-supplied endpoint that was never probed.
    pub fn manual(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            probe_response_raw: String::new(),
            discovered_at: Utc::now(),
        }
    }

    pub fn endpoint_key(&self) -> (String, u16) {
        (self.address.clone(), self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub issues: usize,
    pub avg_fps: f32,
}

/// Record paired with its current status, for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraOverview {
    #[serde(flatten)]
    pub record: CameraRecord,
    pub status: CameraStatus,
}
