//! Scripted in-process stand-in for a camera fleet.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::{ProtocolError, ProtocolResult};
use crate::models::{Credentials, DeviceInfo, DiscoveryCandidate, MediaProfile};
use crate::onvif::{DeviceHandle, OnvifClient};
use crate::ws_discovery::CandidateStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Healthy,
    /// Every call blocks forever, ignoring the supplied timeout
    Hang,
    Unreachable,
    /// Answers, but device information is unusable
    Malformed,
    /// Answers, but refuses to hand out a stream URI
    NoStream,
    /// Accepts the connection, then every later call blocks forever
    Stall,
}

#[derive(Debug, Clone)]
pub struct FakeDevice {
    /// Empty means any credentials are accepted
    pub accepted: Vec<Credentials>,
    pub behavior: Behavior,
    pub info: DeviceInfo,
    pub frame_rate_limit: Option<f32>,
}

impl FakeDevice {
    pub fn accepting(credentials: Credentials) -> Self {
        Self {
            accepted: vec![credentials],
            behavior: Behavior::Healthy,
            info: DeviceInfo {
                manufacturer: "ACME".to_string(),
                model: "LPR-200".to_string(),
                firmware_version: "1.0.0".to_string(),
                serial_number: "SN-0001".to_string(),
            },
            frame_rate_limit: Some(25.0),
        }
    }

    pub fn rejecting_all() -> Self {
        Self { accepted: vec![Credentials::new("__nobody__", "__never__")], ..Self::accepting(Credentials::new("", "")) }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_info(mut self, manufacturer: &str, model: &str, firmware: &str) -> Self {
        self.info.manufacturer = manufacturer.to_string();
        self.info.model = model.to_string();
        self.info.firmware_version = firmware.to_string();
        self
    }
}

#[derive(Default)]
pub struct FakeOnvif {
    devices: Mutex<HashMap<(String, u16), FakeDevice>>,
    probe_results: Mutex<Vec<(String, u16)>>,
    attempts: Mutex<Vec<(String, String)>>,
    closed: Mutex<usize>,
}

impl FakeOnvif {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_device(&self, address: &str, port: u16, device: FakeDevice) {
        self.devices.lock().await.insert((address.to_string(), port), device);
    }

    pub async fn set_behavior(&self, address: &str, port: u16, behavior: Behavior) {
        if let Some(device) = self.devices.lock().await.get_mut(&(address.to_string(), port)) {
            device.behavior = behavior;
        }
    }

    pub async fn update_device(&self, address: &str, port: u16, f: impl FnOnce(&mut FakeDevice)) {
        if let Some(device) = self.devices.lock().await.get_mut(&(address.to_string(), port)) {
            f(device);
        }
    }

    /// Endpoints the next probe reports, duplicates included.
    pub async fn set_probe_results(&self, endpoints: &[(&str, u16)]) {
        *self.probe_results.lock().await = endpoints.iter().map(|(a, p)| (a.to_string(), *p)).collect();
    }

    /// (address, "username:password") of every connect attempt, in order.
    pub async fn attempts(&self) -> Vec<(String, String)> {
        self.attempts.lock().await.clone()
    }

    pub async fn closed_count(&self) -> usize {
        *self.closed.lock().await
    }

    async fn device(&self, address: &str, port: u16) -> ProtocolResult<FakeDevice> {
        let device = self.reachable(address, port).await?;
        if device.behavior == Behavior::Stall {
            return std::future::pending().await;
        }
        Ok(device)
    }

    async fn reachable(&self, address: &str, port: u16) -> ProtocolResult<FakeDevice> {
        let device = self
            .devices
            .lock()
            .await
            .get(&(address.to_string(), port))
            .cloned()
            .ok_or_else(|| ProtocolError::unreachable(format!("no route to {}:{}", address, port)))?;
        match device.behavior {
            Behavior::Hang => std::future::pending().await,
            Behavior::Unreachable => Err(ProtocolError::unreachable(format!("{}:{} refused connection", address, port))),
            _ => Ok(device),
        }
    }
}

#[async_trait]
impl OnvifClient for FakeOnvif {
    async fn probe(&self, _timeout: Duration) -> ProtocolResult<CandidateStream> {
        let mut seen = Vec::new();
        for endpoint in self.probe_results.lock().await.iter() {
            if !seen.contains(endpoint) {
                seen.push(endpoint.clone());
            }
        }
        let candidates: Vec<DiscoveryCandidate> = seen
            .into_iter()
            .map(|(address, port)| DiscoveryCandidate {
                probe_response_raw: format!("<d:ProbeMatches><d:XAddrs>http://{}:{}/onvif/device_service</d:XAddrs></d:ProbeMatches>", address, port),
                address,
                port,
                discovered_at: Utc::now(),
            })
            .collect();
        Ok(Box::pin(stream::iter(candidates)))
    }

    async fn connect(
        &self,
        address: &str,
        port: u16,
        credentials: &Credentials,
        timeout: Duration,
    ) -> ProtocolResult<DeviceHandle> {
        self.attempts.lock().await.push((address.to_string(), credentials.username.clone() + ":" + &credentials.password));
        let device = self.reachable(address, port).await?;
        if !device.accepted.is_empty() && !device.accepted.contains(credentials) {
            return Err(ProtocolError::auth_failure(format!("{}:{} rejected {}", address, port, credentials.username)));
        }
        Ok(DeviceHandle {
            id: Uuid::new_v4(),
            address: address.to_string(),
            port,
            device_url: format!("http://{}:{}/onvif/device_service", address, port),
            media_url: format!("http://{}:{}/onvif/media_service", address, port),
            credentials: credentials.clone(),
            timeout,
        })
    }

    async fn get_device_info(&self, handle: &DeviceHandle) -> ProtocolResult<DeviceInfo> {
        let device = self.device(&handle.address, handle.port).await?;
        if device.behavior == Behavior::Malformed {
            return Err(ProtocolError::malformed("GetDeviceInformationResponse missing Model"));
        }
        Ok(device.info)
    }

    async fn get_profiles(&self, handle: &DeviceHandle) -> ProtocolResult<Vec<MediaProfile>> {
        let device = self.device(&handle.address, handle.port).await?;
        Ok(vec![MediaProfile {
            token: "Profile_1".to_string(),
            name: "mainStream".to_string(),
            frame_rate_limit: device.frame_rate_limit,
        }])
    }

    async fn get_stream_uri(&self, handle: &DeviceHandle, profile: &str) -> ProtocolResult<String> {
        let device = self.device(&handle.address, handle.port).await?;
        if device.behavior == Behavior::NoStream {
            return Err(ProtocolError::malformed("GetStreamUri returned no MediaUri"));
        }
        Ok(format!("rtsp://{}:554/{}", handle.address, profile))
    }

    async fn close(&self, _handle: &DeviceHandle) {
        *self.closed.lock().await += 1;
    }
}
