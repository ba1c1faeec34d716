use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::DeviceDirectory;
use crate::errors::{ProtocolError, ProtocolResult};
use crate::models::{AggregateStats, CameraRecord, CameraState, CameraStatus};
use crate::onvif::{bounded, DeviceHandle, OnvifClient};

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub call_timeout: Duration,
    pub max_concurrent_polls: usize,
    pub default_profile: Option<String>,
}

/// Result of probing one device, before it is folded into its status.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Device info, profiles and stream URI all checked out
    Healthy { frame_rate_limit: Option<f32> },
    /// The device answered with data that failed validation
    Degraded(ProtocolError),
    /// Timeout, unreachable or rejected credentials
    Failed(ProtocolError),
}

impl PollOutcome {
    fn from_error(err: ProtocolError) -> Self {
        if err.is_reachable() {
            PollOutcome::Degraded(err)
        } else {
            PollOutcome::Failed(err)
        }
    }
}

/// Folds one poll outcome into the previous status.
///
/// Every non-healthy poll counts toward `consecutive_failures`, and any
/// camera whose count reaches `threshold` is Offline. Below it, data problems
/// from a reachable device report `Issue` while transport failures keep the
/// previous state. A healthy poll resets the count.
pub fn apply_outcome(
    previous: &CameraStatus,
    outcome: &PollOutcome,
    threshold: u32,
    reported_fps: Option<f32>,
    now: DateTime<Utc>,
) -> CameraStatus {
    let mut next = previous.clone();
    match outcome {
        PollOutcome::Healthy { frame_rate_limit } => {
            next.state = CameraState::Online;
            next.consecutive_failures = 0;
            next.last_seen_at = Some(now);
            next.current_fps = reported_fps.or(*frame_rate_limit).unwrap_or(0.0);
        }
        PollOutcome::Degraded(_) => {
            next.consecutive_failures = previous.consecutive_failures.saturating_add(1);
            next.state = if next.consecutive_failures >= threshold {
                CameraState::Offline
            } else {
                CameraState::Issue
            };
            next.last_seen_at = Some(now);
            next.current_fps = 0.0;
        }
        PollOutcome::Failed(_) => {
            next.consecutive_failures = previous.consecutive_failures.saturating_add(1);
            if next.consecutive_failures >= threshold {
                next.state = CameraState::Offline;
                next.current_fps = 0.0;
            }
        }
    }
    next
}

struct StatusSlot {
    /// Held for the whole poll so one camera's history stays ordered
    poll_guard: Mutex<()>,
    status: RwLock<CameraStatus>,
}

impl StatusSlot {
    fn new(camera_id: &str) -> Self {
        Self {
            poll_guard: Mutex::new(()),
            status: RwLock::new(CameraStatus::unknown(camera_id)),
        }
    }
}

/// Polls registered cameras and owns their derived status.
pub struct HealthMonitor {
    client: Arc<dyn OnvifClient>,
    directory: Arc<DeviceDirectory>,
    policy: HealthPolicy,
    slots: RwLock<HashMap<String, Arc<StatusSlot>>>,
    frame_rates: RwLock<HashMap<String, f32>>,
}

impl HealthMonitor {
    pub fn new(client: Arc<dyn OnvifClient>, directory: Arc<DeviceDirectory>, policy: HealthPolicy) -> Self {
        Self {
            client,
            directory,
            policy,
            slots: RwLock::new(HashMap::new()),
            frame_rates: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, camera_id: &str) -> Arc<StatusSlot> {
        if let Some(slot) = self.slots.read().await.get(camera_id) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(camera_id.to_string())
            .or_insert_with(|| Arc::new(StatusSlot::new(camera_id)))
            .clone()
    }

    /// Polls one camera and records the result. Protocol errors are absorbed
    /// into the returned status. Dropping the future mid-poll leaves the
    /// previous status in place.
    pub async fn poll_once(&self, record: &CameraRecord) -> CameraStatus {
        let slot = self.slot(&record.id).await;
        let _ordered = slot.poll_guard.lock().await;

        let outcome = self.probe_device(record).await;
        let reported_fps = self.frame_rates.read().await.get(&record.id).copied();

        let mut status = slot.status.write().await;
        let next = apply_outcome(&status, &outcome, self.policy.failure_threshold, reported_fps, Utc::now());
        log_transition(&record.id, &status, &next, &outcome);
        *status = next.clone();
        next
    }

    async fn probe_device(&self, record: &CameraRecord) -> PollOutcome {
        let timeout = self.policy.call_timeout;
        let handle = match bounded(
            timeout,
            "connect",
            self.client.connect(&record.address, record.port, &record.credentials, timeout),
        )
        .await
        {
            Ok(handle) => handle,
            Err(e) => return PollOutcome::from_error(e),
        };

        let outcome = match self.check_capabilities(&handle).await {
            Ok(frame_rate_limit) => PollOutcome::Healthy { frame_rate_limit },
            Err(e) => PollOutcome::from_error(e),
        };
        self.client.close(&handle).await;
        outcome
    }

    /// Device info, profile list and stream URI; returns the polled profile's
    /// configured frame rate.
    async fn check_capabilities(&self, handle: &DeviceHandle) -> ProtocolResult<Option<f32>> {
        let timeout = self.policy.call_timeout;
        bounded(timeout, "GetDeviceInformation", self.client.get_device_info(handle)).await?;

        let profiles = bounded(timeout, "GetProfiles", self.client.get_profiles(handle)).await?;
        let profile = match &self.policy.default_profile {
            Some(token) => profiles.iter().find(|p| &p.token == token),
            None => profiles.first(),
        }
        .ok_or_else(|| ProtocolError::malformed(format!("{} reports no usable media profile", handle.address)))?;

        let uri = bounded(timeout, "GetStreamUri", self.client.get_stream_uri(handle, &profile.token)).await?;
        if uri.trim().is_empty() {
            return Err(ProtocolError::malformed(format!("{} returned an empty stream URI", handle.address)));
        }
        Ok(profile.frame_rate_limit)
    }

    /// Polls every registered camera concurrently, at most
    /// `max_concurrent_polls` at a time.
    pub async fn sweep(&self) -> Vec<CameraStatus> {
        let records = self.directory.list().await;
        self.prune(&records).await;
        if records.is_empty() {
            return Vec::new();
        }

        let limit = self.policy.max_concurrent_polls.max(1);
        let statuses: Vec<CameraStatus> = futures_util::stream::iter(records)
            .map(|record| async move { self.poll_once(&record).await })
            .buffer_unordered(limit)
            .collect()
            .await;

        debug!("Health sweep polled {} camera(s)", statuses.len());
        statuses
    }

    /// Sweeps every `poll_interval` until `cancel` fires. A cancelled sweep
    /// is abandoned mid-flight.
    pub async fn run(self: Arc<Self>, poll_interval: Duration, cancel: CancellationToken) {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Started health monitor - polling every {:?}", poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.sweep() => {}
            }
        }
        info!("Health monitor stopped");
    }

    async fn prune(&self, records: &[CameraRecord]) {
        let mut slots = self.slots.write().await;
        slots.retain(|id, _| records.iter().any(|r| &r.id == id));
        let mut frame_rates = self.frame_rates.write().await;
        frame_rates.retain(|id, _| records.iter().any(|r| &r.id == id));
    }

    /// Live frame rate pushed by the stream-capture side. Applied to the
    /// status right away when the camera is online.
    pub async fn record_frame_rate(&self, camera_id: &str, fps: f32) {
        if !fps.is_finite() || fps < 0.0 {
            warn!(camera_id = %camera_id, fps = fps, "Ignoring invalid frame rate report");
            return;
        }
        if self.directory.get(camera_id).await.is_none() {
            debug!(camera_id = %camera_id, "Ignoring frame rate for unregistered camera");
            return;
        }
        self.frame_rates.write().await.insert(camera_id.to_string(), fps);
        if let Some(slot) = self.slots.read().await.get(camera_id) {
            let mut status = slot.status.write().await;
            if status.state == CameraState::Online {
                status.current_fps = fps;
            }
        }
    }

    /// Status of a registered camera; `None` for unknown ids.
    pub async fn status(&self, camera_id: &str) -> Option<CameraStatus> {
        self.directory.get(camera_id).await?;
        Some(self.current_status(camera_id).await)
    }

    async fn current_status(&self, camera_id: &str) -> CameraStatus {
        let slot = self.slots.read().await.get(camera_id).cloned();
        match slot {
            Some(slot) => slot.status.read().await.clone(),
            None => CameraStatus::unknown(camera_id),
        }
    }

    /// Status for every registered camera, in directory order.
    pub async fn statuses(&self) -> Vec<CameraStatus> {
        let records = self.directory.list().await;
        let mut statuses = Vec::with_capacity(records.len());
        for record in &records {
            statuses.push(self.current_status(&record.id).await);
        }
        statuses
    }

    pub async fn forget(&self, camera_id: &str) {
        self.slots.write().await.remove(camera_id);
        self.frame_rates.write().await.remove(camera_id);
    }

    pub async fn aggregate_stats(&self) -> AggregateStats {
        aggregate(&self.statuses().await)
    }
}

pub fn aggregate(statuses: &[CameraStatus]) -> AggregateStats {
    let mut stats = AggregateStats { total: statuses.len(), ..AggregateStats::default() };
    let mut fps_sum = 0.0f32;
    for status in statuses {
        match status.state {
            CameraState::Online => {
                stats.online += 1;
                fps_sum += status.current_fps;
            }
            CameraState::Offline => stats.offline += 1,
            CameraState::Issue => stats.issues += 1,
            CameraState::Unknown => {}
        }
    }
    if stats.online > 0 {
        stats.avg_fps = fps_sum / stats.online as f32;
    }
    stats
}

fn log_transition(camera_id: &str, previous: &CameraStatus, next: &CameraStatus, outcome: &PollOutcome) {
    match (previous.state, next.state) {
        (CameraState::Offline, CameraState::Online) | (CameraState::Issue, CameraState::Online) => {
            info!(camera_id = %camera_id, from = %previous.state, "Camera connection recovered");
        }
        (from, CameraState::Offline) if from != CameraState::Offline => {
            warn!(camera_id = %camera_id, failures = next.consecutive_failures, "Camera connection lost");
        }
        (from, CameraState::Issue) if from != CameraState::Issue => {
            if let PollOutcome::Degraded(e) = outcome {
                warn!(camera_id = %camera_id, "Camera reachable but reporting bad data: {}", e.message);
            }
        }
        (CameraState::Unknown, CameraState::Online) => {
            debug!(camera_id = %camera_id, "Camera online");
        }
        _ => {
            if let PollOutcome::Failed(e) = outcome {
                debug!(camera_id = %camera_id, kind = %e.kind, failures = next.consecutive_failures, "Camera poll failed: {}", e.message);
            }
        }
    }
}
