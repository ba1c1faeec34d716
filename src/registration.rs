use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::directory::{DeviceDirectory, RegistrationDraft};
use crate::errors::{CameraError, ProtocolErrorKind, Result};
use crate::models::{CameraRecord, Credentials, DeviceInfo, DiscoveryCandidate};
use crate::onvif::{bounded, DeviceHandle, OnvifClient};

/// Tries an ordered credential list against a discovered device and
/// persists the first identity that checks out.
pub struct RegistrationNegotiator {
    client: Arc<dyn OnvifClient>,
    directory: Arc<DeviceDirectory>,
    call_timeout: Duration,
    default_profile: Option<String>,
}

impl RegistrationNegotiator {
    pub fn new(
        client: Arc<dyn OnvifClient>,
        directory: Arc<DeviceDirectory>,
        call_timeout: Duration,
        default_profile: Option<String>,
    ) -> Self {
        Self { client, directory, call_timeout, default_profile }
    }

    /// Stops at the first pair for which both `connect` and
    /// `get_device_info` succeed. When every pair fails because the device
    /// never answered, the last transport error is returned instead of
    /// `NoValidCredentials`.
    pub async fn register(
        &self,
        candidate: &DiscoveryCandidate,
        credential_list: &[Credentials],
    ) -> Result<CameraRecord> {
        let mut device_answered = false;
        let mut last_transport_error = None;

        for credentials in credential_list {
            debug!(address = %candidate.address, port = candidate.port, username = %credentials.username, "Trying credentials");
            match self.identify(candidate, credentials).await {
                Ok((handle, info)) => {
                    let stream_uri = self.resolve_stream_uri(&handle).await;
                    self.client.close(&handle).await;

                    let record = self
                        .directory
                        .upsert(RegistrationDraft {
                            address: candidate.address.clone(),
                            port: candidate.port,
                            credentials: credentials.clone(),
                            info,
                            stream_uri,
                        })
                        .await?;
                    info!(
                        camera_id = %record.id,
                        username = %credentials.username,
                        manufacturer = %record.manufacturer,
                        model = %record.model,
                        "Camera registered"
                    );
                    return Ok(record);
                }
                Err(e) => {
                    debug!(address = %candidate.address, username = %credentials.username, kind = %e.kind, "Credential attempt failed: {}", e.message);
                    match e.kind {
                        ProtocolErrorKind::AuthFailure | ProtocolErrorKind::MalformedResponse => device_answered = true,
                        ProtocolErrorKind::Timeout | ProtocolErrorKind::Unreachable => last_transport_error = Some(e),
                    }
                }
            }
        }

        match last_transport_error {
            Some(e) if !device_answered => {
                warn!(address = %candidate.address, port = candidate.port, kind = %e.kind, "Registration failed, device did not answer");
                Err(e.into())
            }
            _ => {
                warn!(address = %candidate.address, port = candidate.port, tried = credential_list.len(), "Registration failed, no credentials accepted");
                Err(CameraError::no_valid_credentials(candidate.address.clone(), candidate.port))
            }
        }
    }

    async fn identify(
        &self,
        candidate: &DiscoveryCandidate,
        credentials: &Credentials,
    ) -> crate::errors::ProtocolResult<(DeviceHandle, DeviceInfo)> {
        let handle = bounded(
            self.call_timeout,
            "connect",
            self.client.connect(&candidate.address, candidate.port, credentials, self.call_timeout),
        )
        .await?;

        match bounded(self.call_timeout, "GetDeviceInformation", self.client.get_device_info(&handle)).await {
            Ok(info) => Ok((handle, info)),
            Err(e) => {
                self.client.close(&handle).await;
                Err(e)
            }
        }
    }

    /// Stream URI for the configured profile, or the device's first profile.
    /// Failure only costs the URI.
    async fn resolve_stream_uri(&self, handle: &DeviceHandle) -> String {
        let profile = match &self.default_profile {
            Some(profile) => profile.clone(),
            None => match bounded(self.call_timeout, "GetProfiles", self.client.get_profiles(handle)).await {
                Ok(profiles) => match profiles.into_iter().next() {
                    Some(first) => first.token,
                    None => {
                        warn!(address = %handle.address, "Device reports no media profiles, stream URI left empty");
                        return String::new();
                    }
                },
                Err(e) => {
                    warn!(address = %handle.address, kind = %e.kind, "Could not list media profiles: {}", e.message);
                    return String::new();
                }
            },
        };

        match bounded(self.call_timeout, "GetStreamUri", self.client.get_stream_uri(handle, &profile)).await {
            Ok(uri) => uri,
            Err(e) => {
                warn!(address = %handle.address, profile = %profile, kind = %e.kind, "Could not fetch stream URI: {}", e.message);
                String::new()
            }
        }
    }
}
