use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::errors::{ProtocolError, ProtocolResult};
use crate::models::{Credentials, DeviceInfo, MediaProfile};
use crate::soap;
use crate::ws_discovery::{self, CandidateStream};

/// Authenticated session with one device. Cheap to clone; closing it only
/// releases the adapter's bookkeeping, ONVIF itself is stateless HTTP.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub id: Uuid,
    pub address: String,
    pub port: u16,
    pub device_url: String,
    pub media_url: String,
    pub credentials: Credentials,
    pub timeout: Duration,
}

/// Capability surface the rest of the engine uses to talk to cameras.
/// Implementations classify every failure into a `ProtocolError` and never retry.
#[async_trait]
pub trait OnvifClient: Send + Sync {
    async fn probe(&self, timeout: Duration) -> ProtocolResult<CandidateStream>;

    async fn connect(
        &self,
        address: &str,
        port: u16,
        credentials: &Credentials,
        timeout: Duration,
    ) -> ProtocolResult<DeviceHandle>;

    async fn get_device_info(&self, handle: &DeviceHandle) -> ProtocolResult<DeviceInfo>;

    async fn get_profiles(&self, handle: &DeviceHandle) -> ProtocolResult<Vec<MediaProfile>>;

    async fn get_stream_uri(&self, handle: &DeviceHandle, profile: &str) -> ProtocolResult<String>;

    async fn close(&self, handle: &DeviceHandle);
}

pub mod http {
    use super::*;

    const ACTION_GET_CAPABILITIES: &str = "http://www.onvif.org/ver10/device/wsdl/GetCapabilities";
    const ACTION_GET_DEVICE_INFORMATION: &str = "http://www.onvif.org/ver10/device/wsdl/GetDeviceInformation";
    const ACTION_GET_PROFILES: &str = "http://www.onvif.org/ver10/media/wsdl/GetProfiles";
    const ACTION_GET_STREAM_URI: &str = "http://www.onvif.org/ver10/media/wsdl/GetStreamUri";

    /// SOAP-over-HTTP adapter talking to real devices.
    #[derive(Clone)]
    pub struct HttpOnvifClient {
        client: reqwest::Client,
    }

    impl Default for HttpOnvifClient {
        fn default() -> Self {
            Self::new()
        }
    }

    impl HttpOnvifClient {
        pub fn new() -> Self {
            // Cameras commonly present self-signed certificates on their HTTPS port
            let client = reqwest::Client::builder()
                .use_rustls_tls()
                .danger_accept_invalid_certs(true)
                .build()
                .unwrap_or_else(|e| {
                    warn!(target: "onvif", error = %e, "Falling back to default HTTP client");
                    reqwest::Client::new()
                });
            Self { client }
        }

        async fn post(
            &self,
            url: &str,
            action: &str,
            body: &str,
            credentials: &Credentials,
            timeout: Duration,
        ) -> ProtocolResult<String> {
            // Never log credentials; endpoint and action only
            debug!(target: "onvif", action = action, endpoint = %url, "Sending ONVIF request");
            let envelope = soap::envelope(body, Some(credentials));
            let mut req = self
                .client
                .post(url)
                .timeout(timeout)
                .header(
                    "Content-Type",
                    format!("application/soap+xml; charset=utf-8; action=\"{}\"", action),
                )
                .header("SOAPAction", action)
                .body(envelope);
            if !credentials.username.is_empty() {
                req = req.basic_auth(&credentials.username, Some(&credentials.password));
            }

            let res = req.send().await.map_err(|e| classify_transport(url, action, &e))?;
            let status = res.status();
            let text = res.text().await.map_err(|e| classify_transport(url, action, &e))?;
            debug!(target: "onvif", action = action, endpoint = %url, status = %status, resp_len = text.len(), "ONVIF response received");
            trace!(target: "onvif", action = action, endpoint = %url, response = %text, "ONVIF response body");

            if let Some(fault) = soap::fault(&text) {
                if soap::is_auth_fault(&fault) || status.as_u16() == 401 || status.as_u16() == 403 {
                    return Err(ProtocolError::auth_failure(format!("{} rejected credentials: {}", url, fault)));
                }
                return Err(ProtocolError::malformed(format!("{} returned SOAP fault: {}", url, fault)));
            }
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(ProtocolError::auth_failure(format!("{} answered HTTP {}", url, status)));
            }
            if !status.is_success() {
                return Err(ProtocolError::malformed(format!("{} answered HTTP {}", url, status)));
            }
            if soap::element_inner(&text, "Body").is_none() {
                return Err(ProtocolError::malformed(format!("{} returned a body without SOAP envelope", url)));
            }
            Ok(text)
        }
    }

    fn classify_transport(url: &str, action: &str, err: &reqwest::Error) -> ProtocolError {
        debug!(target: "onvif", action = action, endpoint = %url, error = %err, "ONVIF HTTP error");
        if err.is_timeout() {
            ProtocolError::timeout(format!("{} did not answer in time", url))
        } else if err.is_connect() || err.is_request() {
            ProtocolError::unreachable(format!("{}: {}", url, err))
        } else {
            ProtocolError::malformed(format!("{}: {}", url, err))
        }
    }

    fn device_service_url(address: &str, port: u16) -> String {
        let host = if address.contains(':') && !address.starts_with('[') {
            format!("[{}]", address)
        } else {
            address.to_string()
        };
        let scheme = if port == 443 { "https" } else { "http" };
        format!("{}://{}:{}/onvif/device_service", scheme, host, port)
    }

    pub(crate) fn parse_profiles(xml: &str) -> Vec<MediaProfile> {
        soap::elements(xml, "Profiles")
            .into_iter()
            .filter_map(|profile| {
                let token = soap::attribute(profile, "Profiles", "token")?;
                let name = soap::element_text(profile, "Name").unwrap_or_else(|| token.clone());
                let frame_rate_limit = soap::element_inner(profile, "VideoEncoderConfiguration")
                    .and_then(|enc| soap::element_text(enc, "FrameRateLimit"))
                    .and_then(|v| v.parse::<f32>().ok());
                Some(MediaProfile { token, name, frame_rate_limit })
            })
            .collect()
    }

    #[async_trait]
    impl OnvifClient for HttpOnvifClient {
        async fn probe(&self, timeout: Duration) -> ProtocolResult<CandidateStream> {
            ws_discovery::probe(timeout).await
        }

        async fn connect(
            &self,
            address: &str,
            port: u16,
            credentials: &Credentials,
            timeout: Duration,
        ) -> ProtocolResult<DeviceHandle> {
            let device_url = device_service_url(address, port);
            let body = "<tds:GetCapabilities><tds:Category>All</tds:Category></tds:GetCapabilities>";
            let resp = self
                .post(&device_url, ACTION_GET_CAPABILITIES, body, credentials, timeout)
                .await?;

            let media_url = soap::element_inner(&resp, "Media")
                .and_then(|media| soap::element_text(media, "XAddr"))
                .unwrap_or_else(|| device_url.clone());

            debug!(target: "onvif", address = address, port = port, username = %credentials.username, media = %media_url, "ONVIF session established");
            Ok(DeviceHandle {
                id: Uuid::new_v4(),
                address: address.to_string(),
                port,
                device_url,
                media_url,
                credentials: credentials.clone(),
                timeout,
            })
        }

        async fn get_device_info(&self, handle: &DeviceHandle) -> ProtocolResult<DeviceInfo> {
            let resp = self
                .post(
                    &handle.device_url,
                    ACTION_GET_DEVICE_INFORMATION,
                    "<tds:GetDeviceInformation/>",
                    &handle.credentials,
                    handle.timeout,
                )
                .await?;

            let info = soap::element_inner(&resp, "GetDeviceInformationResponse").ok_or_else(|| {
                ProtocolError::malformed(format!("{} sent no GetDeviceInformationResponse", handle.device_url))
            })?;
            let manufacturer = soap::element_text(info, "Manufacturer");
            let model = soap::element_text(info, "Model");
            match (manufacturer, model) {
                (Some(manufacturer), Some(model)) => Ok(DeviceInfo {
                    manufacturer,
                    model,
                    firmware_version: soap::element_text(info, "FirmwareVersion").unwrap_or_default(),
                    serial_number: soap::element_text(info, "SerialNumber").unwrap_or_default(),
                }),
                _ => Err(ProtocolError::malformed(format!(
                    "{} device information lacks manufacturer or model",
                    handle.device_url
                ))),
            }
        }

        async fn get_profiles(&self, handle: &DeviceHandle) -> ProtocolResult<Vec<MediaProfile>> {
            let resp = self
                .post(&handle.media_url, ACTION_GET_PROFILES, "<trt:GetProfiles/>", &handle.credentials, handle.timeout)
                .await?;
            Ok(parse_profiles(&resp))
        }

        async fn get_stream_uri(&self, handle: &DeviceHandle, profile: &str) -> ProtocolResult<String> {
            let body = format!(
                "<trt:GetStreamUri>\n\
                    <trt:StreamSetup>\n\
                        <tt:Stream>RTP-Unicast</tt:Stream>\n\
                        <tt:Transport><tt:Protocol>RTSP</tt:Protocol></tt:Transport>\n\
                    </trt:StreamSetup>\n\
                    <trt:ProfileToken>{}</trt:ProfileToken>\n\
                 </trt:GetStreamUri>",
                soap::xml_escape(profile)
            );
            let resp = self
                .post(&handle.media_url, ACTION_GET_STREAM_URI, &body, &handle.credentials, handle.timeout)
                .await?;

            let uri = soap::element_inner(&resp, "MediaUri")
                .and_then(|media| soap::element_text(media, "Uri"))
                .ok_or_else(|| ProtocolError::malformed(format!("{} returned no stream URI", handle.media_url)))?;
            url::Url::parse(&uri)
                .map_err(|e| ProtocolError::malformed(format!("{} returned invalid stream URI '{}': {}", handle.media_url, uri, e)))?;
            Ok(uri)
        }

        async fn close(&self, handle: &DeviceHandle) {
            trace!(target: "onvif", handle = %handle.id, address = %handle.address, "ONVIF session closed");
        }
    }

}

/// Wraps an adapter and remembers every handle it opened, so shutdown can
/// close whatever cancelled work left behind.
pub struct TrackedClient {
    inner: Arc<dyn OnvifClient>,
    open: Mutex<HashMap<Uuid, DeviceHandle>>,
}

impl TrackedClient {
    pub fn new(inner: Arc<dyn OnvifClient>) -> Self {
        Self { inner, open: Mutex::new(HashMap::new()) }
    }

    pub async fn open_handles(&self) -> usize {
        self.open.lock().await.len()
    }

    /// Closes and forgets every handle still open. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let handles: Vec<DeviceHandle> = {
            let mut open = self.open.lock().await;
            open.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            self.inner.close(handle).await;
        }
        handles.len()
    }
}

#[async_trait]
impl OnvifClient for TrackedClient {
    async fn probe(&self, timeout: Duration) -> ProtocolResult<CandidateStream> {
        self.inner.probe(timeout).await
    }

    async fn connect(
        &self,
        address: &str,
        port: u16,
        credentials: &Credentials,
        timeout: Duration,
    ) -> ProtocolResult<DeviceHandle> {
        let handle = self.inner.connect(address, port, credentials, timeout).await?;
        self.open.lock().await.insert(handle.id, handle.clone());
        Ok(handle)
    }

    async fn get_device_info(&self, handle: &DeviceHandle) -> ProtocolResult<DeviceInfo> {
        self.inner.get_device_info(handle).await
    }

    async fn get_profiles(&self, handle: &DeviceHandle) -> ProtocolResult<Vec<MediaProfile>> {
        self.inner.get_profiles(handle).await
    }

    async fn get_stream_uri(&self, handle: &DeviceHandle, profile: &str) -> ProtocolResult<String> {
        self.inner.get_stream_uri(handle, profile).await
    }

    async fn close(&self, handle: &DeviceHandle) {
        let was_open = self.open.lock().await.remove(&handle.id).is_some();
        if was_open {
            self.inner.close(handle).await;
        }
    }
}

/// Runs one adapter call under `timeout`, mapping expiry to `Timeout`.
pub async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> ProtocolResult<T>
where
    F: std::future::Future<Output = ProtocolResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::timeout(format!("{} exceeded {:?}", what, timeout))),
    }
}
