use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::database::{CameraStore, MemoryCameraStore, SqliteCameraStore};
use crate::directory::DeviceDirectory;
use crate::discovery::DiscoveryCoordinator;
use crate::errors::{CameraError, Result};
use crate::health::{HealthMonitor, HealthPolicy};
use crate::models::{AggregateStats, CameraOverview, CameraRecord, CameraStatus, Credentials, DiscoveryCandidate};
use crate::onvif::http::HttpOnvifClient;
use crate::onvif::{OnvifClient, TrackedClient};

static GLOBAL_CAMERA_MANAGER: OnceCell<CameraManager> = OnceCell::const_new();

/// How long shutdown waits for background loops before aborting them.
const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Everything that exists only between `initialize` and `shutdown`.
struct Engine {
    config: ManagerConfig,
    client: Arc<TrackedClient>,
    directory: Arc<DeviceDirectory>,
    discovery: DiscoveryCoordinator,
    registrar: crate::registration::RegistrationNegotiator,
    monitor: Arc<HealthMonitor>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Runs `fut` unless shutdown cancels it first.
    async fn until_shutdown<T>(&self, fut: impl std::future::Future<Output = T>) -> Option<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            value = fut => Some(value),
        }
    }

    async fn discover_and_register(&self) -> Vec<CameraRecord> {
        let candidates = one_per_address(self.discovery.run_discovery_cycle(self.config.probe_timeout).await);
        if candidates.is_empty() {
            return Vec::new();
        }

        let credentials = &self.config.credentials;
        let limit = self.config.max_concurrent_polls.max(1);
        let results: Vec<(DiscoveryCandidate, Result<CameraRecord>)> = futures_util::stream::iter(candidates)
            .map(|candidate| async move {
                let result = self.registrar.register(&candidate, credentials).await;
                (candidate, result)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        let mut registered = Vec::new();
        for (candidate, result) in results {
            match result {
                Ok(record) => registered.push(record),
                Err(e) => warn!(address = %candidate.address, port = candidate.port, "Discovered device not registered: {}", e),
            }
        }
        registered
    }
}

/// Process-wide entry point for camera discovery, registration and status.
///
/// Every method is safe to call at any time. Before `initialize` and after
/// `shutdown` reads return empty results and zeroed stats; only
/// `add_camera` reports `NotInitialized`, since it has no empty answer.
pub struct CameraManager {
    engine: RwLock<Option<Arc<Engine>>>,
    lifecycle: Mutex<()>,
}

impl Default for CameraManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraManager {
    pub fn new() -> Self {
        Self {
            engine: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    /// The shared instance. Starts uninitialized.
    pub async fn global() -> &'static CameraManager {
        GLOBAL_CAMERA_MANAGER.get_or_init(|| async { CameraManager::new() }).await
    }

    pub async fn is_initialized(&self) -> bool {
        self.engine.read().await.is_some()
    }

    async fn engine(&self) -> Option<Arc<Engine>> {
        self.engine.read().await.clone()
    }

    /// Builds the HTTP adapter and the configured store, then initializes.
    pub async fn initialize(&self, config: ManagerConfig) -> Result<()> {
        if self.is_initialized().await {
            return Ok(());
        }
        let store: Arc<dyn CameraStore> = match &config.database_path {
            Some(path) => Arc::new(SqliteCameraStore::new(path).await?),
            None => Arc::new(MemoryCameraStore::new()),
        };
        self.initialize_with(config, Arc::new(HttpOnvifClient::new()), store).await
    }

    /// Starts the engine on the given collaborators. A no-op when already
    /// initialized.
    pub async fn initialize_with(
        &self,
        config: ManagerConfig,
        client: Arc<dyn OnvifClient>,
        store: Arc<dyn CameraStore>,
    ) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.engine.read().await.is_some() {
            info!("Camera manager already initialized");
            return Ok(());
        }
        config.validate()?;

        store.initialize().await?;
        let directory = Arc::new(DeviceDirectory::new(store));
        directory.load().await?;

        let client = Arc::new(TrackedClient::new(client));
        let shared_client: Arc<dyn OnvifClient> = client.clone();
        let monitor = Arc::new(HealthMonitor::new(
            shared_client.clone(),
            directory.clone(),
            HealthPolicy {
                failure_threshold: config.failure_threshold,
                call_timeout: config.call_timeout,
                max_concurrent_polls: config.max_concurrent_polls,
                default_profile: config.default_profile.clone(),
            },
        ));
        let engine = Arc::new(Engine {
            discovery: DiscoveryCoordinator::new(shared_client.clone(), directory.clone()),
            registrar: crate::registration::RegistrationNegotiator::new(
                shared_client,
                directory.clone(),
                config.call_timeout,
                config.default_profile.clone(),
            ),
            config,
            client,
            directory,
            monitor,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            engine.monitor.clone().run(engine.config.poll_interval, engine.cancel.clone()),
        ));
        if let Some(every) = engine.config.discovery_interval {
            tasks.push(tokio::spawn(discovery_loop(engine.clone(), every)));
        }
        *engine.tasks.lock().await = tasks;

        info!(
            "Camera manager initialized with {} camera(s), failure threshold {}, call timeout {:?}",
            engine.directory.len().await,
            engine.config.failure_threshold,
            engine.config.call_timeout
        );
        *self.engine.write().await = Some(engine);
        Ok(())
    }

    /// Stops background loops, cancels in-flight work and closes every open
    /// device handle. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(engine) = self.engine.write().await.take() else {
            return;
        };
        info!("Shutting down camera manager...");
        engine.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *engine.tasks.lock().await);
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(TASK_SHUTDOWN_GRACE, task).await.is_err() {
                warn!("Background task did not stop in time, aborting");
                abort.abort();
            }
        }

        let closed = engine.client.close_all().await;
        info!("Camera manager stopped ({} open device handle(s) closed)", closed);
    }

    pub async fn list_cameras(&self) -> Vec<CameraRecord> {
        match self.engine().await {
            Some(engine) => engine.directory.list().await,
            None => Vec::new(),
        }
    }

    pub async fn get_camera(&self, id: &str) -> Option<CameraRecord> {
        self.engine().await?.directory.get(id).await
    }

    /// Registers the device at `address:port`. Explicit `credentials` are
    /// tried before the configured defaults.
    pub async fn add_camera(
        &self,
        address: &str,
        port: u16,
        credentials: Option<Credentials>,
    ) -> Result<CameraRecord> {
        let engine = self.engine().await.ok_or(CameraError::NotInitialized)?;

        let mut credential_list = Vec::with_capacity(engine.config.credentials.len() + 1);
        if let Some(creds) = credentials {
            credential_list.push(creds);
        }
        for creds in &engine.config.credentials {
            if !credential_list.contains(creds) {
                credential_list.push(creds.clone());
            }
        }

        let candidate = DiscoveryCandidate::manual(address, port);
        info!(address = %address, port = port, "Adding camera");
        engine
            .until_shutdown(engine.registrar.register(&candidate, &credential_list))
            .await
            .unwrap_or(Err(CameraError::NotInitialized))
    }

    /// False when the id is unknown, the manager is not running, or the
    /// store rejected the delete.
    pub async fn remove_camera(&self, id: &str) -> bool {
        let Some(engine) = self.engine().await else {
            return false;
        };
        match engine.directory.remove(id).await {
            Ok(removed) => {
                engine.monitor.forget(id).await;
                removed
            }
            Err(e) => {
                error!(camera_id = %id, "Failed to remove camera: {}", e);
                false
            }
        }
    }

    pub async fn get_stats(&self) -> AggregateStats {
        match self.engine().await {
            Some(engine) => engine.monitor.aggregate_stats().await,
            None => AggregateStats::default(),
        }
    }

    pub async fn get_status(&self, id: &str) -> Option<CameraStatus> {
        self.engine().await?.monitor.status(id).await
    }

    pub async fn list_overview(&self) -> Vec<CameraOverview> {
        let Some(engine) = self.engine().await else {
            return Vec::new();
        };
        let records = engine.directory.list().await;
        let mut overview = Vec::with_capacity(records.len());
        for record in records {
            let status = engine
                .monitor
                .status(&record.id)
                .await
                .unwrap_or_else(|| CameraStatus::unknown(&record.id));
            overview.push(CameraOverview { record, status });
        }
        overview
    }

    pub async fn update_camera_details(
        &self,
        id: &str,
        display_name: Option<String>,
        location: Option<String>,
    ) -> Option<CameraRecord> {
        let engine = self.engine().await?;
        match engine.directory.update_display(id, display_name, location).await {
            Ok(record) => record,
            Err(e) => {
                error!(camera_id = %id, "Failed to update camera details: {}", e);
                None
            }
        }
    }

    /// One immediate sweep over the fleet.
    pub async fn poll_now(&self) -> Vec<CameraStatus> {
        let Some(engine) = self.engine().await else {
            return Vec::new();
        };
        engine.until_shutdown(engine.monitor.sweep()).await.unwrap_or_default()
    }

    /// One discovery cycle, registering each new device with the default
    /// credential list. Returns the records that were registered.
    pub async fn discover_and_register(&self) -> Vec<CameraRecord> {
        let Some(engine) = self.engine().await else {
            return Vec::new();
        };
        engine.until_shutdown(engine.discover_and_register()).await.unwrap_or_default()
    }

    pub async fn report_frame_rate(&self, id: &str, fps: f32) {
        if let Some(engine) = self.engine().await {
            engine.monitor.record_frame_rate(id, fps).await;
        }
    }
}

/// Records are keyed by address, so only the first responder per address
/// is registered in a cycle.
fn one_per_address(candidates: Vec<DiscoveryCandidate>) -> Vec<DiscoveryCandidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| {
            let first = seen.insert(candidate.address.clone());
            if !first {
                debug!(address = %candidate.address, port = candidate.port, "Skipping extra port for an address already in this cycle");
            }
            first
        })
        .collect()
}

async fn discovery_loop(engine: Arc<Engine>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Started discovery loop - probing every {:?}", every);

    loop {
        tokio::select! {
            _ = engine.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Some(registered) = engine.until_shutdown(engine.discover_and_register()).await {
            if !registered.is_empty() {
                info!("Discovery registered {} new camera(s)", registered.len());
            }
        } else {
            break;
        }
    }
    info!("Discovery loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CameraState;
    use crate::testing::{Behavior, FakeDevice, FakeOnvif};

    fn config() -> ManagerConfig {
        ManagerConfig {
            call_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_secs(3600),
            probe_timeout: Duration::from_millis(50),
            ..ManagerConfig::default()
        }
    }

    async fn started(fake: Arc<FakeOnvif>, config: ManagerConfig) -> CameraManager {
        let manager = CameraManager::new();
        manager
            .initialize_with(config, fake, Arc::new(MemoryCameraStore::new()))
            .await
            .unwrap();
        manager
    }

    fn admin() -> Credentials {
        Credentials::new("admin", "admin")
    }

    #[tokio::test]
    async fn test_everything_defaults_before_initialize() {
        let manager = CameraManager::new();
        assert!(!manager.is_initialized().await);
        assert!(manager.list_cameras().await.is_empty());
        assert!(manager.get_camera("10.0.0.5").await.is_none());
        assert!(manager.get_status("10.0.0.5").await.is_none());
        assert!(manager.list_overview().await.is_empty());
        assert!(manager.poll_now().await.is_empty());
        assert!(manager.discover_and_register().await.is_empty());
        assert!(!manager.remove_camera("10.0.0.5").await);
        assert!(manager.update_camera_details("10.0.0.5", None, None).await.is_none());
        manager.report_frame_rate("10.0.0.5", 25.0).await;
        manager.shutdown().await;

        let stats = manager.get_stats().await;
        assert_eq!(
            stats,
            AggregateStats { total: 0, online: 0, offline: 0, issues: 0, avg_fps: 0.0 }
        );
        assert!(matches!(
            manager.add_camera("10.0.0.5", 80, None).await,
            Err(CameraError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_discovery_scenario() {
        let fake = Arc::new(FakeOnvif::new());
        fake.add_device("10.0.0.5", 80, FakeDevice::accepting(admin())).await;
        fake.add_device("10.0.0.6", 80, FakeDevice::rejecting_all()).await;
        fake.set_probe_results(&[("10.0.0.5", 80), ("10.0.0.6", 80)]).await;
        let manager = started(fake.clone(), config()).await;

        let registered = manager.discover_and_register().await;
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].id, "10.0.0.5");

        let cameras = manager.list_cameras().await;
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].address, "10.0.0.5");

        let err = manager.add_camera("10.0.0.6", 80, None).await.unwrap_err();
        assert!(matches!(err, CameraError::NoValidCredentials { .. }));
        assert_eq!(manager.list_cameras().await.len(), 1);

        // Known devices are not probed for registration again
        assert!(manager.discover_and_register().await.is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_address_on_two_ports_registers_once() {
        let fake = Arc::new(FakeOnvif::new());
        fake.add_device("10.0.0.5", 80, FakeDevice::accepting(admin())).await;
        fake.add_device("10.0.0.5", 8000, FakeDevice::accepting(admin())).await;
        fake.set_probe_results(&[("10.0.0.5", 80), ("10.0.0.5", 8000)]).await;
        let manager = started(fake, config()).await;

        let registered = manager.discover_and_register().await;
        assert_eq!(registered.len(), 1);
        let cameras = manager.list_cameras().await;
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].port, registered[0].port);
        assert_eq!(cameras[0].port, 80);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_distinct_addresses_yield_one_record_each() {
        let fake = Arc::new(FakeOnvif::new());
        let addresses = ["10.0.1.1", "10.0.1.2", "10.0.1.3"];
        for (i, address) in addresses.iter().enumerate() {
            let device = FakeDevice::accepting(admin()).with_info("ACME", &format!("M{}", i), "1.0");
            fake.add_device(address, 80, device).await;
        }
        let manager = started(fake, config()).await;

        for address in addresses.iter().chain(addresses.iter()) {
            manager.add_camera(address, 80, None).await.unwrap();
        }

        let cameras = manager.list_cameras().await;
        assert_eq!(cameras.len(), 3);
        for (i, address) in addresses.iter().enumerate() {
            let record = manager.get_camera(address).await.unwrap();
            assert_eq!(record.model, format!("M{}", i));
            assert_eq!(record.credentials, admin());
        }
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_explicit_credentials_tried_first() {
        let fake = Arc::new(FakeOnvif::new());
        let operator = Credentials::new("operator", "s3cret");
        fake.add_device("10.0.0.5", 80, FakeDevice::accepting(operator.clone())).await;
        let manager = started(fake.clone(), config()).await;

        let record = manager.add_camera("10.0.0.5", 80, Some(operator.clone())).await.unwrap();
        assert_eq!(record.credentials, operator);
        assert_eq!(fake.attempts().await.len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent_and_loads_store() {
        let fake = Arc::new(FakeOnvif::new());
        fake.add_device("10.0.0.5", 80, FakeDevice::accepting(admin())).await;
        let store = Arc::new(MemoryCameraStore::new());

        let manager = CameraManager::new();
        manager.initialize_with(config(), fake.clone(), store.clone()).await.unwrap();
        manager.add_camera("10.0.0.5", 80, None).await.unwrap();

        // Second call must not reset the directory
        manager.initialize_with(config(), fake.clone(), Arc::new(MemoryCameraStore::new())).await.unwrap();
        assert_eq!(manager.list_cameras().await.len(), 1);
        manager.shutdown().await;

        assert!(manager.list_cameras().await.is_empty());
        assert_eq!(manager.get_stats().await, AggregateStats::default());

        let restarted = CameraManager::new();
        restarted.initialize_with(config(), fake, store).await.unwrap();
        assert_eq!(restarted.list_cameras().await.len(), 1);
        restarted.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_and_stats() {
        let fake = Arc::new(FakeOnvif::new());
        fake.add_device("10.0.0.5", 80, FakeDevice::accepting(admin())).await;
        fake.add_device("10.0.0.6", 80, FakeDevice::accepting(admin())).await;
        let manager = started(fake.clone(), config()).await;
        manager.add_camera("10.0.0.5", 80, None).await.unwrap();
        manager.add_camera("10.0.0.6", 80, None).await.unwrap();

        fake.set_behavior("10.0.0.6", 80, Behavior::Malformed).await;
        manager.poll_now().await;
        let stats = manager.get_stats().await;
        assert_eq!((stats.total, stats.online, stats.issues), (2, 1, 1));
        assert_eq!(stats.avg_fps, 25.0);

        assert!(manager.remove_camera("10.0.0.6").await);
        assert!(!manager.remove_camera("10.0.0.6").await);
        let stats = manager.get_stats().await;
        assert_eq!((stats.total, stats.online, stats.issues), (1, 1, 0));

        let overview = manager.list_overview().await;
        assert_eq!(overview.len(), 1);
        assert_eq!(overview[0].status.state, CameraState::Online);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_add_and_closes_handles() {
        let fake = Arc::new(FakeOnvif::new());
        fake.add_device("10.0.0.5", 80, FakeDevice::accepting(admin()).with_behavior(Behavior::Stall))
            .await;
        let manager = Arc::new(started(fake.clone(), ManagerConfig { call_timeout: Duration::from_secs(30), ..config() }).await);

        let adding = tokio::spawn({
            let manager = manager.clone();
            async move { manager.add_camera("10.0.0.5", 80, None).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        manager.shutdown().await;
        let result = tokio::time::timeout(Duration::from_secs(1), adding).await.unwrap().unwrap();
        assert!(matches!(result, Err(CameraError::NotInitialized)));
        assert_eq!(fake.closed_count().await, 1);
        assert!(manager.list_cameras().await.is_empty());
    }

    #[tokio::test]
    async fn test_background_loops_poll_and_discover() {
        let fake = Arc::new(FakeOnvif::new());
        fake.add_device("10.0.0.5", 80, FakeDevice::accepting(admin())).await;
        fake.set_probe_results(&[("10.0.0.5", 80)]).await;
        let manager = started(
            fake,
            ManagerConfig {
                poll_interval: Duration::from_millis(50),
                discovery_interval: Some(Duration::from_millis(50)),
                ..config()
            },
        )
        .await;

        let mut online = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if manager.get_stats().await.online == 1 {
                online = true;
                break;
            }
        }
        assert!(online);
        manager.shutdown().await;
        assert!(!manager.is_initialized().await);
    }

    #[tokio::test]
    async fn test_global_instance_is_shared() {
        let a = CameraManager::global().await;
        let b = CameraManager::global().await;
        assert!(std::ptr::eq(a, b));
        assert_eq!(a.get_stats().await, AggregateStats::default());
    }
}
