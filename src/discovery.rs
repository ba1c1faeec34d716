use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::directory::DeviceDirectory;
use crate::models::DiscoveryCandidate;
use crate::onvif::OnvifClient;

/// Runs WS-Discovery probes and filters responders down to devices the
/// directory does not know yet. Never writes to the directory.
pub struct DiscoveryCoordinator {
    client: Arc<dyn OnvifClient>,
    directory: Arc<DeviceDirectory>,
}

impl DiscoveryCoordinator {
    pub fn new(client: Arc<dyn OnvifClient>, directory: Arc<DeviceDirectory>) -> Self {
        Self { client, directory }
    }

    /// One probe cycle. Probe failures are logged and yield an empty set.
    pub async fn run_discovery_cycle(&self, timeout: Duration) -> Vec<DiscoveryCandidate> {
        // The probe stream ends at `timeout`; the outer bound also covers socket setup
        let probe_budget = timeout + Duration::from_secs(1);
        let collected = tokio::time::timeout(probe_budget, async {
            let mut stream = match self.client.probe(timeout).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(kind = %e.kind, "Discovery probe failed: {}", e.message);
                    return Vec::new();
                }
            };
            let mut responders = Vec::new();
            while let Some(candidate) = stream.next().await {
                responders.push(candidate);
            }
            responders
        })
        .await;

        let responders = match collected {
            Ok(responders) => responders,
            Err(_) => {
                warn!("Discovery probe overran its {:?} budget", probe_budget);
                Vec::new()
            }
        };

        let known = self.directory.endpoints().await;
        let known_addresses: HashSet<String> = known.iter().map(|(address, _)| address.clone()).collect();
        let mut seen: HashSet<(String, u16)> = HashSet::new();
        let mut candidates = Vec::new();

        for candidate in responders {
            let key = candidate.endpoint_key();
            if !seen.insert(key.clone()) {
                continue;
            }
            if known.contains(&key) || known_addresses.contains(&candidate.address) {
                debug!(address = %candidate.address, port = candidate.port, "Skipping already registered device");
                continue;
            }
            candidates.push(candidate);
        }

        info!(
            "Discovery cycle finished: {} responder(s), {} new candidate(s)",
            seen.len(),
            candidates.len()
        );
        candidates
    }
}
