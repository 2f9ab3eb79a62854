//! Observational health probing of upstream targets.
//!
//! One background task per service with a configured health check. Probes
//! every target at the service's interval, logs status transitions, and
//! exports the result as a gauge. Probe results never influence target
//! selection.
use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{config::models::ServiceConfig, metrics, ports::http_client::HttpClient};

pub struct HealthChecker {
    client: Arc<dyn HttpClient>,
    shutdown: CancellationToken,
}

impl HealthChecker {
    pub fn new(client: Arc<dyn HttpClient>, shutdown: CancellationToken) -> Self {
        Self { client, shutdown }
    }

    /// Spawn a prober task per service that has health checking configured
    /// (a non-zero interval). Returns the spawned handles.
    pub fn spawn_all(&self, services: &[Arc<ServiceConfig>]) -> Vec<JoinHandle<()>> {
        services
            .iter()
            .filter(|svc| {
                svc.health_check
                    .as_ref()
                    .is_some_and(|hc| hc.interval > 0 && !svc.targets.is_empty())
            })
            .map(|svc| self.spawn_one(svc.clone()))
            .collect()
    }

    fn spawn_one(&self, svc: Arc<ServiceConfig>) -> JoinHandle<()> {
        let client = self.client.clone();
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            // Presence is guaranteed by the spawn_all filter.
            let Some(hc) = svc.health_check.clone() else {
                return;
            };
            let interval = Duration::from_secs(hc.interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_status: HashMap<String, bool> = HashMap::new();

            tracing::info!(
                service = %svc.name,
                path = %hc.path,
                interval_secs = hc.interval,
                "health prober started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                for target in &svc.targets {
                    let url = format!(
                        "{}/{}",
                        target.trim_end_matches('/'),
                        hc.path.trim_start_matches('/')
                    );
                    let healthy = match client.probe(&url, hc.timeout).await {
                        Ok(healthy) => healthy,
                        Err(e) => {
                            tracing::debug!(target = %target, error = %e, "health probe error");
                            false
                        }
                    };

                    metrics::set_backend_up(&svc.name, target, healthy);

                    let previous = last_status.insert(target.clone(), healthy);
                    if previous != Some(healthy) {
                        if healthy {
                            tracing::info!(service = %svc.name, target = %target, "target healthy");
                        } else {
                            tracing::warn!(service = %svc.name, target = %target, "target unhealthy");
                        }
                    }
                }
            }

            tracing::debug!(service = %svc.name, "health prober stopped");
        })
    }
}
