//! Core gateway orchestration service.
//!
//! The `GatewayService` owns the immutable service table built at startup:
//! * base-path normalization and conflict rejection at registration
//! * longest-prefix route lookup for incoming paths
//! * path rewriting (base-path stripping)
//! * upstream target selection
//!
//! This layer deliberately avoids I/O and only manipulates in-memory data so
//! it stays fast and easy to test in isolation.
use std::sync::Arc;

use crate::{
    config::models::{Config, ServiceConfig},
    config::validation::ValidationError,
    core::error::GatewayError,
};

/// Normalize a configured base path: ensure a leading `/`, strip any trailing
/// `/`. `"/"` itself stays `"/"`.
pub fn normalize_base_path(raw: &str) -> String {
    let mut path = if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{raw}")
    };
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    path
}

/// Central routing table. Descriptors are frozen after construction; an
/// instance is cheap to share behind an `Arc`.
pub struct GatewayService {
    services: Vec<Arc<ServiceConfig>>,
}

impl GatewayService {
    /// Build the service table from configuration. Base paths are normalized
    /// here; two services resolving to the same normalized prefix are a
    /// registration error.
    pub fn new(config: &Config) -> Result<Self, ValidationError> {
        let mut services: Vec<Arc<ServiceConfig>> = Vec::with_capacity(config.services.len());

        for svc in &config.services {
            let mut svc = svc.clone();
            svc.base_path = normalize_base_path(&svc.base_path);

            if services.iter().any(|s| s.base_path == svc.base_path) {
                return Err(ValidationError::ServiceConflict {
                    message: format!(
                        "base_path '{}' of service '{}' collides with another service",
                        svc.base_path, svc.name
                    ),
                });
            }

            tracing::info!(
                service = %svc.name,
                base_path = %svc.base_path,
                targets = svc.targets.len(),
                websocket = svc.enable_websocket,
                "registered service route"
            );
            services.push(Arc::new(svc));
        }

        // Longest prefix first so lookup can take the first hit.
        services.sort_by(|a, b| b.base_path.len().cmp(&a.base_path.len()));

        Ok(Self { services })
    }

    /// Longest-prefix match for an incoming request path. A prefix matches on
    /// segment boundaries only: `/api` matches `/api` and `/api/users` but
    /// not `/apiary`.
    pub fn find_service(&self, path: &str) -> Option<Arc<ServiceConfig>> {
        self.services
            .iter()
            .find(|svc| Self::prefix_matches(&svc.base_path, path))
            .cloned()
    }

    fn prefix_matches(base: &str, path: &str) -> bool {
        if base == "/" {
            return true;
        }
        path == base || path.strip_prefix(base).is_some_and(|rest| rest.starts_with('/'))
    }

    /// Rewrite an inbound path for forwarding: strip the base path iff the
    /// service asks for it. The result always begins with `/`.
    pub fn rewrite_path(svc: &ServiceConfig, path: &str) -> String {
        if !svc.strip_base_path {
            return path.to_string();
        }
        match path.strip_prefix(&svc.base_path) {
            Some(rest) if rest.is_empty() => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            Some(rest) => format!("/{rest}"),
            None => path.to_string(),
        }
    }

    /// Pick an upstream origin for the service. The contract is "any-of";
    /// this picks the first configured target.
    pub fn select_target(svc: &ServiceConfig) -> Result<&str, GatewayError> {
        svc.targets
            .first()
            .map(String::as_str)
            .ok_or_else(|| GatewayError::NoTargets {
                service: svc.name.clone(),
            })
    }

    /// All registered services, longest prefix first.
    pub fn services(&self) -> &[Arc<ServiceConfig>] {
        &self.services
    }
}
