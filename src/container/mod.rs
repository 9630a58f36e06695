//! Container Manager: validated config construction plus execution against
//! whichever runtime (Docker or Podman) is detected on this host (§4.7).

pub mod config;
pub mod runtime;

pub use config::{build_container_config, validate_capabilities, validate_image_name, ContainerConfig, VolumeMount};
pub use runtime::{detect_runtime, pull_image, run_container, ContainerRunResult, ContainerRuntime};

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::ContainerStep;
use crate::error::EngineError;
use crate::registry::{Credentials, ImageCache};
use crate::security::{AuditLog, NetworkPolicy};

/// Top-level entry point a step runner calls: builds the config, pulls the
/// image if needed, runs it, and audits the outcome regardless of result.
pub struct ContainerManager {
    runtime: ContainerRuntime,
    network_policy: NetworkPolicy,
    audit_log: Option<Arc<AuditLog>>,
    image_cache: Option<Arc<ImageCache>>,
}

impl ContainerManager {
    pub async fn detect(
        network_policy: NetworkPolicy,
        audit_log: Option<Arc<AuditLog>>,
        image_cache: Option<Arc<ImageCache>>,
    ) -> Result<Self, EngineError> {
        let runtime = detect_runtime().await?;
        Ok(Self {
            runtime,
            network_policy,
            audit_log,
            image_cache,
        })
    }

    pub fn runtime_name(&self) -> &'static str {
        self.runtime.binary()
    }

    pub async fn execute_step(
        &self,
        run_id: &str,
        step: &ContainerStep,
        workspace_host_path: &str,
        credentials: Option<&Credentials>,
        cancellation: &CancellationToken,
    ) -> Result<ContainerRunResult, EngineError> {
        let mut config = build_container_config(step, &self.network_policy)?.with_workspace_mount(workspace_host_path);
        config.env.insert("TAKO_RUNTIME".to_string(), self.runtime.binary().to_string());

        pull_image(self.runtime, &config.image, credentials).await?;
        self.record_pulled_image(&config.image).await;

        let result = run_container(self.runtime, &config, run_id, cancellation).await;

        if let Some(audit_log) = &self.audit_log {
            let success = matches!(&result, Ok(r) if r.exit_code == 0);
            let details = match &result {
                Ok(r) => json!({"exit_code": r.exit_code}),
                Err(e) => json!({"error": e.to_string()}),
            };
            if let Err(e) = audit_log.audit_container_execution(run_id, &step.id, &config.image, success, details) {
                tracing::warn!(error = %e, "failed to write container execution audit entry");
            }
        }

        result
    }

    /// Best-effort: records the pulled image's size in the configured
    /// [`ImageCache`] so the LRU can bound total on-disk image storage. The
    /// runtime itself owns the actual on-disk blob location, so the image
    /// reference string stands in for `local_path`; eviction's removal of
    /// that "path" is a no-op (see [`ImageCache::record`]'s eviction pass),
    /// which is acceptable since eviction here only trims the cache's own
    /// bookkeeping, not runtime-managed storage.
    async fn record_pulled_image(&self, image: &str) {
        let Some(cache) = &self.image_cache else { return };
        let Some(size_bytes) = runtime::inspect_image_size(self.runtime, image).await else {
            return;
        };
        let now_unix = chrono::Utc::now().timestamp();
        if let Err(e) = cache.record(image, image, size_bytes, now_unix) {
            tracing::warn!(image, error = %e, "failed to record pulled image in image cache");
        }
    }
}
