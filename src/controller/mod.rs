pub mod entry;
pub mod pod;
pub mod policy;

use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::crd::FORCE_RECONCILE_ANNOTATION;
use crate::error::Result;
use crate::probe::ProbeHandle;
use crate::runtime::RuntimeRegistry;

/* ============================= KERNEL IDENTITY ============================= */

/// Where the node's kernel boot id lives.
pub const KERNEL_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// Read the boot id identifying this node's running kernel, trimmed and
/// used verbatim for entry ownership and leader election.
pub fn read_kernel_id() -> Result<String> {
    read_kernel_id_from(KERNEL_ID_PATH)
}

pub fn read_kernel_id_from(path: &str) -> Result<String> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw.trim().to_string())
}

/* ============================= CONTEXT ============================= */

/// Process-wide state handed to every reconciler on this node.
///
/// Built once in `main` before any controller starts; the probe handle and
/// the runtime registry are released on shutdown.
pub struct OperatorContext {
    pub client: Client,
    /// This node's kernel boot id, trimmed.
    pub kernel_id: String,
    pub probe: Arc<StdMutex<ProbeHandle>>,
    pub runtimes: Arc<Mutex<RuntimeRegistry>>,
    /// Guards the one-shot emitter spawn in the entry reconciler.
    pub emitter_started: AtomicBool,
}

impl OperatorContext {
    pub fn new(client: Client, kernel_id: String) -> Self {
        Self {
            client,
            kernel_id,
            probe: Arc::new(StdMutex::new(ProbeHandle::new())),
            runtimes: Arc::new(Mutex::new(RuntimeRegistry::with_default_runtimes())),
            emitter_started: AtomicBool::new(false),
        }
    }
}

/// Readiness flag behind each controller's /readyz endpoint.
pub struct ReadyState {
    pub ready: bool,
}

impl ReadyState {
    pub fn shared() -> Arc<Mutex<ReadyState>> {
        Arc::new(Mutex::new(ReadyState { ready: false }))
    }
}

/* ============================= FINALIZERS ============================= */

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == finalizer))
}

/// Add a finalizer, preserving any foreign ones.
pub async fn add_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource + ResourceExt + Clone + std::fmt::Debug + DeserializeOwned,
{
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|s| s == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());

    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Remove a finalizer, preserving any foreign ones.
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource + ResourceExt + Clone + std::fmt::Debug + DeserializeOwned,
{
    let finalizers: Vec<String> = obj
        .meta()
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|s| s != finalizer)
        .collect();

    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/* ============================= NUDGES ============================= */

/// Bump the force-reconcile annotation on one object so its controller
/// observes a change.
pub async fn bump_force_reconcile<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + std::fmt::Debug + DeserializeOwned,
{
    let patch = serde_json::json!({
        "metadata": {
            "annotations": {
                FORCE_RECONCILE_ANNOTATION: chrono::Utc::now().to_rfc3339()
            }
        }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/* ============================= TESTS ============================= */
