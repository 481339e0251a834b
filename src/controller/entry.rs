use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::compare::{entry_matches_container, entry_trap_id, trap_id};
use crate::crd::{ENTRY_FINALIZER, KiveData, KivePolicy, annotations};
use crate::emitter::AlertEmitter;
use crate::error::Error;
use crate::metrics;
use crate::probe::TracedKey;

use super::{OperatorContext, ReadyState, add_finalizer, has_finalizer, remove_finalizer};

/* ============================= CONFIG ============================= */

const ERROR_BACKOFF: Duration = Duration::from_secs(15);

/* ============================= HELPERS ============================= */

/// Trap ids of every trap inside every live (non-deleting) policy.
pub fn live_trap_ids(policies: &[KivePolicy]) -> HashSet<String> {
    let mut ids = HashSet::new();

    for policy in policies {
        if policy.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let alert_version = policy.spec.alert_version.clone().unwrap_or_default();
        for trap in &policy.spec.traps {
            match trap_id(trap, &alert_version) {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(e) => warn!(path = %trap.path, error = %e, "trap_id_failed"),
            }
        }
    }

    ids
}

/// The traced-set key recorded on an entry.
pub fn entry_key(entry: &KiveData) -> TracedKey {
    TracedKey::new(entry.spec.inode_no, entry.spec.dev_id.unwrap_or(0))
}

/// The steady-state content of the kernel set: keys of every live, owned,
/// non-draining entry.
pub fn expected_kernel_set(entries: &[KiveData], kernel_id: &str) -> HashSet<TracedKey> {
    entries
        .iter()
        .filter(|e| e.spec.kernel_id == kernel_id)
        .filter(|e| e.metadata.deletion_timestamp.is_none())
        .map(entry_key)
        .collect()
}

/* ============================= BOOTSTRAP ============================= */

/// Load the probe and spawn the alert emitter. One-shot per process; later
/// calls are no-ops.
async fn bootstrap(ctx: &Arc<OperatorContext>) -> Result<(), Error> {
    if ctx.emitter_started.load(Ordering::Acquire) {
        return Ok(());
    }

    let reader = {
        let mut probe = ctx
            .probe
            .lock()
            .map_err(|_| Error::Runtime("probe lock poisoned".to_string()))?;
        probe.load()?;
        metrics::PROBE_LOADED.set(1);
        probe.take_reader()
    };

    if let Some(reader) = reader {
        if !ctx.emitter_started.swap(true, Ordering::AcqRel) {
            let emitter =
                AlertEmitter::new(ctx.client.clone(), ctx.kernel_id.clone(), reader);
            tokio::spawn(emitter.run());
            info!("alert_emitter_spawned");
        }
    } else {
        ctx.emitter_started.store(true, Ordering::Release);
    }

    Ok(())
}

/* ============================= RECONCILE ============================= */

/// Mirror the owned entries into the kernel set and reap orphans.
///
/// An entry survives only while some live policy still carries its trap
/// (by trap-id label equality, nothing else) and its pod+container still
/// exists. Everything else is deleted here.
pub async fn reconcile(
    _trigger: Arc<KiveData>,
    ctx: Arc<OperatorContext>,
) -> Result<Action, Error> {
    metrics::ENTRY_RECONCILES.inc();
    debug!("entry_reconcile_start");

    bootstrap(&ctx).await?;

    let entries_api: Api<KiveData> = Api::all(ctx.client.clone());
    let entries = entries_api.list(&ListParams::default()).await?;

    let policies_api: Api<KivePolicy> = Api::all(ctx.client.clone());
    let policies = policies_api.list(&ListParams::default()).await?;

    let live_ids = live_trap_ids(&policies.items);

    for entry in &entries.items {
        // Entries owned by other kernels are not ours to touch.
        if entry.spec.kernel_id != ctx.kernel_id {
            continue;
        }

        let name = entry.name_any();

        if !has_finalizer(&entry.metadata, ENTRY_FINALIZER) {
            add_finalizer(&entries_api, entry, ENTRY_FINALIZER).await?;
            debug!(entry = %name, "entry_finalizer_added");
            // The patch re-triggers reconciliation; pick the rest up there.
            return Ok(Action::await_change());
        }

        if entry.metadata.deletion_timestamp.is_some() {
            {
                let mut probe = ctx
                    .probe
                    .lock()
                    .map_err(|_| Error::Runtime("probe lock poisoned".to_string()))?;
                probe.delete_key(entry_key(entry))?;
                metrics::TRACED_INODES.set(probe.tracked_len() as i64);
            }
            remove_finalizer(&entries_api, entry, ENTRY_FINALIZER).await?;
            info!(entry = %name, "entry_reaped");
            return Ok(Action::await_change());
        }

        let linked = live_ids.contains(entry_trap_id(entry))
            && container_still_exists(&ctx, entry).await;

        if !linked {
            match entries_api.delete(&name, &Default::default()).await {
                Ok(_) => {
                    metrics::ENTRIES_DELETED.inc();
                    info!(entry = %name, "entry_orphaned_deleting");
                }
                Err(e) => warn!(entry = %name, error = %e, "entry_delete_failed"),
            }
            continue;
        }

        let insert = {
            let mut probe = ctx
                .probe
                .lock()
                .map_err(|_| Error::Runtime("probe lock poisoned".to_string()))?;
            let result = probe.insert_key(entry_key(entry));
            metrics::TRACED_INODES.set(probe.tracked_len() as i64);
            result
        };

        match insert {
            Ok(()) => {}
            Err(Error::MapFull) => {
                warn!(entry = %name, "traced_set_full_skipping_entry");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(Action::await_change())
}

/// Does the pod+container recorded on the entry still exist on its node?
async fn container_still_exists(ctx: &OperatorContext, entry: &KiveData) -> bool {
    let pod_name = entry
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::POD_NAME))
        .cloned()
        .unwrap_or_default();
    let namespace = entry
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::NAMESPACE))
        .cloned()
        .unwrap_or_default();
    let node_name = entry
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::NODE_NAME))
        .cloned()
        .unwrap_or_default();

    let mut fields = vec![format!("metadata.name={pod_name}")];
    if !namespace.is_empty() {
        fields.push(format!("metadata.namespace={namespace}"));
    }
    if !node_name.is_empty() {
        fields.push(format!("spec.nodeName={node_name}"));
    }

    let pods_api: Api<Pod> = Api::all(ctx.client.clone());
    let pods = match pods_api
        .list(&ListParams::default().fields(&fields.join(",")))
        .await
    {
        Ok(pods) => pods,
        Err(e) => {
            warn!(entry = %entry.name_any(), error = %e, "pod_lookup_failed");
            // Do not reap on a failed lookup; the next pass retries.
            return true;
        }
    };

    pods.items.iter().any(|pod| {
        pod.status
            .as_ref()
            .and_then(|s| s.container_statuses.as_deref())
            .unwrap_or_default()
            .iter()
            .any(|status| entry_matches_container(entry, pod, status))
    })
}

/* ============================= DRIVER ============================= */

pub fn error_policy(_entry: Arc<KiveData>, error: &Error, _ctx: Arc<OperatorContext>) -> Action {
    metrics::ENTRY_RECONCILE_ERRORS.inc();
    warn!(error = %error, "entry_reconcile_error");
    Action::requeue(ERROR_BACKOFF)
}

/// Run the entry controller. Expects leadership for this kernel to be held.
pub async fn run(ctx: Arc<OperatorContext>, ready: Arc<Mutex<ReadyState>>) {
    let entries: Api<KiveData> = Api::all(ctx.client.clone());

    info!(kernel_id = %ctx.kernel_id, "entry_controller_started");

    Controller::new(entries, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            let ready = ready.clone();
            async move {
                {
                    let mut state = ready.lock().await;
                    if !state.ready {
                        state.ready = true;
                    }
                }
                if let Err(e) = result {
                    warn!(error = %e, "entry_dispatch_error");
                }
            }
        })
        .await;

    info!("entry_controller_stopped");
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{KiveDataSpec, KivePolicySpec, KiveTrap, TRAP_ID_LABEL};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;

    fn policy(name: &str, traps: Vec<KiveTrap>, deleting: bool) -> KivePolicy {
        let mut policy = KivePolicy::new(
            name,
            KivePolicySpec {
                alert_version: Some("v1".to_string()),
                traps,
            },
        );
        if deleting {
            policy.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
        policy
    }

    fn trap(path: &str) -> KiveTrap {
        KiveTrap {
            path: path.to_string(),
            ..Default::default()
        }
    }

    fn entry(name: &str, inode: u64, dev: Option<u32>, kernel: &str, tid: &str) -> KiveData {
        let mut labels = BTreeMap::new();
        labels.insert(TRAP_ID_LABEL.to_string(), tid.to_string());

        KiveData {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: KiveDataSpec {
                inode_no: inode,
                dev_id: dev,
                kernel_id: kernel.to_string(),
            },
        }
    }

    // ── live_trap_ids ──

    #[test]
    fn test_live_trap_ids_covers_all_traps() {
        let policies = vec![
            policy("a", vec![trap("/one"), trap("/two")], false),
            policy("b", vec![trap("/three")], false),
        ];
        let ids = live_trap_ids(&policies);
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_live_trap_ids_skips_deleting_policies() {
        let policies = vec![
            policy("a", vec![trap("/one")], false),
            policy("b", vec![trap("/two")], true),
        ];
        let ids = live_trap_ids(&policies);
        assert_eq!(ids.len(), 1);
        let expected = trap_id(&trap("/one"), "v1").expect("should hash");
        assert!(ids.contains(&expected));
    }

    #[test]
    fn test_live_trap_ids_identical_traps_collapse() {
        let policies = vec![
            policy("a", vec![trap("/same")], false),
            policy("b", vec![trap("/same")], false),
        ];
        assert_eq!(live_trap_ids(&policies).len(), 1);
    }

    #[test]
    fn test_live_trap_ids_empty() {
        assert!(live_trap_ids(&[]).is_empty());
    }

    // ── entry_key ──

    #[test]
    fn test_entry_key_uses_dev_when_present() {
        let e = entry("e", 42, Some(7), "k", "t");
        assert_eq!(entry_key(&e), TracedKey::new(42, 7));
    }

    #[test]
    fn test_entry_key_defaults_dev_to_zero() {
        let e = entry("e", 42, None, "k", "t");
        assert_eq!(entry_key(&e), TracedKey::new(42, 0));
    }

    // ── expected_kernel_set ──

    #[test]
    fn test_expected_kernel_set_filters_owner_and_draining() {
        let mut draining = entry("d", 3, Some(1), "ours", "t");
        draining.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let entries = vec![
            entry("a", 1, Some(1), "ours", "t"),
            entry("b", 2, Some(1), "theirs", "t"),
            draining,
        ];

        let set = expected_kernel_set(&entries, "ours");
        assert_eq!(set.len(), 1);
        assert!(set.contains(&TracedKey::new(1, 1)));
    }

    #[test]
    fn test_expected_kernel_set_is_keyed_by_inode_and_dev() {
        let entries = vec![
            entry("a", 1, Some(1), "ours", "t"),
            entry("b", 1, Some(2), "ours", "t"),
        ];
        assert_eq!(expected_kernel_set(&entries, "ours").len(), 2);
    }
}
