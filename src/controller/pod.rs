use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::compare::{entry_refers_to_pod, pod_is_terminal};
use crate::crd::{KERNEL_ID_LABEL, KiveData, KivePolicy};
use crate::error::Error;
use crate::metrics;

use super::{OperatorContext, ReadyState, bump_force_reconcile};

/* ============================= CONFIG ============================= */

/// Backoff while matched pods are still transitioning.
const REQUEUE_BACKOFF: Duration = Duration::from_secs(5);

const ERROR_BACKOFF: Duration = Duration::from_secs(15);

/* ============================= CLASSIFICATION ============================= */

/// What a pod event means for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodLinkage {
    /// No pod carries the entry's (name, namespace, ip) triple any more.
    Missing,
    /// The pod exists but reached Succeeded or Failed.
    Terminal,
    /// The pod exists and may still be transitioning.
    Live,
}

pub fn pod_linkage(entry: &KiveData, pods: &[Pod]) -> PodLinkage {
    match pods.iter().find(|pod| entry_refers_to_pod(entry, pod)) {
        None => PodLinkage::Missing,
        Some(pod) if pod_is_terminal(pod) => PodLinkage::Terminal,
        Some(_) => PodLinkage::Live,
    }
}

/* ============================= RECONCILE ============================= */

/// Prune entries whose pods vanished or terminated, then nudge the policy
/// reconciler so newly-ready pods get resolved.
pub async fn reconcile(_pod: Arc<Pod>, ctx: Arc<OperatorContext>) -> Result<Action, Error> {
    metrics::POD_RECONCILES.inc();
    debug!("pod_reconcile_start");

    let entries_api: Api<KiveData> = Api::all(ctx.client.clone());
    let entries = entries_api
        .list(&ListParams::default().labels(&format!("{KERNEL_ID_LABEL}={}", ctx.kernel_id)))
        .await?;

    let pods_api: Api<Pod> = Api::all(ctx.client.clone());
    let pods = pods_api.list(&ListParams::default()).await?;

    let mut requeue = false;

    for entry in &entries.items {
        match pod_linkage(entry, &pods.items) {
            PodLinkage::Live => {
                // Still settling; look again shortly.
                requeue = true;
            }
            linkage @ (PodLinkage::Missing | PodLinkage::Terminal) => {
                match entries_api.delete(&entry.name_any(), &Default::default()).await {
                    Ok(_) => {
                        metrics::ENTRIES_DELETED.inc();
                        info!(
                            entry = %entry.name_any(),
                            reason = ?linkage,
                            "entry_pruned_after_pod_event"
                        );
                    }
                    Err(e) => {
                        warn!(entry = %entry.name_any(), error = %e, "entry_delete_failed");
                    }
                }
            }
        }
    }

    nudge_policy_reconciler(&ctx).await;

    if requeue {
        Ok(Action::requeue(REQUEUE_BACKOFF))
    } else {
        Ok(Action::await_change())
    }
}

/// Touch one policy so the policy reconciler observes newly-ready pods.
async fn nudge_policy_reconciler(ctx: &OperatorContext) {
    let policies_api: Api<KivePolicy> = Api::all(ctx.client.clone());
    let policies = match policies_api.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, "policy_nudge_list_failed");
            return;
        }
    };

    let Some(policy) = policies.items.first() else {
        return;
    };

    if let Err(e) = bump_force_reconcile(&policies_api, &policy.name_any()).await {
        warn!(policy = %policy.name_any(), error = %e, "policy_nudge_failed");
    }
}

/* ============================= DRIVER ============================= */

pub fn error_policy(_pod: Arc<Pod>, error: &Error, _ctx: Arc<OperatorContext>) -> Action {
    metrics::POD_RECONCILE_ERRORS.inc();
    warn!(error = %error, "pod_reconcile_error");
    Action::requeue(ERROR_BACKOFF)
}

/// Run the pod controller. Expects the cluster-wide lease to be held.
pub async fn run(ctx: Arc<OperatorContext>, ready: Arc<Mutex<ReadyState>>) {
    let pods: Api<Pod> = Api::all(ctx.client.clone());

    info!("pod_controller_started");

    Controller::new(pods, watcher::Config::default())
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
                    warn!(error = %e, "pod_dispatch_error");
                }
            }
        })
        .await;

    info!("pod_controller_stopped");
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{KiveDataSpec, annotations};
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn entry_for(pod: &str, namespace: &str, ip: &str) -> KiveData {
        let mut ann = BTreeMap::new();
        ann.insert(annotations::POD_NAME.to_string(), pod.to_string());
        ann.insert(annotations::NAMESPACE.to_string(), namespace.to_string());
        ann.insert(annotations::POD_IP.to_string(), ip.to_string());

        KiveData {
            metadata: ObjectMeta {
                name: Some("entry".to_string()),
                annotations: Some(ann),
                ..Default::default()
            },
            spec: KiveDataSpec::default(),
        }
    }

    fn pod(name: &str, namespace: &str, ip: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: Some(ip.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_linkage_missing_when_no_pod_matches() {
        let entry = entry_for("web-0", "prod", "10.0.0.9");
        let pods = vec![pod("other", "prod", "10.0.0.9", "Running")];
        assert_eq!(pod_linkage(&entry, &pods), PodLinkage::Missing);
    }

    #[test]
    fn test_linkage_missing_when_ip_changed() {
        let entry = entry_for("web-0", "prod", "10.0.0.9");
        let pods = vec![pod("web-0", "prod", "10.9.9.9", "Running")];
        assert_eq!(pod_linkage(&entry, &pods), PodLinkage::Missing);
    }

    #[test]
    fn test_linkage_terminal_on_failed_pod() {
        let entry = entry_for("web-0", "prod", "10.0.0.9");
        let pods = vec![pod("web-0", "prod", "10.0.0.9", "Failed")];
        assert_eq!(pod_linkage(&entry, &pods), PodLinkage::Terminal);
    }

    #[test]
    fn test_linkage_terminal_on_succeeded_pod() {
        let entry = entry_for("job-1", "batch", "10.0.0.4");
        let pods = vec![pod("job-1", "batch", "10.0.0.4", "Succeeded")];
        assert_eq!(pod_linkage(&entry, &pods), PodLinkage::Terminal);
    }

    #[test]
    fn test_linkage_live_on_running_pod() {
        let entry = entry_for("web-0", "prod", "10.0.0.9");
        let pods = vec![pod("web-0", "prod", "10.0.0.9", "Running")];
        assert_eq!(pod_linkage(&entry, &pods), PodLinkage::Live);
    }

    #[test]
    fn test_linkage_live_on_pending_pod() {
        let entry = entry_for("web-0", "prod", "10.0.0.9");
        let pods = vec![pod("web-0", "prod", "10.0.0.9", "Pending")];
        assert_eq!(pod_linkage(&entry, &pods), PodLinkage::Live);
    }

    #[test]
    fn test_linkage_missing_with_no_pods_at_all() {
        let entry = entry_for("web-0", "prod", "10.0.0.9");
        assert_eq!(pod_linkage(&entry, &[]), PodLinkage::Missing);
    }
}
