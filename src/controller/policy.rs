use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::compare::{
    container_name_matches, entry_matches_container, entry_name, list_params_for_match,
    pod_ip, pod_is_running, trap_id,
};
use crate::crd::{
    KERNEL_ID_LABEL, KiveData, KiveDataSpec, KivePolicy, KiveTrap, KiveTrapMatch,
    POLICY_FIELD_OWNER, POLICY_FINALIZER, TRAP_ID_LABEL, annotations,
};
use crate::error::Error;
use crate::metrics;
use crate::probe::user_dev_to_kernel_dev;
use crate::runtime::ContainerData;

use super::{OperatorContext, ReadyState, add_finalizer, bump_force_reconcile, has_finalizer,
    remove_finalizer};

/* ============================= CONFIG ============================= */

/// Backoff when a matched pod or container is not ready yet.
const REQUEUE_BACKOFF: Duration = Duration::from_secs(5);

const ERROR_BACKOFF: Duration = Duration::from_secs(15);

/* ============================= ENTRY CONSTRUCTION ============================= */

/// Build the KiveData object reifying `trap` matching `status` of `pod`.
///
/// The name is deterministic and the object is written with server-side
/// apply, so repeated reconciles converge without duplicates.
pub fn build_entry(
    policy: &KivePolicy,
    trap: &KiveTrap,
    trap_id: &str,
    pod: &Pod,
    status: &ContainerStatus,
    data: &ContainerData,
    kernel_id: &str,
) -> KiveData {
    let dev_id = user_dev_to_kernel_dev(data.dev);

    let mut labels = BTreeMap::new();
    labels.insert(TRAP_ID_LABEL.to_string(), trap_id.to_string());
    labels.insert(KERNEL_ID_LABEL.to_string(), kernel_id.to_string());

    let mut ann = BTreeMap::new();
    ann.insert(
        annotations::ALERT_VERSION.to_string(),
        policy.spec.alert_version.clone().unwrap_or_default(),
    );
    ann.insert(annotations::POLICY_NAME.to_string(), policy.name_any());
    ann.insert(
        annotations::CALLBACK.to_string(),
        trap.callback.clone().unwrap_or_default(),
    );
    ann.insert(annotations::POD_NAME.to_string(), pod.name_any());
    ann.insert(
        annotations::NAMESPACE.to_string(),
        pod.metadata.namespace.clone().unwrap_or_default(),
    );
    ann.insert(annotations::POD_IP.to_string(), pod_ip(pod).to_string());
    ann.insert(annotations::PATH.to_string(), trap.path.clone());
    ann.insert(annotations::CONTAINER_ID.to_string(), data.id.clone());
    ann.insert(annotations::CONTAINER_NAME.to_string(), data.name.clone());
    ann.insert(
        annotations::NODE_NAME.to_string(),
        pod.spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default(),
    );

    let mut entry = KiveData::new(
        &entry_name(data.ino, Some(dev_id), &pod.name_any(), &data.id),
        KiveDataSpec {
            inode_no: data.ino,
            dev_id: Some(dev_id),
            kernel_id: kernel_id.to_string(),
        },
    );
    entry.metadata.labels = Some(labels);
    entry.metadata.annotations = Some(ann);
    entry
}

/* ============================= ADMISSION ============================= */

/// Select the containers one match clause admits for resolution.
///
/// Applies the client-side half of the pipeline: Running phase, the
/// container-name regex, skipping containers that already have an entry for
/// this trap, and the per-trap dedup set that keeps a container from being
/// admitted twice across overlapping clauses.
pub fn admit_containers<'a>(
    clause: &KiveTrapMatch,
    pods: &'a [Pod],
    existing: &[KiveData],
    matched_containers: &mut HashSet<(String, String, String)>,
) -> Vec<(&'a Pod, &'a ContainerStatus)> {
    let mut admitted = Vec::new();

    for pod in pods {
        if !pod_is_running(pod) {
            continue;
        }

        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_deref())
            .unwrap_or_default();

        for status in statuses {
            match container_name_matches(clause.container_name.as_deref(), &status.name) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(container = %status.name, error = %e, "container_regex_invalid");
                    continue;
                }
            }

            if existing
                .iter()
                .any(|entry| entry_matches_container(entry, pod, status))
            {
                continue;
            }

            let key = (
                pod.name_any(),
                pod.metadata.namespace.clone().unwrap_or_default(),
                status.container_id.clone().unwrap_or_default(),
            );
            if !matched_containers.insert(key) {
                continue;
            }

            admitted.push((pod, status));
        }
    }

    admitted
}

/* ============================= RECONCILE ============================= */

enum ClauseOutcome {
    Done,
    Requeue,
}

/// One full policy pass: every policy, every trap, every match clause.
///
/// Triggered by any KivePolicy change, including force-reconcile bumps
/// from the pod reconciler.
pub async fn reconcile(
    _trigger: Arc<KivePolicy>,
    ctx: Arc<OperatorContext>,
) -> Result<Action, Error> {
    metrics::POLICY_RECONCILES.inc();
    debug!("policy_reconcile_start");

    let policies_api: Api<KivePolicy> = Api::all(ctx.client.clone());
    let policies = policies_api.list(&ListParams::default()).await?;

    let mut finalizing = false;

    for policy in &policies.items {
        // A policy in deletion only needs its finalizer cleared; the entry
        // reconciler observes the missing traps on the next tick.
        if policy.metadata.deletion_timestamp.is_some() {
            if has_finalizer(&policy.metadata, POLICY_FINALIZER) {
                finalizing = true;
                if let Err(e) = remove_finalizer(&policies_api, policy, POLICY_FINALIZER).await {
                    warn!(policy = %policy.name_any(), error = %e, "finalizer_remove_failed");
                } else {
                    info!(policy = %policy.name_any(), "policy_finalizer_cleared");
                }
            }
            continue;
        }

        if !has_finalizer(&policy.metadata, POLICY_FINALIZER) {
            if let Err(e) = add_finalizer(&policies_api, policy, POLICY_FINALIZER).await {
                warn!(policy = %policy.name_any(), error = %e, "finalizer_add_failed");
            }
        }

        let alert_version = policy.spec.alert_version.clone().unwrap_or_default();

        for trap in &policy.spec.traps {
            let tid = match trap_id(trap, &alert_version) {
                Ok(tid) => tid,
                Err(e) => {
                    warn!(
                        policy = %policy.name_any(),
                        path = %trap.path,
                        error = %e,
                        "trap_id_failed"
                    );
                    continue;
                }
            };

            // One entry per (pod, namespace, container) per trap, even when
            // several match clauses select the same container.
            let mut matched_containers: HashSet<(String, String, String)> = HashSet::new();

            for clause in &trap.match_any {
                match reconcile_clause(&ctx, policy, trap, &tid, clause, &mut matched_containers)
                    .await?
                {
                    ClauseOutcome::Done => {}
                    ClauseOutcome::Requeue => return Ok(Action::requeue(REQUEUE_BACKOFF)),
                }
            }
        }
    }

    if finalizing {
        nudge_entry_reconciler(&ctx).await;
    }

    Ok(Action::await_change())
}

/// Resolve one match clause of one trap into KiveData objects.
async fn reconcile_clause(
    ctx: &OperatorContext,
    policy: &KivePolicy,
    trap: &KiveTrap,
    tid: &str,
    clause: &KiveTrapMatch,
    matched_containers: &mut HashSet<(String, String, String)>,
) -> Result<ClauseOutcome, Error> {
    let entries_api: Api<KiveData> = Api::all(ctx.client.clone());
    let existing = entries_api
        .list(&ListParams::default().labels(&format!("{TRAP_ID_LABEL}={tid}")))
        .await?;

    let pods_api: Api<Pod> = Api::all(ctx.client.clone());
    let pods = match pods_api.list(&list_params_for_match(clause)).await {
        Ok(pods) => pods,
        Err(e) => {
            warn!(policy = %policy.name_any(), error = %e, "pod_list_failed");
            return Ok(ClauseOutcome::Done);
        }
    };

    for (pod, status) in admit_containers(clause, &pods.items, &existing.items, matched_containers)
    {
        let data = {
            let mut runtimes = ctx.runtimes.lock().await;
            match runtimes.container_data(status, trap).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        pod = %pod.name_any(),
                        container = %status.name,
                        error = %e,
                        "container_data_failed"
                    );
                    continue;
                }
            }
        };

        if data.requeue {
            return Ok(ClauseOutcome::Requeue);
        }
        if !data.found {
            debug!(
                pod = %pod.name_any(),
                container = %status.name,
                path = %trap.path,
                "trap_path_not_found"
            );
            continue;
        }

        let entry = build_entry(policy, trap, tid, pod, status, &data, &ctx.kernel_id);
        let name = entry.name_any();

        match entries_api
            .patch(
                &name,
                &PatchParams::apply(POLICY_FIELD_OWNER).force(),
                &Patch::Apply(&entry),
            )
            .await
        {
            Ok(_) => {
                metrics::ENTRIES_APPLIED.inc();
                info!(
                    entry = %name,
                    policy = %policy.name_any(),
                    pod = %pod.name_any(),
                    inode = data.ino,
                    "entry_applied"
                );
            }
            Err(e) => {
                warn!(entry = %name, error = %e, "entry_apply_failed");
                continue;
            }
        }
    }

    Ok(ClauseOutcome::Done)
}

/// After clearing a policy finalizer, touch one entry so the entry
/// reconciler runs and removes the now-orphaned objects.
async fn nudge_entry_reconciler(ctx: &OperatorContext) {
    let entries_api: Api<KiveData> = Api::all(ctx.client.clone());
    let entries = match entries_api.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, "entry_nudge_list_failed");
            return;
        }
    };

    let Some(entry) = entries.items.first() else {
        return;
    };

    if let Err(e) = bump_force_reconcile(&entries_api, &entry.name_any()).await {
        warn!(entry = %entry.name_any(), error = %e, "entry_nudge_failed");
    }
}

/* ============================= DRIVER ============================= */

pub fn error_policy(
    _policy: Arc<KivePolicy>,
    error: &Error,
    _ctx: Arc<OperatorContext>,
) -> Action {
    metrics::POLICY_RECONCILE_ERRORS.inc();
    warn!(error = %error, "policy_reconcile_error");
    Action::requeue(ERROR_BACKOFF)
}

/// Run the policy controller until its stream ends or the process stops.
pub async fn run(ctx: Arc<OperatorContext>, ready: Arc<Mutex<ReadyState>>) {
    let policies: Api<KivePolicy> = Api::all(ctx.client.clone());

    info!("policy_controller_started");

    Controller::new(policies, watcher::Config::default())
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
                    warn!(error = %e, "policy_dispatch_error");
                }
            }
        })
        .await;

    info!("policy_controller_stopped");
}

/* ============================= TESTS ============================= */
