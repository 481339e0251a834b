use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::ResourceExt;
use kube::api::ListParams;
use sha2::{Digest, Sha256};

use crate::crd::{KiveData, KiveTrap, KiveTrapMatch, TRAP_ID_LABEL, annotations};
use crate::error::{Error, Result};

/* ============================= TRAP IDENTITY ============================= */

/// Store labels cap values at 63 characters; the trap id fills it exactly.
pub const TRAP_ID_LEN: usize = 63;

/// Deterministic identity of a trap under a given alert schema version.
///
/// `hex(sha256(canonical_json(trap) ∥ alert_version))` truncated to 63
/// characters. Canonical JSON comes from `serde_json::Value`, whose object
/// keys are sorted, so the value is stable across releases.
pub fn trap_id(trap: &KiveTrap, alert_version: &str) -> Result<String> {
    let canonical = serde_json::to_string(&serde_json::to_value(trap)?)?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(alert_version.as_bytes());

    let mut id = hex::encode(hasher.finalize());
    id.truncate(TRAP_ID_LEN);
    Ok(id)
}

/* ============================= NAMING ============================= */

const MAX_NAME_LEN: usize = 253;

/// Deterministic KiveData name, unique per (node, trap, container):
/// `kive-<inode hex>-<dev hex>-<pod>-<short container id>`.
pub fn entry_name(inode: u64, dev: Option<u32>, pod_name: &str, container_id: &str) -> String {
    let raw_id = container_id
        .split_once("://")
        .map(|(_, id)| id)
        .unwrap_or(container_id);
    let short_id: String = raw_id.chars().take(12).collect();

    let mut name = format!(
        "kive-{:x}-{:x}-{}-{}",
        inode,
        dev.unwrap_or(0),
        pod_name,
        short_id
    )
    .to_lowercase()
    .chars()
    .map(|c| {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            c
        } else {
            '-'
        }
    })
    .collect::<String>();

    name.truncate(MAX_NAME_LEN);
    name.trim_end_matches('-').to_string()
}

/// Split a `"<scheme>://<id>"` container reference into its parts.
pub fn split_runtime_id(input: &str) -> Result<(&str, &str)> {
    input
        .split_once("://")
        .filter(|(scheme, id)| !scheme.is_empty() && !id.is_empty())
        .ok_or_else(|| Error::MalformedContainerId(input.to_string()))
}

/* ============================= REGEX MATCH ============================= */

/// Match a container name against the clause's pattern.
///
/// An empty or absent pattern matches every container.
pub fn container_name_matches(pattern: Option<&str>, container_name: &str) -> Result<bool> {
    match pattern {
        None | Some("") => Ok(true),
        Some(p) => {
            let re = regex::Regex::new(p).map_err(|source| Error::Regex {
                pattern: p.to_string(),
                source,
            })?;
            Ok(re.is_match(container_name))
        }
    }
}

/* ============================= POD SELECTION ============================= */

/// Build the server-side selectors for one match clause.
///
/// Name, namespace and pod IP become field selectors; `match_labels` becomes
/// a label selector. Container-name filtering stays client-side.
pub fn list_params_for_match(clause: &KiveTrapMatch) -> ListParams {
    let mut params = ListParams::default();

    let mut fields = Vec::new();
    if let Some(name) = clause.pod_name.as_deref().filter(|s| !s.is_empty()) {
        fields.push(format!("metadata.name={name}"));
    }
    if let Some(ns) = clause.namespace.as_deref().filter(|s| !s.is_empty()) {
        fields.push(format!("metadata.namespace={ns}"));
    }
    if let Some(ip) = clause.ip.as_deref().filter(|s| !s.is_empty()) {
        fields.push(format!("status.podIP={ip}"));
    }
    if !fields.is_empty() {
        params = params.fields(&fields.join(","));
    }

    if !clause.match_labels.is_empty() {
        let labels = clause
            .match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        params = params.labels(&labels);
    }

    params
}

/* ============================= PHASES ============================= */

pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

pub fn pod_is_running(pod: &Pod) -> bool {
    pod_phase(pod) == "Running"
}

/// Succeeded and Failed pods are gone for tracing purposes.
pub fn pod_is_terminal(pod: &Pod) -> bool {
    matches!(pod_phase(pod), "Succeeded" | "Failed")
}

pub fn pod_ip(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .unwrap_or_default()
}

/* ============================= ENTRY COMPARATORS ============================= */

/// Annotation accessor; absent keys read as empty.
pub fn entry_annotation<'a>(entry: &'a KiveData, key: &str) -> &'a str {
    entry
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .unwrap_or_default()
}

/// The trap-id label recorded on the entry, empty if unlabelled.
pub fn entry_trap_id(entry: &KiveData) -> &str {
    entry
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(TRAP_ID_LABEL))
        .map(String::as_str)
        .unwrap_or_default()
}

/// Does this entry reify the given container of the given pod?
///
/// Linkage is by value: pod name, namespace and the runtime container id
/// recorded in the snapshot annotations.
pub fn entry_matches_container(entry: &KiveData, pod: &Pod, status: &ContainerStatus) -> bool {
    entry_annotation(entry, annotations::POD_NAME) == pod.name_any()
        && entry_annotation(entry, annotations::NAMESPACE)
            == pod.metadata.namespace.as_deref().unwrap_or_default()
        && entry_annotation(entry, annotations::CONTAINER_ID)
            == status.container_id.as_deref().unwrap_or_default()
        && entry_annotation(entry, annotations::CONTAINER_NAME) == status.name
}

/// Does this entry refer to the given pod? Used by the pod reconciler,
/// which also keys on the pod IP to catch recycled names.
pub fn entry_refers_to_pod(entry: &KiveData, pod: &Pod) -> bool {
    entry_annotation(entry, annotations::POD_NAME) == pod.name_any()
        && entry_annotation(entry, annotations::NAMESPACE)
            == pod.metadata.namespace.as_deref().unwrap_or_default()
        && entry_annotation(entry, annotations::POD_IP) == pod_ip(pod)
}

/* ============================= TESTS ============================= */
