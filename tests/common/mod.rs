use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use kive_operator::crd::{KivePolicy, KivePolicySpec, KiveTrap, KiveTrapMatch};

/// A pod with the given phase and one container status per `(name, id, ready)`.
pub fn make_pod(
    name: &str,
    namespace: &str,
    ip: &str,
    node: &str,
    phase: &str,
    containers: &[(&str, &str, bool)],
) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), name.to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            pod_ip: Some(ip.to_string()),
            container_statuses: Some(
                containers
                    .iter()
                    .map(|(cname, cid, ready)| ContainerStatus {
                        name: cname.to_string(),
                        container_id: Some(cid.to_string()),
                        ready: *ready,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
    }
}

pub fn make_running_pod(name: &str, namespace: &str, containers: &[(&str, &str, bool)]) -> Pod {
    make_pod(name, namespace, "10.0.0.9", "node-a", "Running", containers)
}

pub fn make_trap(path: &str, match_any: Vec<KiveTrapMatch>) -> KiveTrap {
    KiveTrap {
        path: path.to_string(),
        create: true,
        mode: 0o644,
        callback: None,
        match_any,
    }
}

pub fn match_pod(pod_name: &str, namespace: &str) -> KiveTrapMatch {
    KiveTrapMatch {
        pod_name: Some(pod_name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

pub fn make_policy(name: &str, alert_version: &str, traps: Vec<KiveTrap>) -> KivePolicy {
    KivePolicy::new(
        name,
        KivePolicySpec {
            alert_version: Some(alert_version.to_string()),
            traps,
        },
    )
}
