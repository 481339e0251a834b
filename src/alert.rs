use serde::{Deserialize, Serialize};
use tracing::warn;

/* ============================= VERSIONS ============================= */

/// Alert schema versions this build can emit, oldest first.
pub const SUPPORTED_ALERT_VERSIONS: &[&str] = &["v1", "v2alpha1"];

/// Pick the alert version for an entry's snapshot annotation.
///
/// An unknown value is logged and falls back to the oldest supported
/// version; an absent annotation means `v1`.
pub fn select_alert_version(annotated: Option<&str>) -> &'static str {
    match annotated {
        None | Some("") => SUPPORTED_ALERT_VERSIONS[0],
        Some(v) => match SUPPORTED_ALERT_VERSIONS.iter().find(|s| **s == v) {
            Some(found) => found,
            None => {
                warn!(version = %v, "unknown_alert_version_falling_back");
                SUPPORTED_ALERT_VERSIONS[0]
            }
        },
    }
}

/* ============================= ALERT BODY ============================= */

/// Container that touched the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContainerMetadata {
    pub id: String,
    pub name: String,
}

/// Pod where the file lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PodMetadata {
    pub name: String,
    pub namespace: String,
    pub ip: String,
    pub container: ContainerMetadata,
}

/// Node that raised the event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeMetadata {
    pub name: String,
}

/// Process that performed the access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProcessMetadata {
    pub pid: i32,
    pub tgid: u32,
    pub uid: u32,
    pub gid: u32,
    pub binary: String,
    pub cwd: String,
    pub arguments: String,
}

/// File- and probe-level details of the access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AlertMetadata {
    pub path: String,
    pub inode: u64,
    pub mask: i32,
    #[serde(rename = "kernel-id")]
    pub kernel_id: String,
    pub callback: String,
}

/// The enriched file-access alert, POSTed to the callback or logged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct KiveAlert {
    #[serde(rename = "kive-alert-version")]
    pub alert_version: String,
    #[serde(rename = "kive-policy-name")]
    pub policy_name: String,
    /// RFC 3339.
    pub timestamp: String,
    pub metadata: AlertMetadata,
    pub pod: PodMetadata,
    pub node: NodeMetadata,
    pub process: ProcessMetadata,
}

/* ============================= TESTS ============================= */
