use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= CONSTANTS ============================= */

/// API group shared by both custom resources.
pub const API_GROUP: &str = "kive.dev";

/// Label holding the trap identity on a KiveData object (63 hex chars).
pub const TRAP_ID_LABEL: &str = "kive.dev/trap-id";

/// Label holding the owning kernel boot id on a KiveData object.
pub const KERNEL_ID_LABEL: &str = "kive.dev/kernel-id";

/// Finalizer claimed by the policy reconciler.
pub const POLICY_FINALIZER: &str = "kivepolicy.kive.dev/finalizer";

/// Finalizer claimed by the entry reconciler while a key is programmed.
pub const ENTRY_FINALIZER: &str = "kivedata.kive.dev/finalizer";

/// Annotation bumped to force a reconcile on the peer controller.
pub const FORCE_RECONCILE_ANNOTATION: &str = "kive.dev/force-reconcile";

/// Field owner used for server-side apply of KiveData objects.
pub const POLICY_FIELD_OWNER: &str = "kive-policy-controller";

/// Field owner used for finalizer patches on KiveData objects.
pub const ENTRY_FIELD_OWNER: &str = "kive-entry-controller";

/// Annotation keys snapshotting alert context on a KiveData object.
pub mod annotations {
    pub const ALERT_VERSION: &str = "kive.dev/alert-version";
    pub const POLICY_NAME: &str = "kive.dev/policy-name";
    pub const CALLBACK: &str = "kive.dev/callback";
    pub const POD_NAME: &str = "kive.dev/pod-name";
    pub const NAMESPACE: &str = "kive.dev/namespace";
    pub const POD_IP: &str = "kive.dev/pod-ip";
    pub const PATH: &str = "kive.dev/path";
    pub const CONTAINER_ID: &str = "kive.dev/container-id";
    pub const CONTAINER_NAME: &str = "kive.dev/container-name";
    pub const NODE_NAME: &str = "kive.dev/node-name";
}

/* ============================= TRAP TYPES ============================= */

/// A single file trap inside a KivePolicy.
///
/// The trap names an absolute path inside the matched containers; the
/// operator resolves it to a kernel inode and installs that inode in the
/// traced set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct KiveTrap {
    /// Absolute path to monitor, as seen from inside the container.
    pub path: String,

    /// Create the file if it does not exist yet.
    #[serde(default)]
    pub create: bool,

    /// File mode used when `create` is set.
    #[serde(default)]
    pub mode: u32,

    /// HTTP endpoint receiving alert POSTs. Empty means log only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,

    /// Match clauses combined by OR. An empty list matches nothing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_any: Vec<KiveTrapMatch>,
}

/// A conjunction of optional predicates selecting pods and containers.
///
/// All present fields must hold for a container to be selected.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct KiveTrapMatch {
    /// Filter pods by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    /// Filter containers by name; compiled as a regular expression.
    /// Empty or absent matches every container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    /// Filter pods by namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Filter pods by IP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Filter pods by label equality on every listed key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

/* ============================= KIVEPOLICY ============================= */

/// KivePolicy declares which files to watch in which workloads.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "kive.dev",
    version = "v2alpha1",
    kind = "KivePolicy",
    plural = "kivepolicies"
)]
#[serde(rename_all = "camelCase")]
pub struct KivePolicySpec {
    /// Schema version used for alerts produced by this policy's traps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_version: Option<String>,

    /// Traps evaluated independently; each may select many containers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traps: Vec<KiveTrap>,
}

/* ============================= KIVEDATA ============================= */

/// KiveData is the reification of one resolved trap: trap T matched
/// container C on this node, producing inode I.
///
/// Owned exclusively by the node whose running kernel matches `kernel_id`;
/// only that node programs or deletes it.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "kive.dev",
    version = "v2alpha1",
    kind = "KiveData",
    plural = "kivedata"
)]
#[serde(rename_all = "camelCase")]
pub struct KiveDataSpec {
    /// Inode number of the resolved file.
    #[serde(default)]
    pub inode_no: u64,

    /// Device of the resolved file, in the kernel map-key layout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_id: Option<u32>,

    /// Boot id of the kernel that resolved the inode.
    #[serde(default)]
    pub kernel_id: String,
}

/* ============================= TESTS ============================= */
