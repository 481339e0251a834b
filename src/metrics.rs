use std::sync::LazyLock;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};

/* ============================= REGISTRY ============================= */

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

macro_rules! counter {
    ($name:literal, $help:literal) => {
        LazyLock::new(|| {
            let c = IntCounter::new($name, $help).expect("metric definition is valid");
            REGISTRY
                .register(Box::new(c.clone()))
                .expect("metric not yet registered");
            c
        })
    };
}

/* ============================= METRICS ============================= */

pub static POLICY_RECONCILES: LazyLock<IntCounter> = counter!(
    "kive_policy_reconcile_total",
    "Total KivePolicy reconciliation passes"
);

pub static POLICY_RECONCILE_ERRORS: LazyLock<IntCounter> = counter!(
    "kive_policy_reconcile_errors_total",
    "Total KivePolicy reconciliation errors"
);

pub static ENTRY_RECONCILES: LazyLock<IntCounter> = counter!(
    "kive_entry_reconcile_total",
    "Total KiveData reconciliation passes"
);

pub static ENTRY_RECONCILE_ERRORS: LazyLock<IntCounter> = counter!(
    "kive_entry_reconcile_errors_total",
    "Total KiveData reconciliation errors"
);

pub static POD_RECONCILES: LazyLock<IntCounter> = counter!(
    "kive_pod_reconcile_total",
    "Total pod event reconciliation passes"
);

pub static POD_RECONCILE_ERRORS: LazyLock<IntCounter> = counter!(
    "kive_pod_reconcile_errors_total",
    "Total pod event reconciliation errors"
);

pub static ENTRIES_APPLIED: LazyLock<IntCounter> = counter!(
    "kive_entries_applied_total",
    "Total KiveData objects created or updated via server-side apply"
);

pub static ENTRIES_DELETED: LazyLock<IntCounter> = counter!(
    "kive_entries_deleted_total",
    "Total KiveData objects deleted as orphaned or stale"
);

pub static DECODE_FAILURES: LazyLock<IntCounter> = counter!(
    "kive_event_decode_failures_total",
    "Total malformed ring-buffer records"
);

pub static TRACED_INODES: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("kive_traced_inodes", "Keys currently in the traced-inode set")
        .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

pub static PROBE_LOADED: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("kive_probe_loaded", "Whether the kernel probe is loaded (0/1)")
        .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

pub static ALERTS_EMITTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("kive_alerts_emitted_total", "Alerts emitted, by sink"),
        &["sink"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

/* ============================= HELPERS ============================= */

/// Force-init every metric so it appears on /metrics before first use.
pub fn force_init() {
    LazyLock::force(&POLICY_RECONCILES);
    LazyLock::force(&POLICY_RECONCILE_ERRORS);
    LazyLock::force(&ENTRY_RECONCILES);
    LazyLock::force(&ENTRY_RECONCILE_ERRORS);
    LazyLock::force(&POD_RECONCILES);
    LazyLock::force(&POD_RECONCILE_ERRORS);
    LazyLock::force(&ENTRIES_APPLIED);
    LazyLock::force(&ENTRIES_DELETED);
    LazyLock::force(&DECODE_FAILURES);
    LazyLock::force(&TRACED_INODES);
    LazyLock::force(&PROBE_LOADED);
    LazyLock::force(&ALERTS_EMITTED);
}

/// Render the registry in the prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/* ============================= TESTS ============================= */
