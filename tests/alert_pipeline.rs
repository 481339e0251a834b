mod common;

use common::{make_policy, make_running_pod, make_trap, match_pod};
use kive_operator::alert::KiveAlert;
use kive_operator::compare::trap_id;
use kive_operator::controller::policy::build_entry;
use kive_operator::emitter::{ProcessInfo, build_alert, parse_cmdline, read_process_info};
use kive_operator::probe::{EVENT_SIZE, ProbeEvent, decode_event};
use kive_operator::runtime::ContainerData;

// ══════════════════════════════════════════════════════════════════
// Alert pipeline (no cluster, no kernel required)
//
// Exercises raw record → decoded event → entry join → enrichment →
// wire JSON, end to end.
// ══════════════════════════════════════════════════════════════════

fn encode_record(pid: i32, ino: u64, mask: i32, comm: &str) -> Vec<u8> {
    let mut raw = Vec::with_capacity(EVENT_SIZE);
    raw.extend_from_slice(&pid.to_le_bytes());
    raw.extend_from_slice(&(pid as u32).to_le_bytes());
    raw.extend_from_slice(&0u32.to_le_bytes());
    raw.extend_from_slice(&0u32.to_le_bytes());
    raw.extend_from_slice(&ino.to_le_bytes());
    raw.extend_from_slice(&mask.to_le_bytes());
    let mut comm_bytes = [0u8; 16];
    comm_bytes[..comm.len()].copy_from_slice(comm.as_bytes());
    raw.extend_from_slice(&comm_bytes);
    raw
}

fn entry_for_trap(path: &str, callback: Option<&str>, inode: u64) -> kive_operator::crd::KiveData {
    let mut trap = make_trap(path, vec![match_pod("test-pod", "kive-test")]);
    trap.callback = callback.map(str::to_string);
    let policy = make_policy("p1", "v2alpha1", vec![trap.clone()]);
    let tid = trap_id(&trap, "v2alpha1").expect("should hash");

    let pod = make_running_pod(
        "test-pod",
        "kive-test",
        &[("test-nginx", "containerd://aaa", true)],
    );
    let status = &pod
        .status
        .as_ref()
        .expect("status set")
        .container_statuses
        .as_ref()
        .expect("statuses set")[0];

    let mut data = ContainerData::found(inode, 0x801);
    data.id = "containerd://aaa".to_string();
    data.name = "test-nginx".to_string();

    build_entry(&policy, &trap, &tid, &pod, status, &data, "kernel-1")
}

// ── Full pipeline ──

#[test]
fn test_record_to_alert_pipeline() {
    let raw = encode_record(4242, 131072, 4, "cat");
    let event = decode_event(&raw).expect("should decode");

    let entry = entry_for_trap("/test", None, 131072);
    assert_eq!(entry.spec.inode_no, event.ino);

    let process = ProcessInfo {
        binary: "/bin/cat".to_string(),
        cwd: "/root".to_string(),
        arguments: "/test".to_string(),
    };

    let alert = build_alert(&entry, &event, &process, "2026-03-01T12:00:00Z".to_string());

    assert_eq!(alert.alert_version, "v2alpha1");
    assert_eq!(alert.policy_name, "p1");
    assert_eq!(alert.metadata.path, "/test");
    assert_eq!(alert.metadata.inode, 131072);
    assert_eq!(alert.metadata.mask, 4);
    assert_eq!(alert.pod.name, "test-pod");
    assert_eq!(alert.pod.namespace, "kive-test");
    assert_eq!(alert.pod.container.name, "test-nginx");
    assert_eq!(alert.process.pid, 4242);
    assert_eq!(alert.process.binary, "/bin/cat");
}

#[test]
fn test_alert_json_round_trips() {
    let event = decode_event(&encode_record(7, 42, 2, "sh")).expect("should decode");
    let entry = entry_for_trap("/etc/shadow", Some("http://sink/alerts"), 42);

    let alert = build_alert(
        &entry,
        &event,
        &ProcessInfo::default(),
        "2026-03-01T12:00:00Z".to_string(),
    );

    let json = serde_json::to_string(&alert).expect("should serialize");
    let parsed: KiveAlert = serde_json::from_str(&json).expect("should deserialize");
    assert_eq!(parsed, alert);
}

#[test]
fn test_alert_carries_callback_from_trap() {
    let event = decode_event(&encode_record(7, 42, 2, "sh")).expect("should decode");
    let entry = entry_for_trap("/etc/shadow", Some("http://sink/alerts"), 42);

    let alert = build_alert(
        &entry,
        &event,
        &ProcessInfo::default(),
        "t".to_string(),
    );
    assert_eq!(alert.metadata.callback, "http://sink/alerts");
}

#[test]
fn test_alert_wire_keys_match_contract() {
    let event = decode_event(&encode_record(7, 42, 2, "sh")).expect("should decode");
    let entry = entry_for_trap("/test", None, 42);

    let alert = build_alert(&entry, &event, &ProcessInfo::default(), "t".to_string());
    let value = serde_json::to_value(&alert).expect("should serialize");

    assert!(value.get("kive-alert-version").is_some());
    assert!(value.get("kive-policy-name").is_some());
    assert!(value["metadata"].get("kernel-id").is_some());
    assert!(value["pod"]["container"].get("id").is_some());
    assert!(value["process"].get("arguments").is_some());
}

// ── Enrichment against a fixture procfs ──

#[test]
fn test_enrichment_reads_cmdline_and_degrades() {
    let proc_root = tempfile::tempdir().expect("tempdir");
    let proc_dir = proc_root.path().join("4242");
    std::fs::create_dir_all(&proc_dir).expect("fixture dir");
    std::fs::write(proc_dir.join("cmdline"), b"/bin/cat\0/test\0").expect("fixture cmdline");

    let root = proc_root.path().to_str().expect("utf-8");
    let info = read_process_info(&[root], 4242, "cat");
    assert_eq!(info.binary, "/bin/cat");
    assert_eq!(info.arguments, "/test");

    // Unknown pid degrades to comm.
    let missing = read_process_info(&[root], 9999, "cat");
    assert_eq!(missing.binary, "cat");
}

#[test]
fn test_comm_fallback_after_decode() {
    let event = decode_event(&encode_record(1, 1, 0, "kworker")).expect("should decode");
    assert_eq!(event.comm_str(), "kworker");

    let info = read_process_info(&["/nonexistent-proc"], event.pid, &event.comm_str());
    assert_eq!(info.binary, "kworker");
}

#[test]
fn test_cmdline_token_join_matches_event_shape() {
    let (binary, arguments) =
        parse_cmdline(b"/usr/bin/tail\0-f\0/var/log/syslog\0").expect("should parse");
    assert_eq!(binary, "/usr/bin/tail");
    assert_eq!(arguments, "-f /var/log/syslog");
}

// ── Join semantics ──

#[test]
fn test_event_without_matching_inode_produces_no_join() {
    let event: ProbeEvent = decode_event(&encode_record(7, 999, 2, "sh")).expect("should decode");
    let entry = entry_for_trap("/test", None, 42);

    // The emitter joins on (inode, kernel id); a mismatched inode means the
    // event is dropped.
    assert_ne!(entry.spec.inode_no, event.ino);
}
