use kube::Client;
use kube::ResourceExt;
use kube::api::{Api, ListParams};
use tracing::{debug, info, warn};

use crate::alert::{
    AlertMetadata, ContainerMetadata, KiveAlert, NodeMetadata, PodMetadata, ProcessMetadata,
    select_alert_version,
};
use crate::compare::entry_annotation;
use crate::crd::{KiveData, annotations};
use crate::error::{Error, Result};
use crate::metrics;
use crate::probe::{EventReader, ProbeEvent};
use crate::resolver::{PROC_ROOT, REAL_PROC_ROOT};

/* ============================= PROCESS ENRICHMENT ============================= */

/// What `/proc` told us about the process behind an event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessInfo {
    pub binary: String,
    pub cwd: String,
    pub arguments: String,
}

/// Split a NUL-separated cmdline into binary and argument string.
pub fn parse_cmdline(raw: &[u8]) -> Option<(String, String)> {
    let mut tokens = raw
        .split(|b| *b == 0)
        .filter(|t| !t.is_empty())
        .map(|t| String::from_utf8_lossy(t).into_owned());

    let binary = tokens.next()?;
    let arguments = tokens.collect::<Vec<_>>().join(" ");
    Some((binary, arguments))
}

/// Read cwd and cmdline for a pid, trying each proc root in order and
/// degrading to the event's `comm` when none is readable.
pub fn read_process_info(proc_roots: &[&str], pid: i32, comm: &str) -> ProcessInfo {
    if pid > 0 {
        for root in proc_roots {
            let proc_dir = std::path::PathBuf::from(root).join(pid.to_string());

            let cmdline = std::fs::read(proc_dir.join("cmdline"));
            let cwd = std::fs::read_link(proc_dir.join("cwd"));

            if let Ok(raw) = cmdline {
                if let Some((binary, arguments)) = parse_cmdline(&raw) {
                    return ProcessInfo {
                        binary,
                        arguments,
                        cwd: cwd
                            .map(|p| p.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                    };
                }
            }
        }
    }

    ProcessInfo {
        binary: comm.to_string(),
        ..Default::default()
    }
}

/* ============================= ALERT CONSTRUCTION ============================= */

/// Join an event with its resolved entry's snapshot into the wire alert.
pub fn build_alert(
    entry: &KiveData,
    event: &ProbeEvent,
    process: &ProcessInfo,
    timestamp: String,
) -> KiveAlert {
    let version = select_alert_version(
        entry
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(annotations::ALERT_VERSION))
            .map(String::as_str),
    );

    KiveAlert {
        alert_version: version.to_string(),
        policy_name: entry_annotation(entry, annotations::POLICY_NAME).to_string(),
        timestamp,
        metadata: AlertMetadata {
            path: entry_annotation(entry, annotations::PATH).to_string(),
            inode: event.ino,
            mask: event.mask,
            kernel_id: entry.spec.kernel_id.clone(),
            callback: entry_annotation(entry, annotations::CALLBACK).to_string(),
        },
        pod: PodMetadata {
            name: entry_annotation(entry, annotations::POD_NAME).to_string(),
            namespace: entry_annotation(entry, annotations::NAMESPACE).to_string(),
            ip: entry_annotation(entry, annotations::POD_IP).to_string(),
            container: ContainerMetadata {
                id: entry_annotation(entry, annotations::CONTAINER_ID).to_string(),
                name: entry_annotation(entry, annotations::CONTAINER_NAME).to_string(),
            },
        },
        node: NodeMetadata {
            name: entry_annotation(entry, annotations::NODE_NAME).to_string(),
        },
        process: ProcessMetadata {
            pid: event.pid,
            tgid: event.tgid,
            uid: event.uid,
            gid: event.gid,
            binary: process.binary.clone(),
            cwd: process.cwd.clone(),
            arguments: process.arguments.clone(),
        },
    }
}

/* ============================= EMITTER ============================= */

/// Long-lived reader of the ring buffer, spawned once by the entry
/// reconciler when the probe first loads. Only a closed buffer ends it.
pub struct AlertEmitter {
    client: Client,
    kernel_id: String,
    reader: EventReader,
    http: reqwest::Client,
}

impl AlertEmitter {
    pub fn new(client: Client, kernel_id: String, reader: EventReader) -> Self {
        Self {
            client,
            kernel_id,
            reader,
            http: reqwest::Client::new(),
        }
    }

    pub async fn run(mut self) {
        info!("alert_emitter_started");

        loop {
            let event = match self.reader.read_event().await {
                Ok(event) => event,
                Err(Error::BufferClosed) => {
                    warn!("alert_emitter_stopped_buffer_closed");
                    return;
                }
                Err(Error::Decode(len)) => {
                    metrics::DECODE_FAILURES.inc();
                    warn!(record_len = len, "event_decode_failed");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "event_read_failed");
                    continue;
                }
            };

            if let Err(e) = self.handle_event(event).await {
                warn!(error = %e, inode = event.ino, "alert_emit_failed");
            }
        }
    }

    async fn handle_event(&self, event: ProbeEvent) -> Result<()> {
        let entries: Api<KiveData> = Api::all(self.client.clone());
        let list = entries.list(&ListParams::default()).await?;

        let Some(entry) = list
            .items
            .iter()
            .find(|e| e.spec.inode_no == event.ino && e.spec.kernel_id == self.kernel_id)
        else {
            debug!(inode = event.ino, "event_without_matching_entry");
            return Ok(());
        };

        let process = read_process_info(
            &[REAL_PROC_ROOT, PROC_ROOT],
            event.pid,
            &event.comm_str(),
        );

        let alert = build_alert(entry, &event, &process, chrono::Utc::now().to_rfc3339());
        self.emit(entry, &alert).await
    }

    async fn emit(&self, entry: &KiveData, alert: &KiveAlert) -> Result<()> {
        let callback = entry_annotation(entry, annotations::CALLBACK);

        if callback.is_empty() {
            let body = serde_json::to_string(alert)?;
            info!(alert = %body, policy = %alert.policy_name, "file_access_detected");
            metrics::ALERTS_EMITTED.with_label_values(&["log"]).inc();
            return Ok(());
        }

        self.http
            .post(callback)
            .json(alert)
            .send()
            .await
            .map_err(|e| Error::Runtime(format!("callback post: {e}")))?;
        metrics::ALERTS_EMITTED.with_label_values(&["callback"]).inc();

        debug!(
            callback = %callback,
            policy = %alert.policy_name,
            name = %entry.name_any(),
            "alert_posted"
        );
        Ok(())
    }
}

/* ============================= TESTS ============================= */
