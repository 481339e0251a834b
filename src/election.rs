use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{Error, Result};

/* ============================= CONSTANTS ============================= */

/// Namespace holding the coordination leases, overridable via POD_NAMESPACE.
pub const DEFAULT_LEASE_NAMESPACE: &str = "kive-system";

/// Cluster-wide lease gating the pod reconciler.
pub const POD_RECONCILER_LEASE: &str = "kive-pod-reconciler";

const LEASE_DURATION_SECONDS: i64 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Lease name for the entry reconciler: one holder per running kernel.
pub fn entry_lease_name(kernel_id: &str) -> String {
    let safe: String = kernel_id
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let mut name = format!("kive-entry-{safe}");
    name.truncate(63);
    name.trim_end_matches('-').to_string()
}

/* ============================= LEASE STATE ============================= */

pub fn lease_holder(lease: &Lease) -> &str {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
        .unwrap_or_default()
}

/// A lease is expired once its renew time plus its duration is in the past.
/// A lease without a renew time is treated as expired.
pub fn lease_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = lease.spec.as_ref() else {
        return true;
    };
    let Some(renew) = spec.renew_time.as_ref() else {
        return true;
    };
    let duration = spec
        .lease_duration_seconds
        .map(i64::from)
        .unwrap_or(LEASE_DURATION_SECONDS);
    renew.0 + chrono::Duration::seconds(duration) < now
}

/* ============================= ELECTION ============================= */

/// Acquire-and-hold leader election over a coordination/v1 Lease.
pub struct LeaderElection {
    api: Api<Lease>,
    name: String,
    identity: String,
}

/// A held leadership. `lost` flips to true when a renewal definitively
/// fails; the holder task stops renewing at that point.
pub struct Leadership {
    pub lost: watch::Receiver<bool>,
    renewer: JoinHandle<()>,
}

impl Leadership {
    pub fn abdicate(self) {
        self.renewer.abort();
    }
}

impl LeaderElection {
    pub fn new(client: Client, namespace: &str, name: &str, identity: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Block until this instance holds the lease, then keep renewing it in
    /// a background task.
    pub async fn acquire(self) -> Result<Leadership> {
        loop {
            match self.try_acquire().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!(lease = %self.name, error = %e, "lease_acquire_retry"),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }

        info!(lease = %self.name, identity = %self.identity, "leadership_acquired");

        let (lost_tx, lost_rx) = watch::channel(false);
        let renewer = tokio::spawn(self.renew_loop(lost_tx));

        Ok(Leadership {
            lost: lost_rx,
            renewer,
        })
    }

    async fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now();

        match self.api.get(&self.name).await {
            Ok(existing) => {
                let holder = lease_holder(&existing);
                if holder != self.identity && !lease_expired(&existing, now) {
                    return Ok(false);
                }

                let transitions = existing
                    .spec
                    .as_ref()
                    .and_then(|s| s.lease_transitions)
                    .unwrap_or(0);
                let mut lease = existing.clone();
                lease.spec = Some(self.held_spec(
                    now,
                    if holder == self.identity {
                        transitions
                    } else {
                        transitions + 1
                    },
                ));

                match self.api.replace(&self.name, &PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    // Conflict means someone else moved first.
                    Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        ..Default::default()
                    },
                    spec: Some(self.held_spec(now, 0)),
                };
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn held_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn renew_loop(self, lost_tx: watch::Sender<bool>) {
        let mut last_success = Utc::now();

        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;

            match self.renew().await {
                Ok(()) => last_success = Utc::now(),
                Err(e) => {
                    warn!(lease = %self.name, error = %e, "lease_renew_failed");
                    let overdue = Utc::now() - last_success
                        > chrono::Duration::seconds(LEASE_DURATION_SECONDS);
                    if overdue {
                        warn!(lease = %self.name, "leadership_lost");
                        let _ = lost_tx.send(true);
                        return;
                    }
                }
            }
        }
    }

    async fn renew(&self) -> Result<()> {
        let mut lease = self.api.get(&self.name).await?;

        if lease_holder(&lease) != self.identity {
            return Err(Error::Runtime(format!(
                "lease {} captured by {}",
                self.name,
                lease_holder(&lease)
            )));
        }

        if let Some(spec) = lease.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        self.api
            .replace(&self.name, &PostParams::default(), &lease)
            .await?;
        Ok(())
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_with(holder: Option<&str>, renew: Option<DateTime<Utc>>, seconds: i32) -> Lease {
        Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                renew_time: renew.map(MicroTime),
                lease_duration_seconds: Some(seconds),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_entry_lease_name_from_boot_id() {
        let name = entry_lease_name("6a6f31c5-5b12-4bbc-9a3e-2a8e5a37b2b1");
        assert_eq!(name, "kive-entry-6a6f31c5-5b12-4bbc-9a3e-2a8e5a37b2b1");
    }

    #[test]
    fn test_entry_lease_name_sanitizes_and_caps() {
        let name = entry_lease_name(&"X_9".repeat(40));
        assert!(name.len() <= 63);
        assert!(name.starts_with("kive-entry-"));
        assert!(
            name.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        );
    }

    #[test]
    fn test_lease_holder() {
        let lease = lease_with(Some("node-a"), None, 15);
        assert_eq!(lease_holder(&lease), "node-a");
        assert_eq!(lease_holder(&Lease::default()), "");
    }

    #[test]
    fn test_lease_expired_when_never_renewed() {
        let lease = lease_with(Some("node-a"), None, 15);
        assert!(lease_expired(&lease, Utc::now()));
    }

    #[test]
    fn test_lease_fresh_within_duration() {
        let now = Utc::now();
        let lease = lease_with(Some("node-a"), Some(now - chrono::Duration::seconds(5)), 15);
        assert!(!lease_expired(&lease, now));
    }

    #[test]
    fn test_lease_expired_past_duration() {
        let now = Utc::now();
        let lease = lease_with(Some("node-a"), Some(now - chrono::Duration::seconds(30)), 15);
        assert!(lease_expired(&lease, now));
    }

    #[test]
    fn test_lease_without_spec_is_expired() {
        assert!(lease_expired(&Lease::default(), Utc::now()));
    }

    #[test]
    fn test_pod_reconciler_lease_is_fixed() {
        assert_eq!(POD_RECONCILER_LEASE, "kive-pod-reconciler");
    }
}
