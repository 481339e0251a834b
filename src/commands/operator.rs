use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use kube::Client;
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tracing::{error, info, warn};

use kive_operator::controller::{OperatorContext, ReadyState, entry, pod, policy, read_kernel_id};
use kive_operator::election::{
    DEFAULT_LEASE_NAMESPACE, LeaderElection, POD_RECONCILER_LEASE, entry_lease_name,
};
use kive_operator::metrics;

/* ============================= FLAGS ============================= */

pub struct OperatorFlags {
    pub metrics_bind_address: String,
    pub policy_health_probe_bind_address: String,
    pub entry_health_probe_bind_address: String,
    pub pod_health_probe_bind_address: String,
    pub metrics_secure: bool,
    pub enable_http2: bool,
}

/* ============================= ENTRY ============================= */

pub async fn run(flags: OperatorFlags) -> Result<()> {
    println!("Starting kive operator...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    // Verify actual cluster connectivity before starting anything
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let kernel_id = read_kernel_id().context("Cannot read kernel boot id")?;

    metrics::force_init();

    println!("  Kernel id ................... {kernel_id}");
    println!("  CRD watch ................... KivePolicy, KiveData (kive.dev/v2alpha1)");
    println!(
        "  Health probes ............... policy {} / entry {} / pod {}",
        flags.policy_health_probe_bind_address,
        flags.entry_health_probe_bind_address,
        flags.pod_health_probe_bind_address
    );
    if flags.metrics_bind_address == "0" {
        println!("  Metrics server .............. disabled");
    } else {
        println!(
            "  Metrics server .............. {} ({})",
            flags.metrics_bind_address,
            if flags.metrics_secure { "https" } else { "http" }
        );
    }
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!(kernel_id = %kernel_id, "operator_started");

    let ctx = Arc::new(OperatorContext::new(client.clone(), kernel_id.clone()));

    let policy_ready = ReadyState::shared();
    let entry_ready = ReadyState::shared();
    let pod_ready = ReadyState::shared();

    let (shutdown_tx, _) = broadcast::channel::<()>(8);

    // ── Health and metrics servers ──
    for (name, addr, state) in [
        ("policy", &flags.policy_health_probe_bind_address, &policy_ready),
        ("entry", &flags.entry_health_probe_bind_address, &entry_ready),
        ("pod", &flags.pod_health_probe_bind_address, &pod_ready),
    ] {
        let addr = addr.clone();
        let state = state.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = serve_health(name, addr, state, shutdown).await {
                error!(server = name, error = %e, "health_server_failed");
            }
        });
    }

    if flags.metrics_bind_address != "0" {
        let addr = flags.metrics_bind_address.clone();
        let secure = flags.metrics_secure;
        let http2 = flags.enable_http2;
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(addr, secure, http2, shutdown).await {
                error!(error = %e, "metrics_server_failed");
            }
        });
    }

    // ── Controllers ──
    let lease_namespace =
        std::env::var("POD_NAMESPACE").unwrap_or_else(|_| DEFAULT_LEASE_NAMESPACE.to_string());
    let identity = std::env::var("HOSTNAME").unwrap_or_else(|_| kernel_id.clone());

    // The policy reconciler is not leader-gated.
    let mut policy_task = tokio::spawn(policy::run(ctx.clone(), policy_ready.clone()));

    // One entry reconciler per running kernel.
    let mut entry_task = tokio::spawn(run_elected(
        LeaderElection::new(
            client.clone(),
            &lease_namespace,
            &entry_lease_name(&kernel_id),
            &identity,
        ),
        entry::run(ctx.clone(), entry_ready.clone()),
        "entry",
    ));

    // One pod reconciler cluster-wide.
    let mut pod_task = tokio::spawn(run_elected(
        LeaderElection::new(client.clone(), &lease_namespace, POD_RECONCILER_LEASE, &identity),
        pod::run(ctx.clone(), pod_ready.clone()),
        "pod",
    ));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping operator...");
            println!("{}", "=".repeat(70));
        }
        _ = &mut policy_task => warn!("policy_controller_exited"),
        _ = &mut entry_task => warn!("entry_controller_exited"),
        _ = &mut pod_task => warn!("pod_controller_exited"),
    }

    let _ = shutdown_tx.send(());

    // Release kernel artefacts and runtime connections before exit.
    if let Ok(mut probe) = ctx.probe.lock() {
        probe.unload();
    }
    metrics::PROBE_LOADED.set(0);
    ctx.runtimes.lock().await.disconnect_all().await;

    policy_task.abort();
    entry_task.abort();
    pod_task.abort();

    info!("operator_stopped");
    println!("Operator stopped.");

    Ok(())
}

/// Gate a controller behind a held lease; stop it when leadership is lost.
async fn run_elected<F>(election: LeaderElection, controller: F, name: &'static str)
where
    F: Future<Output = ()>,
{
    match election.acquire().await {
        Ok(leadership) => {
            let mut lost = leadership.lost.clone();
            tokio::select! {
                _ = controller => {}
                _ = lost.wait_for(|lost| *lost) => {
                    warn!(controller = name, "leadership_lost_stopping");
                }
            }
            leadership.abdicate();
        }
        Err(e) => error!(controller = name, error = %e, "leader_election_failed"),
    }
}

/* ============================= HTTP SERVERS ============================= */

pub(crate) fn build_health_router(state: Arc<Mutex<ReadyState>>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

async fn ready_handler(state: Arc<Mutex<ReadyState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn serve_health(
    name: &'static str,
    addr_str: String,
    state: Arc<Mutex<ReadyState>>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = parse_bind_addr(&addr_str)?;
    let app = build_health_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {name} health server on {addr}"))?;

    info!(server = name, addr = %addr, "health_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let body = metrics::render();
    if body.is_empty() {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        )
    } else {
        (StatusCode::OK, body)
    }
}

async fn serve_metrics(
    addr_str: String,
    secure: bool,
    enable_http2: bool,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = parse_bind_addr(&addr_str)?;
    let app = Router::new().route("/metrics", get(metrics_handler));

    if secure {
        let config = self_signed_tls(enable_http2)?;

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });

        info!(addr = %addr, http2 = enable_http2, "metrics_server_started_tls");

        axum_server::bind_rustls(addr, config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind metrics server on {addr}"))?;

        info!(addr = %addr, "metrics_server_started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;
    }

    Ok(())
}

/// Self-signed serving config for the secure metrics endpoint. HTTP/2 is
/// kept off the ALPN list unless explicitly enabled.
fn self_signed_tls(enable_http2: bool) -> Result<axum_server::tls_rustls::RustlsConfig> {
    let certified = rcgen::generate_simple_self_signed(vec![
        "kive-operator".to_string(),
        "localhost".to_string(),
    ])
    .context("Failed to generate self-signed certificate")?;

    let cert_pem = certified.cert.pem();
    let key_pem = certified.key_pair.serialize_pem();

    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse self-signed certificate")?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .context("Failed to parse self-signed key")?
        .context("Self-signed key missing from PEM")?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS config")?;

    config.alpn_protocols = if enable_http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Ok(axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(
        config,
    )))
}

fn parse_bind_addr(addr: &str) -> Result<SocketAddr> {
    let normalized = if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    };
    normalized
        .parse()
        .with_context(|| format!("Invalid bind address {addr:?}"))
}

/* ============================= TESTS ============================= */
