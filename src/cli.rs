use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kive")]
#[command(about = "Cluster-wide file-access tripwire operator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and node prerequisites
    Check,

    /// Manage the KivePolicy and KiveData CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Run the tripwire operator on this node
    Operator {
        /// Metrics endpoint bind address; "0" disables the metrics server
        #[arg(long, default_value = "0")]
        metrics_bind_address: String,

        /// Health probe bind address for the policy reconciler
        #[arg(long, default_value = ":8081")]
        policy_health_probe_bind_address: String,

        /// Health probe bind address for the entry reconciler
        #[arg(long, default_value = ":8082")]
        entry_health_probe_bind_address: String,

        /// Health probe bind address for the pod reconciler
        #[arg(long, default_value = ":8083")]
        pod_health_probe_bind_address: String,

        /// Serve metrics over self-signed TLS; use --metrics-secure=false for plain HTTP
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        metrics_secure: bool,

        /// Enable HTTP/2 on the metrics server (disabled by default)
        #[arg(long, default_value_t = false)]
        enable_http2: bool,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print both CRD YAMLs to stdout
    Generate,

    /// Install both CRDs into the connected cluster
    Install,
}
