use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};

use kive_operator::controller::{KERNEL_ID_PATH, read_kernel_id};
use kive_operator::crd::KivePolicy;
use kive_operator::probe::{DEFAULT_PROBE_OBJECT, PROBE_OBJECT_ENV};
use kive_operator::runtime::{CONTAINERD_SOCKET, CONTAINERD_SOCKET_ENV};

pub async fn run() -> anyhow::Result<()> {
    println!("Running operator preflight checks...\n");

    // 1. Build Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    // 2. Verify actual cluster connectivity by fetching server version
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    }

    // 3. List pods permission
    print!("  List pods permission ........ ");
    let pods: Api<Pod> = Api::all(client.clone());
    match pods.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e),
    }

    // 4. KivePolicy CRD installed
    print!("  KivePolicy CRD .............. ");
    let policies: Api<KivePolicy> = Api::all(client.clone());
    match policies.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({}). Install with: kive crd install", e),
    }

    // 5. Kernel boot id readable
    print!("  Kernel boot id .............. ");
    match read_kernel_id() {
        Ok(id) => println!("OK ({id})"),
        Err(e) => println!("FAIL ({e}) at {KERNEL_ID_PATH}"),
    }

    // 6. containerd socket present
    print!("  containerd socket ........... ");
    let socket =
        std::env::var(CONTAINERD_SOCKET_ENV).unwrap_or_else(|_| CONTAINERD_SOCKET.to_string());
    if std::path::Path::new(&socket).exists() {
        println!("OK ({socket})");
    } else {
        println!("MISSING ({socket})");
    }

    // 7. Probe object present
    print!("  Probe object ................ ");
    let object =
        std::env::var(PROBE_OBJECT_ENV).unwrap_or_else(|_| DEFAULT_PROBE_OBJECT.to_string());
    if std::path::Path::new(&object).exists() {
        println!("OK ({object})");
    } else {
        println!("MISSING ({object})");
    }

    println!("\nAll checks completed.");
    Ok(())
}
