use std::collections::HashMap;

use async_trait::async_trait;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::{GetRequest, ListContainersRequest};
use containerd_client::with_namespace;
use k8s_openapi::api::core::v1::ContainerStatus;
use tonic::Request;
use tonic::transport::Channel;
use tracing::{debug, warn};

use crate::compare::split_runtime_id;
use crate::crd::KiveTrap;
use crate::error::{Error, Result};
use crate::resolver;

/* ============================= CONSTANTS ============================= */

/// Node-local containerd socket.
pub const CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";

/// Environment override for the containerd socket path.
pub const CONTAINERD_SOCKET_ENV: &str = "KIVE_CONTAINERD_SOCKET";

/// Kubernetes containers live in this containerd namespace.
const CONTAINERD_NAMESPACE: &str = "k8s.io";

/* ============================= CAPABILITIES ============================= */

/// What a runtime adapter learned about one container for one trap.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerData {
    /// Inode of the trap path inside the container, when found.
    pub ino: u64,
    /// User-space packed device of the inode.
    pub dev: u64,
    /// Full runtime reference (`<scheme>://<id>`).
    pub id: String,
    /// Container name from the pod status.
    pub name: String,
    /// The container is not ready yet; ask again later.
    pub requeue: bool,
    /// False when the trap path does not (yet) exist in the container.
    pub found: bool,
}

impl ContainerData {
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            ..Default::default()
        }
    }

    pub fn not_found() -> Self {
        Self::default()
    }

    pub fn found(ino: u64, dev: u64) -> Self {
        Self {
            ino,
            dev,
            found: true,
            ..Default::default()
        }
    }
}

/// Capability set every container runtime must provide. New runtimes
/// register with the registry under their id scheme.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn connect(&mut self) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;

    /// Resolve the trap path inside the container identified by the bare
    /// runtime id (scheme already stripped).
    async fn container_data(&mut self, runtime_id: &str, trap: &KiveTrap)
    -> Result<ContainerData>;
}

/* ============================= REGISTRY ============================= */

/// Adapters keyed by the scheme of `"<scheme>://<id>"` container references.
pub struct RuntimeRegistry {
    runtimes: HashMap<String, Box<dyn ContainerRuntime>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self {
            runtimes: HashMap::new(),
        }
    }

    /// The registry shipped by default: containerd only.
    pub fn with_default_runtimes() -> Self {
        let mut registry = Self::new();
        registry.register("containerd", Box::new(Containerd::new()));
        registry
    }

    pub fn register(&mut self, scheme: impl Into<String>, runtime: Box<dyn ContainerRuntime>) {
        self.runtimes.insert(scheme.into(), runtime);
    }

    pub fn supports(&self, scheme: &str) -> bool {
        self.runtimes.contains_key(scheme)
    }

    /// Resolve trap data for one container status. Not-ready containers
    /// short-circuit to a requeue without touching the runtime.
    pub async fn container_data(
        &mut self,
        status: &ContainerStatus,
        trap: &KiveTrap,
    ) -> Result<ContainerData> {
        if !status.ready {
            return Ok(ContainerData::requeue());
        }

        let reference = status.container_id.as_deref().unwrap_or_default();
        let (scheme, runtime_id) = split_runtime_id(reference)?;

        let runtime = self
            .runtimes
            .get_mut(scheme)
            .ok_or_else(|| Error::UnsupportedRuntime(scheme.to_string()))?;

        if !runtime.is_connected() {
            runtime.connect().await?;
        }

        let mut data = runtime.container_data(runtime_id, trap).await?;
        data.id = reference.to_string();
        data.name = status.name.clone();
        Ok(data)
    }

    /// Drop every live connection; failures are logged, not propagated.
    pub async fn disconnect_all(&mut self) {
        for (scheme, runtime) in self.runtimes.iter_mut() {
            if !runtime.is_connected() {
                continue;
            }
            if let Err(e) = runtime.disconnect().await {
                warn!(scheme = %scheme, error = %e, "runtime_disconnect_failed");
            }
        }
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::with_default_runtimes()
    }
}

/* ============================= CONTAINERD ============================= */

/// containerd adapter: GRPC over the node socket, `k8s.io` namespace.
pub struct Containerd {
    socket: String,
    channel: Option<Channel>,
}

impl Containerd {
    pub fn new() -> Self {
        let socket = std::env::var(CONTAINERD_SOCKET_ENV)
            .unwrap_or_else(|_| CONTAINERD_SOCKET.to_string());
        Self::with_socket(socket)
    }

    pub fn with_socket(socket: impl Into<String>) -> Self {
        Self {
            socket: socket.into(),
            channel: None,
        }
    }

    /// Mark the connection dead so the next call reconnects lazily.
    fn drop_connection(&mut self) {
        self.channel = None;
    }
}

impl Default for Containerd {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for Containerd {
    fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    async fn connect(&mut self) -> Result<()> {
        if self.channel.is_some() {
            return Ok(());
        }
        let channel = containerd_client::connect(&self.socket)
            .await
            .map_err(|e| Error::Runtime(format!("connect {}: {e}", self.socket)))?;
        self.channel = Some(channel);
        debug!(socket = %self.socket, "containerd_connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.channel = None;
        Ok(())
    }

    async fn container_data(
        &mut self,
        runtime_id: &str,
        trap: &KiveTrap,
    ) -> Result<ContainerData> {
        let channel = self
            .channel
            .clone()
            .ok_or_else(|| Error::Runtime("containerd not connected".to_string()))?;

        let mut containers = ContainersClient::new(channel.clone());
        let list_request = ListContainersRequest {
            filters: Vec::new(),
        };
        let list_request = with_namespace!(list_request, CONTAINERD_NAMESPACE);
        let listed = match containers.list(list_request).await {
            Ok(resp) => resp.into_inner().containers,
            Err(status) => {
                self.drop_connection();
                return Err(Error::Runtime(format!("list containers: {status}")));
            }
        };

        if !listed.iter().any(|c| c.id == runtime_id) {
            return Ok(ContainerData::not_found());
        }

        let mut tasks = TasksClient::new(channel);
        let task_request = GetRequest {
            container_id: runtime_id.to_string(),
            exec_id: String::new(),
        };
        let task_request = with_namespace!(task_request, CONTAINERD_NAMESPACE);
        let task = match tasks.get(task_request).await {
            Ok(resp) => resp.into_inner().process,
            Err(status) => {
                self.drop_connection();
                return Err(Error::Runtime(format!("get task: {status}")));
            }
        };

        let Some(process) = task else {
            return Ok(ContainerData::not_found());
        };

        match resolver::resolve_inode(process.pid, &trap.path, trap.create, trap.mode) {
            Ok(resolved) => Ok(ContainerData::found(resolved.inode, resolved.dev)),
            Err(Error::NotFound) => Ok(ContainerData::not_found()),
            Err(e) => Err(e),
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRuntime {
        connected: bool,
        connects: u32,
        response: ContainerData,
    }

    impl FakeRuntime {
        fn returning(response: ContainerData) -> Self {
            Self {
                connected: false,
                connects: 0,
                response,
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn connect(&mut self) -> Result<()> {
            self.connected = true;
            self.connects += 1;
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }

        async fn container_data(
            &mut self,
            _runtime_id: &str,
            _trap: &KiveTrap,
        ) -> Result<ContainerData> {
            Ok(self.response.clone())
        }
    }

    fn ready_status(reference: &str) -> ContainerStatus {
        ContainerStatus {
            name: "nginx".to_string(),
            container_id: Some(reference.to_string()),
            ready: true,
            ..Default::default()
        }
    }

    fn trap() -> KiveTrap {
        KiveTrap {
            path: "/test".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_not_ready_container_requeues() {
        let mut registry = RuntimeRegistry::new();
        let mut status = ready_status("containerd://abc");
        status.ready = false;

        let data = registry
            .container_data(&status, &trap())
            .await
            .expect("should requeue");
        assert!(data.requeue);
        assert!(!data.found);
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_error() {
        let mut registry = RuntimeRegistry::new();
        let status = ready_status("cri-o://abc");

        match registry.container_data(&status, &trap()).await {
            Err(Error::UnsupportedRuntime(scheme)) => assert_eq!(scheme, "cri-o"),
            other => panic!("expected UnsupportedRuntime, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_reference_is_error() {
        let mut registry = RuntimeRegistry::new();
        let status = ready_status("not-a-reference");

        assert!(matches!(
            registry.container_data(&status, &trap()).await,
            Err(Error::MalformedContainerId(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_fills_id_and_name() {
        let mut registry = RuntimeRegistry::new();
        registry.register(
            "fake",
            Box::new(FakeRuntime::returning(ContainerData::found(42, 7))),
        );

        let data = registry
            .container_data(&ready_status("fake://cafe"), &trap())
            .await
            .expect("should resolve");

        assert_eq!(data.ino, 42);
        assert_eq!(data.dev, 7);
        assert_eq!(data.id, "fake://cafe");
        assert_eq!(data.name, "nginx");
        assert!(data.found);
    }

    #[tokio::test]
    async fn test_registry_connects_lazily_and_reuses() {
        let mut registry = RuntimeRegistry::new();
        registry.register(
            "fake",
            Box::new(FakeRuntime::returning(ContainerData::found(1, 1))),
        );

        let status = ready_status("fake://cafe");
        registry
            .container_data(&status, &trap())
            .await
            .expect("first call");
        registry
            .container_data(&status, &trap())
            .await
            .expect("second call");

        // A second lookup reuses the live connection.
        let runtime = registry.runtimes.get("fake").expect("registered");
        assert!(runtime.is_connected());
    }

    #[test]
    fn test_default_registry_supports_containerd_only() {
        let registry = RuntimeRegistry::with_default_runtimes();
        assert!(registry.supports("containerd"));
        assert!(!registry.supports("cri-o"));
        assert!(!registry.supports("docker"));
    }

    #[test]
    fn test_containerd_starts_disconnected() {
        let adapter = Containerd::with_socket("/tmp/containerd.sock");
        assert!(!adapter.is_connected());
    }
}
