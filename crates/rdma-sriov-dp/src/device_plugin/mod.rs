#![allow(clippy::doc_markdown)]
//! Kubernetes device plugin advertising SR-IOV virtual functions.
//!
//! [`RdmaSriovDevicePlugin`] owns the device table and the plugin lifecycle:
//!
//! ```text
//! Created -> Started -> Registered -> Serving -> Stopped
//! ```
//!
//! `start` binds the plugin socket and serves the gRPC API, `register`
//! announces the socket to kubelet and kubelet then keeps a `ListAndWatch`
//! stream open for the rest of the process. Health only ever degrades: once a
//! device is reported unhealthy it stays so.

pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

pub mod allocate;
mod service;

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use anyhow::Context;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Server;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Status;
use tower::service_fn;
use tracing::error;
use tracing::info;
use tracing::warn;

use self::api::device_plugin_server::DevicePluginServer;
use self::api::registration_client::RegistrationClient;
use self::api::Device;
use self::api::DevicePluginOptions;
use self::api::ListAndWatchResponse;
use self::api::RegisterRequest;
pub use self::service::DevicePluginService;

/// Device plugin API version sent on registration.
pub const VERSION: &str = "v1beta1";
pub const HEALTHY: &str = "Healthy";
pub const UNHEALTHY: &str = "Unhealthy";

/// Bound on connecting to a plugin or kubelet socket.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on draining the gRPC server during stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Device lists a watcher may fall behind by before it resyncs.
const UPDATE_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PluginState {
    Created,
    Started,
    Registered,
    Serving,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum DevicePluginError {
    #[error("device plugin already running (state {0})")]
    AlreadyRunning(PluginState),
    #[error("device plugin is stopped")]
    Stopped,
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("timed out after {timeout:?} connecting to {}", path.display())]
    DialTimeout { path: PathBuf, timeout: Duration },
    #[error("kubelet rejected registration: {}", .0.message())]
    Registration(#[source] Status),
}

type ServerHandle = JoinHandle<Result<(), tonic::transport::Error>>;

/// RDMA SR-IOV device plugin for Kubernetes
#[derive(Debug)]
pub struct RdmaSriovDevicePlugin {
    /// resource name (e.g. "rdma/vhca")
    resource_name: String,
    /// path of the plugin's own unix socket
    socket_path: PathBuf,
    /// device directory handed to every allocated container
    device_dir: String,
    /// fixed after construction, only health changes
    devices: Mutex<Vec<Device>>,
    /// device list after each applied health report, one copy per watcher
    updates: broadcast::Sender<Vec<Device>>,
    /// single-slot channel carrying IDs of devices to mark unhealthy
    health_tx: mpsc::Sender<String>,
    /// taken by the health task on start
    health_rx: Mutex<Option<mpsc::Receiver<String>>>,
    /// cancelled once on stop
    stop: CancellationToken,
    state: Mutex<PluginState>,
    /// also serializes start and stop
    server: tokio::sync::Mutex<Option<ServerHandle>>,
}

impl RdmaSriovDevicePlugin {
    /// create a new device plugin advertising `devices`
    pub fn new(
        resource_name: impl Into<String>,
        socket_path: impl Into<PathBuf>,
        device_dir: impl Into<String>,
        devices: Vec<Device>,
    ) -> Arc<Self> {
        let (health_tx, health_rx) = mpsc::channel(1);
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);

        Arc::new(Self {
            resource_name: resource_name.into(),
            socket_path: socket_path.into(),
            device_dir: device_dir.into(),
            devices: Mutex::new(devices),
            updates,
            health_tx,
            health_rx: Mutex::new(Some(health_rx)),
            stop: CancellationToken::new(),
            state: Mutex::new(PluginState::Created),
            server: tokio::sync::Mutex::new(None),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn device_dir(&self) -> &str {
        &self.device_dir
    }

    pub fn state(&self) -> PluginState {
        *lock(&self.state)
    }

    /// snapshot of the current device list
    pub fn devices(&self) -> Vec<Device> {
        lock(&self.devices).clone()
    }

    pub fn options(&self) -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }
    }

    /// Start the gRPC server on the plugin socket and wait until it accepts
    /// connections.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut server = self.server.lock().await;
        match self.state() {
            PluginState::Created => {}
            PluginState::Stopped => return Err(DevicePluginError::Stopped.into()),
            state => return Err(DevicePluginError::AlreadyRunning(state).into()),
        }

        info!("start device plugin server: {}", self.socket_path.display());

        self.cleanup()
            .with_context(|| format!("failed to remove {}", self.socket_path.display()))?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))?;

        let device_plugin_server = DevicePluginServer::new(DevicePluginService::new(self.clone()));
        let stop = self.stop.clone();
        *server = Some(tokio::spawn(async move {
            Server::builder()
                .add_service(device_plugin_server)
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        stop.cancelled().await;
                        info!("shutting down gRPC server");
                    },
                )
                .await
        }));
        self.set_state(PluginState::Started);

        let health_rx = lock(&self.health_rx).take();
        if let Some(health_rx) = health_rx {
            let device_plugin = self.clone();
            tokio::spawn(async move {
                device_plugin.apply_health_reports(health_rx).await;
                info!("health task stopped");
            });
        }

        // a successful dial means the server is accepting connections
        let channel = connect_uds(&self.socket_path, DIAL_TIMEOUT)
            .await
            .context("device plugin server did not become ready")?;
        drop(channel);

        info!("gRPC server is bound to: {}", self.socket_path.display());
        Ok(())
    }

    /// Stop serving and remove the plugin socket. Stopping twice is a no-op.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let mut server = self.server.lock().await;
        if self.state() == PluginState::Stopped {
            return Ok(());
        }

        self.stop.cancel();
        if let Some(handle) = server.take() {
            let abort = handle.abort_handle();
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("gRPC server exited with error: {e}"),
                Ok(Err(e)) => warn!("gRPC server task failed: {e}"),
                Err(_) => {
                    warn!("gRPC server did not drain within {SHUTDOWN_TIMEOUT:?}, aborting");
                    abort.abort();
                }
            }
        }
        self.set_state(PluginState::Stopped);

        self.cleanup()
            .with_context(|| format!("failed to remove {}", self.socket_path.display()))?;
        info!("device plugin stopped");
        Ok(())
    }

    /// register device plugin with kubelet
    pub async fn register(&self, kubelet_socket: &Path, resource_name: &str) -> anyhow::Result<()> {
        info!("registering device plugin with kubelet: {}", kubelet_socket.display());

        let channel = connect_uds(kubelet_socket, DIAL_TIMEOUT).await?;
        let mut client = RegistrationClient::new(channel);

        let endpoint = self
            .socket_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("invalid socket path {}", self.socket_path.display()))?;
        let request = RegisterRequest {
            version: VERSION.to_string(),
            endpoint,
            resource_name: resource_name.to_string(),
            options: Some(self.options()),
        };

        client
            .register(Request::new(request))
            .await
            .map_err(DevicePluginError::Registration)?;

        let mut state = lock(&self.state);
        if *state == PluginState::Started {
            *state = PluginState::Registered;
        }
        Ok(())
    }

    /// Start the server and register it with kubelet. A failed registration
    /// stops the server again so no unregistered socket is left behind.
    pub async fn serve(self: &Arc<Self>, kubelet_socket: &Path) -> anyhow::Result<()> {
        if let Err(e) = self.start().await {
            error!("could not start device plugin: {e:#}");
            self.stop_after_failure().await;
            return Err(e);
        }
        info!("starting to serve on {}", self.socket_path.display());

        if let Err(e) = self.register(kubelet_socket, self.resource_name()).await {
            error!("could not register device plugin: {e:#}");
            self.stop_after_failure().await;
            return Err(e);
        }
        info!("registered device plugin with kubelet");

        Ok(())
    }

    async fn stop_after_failure(&self) {
        if let Err(e) = self.stop().await {
            warn!("failed to stop device plugin: {e:#}");
        }
    }

    /// Report a device as unhealthy. Waits while a previous report is still
    /// pending, and fails instead of waiting once the plugin is stopped.
    pub async fn mark_unhealthy(&self, device_id: &str) -> Result<(), DevicePluginError> {
        let known = lock(&self.devices).iter().any(|d| d.id == device_id);
        if !known {
            return Err(DevicePluginError::UnknownDevice(device_id.to_string()));
        }

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(DevicePluginError::Stopped),
            sent = self.health_tx.send(device_id.to_string()) => {
                sent.map_err(|_| DevicePluginError::Stopped)
            }
        }
    }

    fn mark_serving(&self) {
        let mut state = lock(&self.state);
        if matches!(*state, PluginState::Started | PluginState::Registered) {
            *state = PluginState::Serving;
        }
    }

    /// Push the device list to `tx`, then again after every health change,
    /// until the plugin stops or the watcher goes away.
    async fn watch_devices(&self, tx: mpsc::Sender<Result<ListAndWatchResponse, Status>>) {
        let mut updates = self.updates.subscribe();
        let devices = self.devices();
        info!(
            "exposing devices: {:?}",
            devices.iter().map(|d| &d.id).collect::<Vec<_>>()
        );
        if tx.send(Ok(ListAndWatchResponse { devices })).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                _ = tx.closed() => {
                    info!("device watcher disconnected");
                    return;
                }
                update = updates.recv() => {
                    let devices = match update {
                        Ok(devices) => devices,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "device watcher fell behind, resending current list");
                            self.devices()
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    };
                    if tx.send(Ok(ListAndWatchResponse { devices })).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Apply health reports to the device table until the plugin stops.
    /// Every report is published to all watchers, even when nothing changed.
    async fn apply_health_reports(&self, mut health_rx: mpsc::Receiver<String>) {
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                report = health_rx.recv() => match report {
                    Some(device_id) => {
                        let devices = self.degrade(&device_id);
                        // no receivers just means nobody is watching yet
                        let _ = self.updates.send(devices);
                    }
                    None => return,
                },
            }
        }
    }

    /// mark `device_id` unhealthy and return the updated list
    fn degrade(&self, device_id: &str) -> Vec<Device> {
        let mut devices = lock(&self.devices);
        // there is no way back to Healthy
        for device in devices.iter_mut().filter(|d| d.id == device_id) {
            if device.health != UNHEALTHY {
                warn!("device {} is unhealthy", device.id);
                device.health = UNHEALTHY.to_string();
            }
        }
        devices.clone()
    }

    fn set_state(&self, state: PluginState) {
        *lock(&self.state) = state;
    }

    fn cleanup(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.socket_path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// create Unix Domain Socket client connection
pub(crate) async fn connect_uds(socket_path: &Path, timeout: Duration) -> anyhow::Result<Channel> {
    let path = socket_path.to_path_buf();

    // The HTTP URL is a placeholder since we're using Unix socket connector
    let endpoint = Endpoint::from_static("http://tonic").connect_timeout(timeout);
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let path = path.clone();
        async move {
            let stream = UnixStream::connect(path).await?;
            Ok::<_, io::Error>(TokioIo::new(stream))
        }
    }));

    let channel = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| DevicePluginError::DialTimeout {
            path: socket_path.to_path_buf(),
            timeout,
        })?
        .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
    Ok(channel)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;
    use test_log::test;
    use tokio_stream::wrappers::UnixListenerStream;
    use tonic::Response;
    use tonic::Streaming;

    use super::api::device_plugin_client::DevicePluginClient;
    use super::api::registration_server::Registration;
    use super::api::registration_server::RegistrationServer;
    use super::api::AllocateRequest;
    use super::api::ContainerAllocateRequest;
    use super::api::Empty;
    use super::api::PreStartContainerRequest;
    use super::*;
    use crate::config::RDMA_DEVICES;
    use crate::config::RESOURCE_NAME;
    use crate::config::SOCKET_NAME;

    fn test_devices(count: usize) -> Vec<Device> {
        (0..count)
            .map(|i| Device {
                id: format!("02:00:00:00:00:{i:02x}"),
                health: HEALTHY.to_string(),
                topology: None,
            })
            .collect()
    }

    fn new_plugin(dir: &TempDir, devices: Vec<Device>) -> Arc<RdmaSriovDevicePlugin> {
        RdmaSriovDevicePlugin::new(
            RESOURCE_NAME,
            dir.path().join(SOCKET_NAME),
            RDMA_DEVICES,
            devices,
        )
    }

    async fn client(plugin: &RdmaSriovDevicePlugin) -> DevicePluginClient<Channel> {
        let channel = connect_uds(plugin.socket_path(), DIAL_TIMEOUT)
            .await
            .expect("should connect to plugin");
        DevicePluginClient::new(channel)
    }

    async fn next_devices(stream: &mut Streaming<ListAndWatchResponse>) -> Vec<Device> {
        tokio::time::timeout(Duration::from_secs(5), stream.message())
            .await
            .expect("should receive device list in time")
            .expect("stream should not fail")
            .expect("stream should not end")
            .devices
    }

    /// Records registrations the way kubelet would accept them.
    #[derive(Clone, Default)]
    struct FakeKubelet {
        requests: Arc<Mutex<Vec<RegisterRequest>>>,
        reject: bool,
    }

    #[tonic::async_trait]
    impl Registration for FakeKubelet {
        async fn register(
            &self,
            request: Request<RegisterRequest>,
        ) -> Result<Response<Empty>, Status> {
            if self.reject {
                return Err(Status::invalid_argument("unsupported API version"));
            }
            self.requests.lock().unwrap().push(request.into_inner());
            Ok(Response::new(Empty {}))
        }
    }

    fn spawn_kubelet(socket_path: &Path, kubelet: FakeKubelet) -> CancellationToken {
        let listener = UnixListener::bind(socket_path).expect("should bind kubelet socket");
        let token = CancellationToken::new();
        let shutdown = token.clone();
        tokio::spawn(
            Server::builder()
                .add_service(RegistrationServer::new(kubelet))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    shutdown.cancelled().await
                }),
        );
        token
    }

    #[test(tokio::test)]
    async fn start_and_stop_manage_socket_file() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let plugin = new_plugin(&dir, test_devices(2));
        assert_eq!(plugin.state(), PluginState::Created);

        plugin.start().await.expect("should start");
        assert_eq!(plugin.state(), PluginState::Started);
        assert!(plugin.socket_path().exists());

        plugin.stop().await.expect("should stop");
        assert_eq!(plugin.state(), PluginState::Stopped);
        assert!(!plugin.socket_path().exists());

        plugin.stop().await.expect("second stop should be a no-op");
        assert!(!plugin.socket_path().exists());
    }

    #[test(tokio::test)]
    async fn start_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        std::fs::write(dir.path().join(SOCKET_NAME), b"stale").expect("should write stale file");
        let plugin = new_plugin(&dir, test_devices(1));

        plugin.start().await.expect("should start over stale file");
        let options = client(&plugin)
            .await
            .get_device_plugin_options(Empty {})
            .await
            .expect("should answer options")
            .into_inner();
        assert!(!options.pre_start_required);

        plugin.stop().await.expect("should stop");
    }

    #[test(tokio::test)]
    async fn start_fails_when_socket_cannot_be_bound() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let plugin = RdmaSriovDevicePlugin::new(
            RESOURCE_NAME,
            dir.path().join("missing").join(SOCKET_NAME),
            RDMA_DEVICES,
            test_devices(1),
        );

        assert!(plugin.start().await.is_err());
        assert_eq!(plugin.state(), PluginState::Created);
    }

    #[test(tokio::test)]
    async fn stopped_plugin_is_terminal() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let plugin = new_plugin(&dir, test_devices(1));

        plugin.stop().await.expect("stop before start should succeed");
        let err = plugin.start().await.expect_err("should not restart");
        assert!(matches!(
            err.downcast_ref::<DevicePluginError>(),
            Some(DevicePluginError::Stopped)
        ));
        assert!(!plugin.socket_path().exists());
    }

    #[test(tokio::test)]
    async fn start_twice_fails() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let plugin = new_plugin(&dir, test_devices(1));

        plugin.start().await.expect("should start");
        let err = plugin.start().await.expect_err("second start should fail");
        assert!(matches!(
            err.downcast_ref::<DevicePluginError>(),
            Some(DevicePluginError::AlreadyRunning(PluginState::Started))
        ));

        plugin.stop().await.expect("should stop");
    }

    #[test(tokio::test)]
    async fn list_and_watch_pushes_health_changes() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let devices = test_devices(4);
        let plugin = new_plugin(&dir, devices.clone());
        plugin.start().await.expect("should start");

        let mut stream = client(&plugin)
            .await
            .list_and_watch(Empty {})
            .await
            .expect("should open stream")
            .into_inner();

        assert_eq!(next_devices(&mut stream).await, devices);
        assert_eq!(plugin.state(), PluginState::Serving);

        plugin
            .mark_unhealthy(&devices[1].id)
            .await
            .expect("should report device");
        let degraded = next_devices(&mut stream).await;
        let health: Vec<&str> = degraded.iter().map(|d| d.health.as_str()).collect();
        assert_eq!(health, vec![HEALTHY, UNHEALTHY, HEALTHY, HEALTHY]);
        assert_eq!(plugin.devices(), degraded);

        // reporting again re-emits the same list once
        plugin
            .mark_unhealthy(&devices[1].id)
            .await
            .expect("should report device again");
        assert_eq!(next_devices(&mut stream).await, degraded);

        plugin.stop().await.expect("should stop");
        let end = tokio::time::timeout(Duration::from_secs(5), stream.message())
            .await
            .expect("stream should end after stop");
        assert!(!matches!(end, Ok(Some(_))));
    }

    #[test(tokio::test)]
    async fn new_watcher_sees_current_health() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let devices = test_devices(3);
        let plugin = new_plugin(&dir, devices.clone());
        plugin.start().await.expect("should start");

        let mut first = client(&plugin)
            .await
            .list_and_watch(Empty {})
            .await
            .expect("should open stream")
            .into_inner();
        next_devices(&mut first).await;
        plugin
            .mark_unhealthy(&devices[2].id)
            .await
            .expect("should report device");
        next_devices(&mut first).await;

        let mut second = client(&plugin)
            .await
            .list_and_watch(Empty {})
            .await
            .expect("should open stream")
            .into_inner();
        assert_eq!(next_devices(&mut second).await, plugin.devices());
        assert_eq!(plugin.devices()[2].health, UNHEALTHY);

        plugin.stop().await.expect("should stop");
    }

    #[test(tokio::test)]
    async fn every_watcher_sees_health_report() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let devices = test_devices(2);
        let plugin = new_plugin(&dir, devices.clone());
        plugin.start().await.expect("should start");

        let mut streams = Vec::new();
        for _ in 0..2 {
            let mut stream = client(&plugin)
                .await
                .list_and_watch(Empty {})
                .await
                .expect("should open stream")
                .into_inner();
            assert_eq!(next_devices(&mut stream).await, devices);
            streams.push(stream);
        }

        plugin
            .mark_unhealthy(&devices[0].id)
            .await
            .expect("should report device");

        for stream in &mut streams {
            let degraded = next_devices(stream).await;
            let health: Vec<&str> = degraded.iter().map(|d| d.health.as_str()).collect();
            assert_eq!(health, vec![UNHEALTHY, HEALTHY]);
        }

        plugin.stop().await.expect("should stop");
    }

    #[test(tokio::test)]
    async fn health_report_before_start_is_applied_on_start() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let devices = test_devices(2);
        let plugin = new_plugin(&dir, devices.clone());

        plugin
            .mark_unhealthy(&devices[1].id)
            .await
            .expect("should queue report");
        plugin.start().await.expect("should start");

        let mut stream = client(&plugin)
            .await
            .list_and_watch(Empty {})
            .await
            .expect("should open stream")
            .into_inner();
        let mut current = next_devices(&mut stream).await;
        if current[1].health != UNHEALTHY {
            current = next_devices(&mut stream).await;
        }
        assert_eq!(current[1].health, UNHEALTHY);
        assert_eq!(current[0].health, HEALTHY);

        plugin.stop().await.expect("should stop");
    }

    #[test(tokio::test)]
    async fn connect_uds_fails_without_listener() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let timeout = Duration::from_millis(200);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            connect_uds(&dir.path().join("missing.sock"), timeout),
        )
        .await
        .expect("dial should give up within its bound");

        assert!(result.is_err());
    }

    #[test(tokio::test)]
    async fn mark_unhealthy_rejects_unknown_device_and_stopped_plugin() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let devices = test_devices(2);
        let plugin = new_plugin(&dir, devices.clone());

        assert!(matches!(
            plugin.mark_unhealthy("ff:ff:ff:ff:ff:ff").await,
            Err(DevicePluginError::UnknownDevice(_))
        ));

        plugin.start().await.expect("should start");
        plugin.stop().await.expect("should stop");
        assert!(matches!(
            plugin.mark_unhealthy(&devices[0].id).await,
            Err(DevicePluginError::Stopped)
        ));
    }

    #[test(tokio::test)]
    async fn allocate_and_pre_start_over_grpc() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let plugin = new_plugin(&dir, test_devices(4));
        plugin.start().await.expect("should start");
        let mut client = client(&plugin).await;

        let request = AllocateRequest {
            container_requests: vec![
                ContainerAllocateRequest {
                    devices_ids: vec!["02:00:00:00:00:00".to_string()],
                },
                ContainerAllocateRequest {
                    devices_ids: vec!["02:00:00:00:00:03".to_string()],
                },
            ],
        };
        let response = client
            .allocate(request)
            .await
            .expect("allocate should succeed")
            .into_inner();
        assert_eq!(response.container_responses.len(), 2);
        assert_eq!(
            response.container_responses[0],
            response.container_responses[1]
        );
        assert_eq!(response.container_responses[0].devices[0].host_path, RDMA_DEVICES);

        client
            .pre_start_container(PreStartContainerRequest {
                devices_ids: vec!["02:00:00:00:00:00".to_string()],
            })
            .await
            .expect("pre-start should succeed");

        plugin.stop().await.expect("should stop");
    }

    #[test(tokio::test)]
    async fn serve_registers_socket_basename() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let kubelet_socket = dir.path().join("kubelet.sock");
        let kubelet = FakeKubelet::default();
        let kubelet_stop = spawn_kubelet(&kubelet_socket, kubelet.clone());
        let plugin = new_plugin(&dir, test_devices(1));

        plugin.serve(&kubelet_socket).await.expect("should serve");

        assert_eq!(plugin.state(), PluginState::Registered);
        let requests = kubelet.requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            vec![RegisterRequest {
                version: VERSION.to_string(),
                endpoint: SOCKET_NAME.to_string(),
                resource_name: RESOURCE_NAME.to_string(),
                options: Some(plugin.options()),
            }]
        );

        plugin.stop().await.expect("should stop");
        kubelet_stop.cancel();
    }

    #[test(tokio::test)]
    async fn serve_stops_when_kubelet_is_missing() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let plugin = new_plugin(&dir, test_devices(1));

        let result = plugin.serve(&dir.path().join("kubelet.sock")).await;

        assert!(result.is_err());
        assert_eq!(plugin.state(), PluginState::Stopped);
        assert!(!plugin.socket_path().exists());
    }

    #[test(tokio::test)]
    async fn serve_stops_when_registration_is_rejected() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let kubelet_socket = dir.path().join("kubelet.sock");
        let kubelet_stop = spawn_kubelet(
            &kubelet_socket,
            FakeKubelet {
                reject: true,
                ..Default::default()
            },
        );
        let plugin = new_plugin(&dir, test_devices(1));

        let err = plugin
            .serve(&kubelet_socket)
            .await
            .expect_err("registration should fail");

        assert!(matches!(
            err.downcast_ref::<DevicePluginError>(),
            Some(DevicePluginError::Registration(_))
        ));
        assert_eq!(plugin.state(), PluginState::Stopped);
        assert!(!plugin.socket_path().exists());
        kubelet_stop.cancel();
    }
}
