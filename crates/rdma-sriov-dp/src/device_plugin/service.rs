use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::info;

use super::allocate::allocate_response;
use super::api::device_plugin_server::DevicePlugin;
use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::DevicePluginOptions;
use super::api::Empty;
use super::api::ListAndWatchResponse;
use super::api::PreStartContainerRequest;
use super::api::PreStartContainerResponse;
use super::api::PreferredAllocationRequest;
use super::api::PreferredAllocationResponse;
use super::RdmaSriovDevicePlugin;

/// Buffered device lists per watcher before the watch task waits on the client.
const WATCH_BUFFER: usize = 4;

/// DevicePlugin service implementation
/// serves kubelet calls against the plugin's device table
#[derive(Debug)]
pub struct DevicePluginService {
    device_plugin: Arc<RdmaSriovDevicePlugin>,
}

impl DevicePluginService {
    pub fn new(device_plugin: Arc<RdmaSriovDevicePlugin>) -> Self {
        Self { device_plugin }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(self.device_plugin.options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// list devices and push the whole list again on every health change
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");
        self.device_plugin.mark_serving();

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let device_plugin = self.device_plugin.clone();
        tokio::spawn(async move {
            device_plugin.watch_devices(tx).await;
            info!("device watch task stopped");
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        debug!("getting preferred device allocation: {:?}", request.into_inner());

        Ok(Response::new(PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let request = request.into_inner();
        info!("allocate request: {:?}", request);

        let response = allocate_response(&request, self.device_plugin.device_dir());

        info!("allocate response: {:?}", response);
        Ok(Response::new(response))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());

        Ok(Response::new(PreStartContainerResponse {}))
    }
}
