use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::ContainerAllocateResponse;
use super::api::DeviceSpec;

/// Cgroup permissions granted on the exposed device directory.
pub const DEVICE_PERMISSIONS: &str = "rwm";

/// Answer an allocation batch with one identical response per container.
///
/// Every container gets the whole RDMA device directory, mirrored at the same
/// path. The requested device IDs are not used to pick individual VFs.
pub fn allocate_response(request: &AllocateRequest, device_dir: &str) -> AllocateResponse {
    let container_responses = request
        .container_requests
        .iter()
        .map(|container_request| {
            tracing::debug!(
                device_ids = ?container_request.devices_ids,
                "allocating device directory {device_dir}"
            );
            ContainerAllocateResponse {
                devices: vec![DeviceSpec {
                    container_path: device_dir.to_string(),
                    host_path: device_dir.to_string(),
                    permissions: DEVICE_PERMISSIONS.to_string(),
                }],
                ..Default::default()
            }
        })
        .collect();

    AllocateResponse {
        container_responses,
    }
}
