//! One typed registry per kind, bundled for handlers and controllers.

use std::sync::Arc;

use crate::model::{
    ClusterData, CustomizationSpecData, FloatingIpData, ImageData, LoadBalancerData, NodeData,
    OvaUploadJobData, PortData, ProjectData, RegistrationTokenData, SecurityGroupData,
    StoragePoolData, VirtualNetworkData, VmData, VolumeData, VolumeSnapshotData, VpnServiceData,
};
use crate::store::kv::KvStore;
use crate::store::registry::Registry;

#[derive(Clone)]
pub struct Registries {
    pub vms: Registry<VmData>,
    pub nodes: Registry<NodeData>,
    pub networks: Registry<VirtualNetworkData>,
    pub ports: Registry<PortData>,
    pub security_groups: Registry<SecurityGroupData>,
    pub pools: Registry<StoragePoolData>,
    pub volumes: Registry<VolumeData>,
    pub snapshots: Registry<VolumeSnapshotData>,
    pub images: Registry<ImageData>,
    pub ova_jobs: Registry<OvaUploadJobData>,
    pub clusters: Registry<ClusterData>,
    pub projects: Registry<ProjectData>,
    pub tokens: Registry<RegistrationTokenData>,
    pub customizations: Registry<CustomizationSpecData>,
    pub floating_ips: Registry<FloatingIpData>,
    pub load_balancers: Registry<LoadBalancerData>,
    pub vpn_services: Registry<VpnServiceData>,
}

impl Registries {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            vms: Registry::new(kv.clone()),
            nodes: Registry::new(kv.clone()),
            networks: Registry::new(kv.clone()),
            ports: Registry::new(kv.clone()),
            security_groups: Registry::new(kv.clone()),
            pools: Registry::new(kv.clone()),
            volumes: Registry::new(kv.clone()),
            snapshots: Registry::new(kv.clone()),
            images: Registry::new(kv.clone()),
            ova_jobs: Registry::new(kv.clone()),
            clusters: Registry::new(kv.clone()),
            projects: Registry::new(kv.clone()),
            tokens: Registry::new(kv.clone()),
            customizations: Registry::new(kv.clone()),
            floating_ips: Registry::new(kv.clone()),
            load_balancers: Registry::new(kv.clone()),
            vpn_services: Registry::new(kv),
        }
    }
}
