//! 集群信息
//!
//! `ClusterCache` 按地址或名字查询 pod/node/service；`SnapshotSource` 给出节点和 pod 的
//! 网络命名空间快照。`StaticCluster` 同时实现两者，数据来自场景文件。
//! 命名空间和 NetworkPolicy 只用于网络策略检查。

mod meta;
mod policy;
mod snapshot;

pub use meta::{
    ContainerStatus, EndpointAddress, NodeCondition, NodeMeta, PodMeta, ServiceMeta, ServicePort,
    ServiceType, TrafficPolicy,
};
pub use policy::{
    IpBlock, LabelSelector, LabelSelectorRequirement, NamespaceMeta, NetworkPolicyMeta,
    NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicyRule, PolicyType, SelectorOperator,
};
pub use snapshot::{NodeSnapshot, StaticCluster};

use std::net::IpAddr;

use crate::error::Result;
use crate::model::{EndpointType, Protocol};
use crate::netstack::NetNsInfo;

pub trait ClusterCache: Send + Sync {
    fn ip_type(&self, ip: IpAddr) -> Result<EndpointType>;
    fn pod_by_ip(&self, ip: IpAddr) -> Result<Option<&PodMeta>>;
    fn pod_by_name(&self, namespace: &str, name: &str) -> Result<Option<&PodMeta>>;
    fn node_by_ip(&self, ip: IpAddr) -> Result<Option<&NodeMeta>>;
    fn node_by_name(&self, name: &str) -> Result<Option<&NodeMeta>>;
    fn service_by_ip(&self, ip: IpAddr) -> Result<Option<&ServiceMeta>>;
    fn service_by_node_port(&self, node_port: u16, protocol: Protocol)
    -> Result<Option<&ServiceMeta>>;
    fn namespace_by_name(&self, name: &str) -> Result<Option<&NamespaceMeta>>;
    fn network_policies(&self) -> Result<&[NetworkPolicyMeta]>;
}

/// 快照采集端
pub trait SnapshotSource: Send + Sync {
    fn pod_netns(&self, namespace: &str, name: &str) -> Result<NetNsInfo>;
    fn node_netns(&self, node: &str) -> Result<NodeSnapshot>;
}
