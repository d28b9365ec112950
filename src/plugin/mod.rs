//! 网络插件
//!
//! 每种 CNI 决定一个节点收到（或发出）数据包后去往哪一跳、是否封装或 SNAT。
//! 遍历引擎只通过 `NetNodeAction` 与节点交互。

mod base;
mod calico;
mod flannel;
mod generic;
mod network_policy;
mod service;
mod simple;

pub use base::{BasePluginNode, RouteExpectations, SimplePluginNode};
pub use calico::{
    CALICO_TUNNEL_INTERFACE, CalicoHost, CalicoNetworkMode, CalicoOptions, CalicoPlugin, IpPool,
    IpipMode, calico_veth_name,
};
pub use flannel::{FlannelBackend, FlannelHost, FlannelOptions, FlannelPlugin};
pub use generic::GenericNetNode;
pub use network_policy::{KubeNetworkPolicy, NetworkPolicyOptions};
pub use service::{Backend, KubeProxyMode, KubeProxyServiceProcessor, ServiceProcessor};
pub use simple::SimpleVethPod;

use std::sync::Arc;

use crate::cluster::{NodeMeta, PodMeta};
use crate::error::Result;
use crate::model::{Endpoint, Graph, LinkId, NodeId, Packet, Protocol, Suspicion, Transmission};
use crate::netstack::{NetNs, NetNsInfo};

/// 图中一个节点的行为
pub trait NetNodeAction: Send {
    fn net_node(&self) -> NodeId;

    /// 自身作为源，向 `dst` 发起
    fn send(&mut self, graph: &mut Graph, dst: &Endpoint, protocol: Protocol)
    -> Result<Vec<Transmission>>;

    /// 从上游链路收到数据包
    fn receive(&mut self, graph: &mut Graph, upstream: LinkId) -> Result<Vec<Transmission>>;
}

/// pod 的快照
#[derive(Debug)]
pub struct PodInfo {
    pub meta: PodMeta,
    pub netns: NetNs,
}

/// 节点的快照：宿主机命名空间和节点上 pod 的原始命名空间信息
#[derive(Debug)]
pub struct NodeInfo {
    pub name: String,
    pub netns: NetNs,
    pub sub_netns: Vec<NetNsInfo>,
}

impl NodeInfo {
    pub fn sub_netns(&self, key: &str) -> Option<&NetNsInfo> {
        self.sub_netns.iter().find(|n| n.key == key)
    }
}

pub trait Plugin: Send + Sync {
    fn create_pod(
        &self,
        graph: &mut Graph,
        pod: Arc<PodInfo>,
    ) -> Result<Box<dyn NetNodeAction>>;

    fn create_node(
        &self,
        graph: &mut Graph,
        node: Arc<NodeInfo>,
    ) -> Result<Box<dyn NetNodeAction>>;
}

/// 网络策略检查，结果作为全局 suspicion
pub trait NetworkPolicyHandler: Send + Sync {
    fn check_network_policy(
        &self,
        src: &Endpoint,
        dst: &Endpoint,
        protocol: Protocol,
    ) -> Result<Vec<Suspicion>>;
}

/// 云厂商基础设施（安全组、VPC 路由）上的检查
pub trait InfraShim: Send + Sync {
    fn node_to_node(
        &self,
        src: &NodeMeta,
        oif: &str,
        dst: &NodeMeta,
        packet: &Packet,
    ) -> Result<Vec<Suspicion>>;

    fn node_to_external(&self, src: &NodeMeta, oif: &str, packet: &Packet)
    -> Result<Vec<Suspicion>>;
}
