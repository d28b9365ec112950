use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::meta::{NodeMeta, PodMeta, ServiceMeta};
use super::policy::{NamespaceMeta, NetworkPolicyMeta};
use super::{ClusterCache, SnapshotSource};
use crate::error::{Error, Result};
use crate::model::{EndpointType, Protocol};
use crate::netstack::NetNsInfo;

/// 节点的快照：宿主机命名空间以及节点上各 pod 的命名空间（以 `namespace/name` 为 key）
#[derive(Debug, Clone, Default)]
pub struct NodeSnapshot {
    pub netns: NetNsInfo,
    pub sub_netns: Vec<NetNsInfo>,
}

impl NodeSnapshot {
    pub fn sub_netns(&self, key: &str) -> Option<&NetNsInfo> {
        self.sub_netns.iter().find(|n| n.key == key)
    }
}

/// 场景文件中的集群：对象列表加上预先采集的命名空间快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticCluster {
    pub pods: Vec<PodMeta>,
    pub nodes: Vec<NodeMeta>,
    pub services: Vec<ServiceMeta>,
    pub namespaces: Vec<NamespaceMeta>,
    pub network_policies: Vec<NetworkPolicyMeta>,
    /// key 为 `namespace/name`
    pub pod_netns: BTreeMap<String, NetNsInfo>,
    /// key 为节点名
    pub node_netns: BTreeMap<String, NetNsInfo>,
}

impl StaticCluster {
    /// 地址冲突时以先出现的对象为准
    fn pod(&self, ip: IpAddr) -> Option<&PodMeta> {
        self.pods.iter().find(|p| !p.host_network && p.ip == ip)
    }

    fn node(&self, ip: IpAddr) -> Option<&NodeMeta> {
        self.nodes.iter().find(|n| n.has_address(ip))
    }

    fn service(&self, ip: IpAddr) -> Option<&ServiceMeta> {
        self.services.iter().find(|s| {
            s.cluster_ip == Some(ip)
                || s.external_ips.contains(&ip)
                || s.load_balancer_ips.contains(&ip)
        })
    }

    fn keyed(key: String, mut info: NetNsInfo) -> NetNsInfo {
        if info.key.is_empty() {
            info.key = key;
        }
        info
    }
}

impl ClusterCache for StaticCluster {
    fn ip_type(&self, ip: IpAddr) -> Result<EndpointType> {
        if self.pod(ip).is_some() {
            return Ok(EndpointType::Pod);
        }
        if self.node(ip).is_some() {
            return Ok(EndpointType::Node);
        }
        if let Some(svc) = self.service(ip) {
            if svc.contains_lb_ip(ip) {
                return Ok(EndpointType::LoadBalancer);
            }
            return Ok(EndpointType::Service);
        }
        Ok(EndpointType::External)
    }

    fn pod_by_ip(&self, ip: IpAddr) -> Result<Option<&PodMeta>> {
        Ok(self.pod(ip))
    }

    fn pod_by_name(&self, namespace: &str, name: &str) -> Result<Option<&PodMeta>> {
        Ok(self
            .pods
            .iter()
            .find(|p| p.namespace == namespace && p.name == name))
    }

    fn node_by_ip(&self, ip: IpAddr) -> Result<Option<&NodeMeta>> {
        Ok(self.node(ip))
    }

    fn node_by_name(&self, name: &str) -> Result<Option<&NodeMeta>> {
        Ok(self.nodes.iter().find(|n| n.name == name))
    }

    fn service_by_ip(&self, ip: IpAddr) -> Result<Option<&ServiceMeta>> {
        Ok(self.service(ip))
    }

    fn service_by_node_port(
        &self,
        node_port: u16,
        protocol: Protocol,
    ) -> Result<Option<&ServiceMeta>> {
        Ok(self.services.iter().find(|s| {
            s.ports
                .iter()
                .any(|p| p.node_port != 0 && p.node_port == node_port && p.protocol == protocol)
        }))
    }

    fn namespace_by_name(&self, name: &str) -> Result<Option<&NamespaceMeta>> {
        Ok(self.namespaces.iter().find(|n| n.name == name))
    }

    fn network_policies(&self) -> Result<&[NetworkPolicyMeta]> {
        Ok(&self.network_policies)
    }
}

impl SnapshotSource for StaticCluster {
    fn pod_netns(&self, namespace: &str, name: &str) -> Result<NetNsInfo> {
        let key = format!("{namespace}/{name}");
        let info = self
            .pod_netns
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("netns of pod {key}")))?;
        Ok(Self::keyed(key, info))
    }

    fn node_netns(&self, node: &str) -> Result<NodeSnapshot> {
        let netns = self
            .node_netns
            .get(node)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("netns of node {node}")))?;
        let sub_netns: Vec<NetNsInfo> = self
            .pods
            .iter()
            .filter(|p| p.node_name == node && !p.host_network)
            .filter_map(|p| {
                let key = p.key();
                let info = self.pod_netns.get(&key)?.clone();
                Some(Self::keyed(key, info))
            })
            .collect();
        debug!(node, pods = sub_netns.len(), "node snapshot loaded");
        Ok(NodeSnapshot { netns, sub_netns })
    }
}
