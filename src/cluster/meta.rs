use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::model::Protocol;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub name: String,
    /// 第一个为 InternalIP
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
    #[serde(default)]
    pub pod_cidr: Option<IpNet>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
}

impl NodeMeta {
    pub fn has_address(&self, ip: IpAddr) -> bool {
        self.addresses.contains(&ip)
    }

    pub fn ready_condition(&self) -> Option<&NodeCondition> {
        self.conditions.iter().find(|c| c.kind == "Ready")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodMeta {
    pub namespace: String,
    pub name: String,
    pub ip: IpAddr,
    pub node_name: String,
    #[serde(default)]
    pub host_network: bool,
    #[serde(default)]
    pub containers: Vec<ContainerStatus>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl PodMeta {
    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrafficPolicy {
    #[default]
    Cluster,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    pub port: u16,
    pub target_port: u16,
    /// 0 表示未分配
    #[serde(default)]
    pub node_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub ip: IpAddr,
    #[serde(default)]
    pub node_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ServiceType,
    #[serde(default)]
    pub cluster_ip: Option<IpAddr>,
    #[serde(default)]
    pub external_ips: Vec<IpAddr>,
    #[serde(default)]
    pub load_balancer_ips: Vec<IpAddr>,
    #[serde(default)]
    pub external_traffic_policy: TrafficPolicy,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub endpoints: Vec<EndpointAddress>,
}

impl ServiceMeta {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    fn port(&self, port: u16, protocol: Protocol) -> Option<&ServicePort> {
        self.ports
            .iter()
            .find(|p| p.port == port && p.protocol == protocol)
    }

    /// 服务端口对应的 targetPort，没有则为 0
    pub fn target_port(&self, port: u16, protocol: Protocol) -> u16 {
        self.port(port, protocol).map_or(0, |p| p.target_port)
    }

    pub fn node_port(&self, port: u16, protocol: Protocol) -> u16 {
        self.port(port, protocol).map_or(0, |p| p.node_port)
    }

    pub fn target_port_by_node_port(&self, node_port: u16, protocol: Protocol) -> u16 {
        self.ports
            .iter()
            .find(|p| p.protocol == protocol && p.node_port != 0 && p.node_port == node_port)
            .map_or(0, |p| p.target_port)
    }

    pub fn has_node_port(&self, node_port: u16) -> bool {
        node_port != 0 && self.ports.iter().any(|p| p.node_port == node_port)
    }

    /// 仅 LoadBalancer 类型的 ingress 地址算作负载均衡地址
    pub fn contains_lb_ip(&self, ip: IpAddr) -> bool {
        self.kind == ServiceType::LoadBalancer && self.load_balancer_ips.contains(&ip)
    }

    pub fn is_local_traffic(&self) -> bool {
        self.external_traffic_policy == TrafficPolicy::Local
    }
}
