//! kube-proxy 的服务后端选择
//!
//! 根据目的地址（ClusterIP / NodePort / ExternalIP / LB）选出后端及其端口，判断是否需要
//! SNAT；ipvs 模式下再与命名空间里的 real server 比对。

use std::collections::BTreeSet;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::cluster::{NodeMeta, ServiceMeta};
use crate::error::{Error, Result};
use crate::model::Packet;
use crate::netstack::NetNs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Backend {
    pub ip: IpAddr,
    pub port: u16,
    pub masquerade: bool,
}

pub trait ServiceProcessor: Send + Sync {
    /// 检查后端与数据面配置一致
    fn validate(&self, packet: &Packet, backends: &[Backend], netns: &NetNs) -> Result<()>;

    /// 目的为 `service` 的包应被送往的后端
    fn process(
        &self,
        packet: &Packet,
        service: &ServiceMeta,
        node: Option<&NodeMeta>,
    ) -> Vec<Backend>;
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum KubeProxyMode {
    #[default]
    Iptables,
    Ipvs,
}

#[derive(Debug, Clone, Default)]
pub struct KubeProxyServiceProcessor {
    mode: KubeProxyMode,
    cluster_cidr: Option<IpNet>,
}

impl KubeProxyServiceProcessor {
    pub fn new(mode: KubeProxyMode, cluster_cidr: Option<IpNet>) -> Self {
        Self { mode, cluster_cidr }
    }

    /// (是否 SNAT, 后端端口)
    fn should_masquerade(&self, packet: &Packet, svc: &ServiceMeta) -> (bool, u16) {
        let dst = packet.dst;
        let target_port = svc.target_port(packet.dport, packet.protocol);
        if target_port != 0 && svc.contains_lb_ip(dst) {
            return (!svc.is_local_traffic(), target_port);
        }
        // 与 kube-proxy 的 `! -s <cluster-cidr> -d <cluster-ip> -j KUBE-MARK-MASQ` 一致
        if target_port != 0 && svc.cluster_ip == Some(dst) {
            if let Some(cidr) = self.cluster_cidr {
                return (!cidr.contains(&packet.src), target_port);
            }
        }
        let by_node_port = svc.target_port_by_node_port(packet.dport, packet.protocol);
        if by_node_port != 0 {
            return (!svc.is_local_traffic(), by_node_port);
        }
        if svc.external_ips.contains(&dst) {
            return (!svc.is_local_traffic(), target_port);
        }
        (false, target_port)
    }
}

/// 来自集群外的流量：目的是 LB 地址，或目的是本节点地址且命中 nodeport
fn is_external_traffic(svc: &ServiceMeta, node: Option<&NodeMeta>, packet: &Packet) -> bool {
    if svc.contains_lb_ip(packet.dst) {
        return true;
    }
    node.is_some_and(|n| n.has_address(packet.dst)) && svc.has_node_port(packet.dport)
}

impl ServiceProcessor for KubeProxyServiceProcessor {
    fn validate(&self, packet: &Packet, backends: &[Backend], netns: &NetNs) -> Result<()> {
        if self.mode != KubeProxyMode::Ipvs {
            return Ok(());
        }
        let Some(svc) = netns.ipvs.service(packet.protocol, packet.dst, packet.dport) else {
            return Err(Error::Other(
                "service has not been configured in ipvs".to_string(),
            ));
        };

        let mut expected: BTreeSet<(IpAddr, u16)> =
            backends.iter().map(|b| (b.ip, b.port)).collect();
        let mut invalid = Vec::new();
        for rs in &svc.rs {
            if !expected.remove(&(rs.ip, rs.port)) {
                invalid.push(format!("{}:{}", rs.ip, rs.port));
            }
        }
        if !invalid.is_empty() {
            return Err(Error::Other(format!(
                "ipvs realserver {} is not a valid k8s service backend, \
                 which could make network issues",
                invalid.join(",")
            )));
        }
        if !expected.is_empty() {
            let missing: Vec<String> = expected
                .into_iter()
                .map(|(ip, port)| format!("{ip}:{port}"))
                .collect();
            return Err(Error::Other(format!(
                "k8s endpoint {} is not in ipvs realserver, which could make network issues",
                missing.join(",")
            )));
        }
        Ok(())
    }

    fn process(&self, packet: &Packet, svc: &ServiceMeta, node: Option<&NodeMeta>) -> Vec<Backend> {
        let (masquerade, port) = self.should_masquerade(packet, svc);
        if port == 0 {
            error!(service = %svc.key(), packet = %packet, "no service port matched");
        }
        let local_only = is_external_traffic(svc, node, packet) && svc.is_local_traffic();

        let backends: Vec<Backend> = svc
            .endpoints
            .iter()
            .filter(|ep| match (local_only, node) {
                (true, Some(n)) => ep.node_name.as_deref() == Some(n.name.as_str()),
                _ => true,
            })
            .map(|ep| Backend {
                ip: ep.ip,
                port,
                masquerade,
            })
            .collect();
        debug!(service = %svc.key(), backends = backends.len(), masquerade, "service processed");
        backends
    }
}
