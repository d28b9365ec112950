//! Kubernetes NetworkPolicy 检查
//!
//! 源为 pod 时检查作用于它的 egress 规则，目的为 pod 时检查作用于它的 ingress 规则；
//! 目的为 service 时展开到每个后端再检查。被拒绝的每条策略给出一条 Critical。

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, trace};

use super::NetworkPolicyHandler;
use super::service::ServiceProcessor;
use crate::cluster::{
    ClusterCache, NetworkPolicyMeta, NetworkPolicyPeer, NetworkPolicyRule, PodMeta, PolicyType,
};
use crate::error::{Error, Result};
use crate::model::{Endpoint, EndpointType, Packet, Protocol, Suspicion, SuspicionLevel};

/// 不同 CNI 在策略实现上的差异
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkPolicyOptions {
    /// pod 访问 service 地址时不检查 egress，只检查展开后的后端
    pub skip_service_address: bool,
    /// 目标是集群内 pod 时忽略 ipBlock 规则
    pub omit_ip_block_in_cluster: bool,
}

pub struct KubeNetworkPolicy {
    cluster: Arc<dyn ClusterCache>,
    service: Arc<dyn ServiceProcessor>,
    options: NetworkPolicyOptions,
}

/// 规则对端所在的一侧
struct Peer<'a> {
    ip: IpAddr,
    pod: Option<&'a PodMeta>,
}

impl KubeNetworkPolicy {
    pub fn new(
        cluster: Arc<dyn ClusterCache>,
        service: Arc<dyn ServiceProcessor>,
        options: NetworkPolicyOptions,
    ) -> Self {
        Self {
            cluster,
            service,
            options,
        }
    }

    fn pod(&self, ip: IpAddr) -> Result<&PodMeta> {
        self.cluster
            .pod_by_ip(ip)?
            .ok_or_else(|| Error::NotFound(format!("pod with ip {ip}")))
    }

    /// 策略的 podSelector 选中了 `pod`
    fn selects(policy: &NetworkPolicyMeta, pod: &PodMeta) -> Result<bool> {
        if policy.namespace != pod.namespace {
            return Ok(false);
        }
        Ok(policy.pod_selector.is_empty() || policy.pod_selector.matches(&pod.labels)?)
    }

    fn peer_matches(
        &self,
        policy: &NetworkPolicyMeta,
        rule_peer: &NetworkPolicyPeer,
        peer: &Peer<'_>,
    ) -> Result<bool> {
        if let Some(pod) = peer.pod {
            let by_selector = rule_peer.pod_selector.is_some()
                || rule_peer.namespace_selector.is_some();
            if by_selector && self.selector_matches(policy, rule_peer, pod)? {
                return Ok(true);
            }
        }
        let Some(block) = &rule_peer.ip_block else {
            return Ok(false);
        };
        if peer.pod.is_some() && self.options.omit_ip_block_in_cluster {
            return Ok(false);
        }
        Ok(block.contains(peer.ip))
    }

    /// 两个选择器同时给出时须同时满足；只有 podSelector 时限定在策略所在命名空间
    fn selector_matches(
        &self,
        policy: &NetworkPolicyMeta,
        rule_peer: &NetworkPolicyPeer,
        pod: &PodMeta,
    ) -> Result<bool> {
        let namespace_ok = match &rule_peer.namespace_selector {
            None => pod.namespace == policy.namespace,
            Some(selector) if selector.is_empty() => true,
            Some(selector) => match self.cluster.namespace_by_name(&pod.namespace)? {
                Some(ns) => selector.matches(&ns.labels)?,
                None => selector.matches(&Default::default())?,
            },
        };
        if !namespace_ok {
            return Ok(false);
        }
        match &rule_peer.pod_selector {
            None => Ok(true),
            Some(selector) => Ok(selector.is_empty() || selector.matches(&pod.labels)?),
        }
    }

    /// 任一规则放行即不拒绝；规则没有对端时放行所有来源/去向
    fn denies(
        &self,
        policy: &NetworkPolicyMeta,
        rules: &[NetworkPolicyRule],
        peer: &Peer<'_>,
        port: u16,
        protocol: Protocol,
    ) -> Result<bool> {
        for rule in rules {
            if !rule.contains_port(port, protocol) {
                continue;
            }
            if rule.peers.is_empty() {
                return Ok(false);
            }
            for rule_peer in &rule.peers {
                if self.peer_matches(policy, rule_peer, peer)? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn check_egress(
        &self,
        pod: &PodMeta,
        dst: &Endpoint,
        protocol: Protocol,
    ) -> Result<Vec<&NetworkPolicyMeta>> {
        let peer = Peer {
            ip: dst.ip,
            pod: self.cluster.pod_by_ip(dst.ip)?,
        };
        let mut denied = Vec::new();
        for policy in self.cluster.network_policies()? {
            if !policy.has_policy_type(PolicyType::Egress) || !Self::selects(policy, pod)? {
                continue;
            }
            if self.denies(policy, &policy.egress, &peer, dst.port, protocol)? {
                trace!(policy = %policy.key(), pod = %pod.key(), "egress denied");
                denied.push(policy);
            }
        }
        Ok(denied)
    }

    fn check_ingress(
        &self,
        pod: &PodMeta,
        src: &Endpoint,
        port: u16,
        protocol: Protocol,
    ) -> Result<Vec<&NetworkPolicyMeta>> {
        let peer = Peer {
            ip: src.ip,
            pod: self.cluster.pod_by_ip(src.ip)?,
        };
        let mut denied = Vec::new();
        for policy in self.cluster.network_policies()? {
            if !policy.has_policy_type(PolicyType::Ingress) || !Self::selects(policy, pod)? {
                continue;
            }
            if self.denies(policy, &policy.ingress, &peer, port, protocol)? {
                trace!(policy = %policy.key(), pod = %pod.key(), "ingress denied");
                denied.push(policy);
            }
        }
        Ok(denied)
    }

    fn check_service(
        &self,
        src: &Endpoint,
        dst: &Endpoint,
        protocol: Protocol,
    ) -> Result<Vec<Suspicion>> {
        let svc = self
            .cluster
            .service_by_ip(dst.ip)?
            .ok_or_else(|| Error::NotFound(format!("service with ip {}", dst.ip)))?;
        let packet = Packet {
            src: src.ip,
            sport: src.port,
            ..Packet::new(dst.ip, dst.port, protocol)
        };
        let mut out = Vec::new();
        for backend in self.service.process(&packet, svc, None) {
            if backend.ip == dst.ip {
                return Err(Error::Other("service network loop".to_string()));
            }
            let kind = self.cluster.ip_type(backend.ip)?;
            let backend = Endpoint::new(backend.ip, kind, backend.port);
            out.extend(self.check_network_policy(src, &backend, protocol)?);
        }
        Ok(out)
    }
}

impl NetworkPolicyHandler for KubeNetworkPolicy {
    fn check_network_policy(
        &self,
        src: &Endpoint,
        dst: &Endpoint,
        protocol: Protocol,
    ) -> Result<Vec<Suspicion>> {
        let to_service = matches!(dst.kind, EndpointType::Service | EndpointType::LoadBalancer);
        let mut denied = Vec::new();
        if src.kind == EndpointType::Pod && !(to_service && self.options.skip_service_address) {
            let pod = self.pod(src.ip)?;
            denied.extend(self.check_egress(pod, dst, protocol)?);
        }
        if dst.kind == EndpointType::Pod {
            let pod = self.pod(dst.ip)?;
            denied.extend(self.check_ingress(pod, src, dst.port, protocol)?);
        }

        let mut out = if to_service {
            self.check_service(src, dst, protocol)?
        } else {
            Vec::new()
        };
        debug!(src = %src, dst = %dst, denied = denied.len(), "network policy checked");
        out.extend(denied.into_iter().map(|policy| {
            Suspicion::new(
                SuspicionLevel::Critical,
                format!(
                    "network policy {} deny the packet from {} to({protocol}) {}:{}",
                    policy.key(),
                    src.ip,
                    dst.ip,
                    dst.port
                ),
            )
        }));
        Ok(out)
    }
}
