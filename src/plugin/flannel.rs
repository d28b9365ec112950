//! flannel 风格的宿主机节点
//!
//! 本节点 pod 经网桥（默认 `cni0`）互通；跨节点时 host-gw 直接路由到对端节点地址，
//! vxlan 经 `flannel.1` 封装为 UDP/8472 发往对端。访问 service 时由 kube-proxy 选出后端再分发。

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::base::{BasePluginNode, RouteExpectations, SimplePluginNode};
use super::service::ServiceProcessor;
use super::simple::SimpleVethPod;
use super::{InfraShim, NetNodeAction, NodeInfo, Plugin, PodInfo};
use crate::assertions::{
    Assertion, InterfaceExpectation, KubernetesAssertion, NetstackAssertion, RouteAssertion,
};
use crate::cluster::{ClusterCache, NodeMeta, PodMeta, ServiceMeta};
use crate::error::{Error, Result};
use crate::model::{
    Action, Endpoint, EndpointType, Graph, Hop, Link, LinkAttribute, LinkId, LinkType,
    NetNodeType, NodeId, Packet, Protocol, Suspicion, SuspicionLevel, Transmission,
};
use crate::netstack::{LinkState, Scope, dev_sysctl_name, lookup_default_iface_name};

const VXLAN_INTERFACE: &str = "flannel.1";
const VXLAN_PORT: u16 = 8472;
const VXLAN_MTU: u32 = 1450;
const HOST_MTU: u32 = 1500;
const POD_INTERFACE: &str = "eth0";
const ANNOTATION_PUBLIC_IP: &str = "flannel.alpha.coreos.com/public-ip";
const ANNOTATION_BACKEND_TYPE: &str = "flannel.alpha.coreos.com/backend-type";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum FlannelBackend {
    #[default]
    HostGw,
    Vxlan,
    Alloc,
}

impl FlannelBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlannelBackend::HostGw => "host-gw",
            FlannelBackend::Vxlan => "vxlan",
            FlannelBackend::Alloc => "alloc",
        }
    }

    fn from_annotation(value: &str) -> Option<Self> {
        [FlannelBackend::HostGw, FlannelBackend::Vxlan, FlannelBackend::Alloc]
            .into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlannelOptions {
    pub backend: FlannelBackend,
    pub bridge: String,
    /// 宿主机网卡，为空时自动探测
    pub interface: String,
    /// 为 0 时 vxlan 取 1450，其余取 1500
    pub pod_mtu: u32,
    pub ip_masq: bool,
    pub cluster_cidr: Option<IpNet>,
    /// 期望的默认网关
    pub gateway: Option<IpAddr>,
}

impl Default for FlannelOptions {
    fn default() -> Self {
        Self {
            backend: FlannelBackend::HostGw,
            bridge: "cni0".to_string(),
            interface: String::new(),
            pod_mtu: 0,
            ip_masq: true,
            cluster_cidr: None,
            gateway: None,
        }
    }
}

impl FlannelOptions {
    pub fn pod_mtu(&self) -> u32 {
        match (self.pod_mtu, self.backend) {
            (0, FlannelBackend::Vxlan) => VXLAN_MTU,
            (0, _) => HOST_MTU,
            (mtu, _) => mtu,
        }
    }
}

pub struct FlannelPlugin {
    options: FlannelOptions,
    cluster: Arc<dyn ClusterCache>,
    service: Arc<dyn ServiceProcessor>,
    infra: Option<Arc<dyn InfraShim>>,
}

impl FlannelPlugin {
    pub fn new(
        options: FlannelOptions,
        cluster: Arc<dyn ClusterCache>,
        service: Arc<dyn ServiceProcessor>,
    ) -> Self {
        Self {
            options,
            cluster,
            service,
            infra: None,
        }
    }

    pub fn with_infra_shim(mut self, shim: Arc<dyn InfraShim>) -> Self {
        self.infra = Some(shim);
        self
    }
}

impl Plugin for FlannelPlugin {
    fn create_pod(&self, graph: &mut Graph, pod: Arc<PodInfo>) -> Result<Box<dyn NetNodeAction>> {
        Ok(Box::new(SimpleVethPod::new(
            graph,
            pod,
            Arc::clone(&self.cluster),
            self.options.pod_mtu(),
            POD_INTERFACE,
        )))
    }

    fn create_node(
        &self,
        graph: &mut Graph,
        node: Arc<NodeInfo>,
    ) -> Result<Box<dyn NetNodeAction>> {
        let name = node.name.clone();
        let host = FlannelHost::new(
            graph,
            node,
            Arc::clone(&self.cluster),
            Arc::clone(&self.service),
            self.infra.clone(),
            &self.options,
        )?;
        Ok(Box::new(BasePluginNode::new(
            host.node,
            name,
            Arc::clone(&self.cluster),
            host,
        )))
    }
}

/// 对端节点的转发参数
#[derive(Debug, Clone)]
struct PeerNode {
    vtep: Option<IpAddr>,
    backend: FlannelBackend,
    node_ip: IpAddr,
    dev: String,
    dev_mtu: Option<u32>,
    route: RouteAssertion,
}

struct FlannelRoute {
    base: RouteExpectations,
    local_pod_cidr: IpNet,
    cluster_cidr: Option<IpNet>,
    local_vtep: Option<IpAddr>,
    cluster: Arc<dyn ClusterCache>,
    peers: HashMap<String, PeerNode>,
    backend: FlannelBackend,
    iface: String,
}

impl FlannelRoute {
    fn in_cluster(&self, ip: IpAddr) -> bool {
        self.cluster_cidr.is_some_and(|c| c.contains(&ip))
    }

    /// 目的为 pod 时取其所在节点的参数
    fn peer_of(&mut self, packet: &Packet) -> Result<Option<PeerNode>> {
        let cluster = Arc::clone(&self.cluster);
        match cluster.pod_by_ip(packet.dst)? {
            Some(pod) => self.peer(&pod.node_name).map(Some),
            None => Ok(None),
        }
    }

    fn peer(&mut self, name: &str) -> Result<PeerNode> {
        if let Some(peer) = self.peers.get(name) {
            return Ok(peer.clone());
        }
        let cluster = Arc::clone(&self.cluster);
        let node = cluster
            .node_by_name(name)?
            .ok_or_else(|| Error::NotFound(format!("node {name} in k8s nodes")))?;
        let cidr = node
            .pod_cidr
            .ok_or_else(|| Error::Other(format!("node {name} has no pod cidr")))?;
        let node_ip: IpAddr = node
            .annotations
            .get(ANNOTATION_PUBLIC_IP)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                Error::Other(format!("node {name} does not have flannel public-ip annotation"))
            })?
            .parse()
            .map_err(|e| Error::Other(format!("invalid flannel public-ip of node {name}: {e}")))?;
        let annotation = node.annotations.get(ANNOTATION_BACKEND_TYPE).ok_or_else(|| {
            Error::Other(format!("node {name} does not have flannel backend-type annotation"))
        })?;

        let (backend, vtep, dev, dev_mtu) = match FlannelBackend::from_annotation(annotation) {
            Some(FlannelBackend::Vxlan) => (
                FlannelBackend::Vxlan,
                Some(cidr.addr()),
                VXLAN_INTERFACE.to_string(),
                Some(VXLAN_MTU),
            ),
            Some(FlannelBackend::HostGw) => {
                (FlannelBackend::HostGw, Some(node_ip), self.iface.clone(), None)
            }
            _ => (self.backend, None, self.iface.clone(), None),
        };
        let route = RouteAssertion {
            dev: Some(dev.clone()),
            gw: vtep.filter(|v| !v.is_unspecified()),
            ..RouteAssertion::default()
        };
        let peer = PeerNode {
            vtep,
            backend,
            node_ip,
            dev,
            dev_mtu,
            route,
        };
        trace!(node = name, backend = backend.as_str(), "peer node resolved");
        self.peers.insert(name.to_string(), peer.clone());
        Ok(peer)
    }

    /// 本节点网段和集群外地址按本机路由校验，其余按对端节点参数校验
    fn assert(&mut self, net: &mut NetstackAssertion<'_, '_>, packet: &Packet) -> Result<bool> {
        if self.local_pod_cidr.contains(&packet.dst) || !self.in_cluster(packet.dst) {
            return self.base.assert(net, packet);
        }
        match self.peer_of(packet)? {
            Some(peer) => Ok(net.assert_route(&peer.route, packet, "", "")?.is_some()),
            None => Ok(true),
        }
    }

    fn assert_backend(
        &mut self,
        net: &mut NetstackAssertion<'_, '_>,
        packet: &Packet,
    ) -> Result<()> {
        let Some(peer) = self.peer_of(packet)? else {
            return Ok(());
        };
        net.assert_net_device(
            &peer.dev,
            &InterfaceExpectation {
                state: Some(LinkState::Up),
                mtu: peer.dev_mtu,
                ..InterfaceExpectation::default()
            },
        );
        let forwarding = dev_sysctl_name(&peer.dev, "forwarding");
        net.assert_sysctls(&[(forwarding.as_str(), "1")], SuspicionLevel::Fatal);
        if peer.backend == FlannelBackend::Vxlan {
            if let Some(vtep) = peer.vtep {
                net.assert_vxlan_vtep(vtep, peer.node_ip, VXLAN_INTERFACE)?;
            }
        }
        Ok(())
    }

    fn encap(&mut self, packet: &Packet) -> Result<Packet> {
        match self.peer_of(packet)? {
            Some(peer) if peer.backend == FlannelBackend::Vxlan => {
                let src = self.local_vtep.ok_or_else(|| {
                    Error::Other(
                        "local node does not have flannel public-ip annotation".to_string(),
                    )
                })?;
                Ok(packet.encapsulate(src, peer.node_ip, VXLAN_PORT, Protocol::Udp))
            }
            _ => Ok(packet.deep_copy()),
        }
    }

    fn decap(&self, packet: &Packet) -> Result<Packet> {
        let Some(inner) = &packet.encap else {
            return Ok(packet.deep_copy());
        };
        if self.local_vtep != Some(packet.dst) {
            return Err(Error::Other(format!(
                "encap dst {} not match local vtep {}",
                packet.dst,
                self.local_vtep
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            )));
        }
        Ok(inner.as_ref().deep_copy())
    }
}

/// `to` 的去向
enum Destination<'a> {
    Pod(&'a PodMeta),
    Node(&'a NodeMeta),
    External,
}

pub struct FlannelHost {
    node: NodeId,
    info: Arc<NodeInfo>,
    meta: NodeMeta,
    cluster: Arc<dyn ClusterCache>,
    service: Arc<dyn ServiceProcessor>,
    infra: Option<Arc<dyn InfraShim>>,
    bridge: String,
    cluster_cidr: Option<IpNet>,
    pod_cidr: IpNet,
    iface: String,
    ip_masq: bool,
    route: FlannelRoute,
}

impl FlannelHost {
    pub fn new(
        graph: &mut Graph,
        info: Arc<NodeInfo>,
        cluster: Arc<dyn ClusterCache>,
        service: Arc<dyn ServiceProcessor>,
        infra: Option<Arc<dyn InfraShim>>,
        options: &FlannelOptions,
    ) -> Result<Self> {
        let meta = cluster
            .node_by_name(&info.name)?
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("node {}", info.name)))?;
        let pod_cidr = meta
            .pod_cidr
            .map(|c| c.trunc())
            .ok_or_else(|| Error::Other(format!("node {} has no pod cidr", info.name)))?;

        let iface = if options.interface.is_empty() {
            let detected = lookup_default_iface_name(info.netns.interfaces());
            if detected.is_empty() {
                return Err(Error::Other(
                    "cannot lookup default host interface, please manually specify it via --flannel-host-interface"
                        .to_string(),
                ));
            }
            debug!(node = %info.name, iface = %detected, "detected host interface");
            detected
        } else {
            options.interface.clone()
        };

        let dev = info
            .netns
            .interface(&iface)
            .ok_or_else(|| Error::Other(format!("can not find interface named {iface}")))?;
        let mut base = RouteExpectations::new();
        base.add_route(pod_cidr, &options.bridge, None, Scope::Link);
        base.add_route(IpNet::V4(dev.default_ipv4()), &iface, None, Scope::Link);
        if let Some(gw) = options.gateway.filter(|g| !g.is_unspecified()) {
            base.add_route(
                IpNet::V4(Ipv4Net::default()),
                &iface,
                Some(gw),
                Scope::Universe,
            );
        }

        let route = FlannelRoute {
            base,
            local_pod_cidr: pod_cidr,
            cluster_cidr: options.cluster_cidr,
            local_vtep: meta
                .annotations
                .get(ANNOTATION_PUBLIC_IP)
                .and_then(|ip| ip.parse().ok()),
            cluster: Arc::clone(&cluster),
            peers: HashMap::new(),
            backend: options.backend,
            iface: iface.clone(),
        };

        let node = graph.node_for(NetNodeType::Node, &info.name);
        let host = Self {
            node,
            info,
            meta,
            cluster,
            service,
            infra,
            bridge: options.bridge.clone(),
            cluster_cidr: options.cluster_cidr,
            pod_cidr,
            iface,
            ip_masq: options.ip_masq,
            route,
        };
        host.basic_check(graph);
        Ok(host)
    }

    fn basic_check(&self, graph: &mut Graph) {
        let sink = graph.node_mut(self.node);
        KubernetesAssertion::new(&mut *sink).assert_node(&self.meta);

        let mut net = NetstackAssertion::new(sink, &self.info.netns);
        net.assert_default_rule();
        net.assert_no_policy_route();
        net.assert_default_accept();
        net.assert_net_device(&self.iface, &InterfaceExpectation::up_with_mtu(HOST_MTU));
        net.assert_host_bridge(&self.bridge);
        let bridge_forwarding = dev_sysctl_name(&self.bridge, "forwarding");
        let iface_forwarding = dev_sysctl_name(&self.iface, "forwarding");
        net.assert_sysctls(
            &[
                ("net.bridge.bridge-nf-call-iptables", "1"),
                ("net.ipv4.ip_forward", "1"),
                (bridge_forwarding.as_str(), "1"),
                (iface_forwarding.as_str(), "1"),
            ],
            SuspicionLevel::Fatal,
        );
    }

    fn in_cluster(&self, ip: IpAddr) -> bool {
        self.cluster_cidr.is_some_and(|c| c.contains(&ip))
    }

    fn detect_iif(&self, graph: &Graph, upstream: Option<LinkId>) -> String {
        match upstream {
            None => String::new(),
            Some(link) if graph.link(link).kind == LinkType::Veth => self.bridge.clone(),
            Some(_) => self.iface.clone(),
        }
    }

    /// flannel 的 SNAT 规则：
    /// 集群内到集群内不做；集群内到非组播地址做；集群外到本节点 pod 不做；集群外到集群内做
    fn masquerade(&self, packet: &mut Packet) -> Result<()> {
        if !self.ip_masq {
            return Ok(());
        }
        let src_in = self.in_cluster(packet.src);
        let dst_in = self.in_cluster(packet.dst);
        let snat = match (src_in, dst_in) {
            (true, true) => false,
            (true, false) => !packet.dst.is_multicast(),
            (false, _) if self.pod_cidr.contains(&packet.dst) => false,
            (false, dst_in) => dst_in,
        };
        if snat {
            let (src, _) = self.info.netns.router.route_src(packet, "", "")?;
            packet.src = src;
        }
        Ok(())
    }

    /// 去程和回程路由；返回去程是否可达
    fn check_route(&mut self, graph: &mut Graph, packet: &Packet) -> Result<bool> {
        let mut net = NetstackAssertion::new(graph.node_mut(self.node), &self.info.netns);
        let reachable = self.route.assert(&mut net, packet)?;
        self.route.assert(&mut net, &packet.reply())?;
        Ok(reachable)
    }

    fn add_suspicions(&self, graph: &mut Graph, suspicions: Vec<Suspicion>) {
        let node = graph.node_mut(self.node);
        for s in suspicions {
            node.add_suspicion(s.level, s.message);
        }
    }

    fn transmission_to_pod(
        &mut self,
        graph: &mut Graph,
        packet: &Packet,
        pod: &PodMeta,
    ) -> Result<Option<Transmission>> {
        if pod.host_network || pod.node_name != self.info.name {
            let cluster = Arc::clone(&self.cluster);
            let node = cluster
                .node_by_name(&pod.node_name)?
                .ok_or_else(|| Error::NotFound(format!("node {}", pod.node_name)))?;
            return self.transmission_to_node(graph, packet, node);
        }

        if let Some(peer) = self.info.sub_netns(&pod.key()) {
            NetstackAssertion::new(graph.node_mut(self.node), &self.info.netns)
                .assert_veth_peer_bridge(POD_INTERFACE, peer, &self.bridge);
        }
        if !self.check_route(graph, packet)? {
            return Ok(None);
        }
        let mut out = packet.deep_copy();
        self.masquerade(&mut out)?;

        let link = Link::new(LinkType::Veth, self.node, out)
            .with_source_attribute(LinkAttribute::simple(&self.bridge, None));
        Ok(Some(Transmission {
            next_hop: Hop::new(NetNodeType::Pod, packet.dst.to_string()),
            link: graph.add_link(link),
        }))
    }

    fn transmission_to_node(
        &mut self,
        graph: &mut Graph,
        packet: &Packet,
        node: &NodeMeta,
    ) -> Result<Option<Transmission>> {
        let mut out = packet.deep_copy();
        self.masquerade(&mut out)?;
        if !self.check_route(graph, packet)? {
            return Ok(None);
        }
        {
            let mut net = NetstackAssertion::new(graph.node_mut(self.node), &self.info.netns);
            self.route.assert_backend(&mut net, &out)?;
        }
        let wire = self.route.encap(&out)?;
        if let Some(shim) = &self.infra {
            let suspicions = shim.node_to_node(&self.meta, &self.iface, node, &out)?;
            self.add_suspicions(graph, suspicions);
        }

        let link = Link::new(LinkType::Infra, self.node, wire)
            .with_source_attribute(LinkAttribute::simple(&self.iface, None));
        Ok(Some(Transmission {
            next_hop: Hop::new(NetNodeType::Node, &node.name),
            link: graph.add_link(link),
        }))
    }

    fn transmission_to_external(
        &mut self,
        graph: &mut Graph,
        packet: &Packet,
    ) -> Result<Option<Transmission>> {
        let mut out = packet.deep_copy();
        self.masquerade(&mut out)?;
        if !self.check_route(graph, &out)? {
            return Ok(None);
        }
        if let Some(shim) = &self.infra {
            let suspicions = shim.node_to_external(&self.meta, &self.iface, &out)?;
            self.add_suspicions(graph, suspicions);
        }

        let next_hop = Hop::new(NetNodeType::External, out.dst.to_string());
        let link = Link::new(LinkType::Infra, self.node, out)
            .with_source_attribute(LinkAttribute::simple(&self.iface, None));
        Ok(Some(Transmission {
            next_hop,
            link: graph.add_link(link),
        }))
    }

    fn transmit(
        &mut self,
        graph: &mut Graph,
        packet: &Packet,
        dst: &Destination<'_>,
    ) -> Result<Option<Transmission>> {
        match dst {
            Destination::Pod(pod) => self.transmission_to_pod(graph, packet, pod),
            Destination::Node(node) => self.transmission_to_node(graph, packet, node),
            Destination::External => self.transmission_to_external(graph, packet),
        }
    }

    /// 源地址由本机路由决定的新包；没有路由时记 Fatal 并终止该分支
    fn originate(&self, graph: &mut Graph, dst: &Endpoint, protocol: Protocol) -> Result<Packet> {
        let mut packet = Packet::new(dst.ip, dst.port, protocol);
        match self.info.netns.router.route_src(&packet, "", "") {
            Ok((src, _)) => {
                packet.src = src;
                Ok(packet)
            }
            Err(Error::NoRouteToHost) => {
                graph
                    .node_mut(self.node)
                    .add_suspicion(SuspicionLevel::Fatal, format!("no route to host: {dst}"));
                Err(Error::cannot_build(self.node, Error::NoRouteToHost))
            }
            Err(e) => Err(e),
        }
    }

    fn to(
        &mut self,
        graph: &mut Graph,
        upstream: Option<LinkId>,
        dst: &Endpoint,
        protocol: Protocol,
        target: Destination<'_>,
    ) -> Result<Vec<Transmission>> {
        let iif = self.detect_iif(graph, upstream);

        let Some(upstream) = upstream else {
            let packet = self.originate(graph, dst, protocol)?;
            let Some(trans) = self.transmit(graph, &packet, &target)? else {
                return Err(Error::cannot_build(self.node, Error::NoRouteToHost));
            };
            let out = graph.link(trans.link).packet.clone();
            NetstackAssertion::new(graph.node_mut(self.node), &self.info.netns)
                .assert_netfilter_send(&packet, &[out], &iif)?;
            graph
                .node_mut(self.node)
                .do_action(Action::send(vec![trans.link]));
            return Ok(vec![trans]);
        };

        let link = graph.link(upstream).clone();
        if link.kind == LinkType::Veth {
            if let Some(peer_index) = link.source_attribute.peer_index() {
                NetstackAssertion::new(graph.node_mut(self.node), &self.info.netns)
                    .assert_veth_on_bridge(peer_index, &self.bridge);
            }
        }
        graph.accept_link(upstream, self.node, LinkAttribute::simple(&iif, None));
        let packet = self.route.decap(&link.packet)?;
        let Some(trans) = self.transmit(graph, &packet, &target)? else {
            return Ok(Vec::new());
        };
        let out = graph.link(trans.link).packet.clone();
        NetstackAssertion::new(graph.node_mut(self.node), &self.info.netns)
            .assert_netfilter_forward(&packet, &[out], &iif)?;
        graph
            .node_mut(self.node)
            .do_action(Action::forward(upstream, vec![trans.link]));
        Ok(vec![trans])
    }
}

impl SimplePluginNode for FlannelHost {
    fn to_pod(
        &mut self,
        graph: &mut Graph,
        upstream: Option<LinkId>,
        dst: &Endpoint,
        protocol: Protocol,
        pod: &PodMeta,
    ) -> Result<Vec<Transmission>> {
        self.to(graph, upstream, dst, protocol, Destination::Pod(pod))
    }

    fn to_host(
        &mut self,
        graph: &mut Graph,
        upstream: Option<LinkId>,
        dst: &Endpoint,
        protocol: Protocol,
        node: &NodeMeta,
    ) -> Result<Vec<Transmission>> {
        self.to(graph, upstream, dst, protocol, Destination::Node(node))
    }

    fn to_external(
        &mut self,
        graph: &mut Graph,
        upstream: Option<LinkId>,
        dst: &Endpoint,
        protocol: Protocol,
    ) -> Result<Vec<Transmission>> {
        self.to(graph, upstream, dst, protocol, Destination::External)
    }

    #[tracing::instrument(
        skip(self, graph, service),
        fields(node = %self.info.name, service = %service.key())
    )]
    fn to_service(
        &mut self,
        graph: &mut Graph,
        upstream: Option<LinkId>,
        dst: &Endpoint,
        protocol: Protocol,
        service: &ServiceMeta,
    ) -> Result<Vec<Transmission>> {
        let iif = self.detect_iif(graph, upstream);
        let packet = match upstream {
            Some(up) => {
                graph.accept_link(up, self.node, LinkAttribute::simple(&iif, None));
                graph.link(up).packet.clone()
            }
            None => self.originate(graph, dst, protocol)?,
        };

        let backends = self.service.process(&packet, service, Some(&self.meta));
        if backends.is_empty() {
            let message = format!("service {} has no valid endpoint", service.key());
            let node = graph.node_mut(self.node);
            node.add_suspicion(SuspicionLevel::Fatal, message.clone());
            node.do_action(Action::service(upstream, Vec::new()));
            return Err(Error::cannot_build(self.node, Error::Other(message)));
        }
        if let Err(e) = self
            .service
            .validate(&packet, &backends, &self.info.netns)
        {
            graph.node_mut(self.node).add_suspicion(
                SuspicionLevel::Fatal,
                format!("validate endpoint of service {} failed: {e}", service.key()),
            );
        }
        {
            let mut net = NetstackAssertion::new(graph.node_mut(self.node), &self.info.netns);
            for b in &backends {
                net.assert_ipvs_server_exists(packet.dst, packet.dport, protocol, b.ip, b.port);
            }
        }

        let cluster = Arc::clone(&self.cluster);
        let mut transmissions = Vec::new();
        for backend in &backends {
            let mut out = Packet {
                src: packet.src,
                sport: packet.sport,
                dst: backend.ip,
                dport: backend.port,
                protocol,
                encap: None,
                mark: 0,
            };
            if backend.masquerade {
                let (src, _) = self.info.netns.router.route_src(&out, "", "")?;
                out.src = src;
            }

            let trans = match cluster.ip_type(backend.ip)? {
                EndpointType::Pod => {
                    let pod = cluster.pod_by_ip(backend.ip)?.ok_or_else(|| {
                        Error::NotFound(format!("pod from ip {}", backend.ip))
                    })?;
                    self.transmission_to_pod(graph, &out, pod)?
                }
                EndpointType::Node => {
                    let node = cluster.node_by_ip(backend.ip)?.ok_or_else(|| {
                        Error::NotFound(format!("node from ip {}", backend.ip))
                    })?;
                    self.transmission_to_node(graph, &out, node)?
                }
                _ => self.transmission_to_external(graph, &out)?,
            };
            transmissions.extend(trans);
        }

        let links: Vec<LinkId> = transmissions.iter().map(|t| t.link).collect();
        let outs: Vec<Packet> = links
            .iter()
            .map(|l| graph.link(*l).packet.clone())
            .collect();
        graph
            .node_mut(self.node)
            .do_action(Action::service(upstream, links));

        let mut net = NetstackAssertion::new(graph.node_mut(self.node), &self.info.netns);
        match upstream {
            Some(_) => net.assert_netfilter_forward(&packet, &outs, &iif)?,
            None => net.assert_netfilter_send(&packet, &outs, &iif)?,
        }
        Ok(transmissions)
    }

    fn serve(
        &mut self,
        graph: &mut Graph,
        upstream: LinkId,
        dst: &Endpoint,
        protocol: Protocol,
    ) -> Result<Vec<Transmission>> {
        let iif = self.detect_iif(graph, Some(upstream));
        let packet = graph.link(upstream).packet.clone();
        if packet.is_encapsulated() {
            let inner = self.route.decap(&packet)?;
            let cluster = Arc::clone(&self.cluster);
            let pod = cluster.pod_by_ip(inner.dst)?.ok_or_else(|| {
                Error::NotFound(format!("inner packet pod {}", inner.dst))
            })?;
            let endpoint = Endpoint::new(inner.dst, EndpointType::Pod, inner.dport);
            return self.to_pod(graph, Some(upstream), &endpoint, inner.protocol, pod);
        }

        graph.accept_link(upstream, self.node, LinkAttribute::simple(&iif, None));
        let mut net = NetstackAssertion::new(graph.node_mut(self.node), &self.info.netns);
        self.route.assert(&mut net, &packet.reply())?;
        net.assert_netfilter_serve(&packet, &iif)?;
        net.assert_listen(dst.ip, dst.port, protocol);
        graph.node_mut(self.node).do_action(Action::serve(upstream));
        Ok(Vec::new())
    }
}
