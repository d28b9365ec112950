//! calico 风格的宿主机节点
//!
//! 每个 pod 的宿主机侧 veth 名为 `cali` 加上 `namespace.name` 的 SHA-1 前 11 位，本节点 pod
//! 各有一条 scope link 的路由直接指向它。跨节点时按目的地址所在 IP 池的 IPIP 模式选择
//! BGP（经宿主机网卡直连下一跳节点）或 IPIP（经 `tunl0` 封装，路由由 bird 下发）。

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
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
use crate::netstack::{RouteProtocol, RouteType, Scope, dev_sysctl_name, lookup_default_iface_name};

pub const CALICO_TUNNEL_INTERFACE: &str = "tunl0";
const VETH_PREFIX: &str = "cali";
const POD_INTERFACE: &str = "eth0";
const ANNOTATION_IPV4_ADDRESS: &str = "projectcalico.org/IPv4Address";

/// 宿主机侧 veth 名
pub fn calico_veth_name(namespace: &str, name: &str) -> String {
    let digest = Sha1::digest(format!("{namespace}.{name}").as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{VETH_PREFIX}{}", &hex[..11])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpipMode {
    Always,
    /// 只有跨子网的节点之间才封装
    CrossSubnet,
    #[default]
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPool {
    #[serde(default)]
    pub name: String,
    pub cidr: IpNet,
    #[serde(default)]
    pub ipip_mode: IpipMode,
    #[serde(default)]
    pub nat_outgoing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalicoNetworkMode {
    Bgp,
    Ipip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalicoOptions {
    /// 宿主机网卡，为空时自动探测
    pub interface: String,
    pub host_mtu: u32,
    /// BGP 模式下的 pod MTU
    pub pod_mtu: u32,
    /// IPIP 模式下的 pod MTU
    pub ipip_pod_mtu: u32,
    pub gateway: Option<IpAddr>,
    pub ip_pools: Vec<IpPool>,
}

impl Default for CalicoOptions {
    fn default() -> Self {
        Self {
            interface: String::new(),
            host_mtu: 1500,
            pod_mtu: 1500,
            ipip_pod_mtu: 1480,
            gateway: None,
            ip_pools: Vec::new(),
        }
    }
}

impl CalicoOptions {
    pub fn ip_pool(&self, ip: IpAddr) -> Option<&IpPool> {
        self.ip_pools.iter().find(|p| p.cidr.contains(&ip))
    }

    /// 地址所在池开启了 IPIP 时取 IPIP 的 MTU
    pub fn pod_mtu_for(&self, ip: IpAddr) -> u32 {
        match self.ip_pool(ip) {
            Some(pool) if pool.ipip_mode != IpipMode::Never => self.ipip_pod_mtu,
            _ => self.pod_mtu,
        }
    }
}

pub struct CalicoPlugin {
    options: Arc<CalicoOptions>,
    cluster: Arc<dyn ClusterCache>,
    service: Arc<dyn ServiceProcessor>,
    infra: Option<Arc<dyn InfraShim>>,
}

impl CalicoPlugin {
    pub fn new(
        options: CalicoOptions,
        cluster: Arc<dyn ClusterCache>,
        service: Arc<dyn ServiceProcessor>,
    ) -> Self {
        Self {
            options: Arc::new(options),
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

impl Plugin for CalicoPlugin {
    fn create_pod(&self, graph: &mut Graph, pod: Arc<PodInfo>) -> Result<Box<dyn NetNodeAction>> {
        let mtu = self.options.pod_mtu_for(pod.meta.ip);
        Ok(Box::new(SimpleVethPod::new(
            graph,
            pod,
            Arc::clone(&self.cluster),
            mtu,
            POD_INTERFACE,
        )))
    }

    fn create_node(
        &self,
        graph: &mut Graph,
        node: Arc<NodeInfo>,
    ) -> Result<Box<dyn NetNodeAction>> {
        let name = node.name.clone();
        let host = CalicoHost::new(
            graph,
            node,
            Arc::clone(&self.cluster),
            Arc::clone(&self.service),
            self.infra.clone(),
            Arc::clone(&self.options),
        )?;
        Ok(Box::new(BasePluginNode::new(
            host.node,
            name,
            Arc::clone(&self.cluster),
            host,
        )))
    }
}

struct CalicoRoute {
    base: RouteExpectations,
    node_name: String,
    iface: String,
    network: Ipv4Net,
    options: Arc<CalicoOptions>,
    cluster: Arc<dyn ClusterCache>,
}

impl CalicoRoute {
    /// 没有池或池不封装时为 BGP；CrossSubnet 只在下一跳节点不在本机网段时封装
    fn network_mode(
        &self,
        pool: Option<&IpPool>,
        next_node: Option<IpAddr>,
    ) -> CalicoNetworkMode {
        match pool.map(|p| p.ipip_mode) {
            Some(IpipMode::Always) => CalicoNetworkMode::Ipip,
            Some(IpipMode::CrossSubnet) => {
                let same_subnet = next_node.is_some_and(|ip| match ip {
                    IpAddr::V4(v4) => self.network.contains(&v4),
                    IpAddr::V6(_) => false,
                });
                if same_subnet {
                    CalicoNetworkMode::Bgp
                } else {
                    CalicoNetworkMode::Ipip
                }
            }
            _ => CalicoNetworkMode::Bgp,
        }
    }

    fn node_address(&self, name: &str) -> Result<Option<IpAddr>> {
        Ok(self
            .cluster
            .node_by_name(name)?
            .and_then(|n| n.addresses.first().copied()))
    }

    /// 池外地址按本机路由校验，池内地址按所在节点校验；返回是否可达
    fn assert(&self, net: &mut NetstackAssertion<'_, '_>, packet: &Packet) -> Result<bool> {
        let Some(pool) = self.options.ip_pool(packet.dst) else {
            return self.base.assert(net, packet);
        };
        let pod = self.cluster.pod_by_ip(packet.dst)?;
        let expect = match pod {
            Some(pod) if pod.node_name == self.node_name => RouteAssertion {
                dev: Some(calico_veth_name(&pod.namespace, &pod.name)),
                kind: Some(RouteType::Unicast),
                scope: Some(Scope::Link),
                ..RouteAssertion::default()
            },
            _ => {
                let host = match pod {
                    Some(pod) => self.node_address(&pod.node_name)?,
                    None => None,
                };
                let mut expect = RouteAssertion {
                    scope: Some(Scope::Universe),
                    gw: host,
                    ..RouteAssertion::default()
                };
                match self.network_mode(Some(pool), host) {
                    CalicoNetworkMode::Bgp => expect.dev = Some(self.iface.clone()),
                    CalicoNetworkMode::Ipip => {
                        expect.dev = Some(CALICO_TUNNEL_INTERFACE.to_string());
                        expect.protocol = Some(RouteProtocol::BIRD);
                    }
                }
                expect
            }
        };
        Ok(net.assert_route(&expect, packet, "", "")?.is_some())
    }
}

/// `to` 的去向
enum Destination<'a> {
    Pod(&'a PodMeta),
    Node(&'a NodeMeta),
    External,
}

pub struct CalicoHost {
    node: NodeId,
    info: Arc<NodeInfo>,
    meta: NodeMeta,
    cluster: Arc<dyn ClusterCache>,
    service: Arc<dyn ServiceProcessor>,
    infra: Option<Arc<dyn InfraShim>>,
    options: Arc<CalicoOptions>,
    iface: String,
    network: Ipv4Net,
    route: CalicoRoute,
}

impl CalicoHost {
    pub fn new(
        graph: &mut Graph,
        info: Arc<NodeInfo>,
        cluster: Arc<dyn ClusterCache>,
        service: Arc<dyn ServiceProcessor>,
        infra: Option<Arc<dyn InfraShim>>,
        options: Arc<CalicoOptions>,
    ) -> Result<Self> {
        let meta = cluster
            .node_by_name(&info.name)?
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("node {}", info.name)))?;

        let iface = if options.interface.is_empty() {
            let detected = lookup_default_iface_name(info.netns.interfaces());
            if detected.is_empty() {
                return Err(Error::Other(
                    "cannot lookup default host interface, please manually specify it via --calico-host-interface"
                        .to_string(),
                ));
            }
            debug!(node = %info.name, iface = %detected, "detected host interface");
            detected
        } else {
            options.interface.clone()
        };
        let network = info
            .netns
            .interface(&iface)
            .map(|dev| dev.default_ipv4())
            .ok_or_else(|| Error::Other(format!("cannot find interface {iface}")))?;

        let mut base = RouteExpectations::new();
        base.add_route(IpNet::V4(network), &iface, None, Scope::Link);
        if let Some(gw) = options.gateway.filter(|g| !g.is_unspecified()) {
            base.add_route(
                IpNet::V4(Ipv4Net::default()),
                &iface,
                Some(gw),
                Scope::Universe,
            );
        }
        let route = CalicoRoute {
            base,
            node_name: info.name.clone(),
            iface: iface.clone(),
            network,
            options: Arc::clone(&options),
            cluster: Arc::clone(&cluster),
        };

        let node = graph.node_for(NetNodeType::Node, &info.name);
        let host = Self {
            node,
            info,
            meta,
            cluster,
            service,
            infra,
            options,
            iface,
            network,
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
        net.assert_net_device(
            &self.iface,
            &InterfaceExpectation::up_with_mtu(self.options.host_mtu),
        );
        net.assert_ip_forward_enabled();
        let forwarding = dev_sysctl_name(&self.iface, "forwarding");
        net.assert_sysctls(&[(forwarding.as_str(), "1")], SuspicionLevel::Fatal);
    }

    /// pod 侧 veth、隧道设备的状态；隧道还须是 ipip 设备且关闭反向路径过滤
    fn assert_interface(&self, graph: &mut Graph, dev: &str) {
        let mut net = NetstackAssertion::new(graph.node_mut(self.node), &self.info.netns);
        if dev == CALICO_TUNNEL_INTERFACE {
            net.assert_default_ipip_tunnel(dev);
            net.assert_rp_filter_disabled(dev);
        }
        net.assert_net_device(dev, &InterfaceExpectation::up());
        let forwarding = dev_sysctl_name(dev, "forwarding");
        net.assert_sysctls(&[(forwarding.as_str(), "1")], SuspicionLevel::Warning);
    }

    fn detect_iif(&self, graph: &Graph, upstream: Option<LinkId>) -> Result<String> {
        let Some(upstream) = upstream else {
            return Ok(String::new());
        };
        let link = graph.link(upstream);
        if link.kind == LinkType::Veth {
            let source = &graph.node(link.source).id;
            let (namespace, name) = source
                .split_once('/')
                .ok_or_else(|| Error::Other(format!("unexpected pod id {source}")))?;
            return Ok(calico_veth_name(namespace, name));
        }
        if link.packet.is_encapsulated() && link.packet.protocol == Protocol::Ipv4 {
            return Ok(CALICO_TUNNEL_INTERFACE.to_string());
        }
        Ok(self.iface.clone())
    }

    /// 源在开启 natOutgoing 的池内、目的不在任何池内时 SNAT 为本机地址
    fn nat_outgoing(&self, packet: &mut Packet) -> Result<()> {
        let src_nat = self
            .options
            .ip_pool(packet.src)
            .is_some_and(|p| p.nat_outgoing);
        if !src_nat || self.options.ip_pool(packet.dst).is_some() {
            return Ok(());
        }
        let (src, _) = self.info.netns.router.route_src(packet, "", "")?;
        packet.src = src;
        Ok(())
    }

    /// 去程和回程路由；返回去程是否可达
    fn check_route(&self, graph: &mut Graph, packet: &Packet) -> Result<bool> {
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

    fn encap(&self, packet: &Packet, next: &NodeMeta, mode: CalicoNetworkMode) -> Result<Packet> {
        if mode == CalicoNetworkMode::Bgp {
            return Ok(packet.deep_copy());
        }
        let annotation = next.annotations.get(ANNOTATION_IPV4_ADDRESS).ok_or_else(|| {
            Error::Other(format!(
                "node {:?} does not have {ANNOTATION_IPV4_ADDRESS} annotation",
                next.name
            ))
        })?;
        let dst = annotation
            .parse::<IpNet>()
            .map(|n| n.addr())
            .or_else(|_| annotation.parse::<IpAddr>())
            .map_err(|e| {
                Error::Other(format!("invalid {ANNOTATION_IPV4_ADDRESS} {annotation:?}: {e}"))
            })?;
        Ok(packet.encapsulate(
            IpAddr::V4(self.network.addr()),
            dst,
            packet.dport,
            Protocol::Ipv4,
        ))
    }

    fn decap(packet: &Packet) -> Packet {
        match &packet.encap {
            Some(inner) => inner.as_ref().deep_copy(),
            None => packet.deep_copy(),
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

        if !self.check_route(graph, packet)? {
            return Ok(None);
        }
        let veth = calico_veth_name(&pod.namespace, &pod.name);
        self.assert_interface(graph, &veth);

        let link = Link::new(LinkType::Veth, self.node, packet.deep_copy())
            .with_source_attribute(LinkAttribute::simple(&veth, None));
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
        if !self.check_route(graph, packet)? {
            return Ok(None);
        }
        let mut out = packet.deep_copy();
        self.nat_outgoing(&mut out)?;
        if let Some(shim) = &self.infra {
            let suspicions = shim.node_to_node(&self.meta, &self.iface, node, &out)?;
            self.add_suspicions(graph, suspicions);
        }

        let pool = self.options.ip_pool(packet.dst);
        let mode = self
            .route
            .network_mode(pool, node.addresses.first().copied());
        let oif = match mode {
            CalicoNetworkMode::Ipip => {
                self.assert_interface(graph, CALICO_TUNNEL_INTERFACE);
                CALICO_TUNNEL_INTERFACE
            }
            CalicoNetworkMode::Bgp => self.iface.as_str(),
        };
        trace!(node = %node.name, mode = ?mode, "to peer node");
        let wire = self.encap(&out, node, mode)?;

        let link = Link::new(LinkType::Infra, self.node, wire)
            .with_source_attribute(LinkAttribute::simple(oif, None));
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
        if !self.check_route(graph, packet)? {
            return Ok(None);
        }
        let mut out = packet.deep_copy();
        if self.cluster.node_by_ip(out.dst)?.is_none() {
            self.nat_outgoing(&mut out)?;
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
        let iif = self.detect_iif(graph, upstream)?;

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

        if graph.link(upstream).kind == LinkType::Veth {
            self.assert_interface(graph, &iif);
        }
        graph.accept_link(upstream, self.node, LinkAttribute::simple(&iif, None));
        let packet = Self::decap(&graph.link(upstream).packet);
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

impl SimplePluginNode for CalicoHost {
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
        let iif = self.detect_iif(graph, upstream)?;
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
        if let Err(e) = self.service.validate(&packet, &backends, &self.info.netns) {
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
                ..Packet::new(backend.ip, backend.port, protocol)
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
        let iif = self.detect_iif(graph, Some(upstream))?;
        let packet = graph.link(upstream).packet.clone();
        if packet.is_encapsulated() {
            NetstackAssertion::new(graph.node_mut(self.node), &self.info.netns)
                .assert_netfilter_serve(&packet, &iif)?;
            let inner = Self::decap(&packet);
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
