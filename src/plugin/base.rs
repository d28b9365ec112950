//! 按目的地址类型分派的节点骨架，以及按网段挑选的路由期望表

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::trace;

use super::NetNodeAction;
use crate::assertions::{NetstackAssertion, RouteAssertion};
use crate::cluster::{ClusterCache, NodeMeta, PodMeta, ServiceMeta};
use crate::error::{Error, Result};
use crate::model::{Endpoint, EndpointType, Graph, LinkId, NodeId, Packet, Protocol, Transmission};
use crate::netstack::Scope;

/// 插件按目的类型实现的转发逻辑，`upstream` 为 `None` 表示自身发起
pub trait SimplePluginNode: Send {
    fn to_pod(
        &mut self,
        graph: &mut Graph,
        upstream: Option<LinkId>,
        dst: &Endpoint,
        protocol: Protocol,
        pod: &PodMeta,
    ) -> Result<Vec<Transmission>>;

    fn to_host(
        &mut self,
        graph: &mut Graph,
        upstream: Option<LinkId>,
        dst: &Endpoint,
        protocol: Protocol,
        node: &NodeMeta,
    ) -> Result<Vec<Transmission>>;

    fn to_service(
        &mut self,
        graph: &mut Graph,
        upstream: Option<LinkId>,
        dst: &Endpoint,
        protocol: Protocol,
        service: &ServiceMeta,
    ) -> Result<Vec<Transmission>>;

    fn to_external(
        &mut self,
        graph: &mut Graph,
        upstream: Option<LinkId>,
        dst: &Endpoint,
        protocol: Protocol,
    ) -> Result<Vec<Transmission>>;

    fn serve(
        &mut self,
        graph: &mut Graph,
        upstream: LinkId,
        dst: &Endpoint,
        protocol: Protocol,
    ) -> Result<Vec<Transmission>>;
}

pub struct BasePluginNode<T> {
    node: NodeId,
    name: String,
    cluster: Arc<dyn ClusterCache>,
    inner: T,
}

impl<T: SimplePluginNode> BasePluginNode<T> {
    pub fn new(
        node: NodeId,
        name: impl Into<String>,
        cluster: Arc<dyn ClusterCache>,
        inner: T,
    ) -> Self {
        Self {
            node,
            name: name.into(),
            cluster,
            inner,
        }
    }

    fn not_found(kind: &str, ip: IpAddr) -> Error {
        Error::NotFound(format!("{kind} with ip {ip}"))
    }
}

impl<T: SimplePluginNode> NetNodeAction for BasePluginNode<T> {
    fn net_node(&self) -> NodeId {
        self.node
    }

    fn send(
        &mut self,
        graph: &mut Graph,
        dst: &Endpoint,
        protocol: Protocol,
    ) -> Result<Vec<Transmission>> {
        let cluster = Arc::clone(&self.cluster);
        let kind = cluster.ip_type(dst.ip)?;
        trace!(node = %self.name, dst = %dst, kind = %kind, "send");
        match kind {
            EndpointType::Pod => {
                let pod = cluster
                    .pod_by_ip(dst.ip)?
                    .ok_or_else(|| Self::not_found("pod", dst.ip))?;
                self.inner.to_pod(graph, None, dst, protocol, pod)
            }
            EndpointType::Node => {
                let host = cluster
                    .node_by_ip(dst.ip)?
                    .ok_or_else(|| Self::not_found("node", dst.ip))?;
                self.inner.to_host(graph, None, dst, protocol, host)
            }
            EndpointType::Service | EndpointType::LoadBalancer => {
                let svc = cluster
                    .service_by_ip(dst.ip)?
                    .ok_or_else(|| Self::not_found("service", dst.ip))?;
                self.inner.to_service(graph, None, dst, protocol, svc)
            }
            EndpointType::External => self.inner.to_external(graph, None, dst, protocol),
        }
    }

    fn receive(&mut self, graph: &mut Graph, upstream: LinkId) -> Result<Vec<Transmission>> {
        let cluster = Arc::clone(&self.cluster);
        let packet = &graph.link(upstream).packet;
        let protocol = packet.protocol;
        let kind = cluster.ip_type(packet.dst)?;
        let dst = Endpoint::new(packet.dst, kind, packet.dport);
        trace!(node = %self.name, dst = %dst, "receive");

        match kind {
            EndpointType::Pod => {
                let pod = cluster
                    .pod_by_ip(dst.ip)?
                    .ok_or_else(|| Self::not_found("pod", dst.ip))?;
                self.inner.to_pod(graph, Some(upstream), &dst, protocol, pod)
            }
            EndpointType::Node => {
                let host = cluster
                    .node_by_ip(dst.ip)?
                    .ok_or_else(|| Self::not_found("node", dst.ip))?;
                if host.name != self.name {
                    return self.inner.to_host(graph, Some(upstream), &dst, protocol, host);
                }
                // 发给自己：命中 nodeport 走服务，否则本机接收
                match cluster.service_by_node_port(dst.port, protocol)? {
                    Some(svc) => self.inner.to_service(graph, Some(upstream), &dst, protocol, svc),
                    None => self.inner.serve(graph, upstream, &dst, protocol),
                }
            }
            EndpointType::Service | EndpointType::LoadBalancer => {
                let svc = cluster
                    .service_by_ip(dst.ip)?
                    .ok_or_else(|| Self::not_found("service", dst.ip))?;
                self.inner.to_service(graph, Some(upstream), &dst, protocol, svc)
            }
            EndpointType::External => self.inner.to_external(graph, Some(upstream), &dst, protocol),
        }
    }
}

/// 网段 -> 路由期望；校验时取包含目的地址的最长前缀
#[derive(Debug, Clone, Default)]
pub struct RouteExpectations {
    routes: BTreeMap<IpNet, RouteAssertion>,
}

impl RouteExpectations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, cidr: IpNet, dev: &str, gw: Option<IpAddr>, scope: Scope) {
        self.routes.insert(
            cidr.trunc(),
            RouteAssertion {
                dev: Some(dev.to_string()),
                scope: Some(scope),
                gw,
                ..RouteAssertion::default()
            },
        );
    }

    pub fn lookup(&self, dst: IpAddr) -> Option<&RouteAssertion> {
        self.routes
            .iter()
            .filter(|(cidr, _)| cidr.contains(&dst))
            .max_by_key(|(cidr, _)| cidr.prefix_len())
            .map(|(_, expect)| expect)
    }

    /// 没有期望覆盖目的地址时不检查，视为可达
    pub fn assert(&self, net: &mut NetstackAssertion<'_, '_>, packet: &Packet) -> Result<bool> {
        match self.lookup(packet.dst) {
            Some(expect) => Ok(net.assert_route(expect, packet, "", "")?.is_some()),
            None => Ok(true),
        }
    }
}
