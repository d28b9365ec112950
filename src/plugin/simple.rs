//! 通过一对 veth 接到宿主机的 pod
//!
//! 出向一律经 pod 内的 `eth0` 送到所在节点；入向只接受 veth 链路并在本地接收。

use std::sync::Arc;

use tracing::debug;

use super::{NetNodeAction, PodInfo};
use crate::assertions::{
    Assertion, InterfaceExpectation, KubernetesAssertion, NetstackAssertion, RouteAssertion,
};
use crate::cluster::ClusterCache;
use crate::error::{Error, Result};
use crate::model::{
    Action, Endpoint, Graph, Hop, Link, LinkAttribute, LinkId, LinkType, NetNodeType, NodeId,
    Packet, Protocol, SuspicionLevel, Transmission,
};

pub struct SimpleVethPod {
    node: NodeId,
    info: Arc<PodInfo>,
    cluster: Arc<dyn ClusterCache>,
    mtu: u32,
    iface: String,
}

impl SimpleVethPod {
    /// 图中节点 ID 为 `namespace/name`
    pub fn new(
        graph: &mut Graph,
        info: Arc<PodInfo>,
        cluster: Arc<dyn ClusterCache>,
        mtu: u32,
        iface: impl Into<String>,
    ) -> Self {
        let node = graph.node_for(NetNodeType::Pod, &info.meta.key());
        Self {
            node,
            info,
            cluster,
            mtu,
            iface: iface.into(),
        }
    }

    fn assert(&self, graph: &mut Graph) -> Result<()> {
        let sink = graph.node_mut(self.node);
        if let Some(pod) = self
            .cluster
            .pod_by_name(&self.info.meta.namespace, &self.info.meta.name)?
        {
            KubernetesAssertion::new(&mut *sink).assert_pod(pod);
        }
        let mut net = NetstackAssertion::new(sink, &self.info.netns);
        net.assert_default_rule();
        net.assert_no_policy_route();
        net.assert_no_iptables();
        net.assert_default_accept();
        net.assert_net_device(&self.iface, &InterfaceExpectation::up_with_mtu(self.mtu));
        net.assert_net_device("lo", &InterfaceExpectation::up());
        Ok(())
    }
}

impl NetNodeAction for SimpleVethPod {
    fn net_node(&self) -> NodeId {
        self.node
    }

    #[tracing::instrument(skip(self, graph), fields(pod = %self.info.meta.key()))]
    fn send(
        &mut self,
        graph: &mut Graph,
        dst: &Endpoint,
        protocol: Protocol,
    ) -> Result<Vec<Transmission>> {
        self.assert(graph)?;

        let netns = &self.info.netns;
        let mut packet = Packet::new(dst.ip, dst.port, protocol);
        let mut net = NetstackAssertion::new(graph.node_mut(self.node), netns);
        if net
            .assert_route(&RouteAssertion::dev(&self.iface), &packet, "", "")?
            .is_none()
        {
            return Err(Error::cannot_build(self.node, Error::NoRouteToHost));
        }

        let (src, route) = match netns.router.route_src(&packet, "", "") {
            Ok(found) => found,
            Err(e) => {
                graph
                    .node_mut(self.node)
                    .add_suspicion(SuspicionLevel::Fatal, format!("{e}: {dst}"));
                return Err(Error::cannot_build(self.node, e));
            }
        };
        let mut net = NetstackAssertion::new(graph.node_mut(self.node), netns);
        net.assert_route_neigh(route, packet.dst);
        packet.src = src;

        let peer_index = netns.interface(&self.iface).map_or(0, |i| i.peer_index);
        let link = Link::new(LinkType::Veth, self.node, packet).with_source_attribute(
            LinkAttribute::Veth {
                interface: self.iface.clone(),
                ip: Some(src),
                peer_index,
            },
        );
        let link = graph.add_link(link);
        graph.node_mut(self.node).do_action(Action::send(vec![link]));
        debug!(next = %self.info.meta.node_name, "pod send");

        Ok(vec![Transmission {
            next_hop: Hop::new(NetNodeType::Node, &self.info.meta.node_name),
            link,
        }])
    }

    #[tracing::instrument(skip(self, graph), fields(pod = %self.info.meta.key()))]
    fn receive(&mut self, graph: &mut Graph, upstream: LinkId) -> Result<Vec<Transmission>> {
        let link = graph.link(upstream);
        if link.kind != LinkType::Veth {
            return Err(Error::Other(format!(
                "unexpect upstream type to receive, expect veth, but: {}",
                link.kind
            )));
        }
        let packet = link.packet.clone();
        graph.accept_link(
            upstream,
            self.node,
            LinkAttribute::simple(&self.iface, None),
        );
        self.assert(graph)?;

        let mut net = NetstackAssertion::new(graph.node_mut(self.node), &self.info.netns);
        net.assert_route(&RouteAssertion::dev(&self.iface), &packet.reply(), "", "")?;
        net.assert_listen(packet.dst, packet.dport, packet.protocol);
        graph.node_mut(self.node).do_action(Action::serve(upstream));
        Ok(Vec::new())
    }
}
