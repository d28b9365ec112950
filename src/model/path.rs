//! 诊断结果路径
//!
//! 从源节点的发起动作出发做 BFS，给每条链路标上层级；同一条链路只访问一次。

use std::collections::{HashSet, VecDeque};
use std::fmt::Write as _;

use tracing::trace;

use super::action::ActionType;
use super::graph::Graph;
use super::id::{LinkId, NodeId};
use super::link::Link;
use super::suspicion::Suspicion;

#[derive(Debug)]
pub struct PacketPath {
    graph: Graph,
    origin: NodeId,
    order: Vec<LinkId>,
}

impl PacketPath {
    pub fn new(mut graph: Graph, origin: NodeId) -> Self {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<(LinkId, usize)> = VecDeque::new();

        if let Some(action) = graph.node(origin).action_of(None) {
            for out in &action.outputs {
                queue.push_back((*out, 0));
            }
        }

        while let Some((lid, level)) = queue.pop_front() {
            if !seen.insert(lid) {
                continue;
            }
            graph.set_level(lid, level);
            order.push(lid);
            let Some(dst) = graph.link(lid).destination else {
                continue;
            };
            if let Some(action) = graph.node(dst).action_of(Some(lid)) {
                for out in &action.outputs {
                    queue.push_back((*out, level + 1));
                }
            }
        }
        trace!(links = order.len(), "packet path built");

        Self {
            graph,
            origin,
            order,
        }
    }

    pub fn origin(&self) -> NodeId {
        self.origin
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// BFS 顺序的链路，可重复遍历
    pub fn links(&self) -> impl Iterator<Item = (LinkId, &Link)> + '_ {
        self.order.iter().map(|id| (*id, self.graph.link(*id)))
    }

    /// 路径上出现的节点（按首次访问顺序），空路径时只有源节点
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for (_, link) in self.links() {
            for n in [Some(link.source), link.destination].into_iter().flatten() {
                if seen.insert(n) {
                    out.push(n);
                }
            }
        }
        if out.is_empty() {
            out.push(self.origin);
        }
        out
    }

    /// 路径上所有节点的 suspicion
    pub fn suspicions(&self) -> Vec<Suspicion> {
        self.nodes()
            .into_iter()
            .flat_map(|n| self.graph.node(n).suspicions().iter().cloned())
            .collect()
    }

    pub fn link_label(&self, id: LinkId) -> String {
        let link = self.graph.link(id);
        let mut label = format!("type={},level={}", link.kind, link.level);
        let action = link
            .destination
            .and_then(|dst| self.graph.node(dst).action_of(Some(id)));
        if let Some(action) = action {
            let _ = write!(label, ",trans={}", action.kind.as_str());
        }
        if let Some(oif) = link.source_attribute.interface() {
            let _ = write!(label, ",oif={oif}");
        }
        if let Some(iif) = link.destination_attribute.interface() {
            let _ = write!(label, ",iif={iif}");
        }
        let _ = write!(
            label,
            ",src={},dst={},dport={}",
            link.packet.src, link.packet.dst, link.packet.dport
        );
        label
    }

    /// Graphviz 格式，终点动作为 serve 的边用圆点箭头
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph {\n");
        for (id, link) in self.links() {
            let Some(dst) = link.destination else {
                continue;
            };
            let src = self.graph.node(link.source);
            let dnode = self.graph.node(dst);
            let serve = dnode
                .action_of(Some(id))
                .is_some_and(|a| a.kind == ActionType::Serve);
            let _ = write!(
                out,
                "  \"{}\" -> \"{}\" [label=\"{}\"",
                src.id,
                dnode.id,
                self.link_label(id)
            );
            if serve {
                out.push_str(", arrowhead=\"dot\"");
            }
            out.push_str("]\n");
        }
        out.push_str("}\n");
        out
    }
}
