//! 单次诊断的节点/链路 arena
//!
//! 节点按 (类型, ID) 去重，链路一旦加入就只允许补全目的端。

use std::collections::HashMap;

use super::id::{LinkId, NodeId};
use super::link::{Link, LinkAttribute};
use super::node::{NetNode, NetNodeType};
use super::suspicion::Suspicion;

#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<NetNode>,
    links: Vec<Link>,
    index: HashMap<(NetNodeType, String), NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得 (kind, id) 对应的节点，不存在则创建
    pub fn node_for(&mut self, kind: NetNodeType, id: &str) -> NodeId {
        if let Some(existing) = self.index.get(&(kind, id.to_string())) {
            return *existing;
        }
        let nid = NodeId(self.nodes.len());
        self.nodes.push(NetNode::new(kind, id));
        self.index.insert((kind, id.to_string()), nid);
        nid
    }

    pub fn find(&self, kind: NetNodeType, id: &str) -> Option<NodeId> {
        self.index.get(&(kind, id.to_string())).copied()
    }

    pub fn node(&self, id: NodeId) -> &NetNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut NetNode {
        &mut self.nodes[id.0]
    }

    pub fn add_link(&mut self, link: Link) -> LinkId {
        let lid = LinkId(self.links.len());
        self.links.push(link);
        lid
    }

    pub fn link(&self, id: LinkId) -> &Link {
        &self.links[id.0]
    }

    /// 对端接收链路：写入目的节点和目的端属性
    pub fn accept_link(&mut self, link: LinkId, node: NodeId, attr: LinkAttribute) {
        let l = &mut self.links[link.0];
        l.destination = Some(node);
        l.destination_attribute = attr;
    }

    pub(crate) fn set_level(&mut self, link: LinkId, level: usize) {
        self.links[link.0].level = level;
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// 所有节点上的 suspicion，按节点创建顺序
    pub fn suspicions(&self) -> Vec<Suspicion> {
        self.nodes
            .iter()
            .flat_map(|n| n.suspicions().iter().cloned())
            .collect()
    }
}
