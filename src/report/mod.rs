//! 诊断报告
//!
//! 把 `Diagnosis` 整理成可序列化的节点/链路列表，供 JSON 输出和终端展示。

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::diagnose::Diagnosis;
use crate::model::{ActionType, LinkType, NetNodeType, Protocol, Suspicion, SuspicionLevel};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NetNodeType,
    pub max_level: Option<SuspicionLevel>,
    pub suspicions: Vec<Suspicion>,
    /// 入向链路 id -> 动作；自身发起的动作 key 为空串
    pub actions: BTreeMap<String, ActionType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPacket {
    pub source: String,
    pub destination: String,
    pub dport: u16,
    pub protocol: Protocol,
    pub encapsulated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportLink {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: LinkType,
    pub level: usize,
    pub source: String,
    pub destination: Option<String>,
    pub source_attributes: BTreeMap<String, String>,
    pub destination_attributes: BTreeMap<String, String>,
    pub action: Option<ActionType>,
    pub packet: ReportPacket,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    /// 全局结论（网络策略等）
    pub cluster: Vec<Suspicion>,
    pub nodes: Vec<ReportNode>,
    pub links: Vec<ReportLink>,
    pub interrupted: Option<String>,
}

fn attrs(map: BTreeMap<&'static str, String>) -> BTreeMap<String, String> {
    map.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

impl Report {
    pub fn new(diagnosis: &Diagnosis) -> Self {
        let path = &diagnosis.path;
        let graph = path.graph();
        let link_id = |id| {
            let link = graph.link(id);
            let dst = link
                .destination
                .map(|d| graph.node(d).id.clone())
                .unwrap_or_default();
            format!("{},{},{}", link.kind, graph.node(link.source).id, dst)
        };

        let links: Vec<ReportLink> = path
            .links()
            .map(|(id, link)| ReportLink {
                id: link_id(id),
                kind: link.kind,
                level: link.level,
                source: graph.node(link.source).id.clone(),
                destination: link.destination.map(|d| graph.node(d).id.clone()),
                source_attributes: attrs(link.source_attribute.attrs()),
                destination_attributes: attrs(link.destination_attribute.attrs()),
                action: link
                    .destination
                    .and_then(|d| graph.node(d).action_of(Some(id)))
                    .map(|a| a.kind),
                packet: ReportPacket {
                    source: link.packet.src.to_string(),
                    destination: link.packet.dst.to_string(),
                    dport: link.packet.dport,
                    protocol: link.packet.protocol,
                    encapsulated: link.packet.is_encapsulated(),
                },
                label: path.link_label(id),
            })
            .collect();

        let nodes = path
            .nodes()
            .into_iter()
            .map(|n| {
                let node = graph.node(n);
                let mut actions = BTreeMap::new();
                if let Some(a) = node.action_of(None) {
                    actions.insert(String::new(), a.kind);
                }
                for (id, _) in path.links() {
                    if let Some(a) = node.action_of(Some(id)) {
                        actions.insert(link_id(id), a.kind);
                    }
                }
                ReportNode {
                    id: node.id.clone(),
                    kind: node.kind,
                    max_level: node.max_suspicion_level(),
                    suspicions: node.suspicions().to_vec(),
                    actions,
                }
            })
            .collect();

        Self {
            cluster: diagnosis.suspicions.clone(),
            nodes,
            links,
            interrupted: diagnosis.interrupted.as_ref().map(|e| e.to_string()),
        }
    }

    /// 路径上出现的最高级别
    pub fn max_level(&self) -> Option<SuspicionLevel> {
        self.cluster
            .iter()
            .map(|s| s.level)
            .chain(self.nodes.iter().filter_map(|n| n.max_level))
            .max()
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        if !self.cluster.is_empty() {
            out.push_str("cluster:\n");
            for s in &self.cluster {
                let _ = writeln!(out, "  {s}");
            }
        }
        out.push_str("nodes:\n");
        for node in &self.nodes {
            let _ = writeln!(out, "  [{}] {}", node.kind, node.id);
            for s in &node.suspicions {
                let _ = writeln!(out, "    {s}");
            }
        }
        out.push_str("links:\n");
        for link in &self.links {
            let _ = writeln!(
                out,
                "  {} -> {} [{}]",
                link.source,
                link.destination.as_deref().unwrap_or("?"),
                link.label
            );
        }
        if let Some(reason) = &self.interrupted {
            let _ = writeln!(out, "interrupted: {reason}");
        }
        out
    }
}
