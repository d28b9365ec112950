//! 链路
//!
//! 两个节点之间承载一个数据包的有向边。目的节点在对端 `Receive` 时才确定。

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::id::NodeId;
use super::packet::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    External,
    Infra,
    Veth,
    #[serde(rename = "ipvlan")]
    IpVlan,
    Local,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::External => "external",
            LinkType::Infra => "infra",
            LinkType::Veth => "veth",
            LinkType::IpVlan => "ipvlan",
            LinkType::Local => "local",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 链路一端的接口属性
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkAttribute {
    #[default]
    Null,
    Simple {
        interface: String,
        ip: Option<IpAddr>,
    },
    Veth {
        interface: String,
        ip: Option<IpAddr>,
        peer_index: u32,
    },
}

impl LinkAttribute {
    pub fn simple(interface: impl Into<String>, ip: Option<IpAddr>) -> Self {
        LinkAttribute::Simple {
            interface: interface.into(),
            ip,
        }
    }

    pub fn interface(&self) -> Option<&str> {
        match self {
            LinkAttribute::Null => None,
            LinkAttribute::Simple { interface, .. } | LinkAttribute::Veth { interface, .. } => {
                Some(interface)
            }
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            LinkAttribute::Null => None,
            LinkAttribute::Simple { ip, .. } | LinkAttribute::Veth { ip, .. } => *ip,
        }
    }

    pub fn peer_index(&self) -> Option<u32> {
        match self {
            LinkAttribute::Veth { peer_index, .. } => Some(*peer_index),
            _ => None,
        }
    }

    /// 输出到报告里的属性表
    pub fn attrs(&self) -> BTreeMap<&'static str, String> {
        let mut out = BTreeMap::new();
        match self {
            LinkAttribute::Null => {}
            LinkAttribute::Simple { interface, .. } => {
                out.insert("if", interface.clone());
            }
            LinkAttribute::Veth {
                interface,
                peer_index,
                ..
            } => {
                out.insert("if", interface.clone());
                out.insert("peer_id", peer_index.to_string());
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Link {
    pub kind: LinkType,
    pub source: NodeId,
    pub destination: Option<NodeId>,
    pub packet: Packet,
    pub source_attribute: LinkAttribute,
    pub destination_attribute: LinkAttribute,
    /// BFS 层级，由 `PacketPath` 在构造时填写
    pub level: usize,
}

impl Link {
    pub fn new(kind: LinkType, source: NodeId, packet: Packet) -> Self {
        Self {
            kind,
            source,
            destination: None,
            packet,
            source_attribute: LinkAttribute::Null,
            destination_attribute: LinkAttribute::Null,
            level: 0,
        }
    }

    pub fn with_source_attribute(mut self, attr: LinkAttribute) -> Self {
        self.source_attribute = attr;
        self
    }
}
