//! `Send`/`Receive` 的返回单元：告诉遍历引擎下一跳是谁、带着哪条链路过去。

use std::fmt;

use super::id::LinkId;
use super::node::NetNodeType;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hop {
    pub kind: NetNodeType,
    pub id: String,
}

impl Hop {
    pub fn new(kind: NetNodeType, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub next_hop: Hop,
    pub link: LinkId,
}
