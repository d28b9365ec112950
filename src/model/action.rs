//! 节点动作
//!
//! 记录节点对某个入向链路（或自身发起）做了什么，用于事后重建路径。

use serde::{Deserialize, Serialize};

use super::id::LinkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Service,
    Serve,
    Forward,
    Send,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Service => "service",
            ActionType::Serve => "serve",
            ActionType::Forward => "forward",
            ActionType::Send => "send",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionType,
    /// 入向链路；`None` 表示节点自己发起
    pub input: Option<LinkId>,
    pub outputs: Vec<LinkId>,
}

impl Action {
    pub fn forward(input: LinkId, outputs: Vec<LinkId>) -> Self {
        Self {
            kind: ActionType::Forward,
            input: Some(input),
            outputs,
        }
    }

    pub fn send(outputs: Vec<LinkId>) -> Self {
        Self {
            kind: ActionType::Send,
            input: None,
            outputs,
        }
    }

    pub fn serve(input: LinkId) -> Self {
        Self {
            kind: ActionType::Serve,
            input: Some(input),
            outputs: Vec::new(),
        }
    }

    /// 服务负载均衡：可能是自身发起（访问 service），也可能是转发途中
    pub fn service(input: Option<LinkId>, outputs: Vec<LinkId>) -> Self {
        Self {
            kind: ActionType::Service,
            input,
            outputs,
        }
    }
}
