//! 网络节点
//!
//! 节点只保存诊断中产生的数据：动作和 suspicion。如何转发由 `NetNodeAction` 实现决定。

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::action::Action;
use super::id::LinkId;
use super::suspicion::{Suspicion, SuspicionLevel};
use crate::assertions::Assertion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetNodeType {
    Pod,
    Node,
    External,
    Generic,
}

impl NetNodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetNodeType::Pod => "pod",
            NetNodeType::Node => "node",
            NetNodeType::External => "external",
            NetNodeType::Generic => "generic",
        }
    }
}

impl fmt::Display for NetNodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct NetNode {
    pub kind: NetNodeType,
    pub id: String,
    /// 入向链路 -> 动作
    actions: HashMap<LinkId, Action>,
    /// 自身发起的动作
    initiative: Option<Action>,
    suspicions: Vec<Suspicion>,
}

impl NetNode {
    pub fn new(kind: NetNodeType, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            actions: HashMap::new(),
            initiative: None,
            suspicions: Vec::new(),
        }
    }

    /// 记录一个动作。无入向链路的动作记为发起动作
    pub fn do_action(&mut self, action: Action) {
        match action.input {
            Some(input) => {
                self.actions.insert(input, action);
            }
            None => self.initiative = Some(action),
        }
    }

    pub fn action_of(&self, input: Option<LinkId>) -> Option<&Action> {
        match input {
            Some(input) => self.actions.get(&input),
            None => self.initiative.as_ref(),
        }
    }

    pub fn suspicions(&self) -> &[Suspicion] {
        &self.suspicions
    }

    pub fn max_suspicion_level(&self) -> Option<SuspicionLevel> {
        self.suspicions.iter().map(|s| s.level).max()
    }
}

impl Assertion for NetNode {
    fn add_suspicion(&mut self, level: SuspicionLevel, message: String) {
        self.suspicions.push(Suspicion { level, message });
    }
}
