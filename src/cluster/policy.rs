//! 命名空间与 NetworkPolicy 对象
//!
//! 标签选择器的语义与 Kubernetes 一致：`match_labels` 与 `match_expressions` 全部满足才算命中，
//! 两者都为空的选择器匹配任意对象。

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::Protocol;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceMeta {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> Result<bool> {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In | SelectorOperator::NotIn if self.values.is_empty() => {
                Err(Error::Other(format!(
                    "label selector {}: values set can't be empty for In/NotIn",
                    self.key
                )))
            }
            SelectorOperator::Exists | SelectorOperator::DoesNotExist
                if !self.values.is_empty() =>
            {
                Err(Error::Other(format!(
                    "label selector {}: values may not be specified for Exists/DoesNotExist",
                    self.key
                )))
            }
            SelectorOperator::In => Ok(value.is_some_and(|v| self.values.contains(v))),
            SelectorOperator::NotIn => Ok(!value.is_some_and(|v| self.values.contains(v))),
            SelectorOperator::Exists => Ok(value.is_some()),
            SelectorOperator::DoesNotExist => Ok(value.is_none()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// 非法的表达式返回 `Err`，不视为不匹配
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> Result<bool> {
        let mut matched = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));
        for req in &self.match_expressions {
            matched &= req.matches(labels)?;
        }
        Ok(matched)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyType {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicyPort {
    /// 缺省为 TCP
    pub protocol: Option<Protocol>,
    /// 缺省为该协议的全部端口
    pub port: Option<u16>,
    pub end_port: Option<u16>,
}

impl NetworkPolicyPort {
    pub fn contains(&self, port: u16, protocol: Protocol) -> bool {
        let expect = self.protocol.unwrap_or(Protocol::Tcp);
        // 非 TCP/UDP 的包按 TCP 规则匹配
        let actual = match protocol {
            Protocol::Udp => Protocol::Udp,
            _ => Protocol::Tcp,
        };
        if expect != actual {
            return false;
        }
        match self.port {
            None => true,
            Some(0) => false,
            Some(from) => {
                let to = self.end_port.unwrap_or(from);
                (from..=to).contains(&port)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpBlock {
    pub cidr: IpNet,
    #[serde(default)]
    pub except: Vec<IpNet>,
}

impl IpBlock {
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.cidr.contains(&ip) && !self.except.iter().any(|e| e.contains(&ip))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicyPeer {
    pub pod_selector: Option<LabelSelector>,
    pub namespace_selector: Option<LabelSelector>,
    pub ip_block: Option<IpBlock>,
}

/// ingress 规则的 `from` 或 egress 规则的 `to`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicyRule {
    pub ports: Vec<NetworkPolicyPort>,
    #[serde(alias = "from", alias = "to")]
    pub peers: Vec<NetworkPolicyPeer>,
}

impl NetworkPolicyRule {
    /// 没有端口限制时放行全部端口
    pub fn contains_port(&self, port: u16, protocol: Protocol) -> bool {
        self.ports.is_empty() || self.ports.iter().any(|p| p.contains(port, protocol))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicyMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub pod_selector: LabelSelector,
    #[serde(default)]
    pub policy_types: Vec<PolicyType>,
    #[serde(default)]
    pub ingress: Vec<NetworkPolicyRule>,
    #[serde(default)]
    pub egress: Vec<NetworkPolicyRule>,
}

impl NetworkPolicyMeta {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn has_policy_type(&self, kind: PolicyType) -> bool {
        self.policy_types.contains(&kind)
    }
}
