//! 错误类型
//!
//! 诊断过程中所有可传播的错误。断言失败不走这里，而是作为 suspicion 挂在节点上。

use std::net::IpAddr;

use thiserror::Error;

use crate::model::NodeId;
use crate::netstack::Trace;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no route to host")]
    NoRouteToHost,

    #[error("cannot find valid ip for dst {0} route")]
    NoSourceAddress(IpAddr),

    #[error("unsupported {0}")]
    IptablesUnsupported(String),

    #[error("cannot process iptables")]
    IptablesUnavailable,

    #[error("rule: {rule:?}, message: {message:?}")]
    IptablesRule { rule: String, message: String },

    #[error("packet dropped by iptables:\n{0}")]
    IptablesDrop(Trace),

    #[error("error parse iptables: {0}")]
    IptablesParse(String),

    #[error("error parse ipset: {0}")]
    IpsetParse(String),

    #[error("error parse ipvs rule {line:?}: {message}")]
    IpvsParse { line: String, message: String },

    #[error("cannot build transmission from {node:?}: {source}")]
    CannotBuildTransmission {
        node: NodeId,
        #[source]
        source: Box<Error>,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("{0}")]
    Other(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// 包装为 `CannotBuildTransmission`，用于无法为源节点构造出向链路的情况。
    pub fn cannot_build(node: NodeId, source: Error) -> Self {
        Error::CannotBuildTransmission {
            node,
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
