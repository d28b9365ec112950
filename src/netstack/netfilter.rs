//! netfilter hook 流水线
//!
//! 每个 hook 按内核顺序依次跑若干张表，遇到 DROP 即停止并带回 trace。

use std::fmt;

use tracing::trace;

use super::iptables::IpTables;
use super::ipset::IpSetManager;
use super::ipvs::Ipvs;
use super::route::Router;
use crate::error::{Error, Result};
use crate::model::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    PreRouting,
    Input,
    Forward,
    Output,
    PostRouting,
}

impl Hook {
    pub const ALL: [Hook; 5] = [
        Hook::PreRouting,
        Hook::Input,
        Hook::Forward,
        Hook::Output,
        Hook::PostRouting,
    ];

    /// 内置链名
    pub fn name(&self) -> &'static str {
        match self {
            Hook::PreRouting => "PREROUTING",
            Hook::Input => "INPUT",
            Hook::Forward => "FORWARD",
            Hook::Output => "OUTPUT",
            Hook::PostRouting => "POSTROUTING",
        }
    }

    /// 该 hook 上依次执行的表
    pub fn tables(&self) -> &'static [&'static str] {
        match self {
            Hook::PreRouting => &["raw", "mangle", "nat"],
            Hook::Input => &["mangle", "nat", "filter"],
            Hook::Forward => &["mangle", "filter"],
            Hook::Output => &["raw", "mangle", "nat", "filter"],
            Hook::PostRouting => &["mangle", "nat"],
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accept,
    Drop,
}

/// 匹配模块可以查询的数据
#[derive(Debug, Clone, Copy)]
pub struct NetfilterContext<'a> {
    pub ipset: &'a IpSetManager,
    pub router: &'a Router,
    pub ipvs: &'a Ipvs,
}

#[derive(Debug, Clone, Copy)]
pub struct Netfilter<'a> {
    iptables: &'a IpTables,
    ctx: NetfilterContext<'a>,
}

impl<'a> Netfilter<'a> {
    pub fn new(iptables: &'a IpTables, ctx: NetfilterContext<'a>) -> Self {
        Self { iptables, ctx }
    }

    /// 包经过一个 hook。返回放行后的包（可能被 NAT/MARK 改写）
    ///
    /// 被丢弃时返回 `Error::IptablesDrop`；规则集是解析失败的替代品时返回
    /// `Error::IptablesUnavailable`。
    #[tracing::instrument(skip(self, packet), fields(packet = %packet))]
    pub fn hook(&self, hook: Hook, packet: &Packet, iif: &str, oif: &str) -> Result<Packet> {
        if self.iptables.is_fallback() {
            return Err(Error::IptablesUnavailable);
        }
        let mut out = packet.deep_copy();
        for table in hook.tables() {
            let (verdict, t) = self
                .iptables
                .trace_packet(hook, table, &mut out, iif, oif, &self.ctx)?;
            trace!(table, verdict = ?verdict, out = %out, "table evaluated");
            if verdict == Verdict::Drop {
                return Err(Error::IptablesDrop(t));
            }
        }
        Ok(out)
    }
}
