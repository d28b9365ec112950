//! iptables 规则引擎
//!
//! 从 iptables-xml 输出构建 表 → 链 → 规则 模型，并按 hook 模拟一次遍历。
//! 解析失败不会中断诊断：退回到一套全 ACCEPT 的空表，并标记为无法模拟。

mod matcher;
mod parse;
mod table;
mod target;

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, error};

pub use matcher::{AddrType, Match, Matcher, MultiPortField, PortField, RpFilter};
pub use table::{Chain, Rule, Table};
pub use target::{MarkOp, NatAddr, Target, XtVerdict};

use crate::error::{Error, Result};
use crate::model::Packet;
use crate::netstack::netfilter::{Hook, NetfilterContext, Verdict};

/// 命中规则的记录，每项为 `table chain rule`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace(Vec<String>);

impl Trace {
    pub fn push(&mut self, entry: String) {
        self.0.push(entry);
    }

    pub fn entries(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn extend(&mut self, other: Trace) {
        self.0.extend(other.0);
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "    {entry}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpTables {
    tables: BTreeMap<String, Table>,
    /// 解析失败后的替代品，hook 流水线不对其求值
    fallback: bool,
}

fn builtin_tables() -> BTreeMap<String, Table> {
    [
        Table::with_builtin_chains("raw", &["PREROUTING", "OUTPUT"]),
        Table::with_builtin_chains(
            "mangle",
            &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
        ),
        Table::with_builtin_chains("nat", &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"]),
        Table::with_builtin_chains("filter", &["INPUT", "FORWARD", "OUTPUT"]),
    ]
    .into_iter()
    .map(|t| (t.name.clone(), t))
    .collect()
}

impl IpTables {
    pub fn new(tables: impl IntoIterator<Item = Table>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
            fallback: false,
        }
    }

    /// 没有任何规则的规则集（可正常模拟）
    pub fn accept_all() -> Self {
        Self {
            tables: builtin_tables(),
            fallback: false,
        }
    }

    /// 解析失败时的替代规则集
    pub fn fallback() -> Self {
        Self {
            tables: builtin_tables(),
            fallback: true,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// 严格解析，空 dump 得到无规则的规则集
    pub fn try_parse(dump: &str) -> Result<Self> {
        if dump.trim().is_empty() {
            return Ok(Self::accept_all());
        }
        Ok(Self {
            tables: parse::parse_tables(dump)?,
            fallback: false,
        })
    }

    /// 解析，失败时记录日志并退回 `fallback()`
    pub fn parse(dump: &str) -> Self {
        match Self::try_parse(dump) {
            Ok(ipt) => {
                debug!(tables = ipt.tables.len(), "iptables parsed");
                ipt
            }
            Err(e) => {
                error!(error = %e, "error parse iptables, fall back to empty tables");
                Self::fallback()
            }
        }
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// 在单张表上按 hook 模拟。表不存在视为 ACCEPT
    pub fn trace_packet(
        &self,
        hook: Hook,
        table: &str,
        packet: &mut Packet,
        iif: &str,
        oif: &str,
        ctx: &NetfilterContext<'_>,
    ) -> Result<(Verdict, Trace)> {
        if self.fallback {
            return Ok((Verdict::Accept, Trace::default()));
        }
        match self.tables.get(table) {
            Some(t) => t.trace_packet(hook, packet, iif, oif, ctx),
            None => Ok((Verdict::Accept, Trace::default())),
        }
    }

    /// 所有链都没有规则
    pub fn check_empty(&self) -> Result<()> {
        for table in self.tables.values() {
            for chain in table.chains.values() {
                if !chain.rules.is_empty() {
                    return Err(Error::Other(format!(
                        "table {} chain {} is not empty",
                        table.name, chain.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// 所有链的默认策略都是 ACCEPT
    pub fn check_default_accept(&self) -> Result<()> {
        for table in self.tables.values() {
            for chain in table.chains.values() {
                if chain.policy != Verdict::Accept {
                    return Err(Error::Other(format!(
                        "table {} chain {} default policy is not ACCEPT",
                        table.name, chain.name
                    )));
                }
            }
        }
        Ok(())
    }
}
