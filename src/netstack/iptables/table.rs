//! 表、链、规则以及链遍历
//!
//! 遍历用显式栈保存 `(chain, pos)` 帧：CALL 压入返回帧再压入目标链，GOTO 只压入目标链，
//! RETURN 或走完用户链即弹栈，栈空后使用起始链的默认策略。

use std::collections::BTreeMap;
use std::fmt;

use tracing::trace;

use super::Trace;
use super::matcher::Match;
use super::target::{Target, XtVerdict};
use crate::error::{Error, Result};
use crate::model::Packet;
use crate::netstack::netfilter::{Hook, NetfilterContext, Verdict};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub matches: Vec<Match>,
    pub target: Target,
}

impl Rule {
    pub fn new(matches: Vec<Match>, target: Target) -> Self {
        Self { matches, target }
    }

    /// 所有匹配项都满足才算命中
    pub fn matches(
        &self,
        packet: &Packet,
        iif: &str,
        oif: &str,
        ctx: &NetfilterContext<'_>,
    ) -> Result<bool> {
        for m in &self.matches {
            if !m.matches(packet, iif, oif, ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.matches.iter().map(ToString::to_string).collect();
        let target = self.target.to_string();
        if !target.is_empty() {
            parts.push(target);
        }
        f.write_str(&parts.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    /// 只对内置链有意义
    pub policy: Verdict,
    pub rules: Vec<Rule>,
}

impl Chain {
    pub fn new(name: impl Into<String>, policy: Verdict) -> Self {
        Self {
            name: name.into(),
            policy,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub chains: BTreeMap<String, Chain>,
}

struct Frame<'a> {
    chain: &'a Chain,
    pos: usize,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chains: BTreeMap::new(),
        }
    }

    /// 只有内置空链、默认 ACCEPT 的表
    pub fn with_builtin_chains(name: impl Into<String>, chains: &[&str]) -> Self {
        let mut table = Self::new(name);
        for chain in chains {
            table.add_chain(Chain::new(*chain, Verdict::Accept));
        }
        table
    }

    pub fn add_chain(&mut self, chain: Chain) {
        self.chains.insert(chain.name.clone(), chain);
    }

    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.get(name)
    }

    fn entry(&self, chain: &Chain, rule: &Rule) -> String {
        format!("{} {} {}", self.name, chain.name, rule)
    }

    fn jump_target<'a>(&'a self, name: &str, rule: &Rule) -> Result<&'a Chain> {
        self.chains.get(name).ok_or_else(|| Error::IptablesRule {
            rule: rule.to_string(),
            message: format!("chain {name} not found in table {}", self.name),
        })
    }

    /// 非 ACCEPT 结束时，把当前帧和栈上各帧的下一条规则也写进 trace
    fn trace_pending(&self, trace: &mut Trace, frame: &Frame<'_>, stack: &[Frame<'_>]) {
        for f in std::iter::once(frame).chain(stack.iter().rev()) {
            if let Some(rule) = f.chain.rules.get(f.pos) {
                trace.push(self.entry(f.chain, rule));
            }
        }
    }

    /// 按 hook 对应的内置链遍历本表。内置链不存在时视为 ACCEPT
    pub fn trace_packet(
        &self,
        hook: Hook,
        packet: &mut Packet,
        iif: &str,
        oif: &str,
        ctx: &NetfilterContext<'_>,
    ) -> Result<(Verdict, Trace)> {
        let mut trace = Trace::default();
        let Some(start) = self.chain(hook.name()) else {
            return Ok((Verdict::Accept, trace));
        };

        let mut stack = vec![Frame {
            chain: start,
            pos: 0,
        }];

        'frames: while let Some(mut frame) = stack.pop() {
            let chain = frame.chain;
            while let Some(rule) = chain.rules.get(frame.pos) {
                frame.pos += 1;

                let hit = rule
                    .matches(packet, iif, oif, ctx)
                    .map_err(|e| rule_error(rule, e))?;
                if !hit {
                    continue;
                }
                trace.push(self.entry(chain, rule));

                let xt = match &rule.target {
                    Target::Accept => return Ok((Verdict::Accept, trace)),
                    Target::Drop | Target::Reject => {
                        self.trace_pending(&mut trace, &frame, &stack);
                        return Ok((Verdict::Drop, trace));
                    }
                    Target::Nop => continue,
                    Target::Return => continue 'frames,
                    Target::Call(name) => {
                        let next = self.jump_target(name, rule)?;
                        stack.push(frame);
                        stack.push(Frame {
                            chain: next,
                            pos: 0,
                        });
                        continue 'frames;
                    }
                    Target::Goto(name) => {
                        let next = self.jump_target(name, rule)?;
                        stack.push(Frame {
                            chain: next,
                            pos: 0,
                        });
                        continue 'frames;
                    }
                    ext => ext
                        .apply(packet, iif, oif, ctx)
                        .map_err(|e| rule_error(rule, e))?,
                };

                match xt {
                    XtVerdict::Accept => return Ok((Verdict::Accept, trace)),
                    XtVerdict::Drop | XtVerdict::Reject => {
                        self.trace_pending(&mut trace, &frame, &stack);
                        return Ok((Verdict::Drop, trace));
                    }
                    XtVerdict::Continue => continue,
                    XtVerdict::Return => continue 'frames,
                }
            }
        }

        trace!(table = %self.name, hook = %hook, policy = ?start.policy, "fall through to policy");
        Ok((start.policy, trace))
    }
}

/// unsupported 原样上抛，其他错误带上规则文本
fn rule_error(rule: &Rule, err: Error) -> Error {
    match err {
        Error::IptablesUnsupported(_) | Error::Invariant(_) => err,
        other => Error::IptablesRule {
            rule: rule.to_string(),
            message: other.to_string(),
        },
    }
}
