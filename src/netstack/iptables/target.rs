//! 规则目标
//!
//! 内置目标由求值器直接处理；扩展目标（NAT、MARK 等）先作用在包上，再给出 `XtVerdict`。

use std::fmt;
use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::model::Packet;
use crate::netstack::netfilter::NetfilterContext;

/// 扩展目标的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XtVerdict {
    Accept,
    Drop,
    Reject,
    Continue,
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOp {
    /// `--set-xmark value/mask`：`mark = (mark & !mask) ^ value`
    SetXmark { value: u32, mask: u32 },
    /// `--set-mark value/mask`：`mark = (mark & !mask) | value`
    SetMark { value: u32, mask: u32 },
    And(u32),
    Or(u32),
    Xor(u32),
}

impl MarkOp {
    pub fn apply(&self, mark: u32) -> u32 {
        match *self {
            MarkOp::SetXmark { value, mask } => (mark & !mask) ^ value,
            MarkOp::SetMark { value, mask } => (mark & !mask) | value,
            MarkOp::And(v) => mark & v,
            MarkOp::Or(v) => mark | v,
            MarkOp::Xor(v) => mark ^ v,
        }
    }
}

impl fmt::Display for MarkOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkOp::SetXmark { value, mask } => write!(f, "--set-xmark {value:#x}/{mask:#x}"),
            MarkOp::SetMark { value, mask } => write!(f, "--set-mark {value:#x}/{mask:#x}"),
            MarkOp::And(v) => write!(f, "--and-mark {v:#x}"),
            MarkOp::Or(v) => write!(f, "--or-mark {v:#x}"),
            MarkOp::Xor(v) => write!(f, "--xor-mark {v:#x}"),
        }
    }
}

/// NAT 目标地址（范围只取第一个地址/端口）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatAddr {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

impl fmt::Display for NatAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.ip, port),
            None => write!(f, "{}", self.ip),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Accept,
    Drop,
    Reject,
    Return,
    /// 没有动作的规则，只计数
    Nop,
    Call(String),
    Goto(String),
    Masquerade,
    Snat(NatAddr),
    Dnat(NatAddr),
    Mark(MarkOp),
    NoTrack,
    TProxy,
    Unsupported(String),
}

impl Target {
    /// 扩展目标作用到包上；内置目标不走这里
    pub fn apply(
        &self,
        packet: &mut Packet,
        iif: &str,
        oif: &str,
        ctx: &NetfilterContext<'_>,
    ) -> Result<XtVerdict> {
        match self {
            Target::Mark(op) => {
                packet.mark = op.apply(packet.mark);
                Ok(XtVerdict::Continue)
            }
            Target::NoTrack => Ok(XtVerdict::Continue),
            Target::TProxy => Ok(XtVerdict::Accept),
            Target::Dnat(to) => {
                packet.dst = to.ip;
                if let Some(port) = to.port {
                    packet.dport = port;
                }
                Ok(XtVerdict::Accept)
            }
            Target::Snat(to) => {
                packet.src = to.ip;
                if let Some(port) = to.port {
                    packet.sport = port;
                }
                Ok(XtVerdict::Accept)
            }
            Target::Masquerade => {
                let src = match (!oif.is_empty())
                    .then(|| ctx.router.interface_addr(oif))
                    .flatten()
                {
                    Some(ip) => ip,
                    None => ctx.router.route_src(packet, iif, oif)?.0,
                };
                packet.src = src;
                Ok(XtVerdict::Accept)
            }
            Target::Unsupported(name) => {
                Err(Error::IptablesUnsupported(format!("target {name}")))
            }
            builtin => Err(Error::Invariant(format!(
                "builtin target {builtin} is not an extension"
            ))),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Accept => f.write_str("-j ACCEPT"),
            Target::Drop => f.write_str("-j DROP"),
            Target::Reject => f.write_str("-j REJECT"),
            Target::Return => f.write_str("-j RETURN"),
            Target::Nop => Ok(()),
            Target::Call(chain) => write!(f, "-j {chain}"),
            Target::Goto(chain) => write!(f, "-g {chain}"),
            Target::Masquerade => f.write_str("-j MASQUERADE"),
            Target::Snat(to) => write!(f, "-j SNAT --to-source {to}"),
            Target::Dnat(to) => write!(f, "-j DNAT --to-destination {to}"),
            Target::Mark(op) => write!(f, "-j MARK {op}"),
            Target::NoTrack => f.write_str("-j NOTRACK"),
            Target::TProxy => f.write_str("-j TPROXY"),
            Target::Unsupported(name) => write!(f, "-j {name}"),
        }
    }
}
