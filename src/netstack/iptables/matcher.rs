//! 匹配模块
//!
//! 每个 XML 表达式对应一个匹配项，各自可取反。`conntrack`/`statistic`/`physdev`/`socket`
//! 不建模，始终匹配。

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{Error, Result};
use crate::model::{Packet, Protocol};
use crate::netstack::netfilter::NetfilterContext;
use crate::netstack::route::{RT_TABLE_LOCAL, RouteType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortField {
    Source,
    Destination,
}

impl PortField {
    fn option(&self) -> &'static str {
        match self {
            PortField::Source => "sport",
            PortField::Destination => "dport",
        }
    }

    fn of(&self, packet: &Packet) -> u16 {
        match self {
            PortField::Source => packet.sport,
            PortField::Destination => packet.dport,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiPortField {
    Sports,
    Dports,
    Ports,
}

impl MultiPortField {
    fn option(&self) -> &'static str {
        match self {
            MultiPortField::Sports => "sports",
            MultiPortField::Dports => "dports",
            MultiPortField::Ports => "ports",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrType {
    Src(RouteType),
    Dst(RouteType),
    LimitIfaceIn(String),
    LimitIfaceOut(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpFilter {
    Loose,
    Invert,
    /// 其余选项（validmark、accept-local 等）按严格模式处理
    Strict(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// `-m tcp/udp --sport/--dport first[:last]`
    Port {
        protocol: Protocol,
        field: PortField,
        first: u16,
        last: u16,
    },
    InInterface(String),
    OutInterface(String),
    Source(IpNet),
    Destination(IpNet),
    Protocol(String),
    Set {
        name: String,
        flags: String,
    },
    Comment(String),
    MultiPort {
        field: MultiPortField,
        ranges: Vec<(u16, u16)>,
    },
    Mark {
        value: u32,
        mask: u32,
    },
    AddrType(AddrType),
    RpFilter(RpFilter),
    /// 不建模的模块，始终匹配
    PassThrough {
        module: String,
        option: String,
        value: String,
    },
    /// 无法模拟的模块或选项，匹配时报告 unsupported
    Unsupported {
        module: String,
        option: String,
        value: String,
    },
}

/// 规则中的一个匹配项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub matcher: Matcher,
    pub invert: bool,
}

impl Match {
    pub fn new(matcher: Matcher) -> Self {
        Self {
            matcher,
            invert: false,
        }
    }

    pub fn inverted(matcher: Matcher) -> Self {
        Self {
            matcher,
            invert: true,
        }
    }

    pub fn matches(
        &self,
        packet: &Packet,
        iif: &str,
        oif: &str,
        ctx: &NetfilterContext<'_>,
    ) -> Result<bool> {
        let v = self.matcher.matches(packet, iif, oif, ctx)?;
        Ok(v != self.invert)
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.invert {
            f.write_str("! ")?;
        }
        write!(f, "{}", self.matcher)
    }
}

/// iptables 接口名匹配，`+` 结尾表示前缀
fn iface_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('+') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

fn in_ranges(ranges: &[(u16, u16)], port: u16) -> bool {
    ranges.iter().any(|(first, last)| port >= *first && port <= *last)
}

fn set_field_ip(packet: &Packet, field: &str) -> IpAddr {
    match field {
        "src" => packet.src,
        "dst" => packet.dst,
        _ => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
    }
}

fn set_field_port(packet: &Packet, field: &str) -> u16 {
    match field {
        "src" => packet.sport,
        "dst" => packet.dport,
        _ => 0,
    }
}

impl Matcher {
    pub fn matches(
        &self,
        packet: &Packet,
        iif: &str,
        oif: &str,
        ctx: &NetfilterContext<'_>,
    ) -> Result<bool> {
        match self {
            Matcher::Port {
                protocol,
                field,
                first,
                last,
            } => {
                if packet.protocol != *protocol {
                    return Ok(false);
                }
                let port = field.of(packet);
                Ok(port >= *first && port <= *last)
            }
            Matcher::InInterface(name) => Ok(iface_matches(name, iif)),
            Matcher::OutInterface(name) => Ok(iface_matches(name, oif)),
            Matcher::Source(net) => Ok(net.contains(&packet.src)),
            Matcher::Destination(net) => Ok(net.contains(&packet.dst)),
            Matcher::Protocol(p) => Ok(p.eq_ignore_ascii_case("all")
                || p.eq_ignore_ascii_case(packet.protocol.as_str())),
            Matcher::Set { name, flags } => match_set(name, flags, packet, ctx),
            Matcher::Comment(_) | Matcher::PassThrough { .. } => Ok(true),
            Matcher::MultiPort { field, ranges } => Ok(match field {
                MultiPortField::Sports => in_ranges(ranges, packet.sport),
                MultiPortField::Dports => in_ranges(ranges, packet.dport),
                MultiPortField::Ports => {
                    in_ranges(ranges, packet.sport) || in_ranges(ranges, packet.dport)
                }
            }),
            Matcher::Mark { value, mask } => Ok(*value == packet.mark & *mask),
            Matcher::AddrType(t) => match_addrtype(t, packet, iif, oif, ctx),
            Matcher::RpFilter(rp) => match_rpfilter(rp, packet, iif, oif, ctx),
            Matcher::Unsupported { module, option, .. } => Err(Error::IptablesUnsupported(
                format!("{module} match option {option}"),
            )),
        }
    }
}

fn match_set(name: &str, flags: &str, packet: &Packet, ctx: &NetfilterContext<'_>) -> Result<bool> {
    let Some(set) = ctx.ipset.get(name) else {
        return Ok(false);
    };
    let fields: Vec<&str> = flags.split(',').collect();
    let need = |n: usize| -> Result<()> {
        if fields.len() < n {
            return Err(Error::Other(format!(
                "invalid set flags {flags:?} for {} set {name}",
                set.kind
            )));
        }
        Ok(())
    };
    let proto = packet.protocol.as_str();

    let key = match set.kind.as_str() {
        "hash:net" => {
            let addr = set_field_ip(packet, fields[0]);
            return Ok(set.members.iter().any(|m| prefix_contains(m, addr)));
        }
        "hash:ip" => set_field_ip(packet, fields[0]).to_string(),
        "hash:ip,port" => {
            need(2)?;
            format!(
                "{},{}:{}",
                set_field_ip(packet, fields[0]),
                proto,
                set_field_port(packet, fields[1])
            )
        }
        "hash:ip,port,ip" => {
            need(3)?;
            format!(
                "{},{}:{},{}",
                set_field_ip(packet, fields[0]),
                proto,
                set_field_port(packet, fields[1]),
                set_field_ip(packet, fields[2])
            )
        }
        "bitmap:port" => set_field_port(packet, fields[0]).to_string(),
        other => {
            return Err(Error::IptablesUnsupported(format!(
                "ipset type {other} of {name}"
            )));
        }
    };
    Ok(set.contains(&key))
}

/// 成员可能是单个地址或网段
fn prefix_contains(member: &str, addr: IpAddr) -> bool {
    if let Ok(net) = member.parse::<IpNet>() {
        return net.contains(&addr);
    }
    member.parse::<IpAddr>().is_ok_and(|ip| ip == addr)
}

fn match_addrtype(
    t: &AddrType,
    packet: &Packet,
    iif: &str,
    oif: &str,
    ctx: &NetfilterContext<'_>,
) -> Result<bool> {
    let (addr, want) = match t {
        AddrType::LimitIfaceIn(name) => return Ok(iif == name),
        AddrType::LimitIfaceOut(name) => return Ok(oif == name),
        AddrType::Src(want) => (packet.src, *want),
        AddrType::Dst(want) => (packet.dst, *want),
    };

    match want {
        RouteType::Unspec => return Ok(addr.is_unspecified()),
        RouteType::Multicast => return Ok(addr.is_multicast()),
        _ => {}
    }

    // local 表里查地址类型，查不到即单播
    let mut probe = packet.clone();
    probe.dst = addr;
    let actual = match ctx.router.table_route(RT_TABLE_LOCAL, &probe) {
        Ok(route) => route.kind,
        Err(Error::NoRouteToHost) => RouteType::Unicast,
        Err(e) => return Err(e),
    };
    Ok(actual == want)
}

fn match_rpfilter(
    rp: &RpFilter,
    packet: &Packet,
    iif: &str,
    oif: &str,
    ctx: &NetfilterContext<'_>,
) -> Result<bool> {
    if *rp == RpFilter::Loose {
        return Ok(true);
    }
    let route = match ctx.router.route(packet, iif, oif) {
        Ok(route) => route,
        Err(Error::NoRouteToHost) => return Ok(false),
        Err(e) => return Err(e),
    };
    let matched = route.oif_name == iif;
    Ok(if *rp == RpFilter::Invert {
        !matched
    } else {
        matched
    })
}

fn fmt_ranges(ranges: &[(u16, u16)]) -> String {
    ranges
        .iter()
        .map(|(a, b)| {
            if a == b {
                a.to_string()
            } else {
                format!("{a}:{b}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Port {
                protocol,
                field,
                first,
                last,
            } => {
                write!(f, "-m {} --{} ", protocol, field.option())?;
                if first == last {
                    write!(f, "{first}")
                } else {
                    write!(f, "{first}:{last}")
                }
            }
            Matcher::InInterface(name) => write!(f, "-i {name}"),
            Matcher::OutInterface(name) => write!(f, "-o {name}"),
            Matcher::Source(net) => write!(f, "-s {net}"),
            Matcher::Destination(net) => write!(f, "-d {net}"),
            Matcher::Protocol(p) => write!(f, "-p {p}"),
            Matcher::Set { name, flags } => write!(f, "-m set --match-set {name} {flags}"),
            Matcher::Comment(c) => write!(f, "-m comment --comment {c:?}"),
            Matcher::MultiPort { field, ranges } => {
                write!(f, "-m multiport --{} {}", field.option(), fmt_ranges(ranges))
            }
            Matcher::Mark { value, mask } => write!(f, "-m mark --mark {value:#x}/{mask:#x}"),
            Matcher::AddrType(t) => match t {
                AddrType::Src(k) => {
                    write!(f, "-m addrtype --src-type {}", k.name().to_uppercase())
                }
                AddrType::Dst(k) => {
                    write!(f, "-m addrtype --dst-type {}", k.name().to_uppercase())
                }
                AddrType::LimitIfaceIn(n) => write!(f, "-m addrtype --limit-iface-in {n}"),
                AddrType::LimitIfaceOut(n) => write!(f, "-m addrtype --limit-iface-out {n}"),
            },
            Matcher::RpFilter(rp) => match rp {
                RpFilter::Loose => f.write_str("-m rpfilter --loose"),
                RpFilter::Invert => f.write_str("-m rpfilter --invert"),
                RpFilter::Strict(opt) => write!(f, "-m rpfilter --{opt}"),
            },
            Matcher::PassThrough {
                module,
                option,
                value,
            }
            | Matcher::Unsupported {
                module,
                option,
                value,
            } => {
                write!(f, "-m {module} --{option}")?;
                if !value.is_empty() {
                    write!(f, " {value}")?;
                }
                Ok(())
            }
        }
    }
}
