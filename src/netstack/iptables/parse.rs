//! iptables-xml 解析
//!
//! 每个 `<module>` 下的每个子元素生成一个匹配项，`invert` 属性单独作用于该项。
//! 未知模块和未知目标照常建模为 unsupported，等到真正匹配时再报告。

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use roxmltree::{Document, Node};

use super::matcher::{AddrType, Match, Matcher, MultiPortField, PortField, RpFilter};
use super::table::{Chain, Rule, Table};
use super::target::{MarkOp, NatAddr, Target};
use crate::error::{Error, Result};
use crate::model::Protocol;
use crate::netstack::netfilter::Verdict;
use crate::netstack::route::RouteType;

const PASS_THROUGH_MODULES: [&str; 4] = ["conntrack", "statistic", "physdev", "socket"];

fn parse_err(msg: impl Into<String>) -> Error {
    Error::IptablesParse(msg.into())
}

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(Node::is_element)
}

fn text(node: Node<'_, '_>) -> String {
    node.text().map(str::trim).unwrap_or_default().to_string()
}

/// 解析整份 dump，返回表名 -> 表
pub fn parse_tables(dump: &str) -> Result<BTreeMap<String, Table>> {
    let doc = Document::parse(dump).map_err(|e| parse_err(e.to_string()))?;
    let mut tables = BTreeMap::new();
    for xml_table in elements(doc.root_element()) {
        let table = parse_table(xml_table)?;
        tables.insert(table.name.clone(), table);
    }
    Ok(tables)
}

fn parse_table(node: Node<'_, '_>) -> Result<Table> {
    let name = node
        .attribute("name")
        .ok_or_else(|| parse_err("table without name"))?;
    let mut table = Table::new(name);
    for xml_chain in elements(node) {
        let chain_name = xml_chain
            .attribute("name")
            .ok_or_else(|| parse_err(format!("chain without name in table {name}")))?;
        let policy = match xml_chain.attribute("policy") {
            Some("DROP") => Verdict::Drop,
            _ => Verdict::Accept,
        };
        let mut chain = Chain::new(chain_name, policy);
        for xml_rule in elements(xml_chain) {
            chain.rules.push(parse_rule(xml_rule)?);
        }
        table.add_chain(chain);
    }
    Ok(table)
}

fn find<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    elements(node).find(|c| c.tag_name().name() == tag)
}

fn parse_rule(node: Node<'_, '_>) -> Result<Rule> {
    let mut matches = Vec::new();
    if let Some(conditions) = find(node, "conditions") {
        for module in elements(conditions) {
            let module_name = module.tag_name().name();
            for expr in elements(module) {
                let invert = matches!(expr.attribute("invert"), Some("1") | Some("true"));
                let matcher = parse_matcher(module_name, expr.tag_name().name(), &text(expr))?;
                matches.push(Match { matcher, invert });
            }
        }
    }

    let target = match find(node, "actions").and_then(|a| elements(a).next()) {
        Some(action) => parse_target(action)?,
        None => Target::Nop,
    };
    Ok(Rule::new(matches, target))
}

fn parse_u32(s: &str) -> Result<u32> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| parse_err(format!("invalid number {s:?}: {e}")))
}

/// `value[/mask]`，缺省 mask 为全 1
fn parse_mark(s: &str) -> Result<(u32, u32)> {
    match s.split_once('/') {
        Some((v, m)) => Ok((parse_u32(v)?, parse_u32(m)?)),
        None => Ok((parse_u32(s)?, u32::MAX)),
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.trim()
        .parse()
        .map_err(|e| parse_err(format!("invalid port {s:?}: {e}")))
}

/// `a` 或 `a:b`
fn parse_port_range(s: &str) -> Result<(u16, u16)> {
    match s.split_once(':') {
        Some((a, b)) => Ok((parse_port(a)?, parse_port(b)?)),
        None => {
            let p = parse_port(s)?;
            Ok((p, p))
        }
    }
}

fn parse_net(s: &str) -> Result<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    s.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|e| parse_err(format!("invalid address {s:?}: {e}")))
}

fn parse_addr_class(s: &str) -> Option<RouteType> {
    let kind = match s {
        "UNSPEC" => RouteType::Unspec,
        "UNICAST" => RouteType::Unicast,
        "LOCAL" => RouteType::Local,
        "BROADCAST" => RouteType::Broadcast,
        "ANYCAST" => RouteType::Anycast,
        "MULTICAST" => RouteType::Multicast,
        "BLACKHOLE" => RouteType::Blackhole,
        "UNREACHABLE" => RouteType::Unreachable,
        "PROHIBIT" => RouteType::Prohibit,
        "THROW" => RouteType::Throw,
        "NAT" => RouteType::Nat,
        "XRESOLVE" => RouteType::Xresolve,
        _ => return None,
    };
    Some(kind)
}

fn strip_quotes(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

fn parse_matcher(module: &str, option: &str, value: &str) -> Result<Matcher> {
    let unsupported = || Matcher::Unsupported {
        module: module.to_string(),
        option: option.to_string(),
        value: value.to_string(),
    };

    let matcher = match (module, option) {
        ("tcp" | "udp", "sport" | "dport") => {
            let (first, last) = parse_port_range(value)?;
            Matcher::Port {
                protocol: if module == "tcp" {
                    Protocol::Tcp
                } else {
                    Protocol::Udp
                },
                field: if option == "sport" {
                    PortField::Source
                } else {
                    PortField::Destination
                },
                first,
                last,
            }
        }
        ("match", "i") => Matcher::InInterface(value.to_string()),
        ("match", "o") => Matcher::OutInterface(value.to_string()),
        ("match", "s") => Matcher::Source(parse_net(value)?),
        ("match", "d") => Matcher::Destination(parse_net(value)?),
        ("match", "p") => Matcher::Protocol(value.to_string()),
        ("set", "match-set") => {
            let mut fields = value.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some(name), Some(flags), None) => Matcher::Set {
                    name: name.to_string(),
                    flags: flags.to_string(),
                },
                _ => return Err(parse_err(format!("invalid set argument format {value:?}"))),
            }
        }
        ("comment", _) => Matcher::Comment(strip_quotes(value).to_string()),
        ("multiport", "sports" | "dports" | "ports") => {
            let ranges = value
                .split(',')
                .map(parse_port_range)
                .collect::<Result<Vec<_>>>()?;
            let field = match option {
                "sports" => MultiPortField::Sports,
                "dports" => MultiPortField::Dports,
                _ => MultiPortField::Ports,
            };
            Matcher::MultiPort { field, ranges }
        }
        ("mark", "mark") => {
            let (value, mask) = parse_mark(value)?;
            Matcher::Mark { value, mask }
        }
        ("addrtype", "src-type" | "dst-type") => match parse_addr_class(value) {
            Some(kind) if option == "src-type" => Matcher::AddrType(AddrType::Src(kind)),
            Some(kind) => Matcher::AddrType(AddrType::Dst(kind)),
            None => unsupported(),
        },
        ("addrtype", "limit-iface-in") => {
            Matcher::AddrType(AddrType::LimitIfaceIn(value.to_string()))
        }
        ("addrtype", "limit-iface-out") => {
            Matcher::AddrType(AddrType::LimitIfaceOut(value.to_string()))
        }
        ("rpfilter", "loose") => Matcher::RpFilter(RpFilter::Loose),
        ("rpfilter", "invert") => Matcher::RpFilter(RpFilter::Invert),
        ("rpfilter", other) => Matcher::RpFilter(RpFilter::Strict(other.to_string())),
        (m, _) if PASS_THROUGH_MODULES.contains(&m) => Matcher::PassThrough {
            module: module.to_string(),
            option: option.to_string(),
            value: value.to_string(),
        },
        _ => unsupported(),
    };
    Ok(matcher)
}

fn parse_nat_addr(s: &str) -> Result<NatAddr> {
    // ip[-ip][:port[-port]]，只取第一个
    let (ip_part, port_part) = match s.rsplit_once(':') {
        Some((ip, port)) if !ip.contains(':') => (ip, Some(port)),
        _ => (s, None),
    };
    let ip_first = ip_part.split('-').next().unwrap_or(ip_part);
    let ip = ip_first
        .trim_matches(|c| c == '[' || c == ']')
        .parse::<IpAddr>()
        .map_err(|e| parse_err(format!("invalid nat address {s:?}: {e}")))?;
    let port = match port_part {
        Some(p) => Some(parse_port(p.split('-').next().unwrap_or(p))?),
        None => None,
    };
    Ok(NatAddr { ip, port })
}

fn parse_target(action: Node<'_, '_>) -> Result<Target> {
    let tag = action.tag_name().name();
    let params: BTreeMap<&str, String> = elements(action)
        .map(|c| (c.tag_name().name(), text(c)))
        .collect();

    let jump_chain = || {
        elements(action)
            .next()
            .map(|c| c.tag_name().name().to_string())
            .ok_or_else(|| parse_err(format!("{tag} without target chain")))
    };

    let target = match tag {
        "call" => Target::Call(jump_chain()?),
        "goto" => Target::Goto(jump_chain()?),
        "ACCEPT" => Target::Accept,
        "DROP" => Target::Drop,
        "REJECT" => Target::Reject,
        "RETURN" => Target::Return,
        "MASQUERADE" => Target::Masquerade,
        "NOTRACK" => Target::NoTrack,
        "TPROXY" => Target::TProxy,
        "DNAT" => {
            let to = params
                .get("to-destination")
                .ok_or_else(|| parse_err("DNAT without --to-destination"))?;
            Target::Dnat(parse_nat_addr(to)?)
        }
        "SNAT" => {
            let to = params
                .get("to-source")
                .ok_or_else(|| parse_err("SNAT without --to-source"))?;
            Target::Snat(parse_nat_addr(to)?)
        }
        "MARK" => Target::Mark(parse_mark_op(&params)?),
        other => Target::Unsupported(other.to_string()),
    };
    Ok(target)
}

fn parse_mark_op(params: &BTreeMap<&str, String>) -> Result<MarkOp> {
    if let Some(v) = params.get("set-xmark") {
        let (value, mask) = parse_mark(v)?;
        return Ok(MarkOp::SetXmark { value, mask });
    }
    if let Some(v) = params.get("set-mark") {
        let (value, mask) = parse_mark(v)?;
        return Ok(MarkOp::SetMark { value, mask });
    }
    if let Some(v) = params.get("and-mark") {
        return Ok(MarkOp::And(parse_u32(v)?));
    }
    if let Some(v) = params.get("or-mark") {
        return Ok(MarkOp::Or(parse_u32(v)?));
    }
    if let Some(v) = params.get("xor-mark") {
        return Ok(MarkOp::Xor(parse_u32(v)?));
    }
    Err(parse_err("MARK without mark operation"))
}
