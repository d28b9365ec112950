//! 策略路由模拟
//!
//! 规则按优先级升序（稳定）排列；每张表内的路由按前缀长度降序、优先级升序（稳定）排列。
//! 查找时依次尝试匹配的规则，第一张能给出路由的表胜出。

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::interface::Interface;
use crate::error::{Error, Result};
use crate::model::Packet;

pub const RT_TABLE_UNSPEC: u32 = 0;
pub const RT_TABLE_DEFAULT: u32 = 253;
pub const RT_TABLE_MAIN: u32 = 254;
pub const RT_TABLE_LOCAL: u32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Universe,
    Site,
    Link,
    Host,
    Nowhere,
}

impl Scope {
    pub fn value(&self) -> u8 {
        match self {
            Scope::Universe => 0,
            Scope::Site => 200,
            Scope::Link => 253,
            Scope::Host => 254,
            Scope::Nowhere => 255,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Scope::Universe => "universe",
            Scope::Site => "site",
            Scope::Link => "link",
            Scope::Host => "host",
            Scope::Nowhere => "nowhere",
        }
    }
}

/// 路由类型（RTN_*）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    Unspec,
    #[default]
    Unicast,
    Local,
    Broadcast,
    Anycast,
    Multicast,
    Blackhole,
    Unreachable,
    Prohibit,
    Throw,
    Nat,
    Xresolve,
}

impl RouteType {
    pub fn value(&self) -> u8 {
        match self {
            RouteType::Unspec => 0,
            RouteType::Unicast => 1,
            RouteType::Local => 2,
            RouteType::Broadcast => 3,
            RouteType::Anycast => 4,
            RouteType::Multicast => 5,
            RouteType::Blackhole => 6,
            RouteType::Unreachable => 7,
            RouteType::Prohibit => 8,
            RouteType::Throw => 9,
            RouteType::Nat => 10,
            RouteType::Xresolve => 11,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RouteType::Unspec => "unspec",
            RouteType::Unicast => "unicast",
            RouteType::Local => "local",
            RouteType::Broadcast => "broadcast",
            RouteType::Anycast => "anycast",
            RouteType::Multicast => "multicast",
            RouteType::Blackhole => "blackhole",
            RouteType::Unreachable => "unreachable",
            RouteType::Prohibit => "prohibit",
            RouteType::Throw => "throw",
            RouteType::Nat => "nat",
            RouteType::Xresolve => "xresolve",
        }
    }

    /// 这几类路由表示目的不可达
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            RouteType::Unreachable | RouteType::Blackhole | RouteType::Prohibit | RouteType::Throw
        )
    }
}

/// 路由来源（RTPROT_*）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteProtocol(pub u8);

impl RouteProtocol {
    pub const REDIRECT: RouteProtocol = RouteProtocol(1);
    pub const KERNEL: RouteProtocol = RouteProtocol(2);
    pub const BOOT: RouteProtocol = RouteProtocol(3);
    pub const STATIC: RouteProtocol = RouteProtocol(4);
    pub const RA: RouteProtocol = RouteProtocol(9);
    pub const BIRD: RouteProtocol = RouteProtocol(12);
    pub const OSPF: RouteProtocol = RouteProtocol(188);
    pub const RIP: RouteProtocol = RouteProtocol(189);

    pub fn name(&self) -> &'static str {
        match *self {
            RouteProtocol::REDIRECT => "redirect",
            RouteProtocol::KERNEL => "kernel",
            RouteProtocol::BOOT => "boot",
            RouteProtocol::STATIC => "static",
            RouteProtocol::RA => "ra",
            RouteProtocol::BIRD => "bird",
            RouteProtocol::OSPF => "ospf",
            RouteProtocol::RIP => "rip",
            _ => "",
        }
    }
}

fn default_dst() -> IpNet {
    IpNet::V4(Ipv4Net::default())
}

fn default_table() -> u32 {
    RT_TABLE_MAIN
}

/// 一条路由。`dst` 总是有值，默认路由为 `0.0.0.0/0`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub oif_name: String,
    #[serde(default)]
    pub iif_name: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default = "default_dst")]
    pub dst: IpNet,
    #[serde(default)]
    pub src: Option<IpAddr>,
    #[serde(default)]
    pub gw: Option<IpAddr>,
    #[serde(default)]
    pub protocol: RouteProtocol,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_table")]
    pub table: u32,
    #[serde(default, rename = "type")]
    pub kind: RouteType,
    #[serde(default)]
    pub tos: u8,
    #[serde(default)]
    pub flags: u32,
}

impl Route {
    /// main 表中经 `oif` 到 `dst` 的单播路由
    pub fn new(dst: IpNet, oif: impl Into<String>) -> Self {
        Self {
            oif_name: oif.into(),
            iif_name: String::new(),
            scope: Scope::Universe,
            dst,
            src: None,
            gw: None,
            protocol: RouteProtocol::default(),
            priority: 0,
            table: RT_TABLE_MAIN,
            kind: RouteType::Unicast,
            tos: 0,
            flags: 0,
        }
    }

    pub fn is_default(&self) -> bool {
        self.dst.prefix_len() == 0 && self.dst.addr().is_unspecified()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            f.write_str("default")?;
        } else {
            write!(f, "{}", self.dst)?;
        }
        if !self.oif_name.is_empty() {
            write!(f, " dev {}", self.oif_name)?;
        }
        if let Some(gw) = self.gw.filter(|g| !g.is_unspecified()) {
            write!(f, " via {gw}")?;
        }
        if matches!(self.scope, Scope::Link | Scope::Host | Scope::Universe) {
            write!(f, " scope {}", self.scope.name())?;
        }
        write!(f, " type {}", self.kind.name())
    }
}

/// 策略路由规则，未设置的字段不参与匹配
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub priority: u32,
    pub table: u32,
    pub mark: u32,
    pub mask: u32,
    pub src: Option<IpNet>,
    pub dst: Option<IpNet>,
    pub iif_name: String,
    pub oif_name: String,
}

impl Rule {
    pub fn new(priority: u32, table: u32) -> Self {
        Self {
            priority,
            table,
            ..Self::default()
        }
    }

    pub fn matches(&self, packet: &Packet, iif: &str, oif: &str) -> bool {
        if self.src.is_some_and(|src| !src.contains(&packet.src)) {
            return false;
        }
        if self.dst.is_some_and(|dst| !dst.contains(&packet.dst)) {
            return false;
        }
        if self.mark > 0 && (packet.mark ^ self.mark) & self.mask != 0 {
            return false;
        }
        if !self.iif_name.is_empty() && self.iif_name != iif {
            return false;
        }
        if !self.oif_name.is_empty() && self.oif_name != oif {
            return false;
        }
        true
    }
}

/// 内核默认的三条规则：local(0)、main(32766)、default(32767)
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new(0, RT_TABLE_LOCAL),
        Rule::new(32766, RT_TABLE_MAIN),
        Rule::new(32767, RT_TABLE_DEFAULT),
    ]
}

pub fn sort_rules(rules: &mut [Rule]) {
    rules.sort_by_key(|r| r.priority);
}

pub fn sort_routes(routes: &mut [Route]) {
    routes.sort_by(|a, b| {
        b.dst
            .prefix_len()
            .cmp(&a.dst.prefix_len())
            .then(a.priority.cmp(&b.priority))
    });
}

#[derive(Debug, Clone, Default)]
pub struct Router {
    rules: Vec<Rule>,
    routes: HashMap<u32, Vec<Route>>,
    interfaces: Vec<Interface>,
}

impl Router {
    pub fn new(mut rules: Vec<Rule>, routes: Vec<Route>, interfaces: Vec<Interface>) -> Self {
        sort_rules(&mut rules);
        let mut tables: HashMap<u32, Vec<Route>> = HashMap::new();
        for route in routes {
            tables.entry(route.table).or_default().push(route);
        }
        for routes in tables.values_mut() {
            sort_routes(routes);
        }
        Self {
            rules,
            routes: tables,
            interfaces,
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// 某张表内排序后的路由
    pub fn table(&self, table: u32) -> &[Route] {
        self.routes.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    fn lookup(&self, table: u32, packet: &Packet) -> Option<&Route> {
        self.routes
            .get(&table)?
            .iter()
            .find(|r| r.dst.contains(&packet.dst))
    }

    pub fn route(&self, packet: &Packet, iif: &str, oif: &str) -> Result<&Route> {
        for rule in &self.rules {
            if !rule.matches(packet, iif, oif) {
                continue;
            }
            if let Some(route) = self.lookup(rule.table, packet) {
                trace!(packet = %packet, table = rule.table, route = %route, "route lookup");
                return Ok(route);
            }
        }
        Err(Error::NoRouteToHost)
    }

    pub fn table_route(&self, table: u32, packet: &Packet) -> Result<&Route> {
        self.lookup(table, packet).ok_or(Error::NoRouteToHost)
    }

    /// 指定表的默认路由，表号 0 视为 local 表
    pub fn default_route(&self, table: u32) -> Option<&Route> {
        let table = if table == RT_TABLE_UNSPEC {
            RT_TABLE_LOCAL
        } else {
            table
        };
        self.routes.get(&table)?.iter().find(|r| r.is_default())
    }

    /// 接口上的第一个 IPv4 地址
    pub fn interface_addr(&self, name: &str) -> Option<IpAddr> {
        self.interfaces
            .iter()
            .find(|i| i.name == name)
            .and_then(Interface::ipv4)
            .map(|net| IpAddr::V4(net.addr()))
    }

    /// 路由并选出源地址：出接口的第一个 IPv4 地址，出接口没有地址时改用 main 表默认路由的出接口
    pub fn route_src(&self, packet: &Packet, iif: &str, oif: &str) -> Result<(IpAddr, &Route)> {
        let route = self.route(packet, iif, oif)?;
        if let Some(src) = self.interface_addr(&route.oif_name) {
            return Ok((src, route));
        }
        if let Some(default) = self.default_route(RT_TABLE_MAIN) {
            if let Some(src) = self.interface_addr(&default.oif_name) {
                return Ok((src, default));
            }
        }
        Err(Error::NoSourceAddress(packet.dst))
    }
}

