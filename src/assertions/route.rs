//! 路由期望：只比较调用方给出的字段，`None` 为通配

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::netstack::{Route, RouteProtocol, RouteType, Scope};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteAssertion {
    pub dev: Option<String>,
    pub scope: Option<Scope>,
    pub kind: Option<RouteType>,
    pub dst: Option<IpNet>,
    pub src: Option<IpAddr>,
    pub gw: Option<IpAddr>,
    pub protocol: Option<RouteProtocol>,
}

impl RouteAssertion {
    pub fn dev(dev: impl Into<String>) -> Self {
        Self {
            dev: Some(dev.into()),
            ..Self::default()
        }
    }

    /// 第一个不符合期望的字段名
    pub fn mismatch(&self, route: &Route) -> Option<&'static str> {
        if self.dev.as_deref().is_some_and(|d| d != route.oif_name) {
            return Some("dev");
        }
        if self.scope.is_some_and(|s| s != route.scope) {
            return Some("scope");
        }
        if self.src.is_some() && self.src != route.src {
            return Some("src");
        }
        if self.dst.is_some_and(|d| d.trunc() != route.dst.trunc()) {
            return Some("dst");
        }
        if self.gw.is_some() && self.gw != route.gw {
            return Some("gateway");
        }
        if self.kind.is_some_and(|k| k != route.kind) {
            return Some("type");
        }
        if self.protocol.is_some_and(|p| p != route.protocol) {
            return Some("protocol");
        }
        None
    }
}

impl fmt::Display for RouteAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(dev) = &self.dev {
            parts.push(format!("dev: {dev}"));
        }
        if let Some(scope) = self.scope {
            parts.push(format!("scope: {}", scope.name()));
        }
        if let Some(kind) = self.kind {
            parts.push(format!("type: {}", kind.name()));
        }
        if let Some(src) = self.src {
            parts.push(format!("src: {src}"));
        }
        if let Some(dst) = self.dst {
            parts.push(format!("dst: {dst}"));
        }
        if let Some(gw) = self.gw {
            parts.push(format!("gateway: {gw}"));
        }
        if let Some(protocol) = self.protocol {
            parts.push(format!("protocol: {}", protocol.name()));
        }
        f.write_str(&parts.join(" "))
    }
}
