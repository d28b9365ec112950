//! 诊断请求中的源/目的端点

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Pod,
    Node,
    Service,
    #[serde(rename = "lb")]
    #[value(name = "lb")]
    LoadBalancer,
    External,
}

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Pod => "pod",
            EndpointType::Node => "node",
            EndpointType::Service => "service",
            EndpointType::LoadBalancer => "lb",
            EndpointType::External => "external",
        }
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    #[serde(rename = "type")]
    pub kind: EndpointType,
    #[serde(default)]
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, kind: EndpointType, port: u16) -> Self {
        Self { ip, kind, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}:{}", self.kind, self.ip, self.port)
    }
}
