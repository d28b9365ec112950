//! 数据包类型
//!
//! 模拟路径上传递的数据包。挂到链路上之后不再修改，变换（NAT、封装）总是产生新的包。

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// 传输层协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Ipv4,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Ipv4 => "ipv4",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "ipv4" | "ip" => Ok(Protocol::Ipv4),
            other => Err(Error::Other(format!("unknown protocol {other:?}"))),
        }
    }
}

/// 模拟数据包
///
/// `encap` 保存隧道内层的原始包（VXLAN 等），`Clone` 即深拷贝。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub src: IpAddr,
    #[serde(default)]
    pub sport: u16,
    pub dst: IpAddr,
    #[serde(default)]
    pub dport: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encap: Option<Box<Packet>>,
    #[serde(default)]
    pub mark: u32,
}

impl Packet {
    /// 构造一个源地址未定的包，源地址由路由选择后再填
    pub fn new(dst: IpAddr, dport: u16, protocol: Protocol) -> Self {
        Self {
            src: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            sport: 0,
            dst,
            dport,
            protocol,
            encap: None,
            mark: 0,
        }
    }

    /// 深拷贝（含整个 encap 链）
    pub fn deep_copy(&self) -> Packet {
        self.clone()
    }

    /// 回程包：交换源和目的，用于校验回程路由
    pub fn reply(&self) -> Packet {
        Packet {
            src: self.dst,
            sport: self.dport,
            dst: self.src,
            dport: self.sport,
            protocol: self.protocol,
            encap: None,
            mark: 0,
        }
    }

    /// 以当前包为内层，生成一个外层隧道包
    pub fn encapsulate(&self, src: IpAddr, dst: IpAddr, dport: u16, protocol: Protocol) -> Packet {
        Packet {
            src,
            sport: self.sport,
            dst,
            dport,
            protocol,
            encap: Some(Box::new(self.deep_copy())),
            mark: 0,
        }
    }

    pub fn is_encapsulated(&self) -> bool {
        self.encap.is_some()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{}->{}:{} [{}]",
            self.protocol, self.src, self.sport, self.dst, self.dport, self.mark
        )
    }
}
