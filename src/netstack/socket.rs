//! 套接字快照

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::model::Protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SockState {
    Listen,
    Establish,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnStat {
    pub local_ip: IpAddr,
    pub local_port: u16,
    #[serde(default)]
    pub remote_ip: Option<IpAddr>,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub state: SockState,
}

impl ConnStat {
    /// 监听在 `ip:port`（或通配地址）上
    pub fn listens_on(&self, ip: IpAddr, port: u16, protocol: Protocol) -> bool {
        self.state == SockState::Listen
            && self.protocol == protocol
            && self.local_port == port
            && (self.local_ip == ip || self.local_ip.is_unspecified())
    }
}
