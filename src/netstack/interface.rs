//! 网络接口快照

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use super::neigh::Neigh;

pub const LINK_DRIVER_VETH: &str = "veth";
pub const LINK_DRIVER_IPIP: &str = "ipip";
pub const LINK_DRIVER_VXLAN: &str = "vxlan";
pub const LINK_DRIVER_BRIDGE: &str = "bridge";

const DEFAULT_INTERFACE_NAMES: [&str; 2] = ["eth0", "eno0"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub mtu: u32,
    pub driver: String,
    /// 接口地址，保留主机位（如 `10.244.0.5/24`）
    pub addrs: Vec<IpNet>,
    pub state: LinkState,
    pub dev_sysctls: BTreeMap<String, String>,
    pub neigh_info: Vec<Neigh>,
    pub fdb_info: Vec<Neigh>,
    pub peer_index: u32,
    pub master_index: u32,
}

impl Interface {
    pub fn is_up(&self) -> bool {
        self.state == LinkState::Up
    }

    /// 第一个 IPv4 地址
    pub fn ipv4(&self) -> Option<Ipv4Net> {
        self.addrs.iter().find_map(|a| match a {
            IpNet::V4(v4) => Some(*v4),
            IpNet::V6(_) => None,
        })
    }

    /// 第一个 IPv4 地址，没有则返回 169.254.0.1/32
    pub fn default_ipv4(&self) -> Ipv4Net {
        self.ipv4()
            .unwrap_or_else(|| Ipv4Net::from(Ipv4Addr::new(169, 254, 0, 1)))
    }
}

/// 在接口列表中挑出宿主机默认网卡名：先找 eth0/eno0，再找第一个形如
/// `enp<N>s<N>...`、`eth<N>`、`ens<N>` 的接口，找不到返回空串
pub fn lookup_default_iface_name(ifaces: &[Interface]) -> String {
    for name in DEFAULT_INTERFACE_NAMES {
        if ifaces.iter().any(|i| i.name == name) {
            return name.to_string();
        }
    }
    ifaces
        .iter()
        .find(|i| is_default_iface_pattern(&i.name))
        .map(|i| i.name.clone())
        .unwrap_or_default()
}

fn is_default_iface_pattern(name: &str) -> bool {
    if let Some(rest) = name.strip_prefix("enp") {
        // enp[0-9]+s[0-9]+.*
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return false;
        }
        let Some(rest) = rest[digits..].strip_prefix('s') else {
            return false;
        };
        return rest.chars().next().is_some_and(|c| c.is_ascii_digit());
    }
    for prefix in ["eth", "ens"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            return !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit());
        }
    }
    false
}

/// 设备级 sysctl 名称，接口名中的 `.` 写作 `/`
pub fn dev_sysctl_name(dev: &str, key: &str) -> String {
    format!("net.ipv4.conf.{}.{}", dev.replace('.', "/"), key)
}
