//! 邻居表（ARP / FDB）
//!
//! 对于 VXLAN 这类隧道设备，永久 ARP 表项的 MAC 地址再到 FDB 里查出对端 VTEP 地址。

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::interface::Interface;
use super::route::Route;
use crate::error::{Error, Result};

/// 邻居表项状态（内核 NUD_* 位）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NudState(pub u16);

impl NudState {
    pub const NONE: NudState = NudState(0x00);
    pub const INCOMPLETE: NudState = NudState(0x01);
    pub const REACHABLE: NudState = NudState(0x02);
    pub const STALE: NudState = NudState(0x04);
    pub const DELAY: NudState = NudState(0x08);
    pub const PROBE: NudState = NudState(0x10);
    pub const FAILED: NudState = NudState(0x20);
    pub const NOARP: NudState = NudState(0x40);
    pub const PERMANENT: NudState = NudState(0x80);

    pub fn name(&self) -> &'static str {
        match *self {
            NudState::NONE => "NONE",
            NudState::INCOMPLETE => "INCOMPLETE",
            NudState::REACHABLE => "REACHABLE",
            NudState::STALE => "STALE",
            NudState::DELAY => "DELAY",
            NudState::PROBE => "PROBE",
            NudState::FAILED => "FAILED",
            NudState::NOARP => "NOARP",
            NudState::PERMANENT => "PERMANENT",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for NudState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neigh {
    #[serde(default)]
    pub link_index: u32,
    #[serde(default)]
    pub state: NudState,
    /// FDB 表项可能没有 IP
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub hardware_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighResult {
    pub state: NudState,
    pub ll_addr: String,
    /// 隧道对端地址（来自 FDB）
    pub dst: Option<IpAddr>,
}

#[derive(Debug, Clone, Default)]
pub struct Neighbour {
    interfaces: Vec<Interface>,
}

impl Neighbour {
    pub fn new(interfaces: Vec<Interface>) -> Self {
        Self { interfaces }
    }

    /// 在 `link_index` 接口上查 `ip` 的邻居缓存，没有缓存返回 `Ok(None)`
    pub fn probe_neigh(&self, ip: IpAddr, link_index: u32) -> Result<Option<NeighResult>> {
        let iface = self
            .interfaces
            .iter()
            .find(|i| i.index == link_index)
            .ok_or_else(|| Error::NotFound(format!("link {link_index}")))?;

        let Some(neigh) = iface
            .neigh_info
            .iter()
            .find(|n| n.link_index == link_index && n.ip == Some(ip))
        else {
            return Ok(None);
        };

        let mut dst = None;
        if neigh.state == NudState::PERMANENT {
            // 取最后一条匹配的 FDB 表项
            for fdb in &iface.fdb_info {
                if fdb.hardware_addr.eq_ignore_ascii_case(&neigh.hardware_addr) {
                    dst = fdb.ip;
                }
            }
        }

        Ok(Some(NeighResult {
            state: neigh.state,
            ll_addr: neigh.hardware_addr.clone(),
            dst,
        }))
    }

    /// 路由下一跳的 ARP 表项：有网关查网关，否则查目的地址本身
    pub fn probe_route_neigh(&self, route: &Route, dst: IpAddr) -> Option<&Neigh> {
        let target = route.gw.unwrap_or(dst);
        self.interfaces
            .iter()
            .filter(|i| i.name == route.oif_name)
            .flat_map(|i| i.neigh_info.iter())
            .find(|n| n.ip == Some(target) && target.is_ipv4())
    }
}
