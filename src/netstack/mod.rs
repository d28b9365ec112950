//! 内核网络栈模拟
//!
//! 基于采集到的快照模拟路由、netfilter、IPVS、IPSet 和邻居表的行为。

mod interface;
pub mod iptables;
mod ipset;
mod ipvs;
mod neigh;
mod netfilter;
mod netns;
mod route;
mod socket;

pub use interface::{
    Interface, LINK_DRIVER_BRIDGE, LINK_DRIVER_IPIP, LINK_DRIVER_VETH, LINK_DRIVER_VXLAN,
    LinkState, dev_sysctl_name, lookup_default_iface_name,
};
pub use iptables::{IpTables, Trace};
pub use ipset::{IpSet, IpSetManager};
pub use ipvs::{IpvsService, Ipvs, RealServer, service_key};
pub use neigh::{Neigh, NeighResult, Neighbour, NudState};
pub use netfilter::{Hook, Netfilter, NetfilterContext, Verdict};
pub use netns::{NetNs, NetNsInfo};
pub use route::{
    RT_TABLE_DEFAULT, RT_TABLE_LOCAL, RT_TABLE_MAIN, RT_TABLE_UNSPEC, Route, RouteProtocol,
    RouteType, Router, Rule, Scope, default_rules, sort_routes, sort_rules,
};
pub use socket::{ConnStat, SockState};
