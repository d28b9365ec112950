//! 网络命名空间快照与模拟实体
//!
//! `NetNsInfo` 是采集端给出的原始数据；`NetNs` 在其上构建路由、iptables、ipset、ipvs 和邻居表，
//! 构建后只读。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::interface::Interface;
use super::ipset::IpSetManager;
use super::iptables::IpTables;
use super::ipvs::Ipvs;
use super::neigh::Neighbour;
use super::netfilter::{Netfilter, NetfilterContext};
use super::route::{Route, Router, Rule, default_rules};
use super::socket::ConnStat;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetNsInfo {
    pub netns: String,
    pub netns_id: String,
    pub pid: u32,
    pub key: String,
    pub interfaces: Vec<Interface>,
    pub sysctl_info: BTreeMap<String, String>,
    pub route_info: Vec<Route>,
    /// 为空时使用内核默认的 local/main/default 三条规则
    pub rule_info: Vec<Rule>,
    /// iptables-xml 输出
    pub iptables_info: String,
    /// `ipset save -o xml` 输出
    pub ipset_info: String,
    /// ipvsadm-save 输出，每项一行
    pub ipvs_info: Vec<String>,
    pub conn_stats: Vec<ConnStat>,
}

#[derive(Debug, Clone)]
pub struct NetNs {
    pub info: NetNsInfo,
    pub router: Router,
    pub iptables: IpTables,
    pub ipset: IpSetManager,
    pub ipvs: Ipvs,
    pub neighbour: Neighbour,
}

impl NetNs {
    #[tracing::instrument(skip(info), fields(netns = %info.netns_id))]
    pub fn new(info: NetNsInfo) -> Result<Self> {
        let rules = if info.rule_info.is_empty() {
            default_rules()
        } else {
            info.rule_info.clone()
        };
        let router = Router::new(rules, info.route_info.clone(), info.interfaces.clone());
        let iptables = IpTables::parse(&info.iptables_info);
        let ipset = IpSetManager::parse(&info.ipset_info)?;
        let ipvs = Ipvs::parse(&info.ipvs_info)?;
        let neighbour = Neighbour::new(info.interfaces.clone());
        debug!(
            interfaces = info.interfaces.len(),
            routes = info.route_info.len(),
            ipsets = ipset.len(),
            "netns loaded"
        );
        Ok(Self {
            info,
            router,
            iptables,
            ipset,
            ipvs,
            neighbour,
        })
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.info.interfaces
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.info.interfaces.iter().find(|i| i.name == name)
    }

    pub fn interface_by_index(&self, index: u32) -> Option<&Interface> {
        self.info.interfaces.iter().find(|i| i.index == index)
    }

    pub fn netfilter(&self) -> Netfilter<'_> {
        Netfilter::new(
            &self.iptables,
            NetfilterContext {
                ipset: &self.ipset,
                router: &self.router,
                ipvs: &self.ipvs,
            },
        )
    }
}
