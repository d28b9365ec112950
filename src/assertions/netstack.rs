//! 网络栈断言
//!
//! 在一个命名空间快照上检查 sysctl、接口、路由、监听、netfilter 和 IPVS 的状态。

use std::fmt::Display;
use std::net::IpAddr;

use tracing::debug;

use super::route::RouteAssertion;
use super::{Assertion, assert_true};
use crate::error::{Error, Result};
use crate::model::{Packet, Protocol, SuspicionLevel};
use crate::netstack::{
    Hook, Interface, LINK_DRIVER_IPIP, LINK_DRIVER_VETH, LinkState, NetNs, NetNsInfo, NudState,
    RT_TABLE_DEFAULT, RT_TABLE_LOCAL, RT_TABLE_MAIN, Route, RouteType,
};

/// 对接口的期望，`None` 字段不检查
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceExpectation {
    pub mtu: Option<u32>,
    pub state: Option<LinkState>,
    pub driver: Option<String>,
    pub master_index: Option<u32>,
    pub peer_index: Option<u32>,
}

impl InterfaceExpectation {
    pub fn up() -> Self {
        Self {
            state: Some(LinkState::Up),
            ..Self::default()
        }
    }

    pub fn up_with_mtu(mtu: u32) -> Self {
        Self {
            mtu: Some(mtu),
            state: Some(LinkState::Up),
            ..Self::default()
        }
    }
}

pub struct NetstackAssertion<'s, 'n> {
    sink: &'s mut dyn Assertion,
    netns: &'n NetNs,
}

impl<'s, 'n> NetstackAssertion<'s, 'n> {
    pub fn new(sink: &'s mut dyn Assertion, netns: &'n NetNs) -> Self {
        Self { sink, netns }
    }

    fn add(&mut self, level: SuspicionLevel, message: String) {
        self.sink.add_suspicion(level, message);
    }

    fn interface(&self, name: &str) -> Option<&'n Interface> {
        self.netns.interface(name)
    }

    pub fn assert_sysctls(&mut self, expect: &[(&str, &str)], level: SuspicionLevel) {
        for (key, value) in expect {
            match self.netns.info.sysctl_info.get(*key) {
                None => self.add(
                    level,
                    format!("expect sysctl {key} not exist in actual netns"),
                ),
                Some(actual) => assert_true(
                    self.sink,
                    actual == value,
                    level,
                    format!(
                        "expect sysctl {key} in actual netns: {actual} not equal to expect: {value}"
                    ),
                ),
            }
        }
    }

    pub fn assert_ip_forward_enabled(&mut self) {
        self.assert_sysctls(&[("net.ipv4.ip_forward", "1")], SuspicionLevel::Fatal);
    }

    /// `dev` 为空时检查 `all`
    pub fn assert_rp_filter_disabled(&mut self, dev: &str) {
        let dev = if dev.is_empty() { "all" } else { dev };
        let key = format!("net.ipv4.conf.{dev}.rp_filter");
        self.assert_sysctls(&[(key.as_str(), "0")], SuspicionLevel::Fatal);
    }

    /// 第一条指向 main/local 表的规则不应带额外匹配条件
    pub fn assert_default_rule(&mut self) {
        let rule = self
            .netns
            .router
            .rules()
            .iter()
            .find(|r| r.table == RT_TABLE_MAIN || r.table == RT_TABLE_LOCAL);
        match rule {
            None => self.add(
                SuspicionLevel::Critical,
                "default policy to table main is deleted".to_string(),
            ),
            Some(r) => {
                let scoped = r.src.is_some() || r.dst.is_some();
                if scoped || !r.iif_name.is_empty() || !r.oif_name.is_empty() {
                    self.add(
                        SuspicionLevel::Critical,
                        "default policy to table main is wrong with non zero fields".to_string(),
                    );
                }
            }
        }
    }

    pub fn assert_no_policy_route(&mut self) {
        let tables: Vec<u32> = self
            .netns
            .router
            .rules()
            .iter()
            .map(|r| r.table)
            .filter(|t| ![RT_TABLE_MAIN, RT_TABLE_LOCAL, RT_TABLE_DEFAULT].contains(t))
            .collect();
        assert_true(
            self.sink,
            tables.is_empty(),
            SuspicionLevel::Warning,
            format!("policy route enabled, tables: {tables:?}"),
        );
    }

    pub fn assert_net_device(&mut self, name: &str, expect: &InterfaceExpectation) {
        let Some(iface) = self.interface(name) else {
            self.add(
                SuspicionLevel::Critical,
                format!("cannot find interface: {name} to assert"),
            );
            return;
        };
        self.check_field(name, "mtu", expect.mtu, iface.mtu);
        self.check_field(name, "state", expect.state.map(state_name), state_name(iface.state));
        self.check_field(name, "driver", expect.driver.clone(), iface.driver.clone());
        self.check_field(name, "master_index", expect.master_index, iface.master_index);
        self.check_field(name, "peer_index", expect.peer_index, iface.peer_index);
    }

    fn check_field<T: PartialEq + Display>(
        &mut self,
        dev: &str,
        field: &str,
        expect: Option<T>,
        actual: T,
    ) {
        if let Some(expect) = expect {
            assert_true(
                self.sink,
                expect == actual,
                SuspicionLevel::Fatal,
                format!(
                    "netdevice {dev:?} field: {field} is not expect: actual({actual}) != expect({expect})"
                ),
            );
        }
    }

    pub fn assert_listen(&mut self, ip: IpAddr, port: u16, protocol: Protocol) {
        let listening = self
            .netns
            .info
            .conn_stats
            .iter()
            .any(|s| s.listens_on(ip, port, protocol));
        assert_true(
            self.sink,
            listening,
            SuspicionLevel::Fatal,
            format!("no process listening on 0.0.0.0:{port} or {ip}:{port} protocol {protocol}"),
        );
    }

    pub fn assert_host_bridge(&mut self, name: &str) {
        let Some(bridge) = self.interface(name) else {
            self.add(SuspicionLevel::Fatal, format!("bridge {name} is not existed"));
            return;
        };
        assert_true(
            self.sink,
            bridge.is_up(),
            SuspicionLevel::Fatal,
            format!("bridge {name} state is down"),
        );
    }

    /// 从 pod 一侧的接口出发，检查宿主机上的 veth 对端挂在期望的网桥上
    pub fn assert_veth_peer_bridge(&mut self, peer_if: &str, peer_ns: &NetNsInfo, bridge: &str) {
        let Some(peer) = peer_ns.interfaces.iter().find(|i| i.name == peer_if) else {
            self.add(
                SuspicionLevel::Fatal,
                format!("cannot find {peer_if} in peer netns {}", peer_ns.netns_id),
            );
            return;
        };
        let Some(dev) = self.netns.interface_by_index(peer.peer_index) else {
            self.add(
                SuspicionLevel::Fatal,
                format!("veth index {} is not existed", peer.peer_index),
            );
            return;
        };
        self.assert_veth_master(dev, bridge);
    }

    /// 从宿主机一侧的 veth 序号出发，检查它挂在期望的网桥上
    pub fn assert_veth_on_bridge(&mut self, index: u32, bridge: &str) {
        let Some(dev) = self.netns.interface_by_index(index) else {
            self.add(
                SuspicionLevel::Fatal,
                format!("veth peer index {index} is not existed"),
            );
            return;
        };
        self.assert_veth_master(dev, bridge);
    }

    fn assert_veth_master(&mut self, dev: &Interface, bridge: &str) {
        if dev.driver != LINK_DRIVER_VETH {
            self.add(
                SuspicionLevel::Fatal,
                format!("{} is not a veth interface", dev.name),
            );
            return;
        }
        assert_true(
            self.sink,
            dev.is_up(),
            SuspicionLevel::Warning,
            format!("state of veth peer {} is DOWN", dev.name),
        );
        if dev.master_index == 0 {
            self.add(SuspicionLevel::Fatal, format!("{} has no master", dev.name));
            return;
        }
        let Some(master) = self.netns.interface_by_index(dev.master_index) else {
            self.add(
                SuspicionLevel::Fatal,
                format!(
                    "cannot find master interface {}, for dev {}",
                    dev.master_index, dev.name
                ),
            );
            return;
        };
        if !bridge.is_empty() {
            assert_true(
                self.sink,
                master.name == bridge,
                SuspicionLevel::Fatal,
                format!("bridge of {} is {}, not {bridge}", dev.name, master.name),
            );
        }
    }

    /// 校验数据包命中的路由
    ///
    /// 找不到路由或路由类型为不可达时记 Fatal 并返回 `None`；其余情况返回命中的路由，
    /// 与期望不符只记 suspicion。
    pub fn assert_route(
        &mut self,
        expected: &RouteAssertion,
        packet: &Packet,
        iif: &str,
        oif: &str,
    ) -> Result<Option<&'n Route>> {
        let route = match self.netns.router.route(packet, iif, oif) {
            Ok(route) => route,
            Err(Error::NoRouteToHost) => {
                self.add(
                    SuspicionLevel::Fatal,
                    format!("no route to host {}", packet.dst),
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if route.kind.is_unreachable() {
            self.add(
                SuspicionLevel::Fatal,
                format!(
                    "route with type {} which indicates {} is unreachable",
                    route.kind.name(),
                    packet.dst
                ),
            );
            return Ok(None);
        }
        if route.kind == RouteType::Local {
            return Ok(Some(route));
        }
        if let Some(field) = expected.mismatch(route) {
            debug!(field, route = %route, "route mismatch");
            self.add(
                SuspicionLevel::Fatal,
                format!(
                    "invalid route {:?} for packet {{src={}, dst={}}}, expected: {:?}",
                    route.to_string(),
                    packet.src,
                    packet.dst,
                    expected.to_string()
                ),
            );
        }
        Ok(Some(route))
    }

    /// 路由下一跳的 ARP 解析状态
    pub fn assert_route_neigh(&mut self, route: &Route, dst: IpAddr) {
        let Some(neigh) = self.netns.neighbour.probe_route_neigh(route, dst) else {
            return;
        };
        if neigh.state != NudState::FAILED && neigh.state != NudState::INCOMPLETE {
            return;
        }
        let message = match route.gw {
            None => format!("dst: {dst} ARP resolve failed."),
            Some(gw) => format!("dst: {dst} route's gateway: {gw} ARP resolve failed."),
        };
        self.add(SuspicionLevel::Critical, message);
    }

    /// VXLAN 设备上 `vtep` 的 ARP + FDB 表项应指向 `dst_host`
    pub fn assert_vxlan_vtep(&mut self, vtep: IpAddr, dst_host: IpAddr, dev: &str) -> Result<()> {
        let Some(iface) = self.interface(dev) else {
            self.add(
                SuspicionLevel::Fatal,
                format!("invalid vxlan interface {dev}"),
            );
            return Ok(());
        };
        let Some(neigh) = self.netns.neighbour.probe_neigh(vtep, iface.index)? else {
            self.add(
                SuspicionLevel::Critical,
                format!("no neigh for next node hop: {vtep} on {dev}"),
            );
            return Ok(());
        };
        match neigh.dst {
            Some(remote) if !remote.is_unspecified() => assert_true(
                self.sink,
                remote == dst_host,
                SuspicionLevel::Critical,
                format!(
                    "fdb table for {:?} not equal to expect vtep {:?}",
                    vtep.to_string(),
                    dst_host.to_string()
                ),
            ),
            _ => self.add(
                SuspicionLevel::Critical,
                format!("no fdb table for {dev}"),
            ),
        }
        Ok(())
    }

    pub fn assert_default_ipip_tunnel(&mut self, dev: &str) {
        let Some(iface) = self.interface(dev) else {
            self.add(
                SuspicionLevel::Fatal,
                format!("interface {dev:?} does not exist"),
            );
            return;
        };
        assert_true(
            self.sink,
            iface.driver == LINK_DRIVER_IPIP,
            SuspicionLevel::Fatal,
            format!(
                "driver of interface {dev:?} is {:?}, not {LINK_DRIVER_IPIP:?}",
                iface.driver
            ),
        );
    }

    pub fn assert_no_iptables(&mut self) {
        if let Err(e) = self.netns.iptables.check_empty() {
            self.add(SuspicionLevel::Fatal, format!("iptables: {e}"));
        }
    }

    pub fn assert_default_accept(&mut self) {
        if let Err(e) = self.netns.iptables.check_default_accept() {
            self.add(SuspicionLevel::Fatal, format!("iptables: {e}"));
        }
    }

    /// hook 结果转成 suspicion；放行返回改写后的包
    fn check_netfilter(&mut self, result: Result<Packet>) -> Result<Option<Packet>> {
        match result {
            Ok(packet) => Ok(Some(packet)),
            Err(Error::IptablesUnavailable | Error::IptablesUnsupported(_)) => {
                self.add(
                    SuspicionLevel::Warning,
                    "iptables contains unsupported rules, which is not expected".to_string(),
                );
                Ok(None)
            }
            Err(e @ Error::IptablesRule { .. }) => {
                self.add(
                    SuspicionLevel::Warning,
                    format!("iptables contains unsupported rule: {e}"),
                );
                Ok(None)
            }
            Err(Error::IptablesDrop(trace)) => {
                self.add(
                    SuspicionLevel::Warning,
                    format!("packet drop by iptables, trace:\n{trace}"),
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// 本机发出：OUTPUT，然后每个出包过 POSTROUTING
    pub fn assert_netfilter_send(
        &mut self,
        input: &Packet,
        outputs: &[Packet],
        iif: &str,
    ) -> Result<()> {
        let nf = self.netns.netfilter();
        if self.check_netfilter(nf.hook(Hook::Output, input, iif, ""))?.is_none() {
            return Ok(());
        }
        for out in outputs {
            self.check_netfilter(nf.hook(Hook::PostRouting, out, iif, ""))?;
        }
        Ok(())
    }

    /// 转发：PREROUTING，然后每个出包（仅替换目的地址）过 FORWARD 和 POSTROUTING，不应被 SNAT
    pub fn assert_netfilter_forward(
        &mut self,
        input: &Packet,
        outputs: &[Packet],
        iif: &str,
    ) -> Result<()> {
        let nf = self.netns.netfilter();
        if self.check_netfilter(nf.hook(Hook::PreRouting, input, iif, ""))?.is_none() {
            return Ok(());
        }
        let fallback = [input.clone()];
        let outputs = if outputs.is_empty() { &fallback[..] } else { outputs };
        for out in outputs {
            let mut packet = input.deep_copy();
            packet.dst = out.dst;
            let Some(forwarded) =
                self.check_netfilter(nf.hook(Hook::Forward, &packet, iif, ""))?
            else {
                continue;
            };
            let Some(filtered) =
                self.check_netfilter(nf.hook(Hook::PostRouting, &forwarded, iif, ""))?
            else {
                continue;
            };
            assert_true(
                self.sink,
                filtered.src == packet.src,
                SuspicionLevel::Fatal,
                format!("pkt {input} is SNATed to {filtered}, which is not expected"),
            );
        }
        Ok(())
    }

    /// 本机接收：PREROUTING，然后 INPUT
    pub fn assert_netfilter_serve(&mut self, input: &Packet, iif: &str) -> Result<()> {
        let nf = self.netns.netfilter();
        let Some(filtered) = self.check_netfilter(nf.hook(Hook::PreRouting, input, iif, ""))? else {
            return Ok(());
        };
        self.check_netfilter(nf.hook(Hook::Input, &filtered, iif, ""))?;
        Ok(())
    }

    /// 命名空间里配置了该 IPVS 服务时，检查后端在 real server 中
    pub fn assert_ipvs_server_exists(
        &mut self,
        service: IpAddr,
        port: u16,
        protocol: Protocol,
        backend: IpAddr,
        backend_port: u16,
    ) {
        if self.netns.ipvs.is_empty() {
            return;
        }
        let Some(svc) = self.netns.ipvs.service(protocol, service, port) else {
            return;
        };
        if svc.rs.is_empty() {
            self.add(
                SuspicionLevel::Fatal,
                format!("ipvs has no service {svc} or service has no rs info"),
            );
            return;
        }
        let found = svc
            .rs
            .iter()
            .any(|rs| rs.ip == backend && rs.port == backend_port);
        assert_true(
            self.sink,
            found,
            SuspicionLevel::Warning,
            format!("ipvs service {service} has no endpoint {backend}:{backend_port}"),
        );
    }
}

fn state_name(state: LinkState) -> &'static str {
    match state {
        LinkState::Up => "up",
        LinkState::Down => "down",
        LinkState::Unknown => "unknown",
    }
}
