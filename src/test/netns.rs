use crate::model::{Packet, Protocol};
use crate::netstack::{
    ConnStat, Interface, LinkState, NetNs, NetNsInfo, RT_TABLE_MAIN, Route, Rule, SockState,
    dev_sysctl_name, lookup_default_iface_name,
};
use std::net::IpAddr;

fn ip(s: &str) -> IpAddr {
    s.parse().expect("ip")
}

fn named(name: &str, index: u32) -> Interface {
    Interface {
        name: name.to_string(),
        index,
        state: LinkState::Up,
        ..Interface::default()
    }
}

#[test]
fn empty_rule_info_uses_kernel_default_rules() {
    let info = NetNsInfo {
        interfaces: vec![named("lo", 1), named("eth0", 2)],
        route_info: vec![Route::new("0.0.0.0/0".parse().expect("net"), "eth0")],
        ..NetNsInfo::default()
    };
    let ns = NetNs::new(info).expect("netns");
    let prios: Vec<u32> = ns.router.rules().iter().map(|r| r.priority).collect();
    assert_eq!(prios, vec![0, 32766, 32767]);
    assert!(!ns.iptables.is_fallback());
    assert!(ns.ipset.is_empty());
    assert!(ns.ipvs.is_empty());

    let route = ns
        .router
        .route(&Packet::new(ip("1.1.1.1"), 53, Protocol::Udp), "", "")
        .expect("default route");
    assert_eq!(route.table, RT_TABLE_MAIN);
    assert_eq!(ns.interface_by_index(2).map(|i| i.name.as_str()), Some("eth0"));
}

#[test]
fn explicit_rules_replace_default_rules() {
    let info = NetNsInfo {
        rule_info: vec![Rule::new(32766, RT_TABLE_MAIN)],
        ..NetNsInfo::default()
    };
    let ns = NetNs::new(info).expect("netns");
    assert_eq!(ns.router.rules().len(), 1);
}

#[test]
fn broken_ipvs_dump_fails_netns_build() {
    let info = NetNsInfo {
        ipvs_info: vec!["-a -t 10.96.0.10:80 -r 10.244.0.3:80 -m".into()],
        ..NetNsInfo::default()
    };
    assert!(NetNs::new(info).is_err());
}

#[test]
fn netns_info_deserializes_with_defaults() {
    let info: NetNsInfo = serde_json::from_str(
        r#"{
            "netns": "/proc/1/ns/net",
            "interfaces": [{"name": "eth0", "index": 2, "state": "up", "addrs": ["192.168.0.10/24"]}],
            "route_info": [{"dst": "192.168.0.0/24", "oif_name": "eth0", "scope": "link"}],
            "conn_stats": [{"local_ip": "0.0.0.0", "local_port": 22, "state": "listen"}]
        }"#,
    )
    .expect("json");
    assert_eq!(info.interfaces[0].addrs[0].to_string(), "192.168.0.10/24");
    assert_eq!(info.route_info[0].table, RT_TABLE_MAIN);
    assert_eq!(info.conn_stats[0].state, SockState::Listen);
    assert_eq!(info.conn_stats[0].protocol, Protocol::Tcp);
}

#[test]
fn listen_matches_wildcard_address() {
    let any = ConnStat {
        local_ip: ip("0.0.0.0"),
        local_port: 80,
        remote_ip: None,
        remote_port: 0,
        protocol: Protocol::Tcp,
        state: SockState::Listen,
    };
    assert!(any.listens_on(ip("10.244.0.3"), 80, Protocol::Tcp));
    assert!(!any.listens_on(ip("10.244.0.3"), 80, Protocol::Udp));
    assert!(!any.listens_on(ip("10.244.0.3"), 81, Protocol::Tcp));

    let established = ConnStat {
        state: SockState::Establish,
        ..any
    };
    assert!(!established.listens_on(ip("10.244.0.3"), 80, Protocol::Tcp));
}

#[test]
fn default_iface_lookup_order() {
    let ifaces = vec![named("lo", 1), named("ens3", 2), named("eth0", 3)];
    assert_eq!(lookup_default_iface_name(&ifaces), "eth0");

    let ifaces = vec![named("lo", 1), named("cni0", 2), named("enp0s3", 3)];
    assert_eq!(lookup_default_iface_name(&ifaces), "enp0s3");

    let ifaces = vec![named("lo", 1), named("ensX", 2), named("bond0", 3)];
    assert_eq!(lookup_default_iface_name(&ifaces), "");
}

#[test]
fn dev_sysctl_name_escapes_dots() {
    assert_eq!(dev_sysctl_name("eth0", "rp_filter"), "net.ipv4.conf.eth0.rp_filter");
    assert_eq!(dev_sysctl_name("flannel.1", "forwarding"), "net.ipv4.conf.flannel/1.forwarding");
}
