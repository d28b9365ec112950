use crate::cluster::{
    ContainerStatus, EndpointAddress, NodeCondition, NodeMeta, PodMeta, ServiceMeta, ServicePort,
    ServiceType, StaticCluster, TrafficPolicy,
};
use crate::diagnose::{ClusterConfig, DefaultNetNodeManager, Diagnosis, Diagnostor, Scenario};
use crate::error::Result;
use crate::model::{
    ActionType, Endpoint, EndpointType, LinkType, Packet, Protocol, Suspicion, SuspicionLevel,
};
use crate::netstack::{
    ConnStat, Interface, LinkState, Neigh, NetNsInfo, NudState, Route, RouteType, Scope, SockState,
};
use crate::plugin::{
    FlannelBackend, FlannelOptions, FlannelPlugin, InfraShim, KubeProxyMode,
    KubeProxyServiceProcessor, NetworkPolicyHandler,
};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

pub(super) fn ip(s: &str) -> IpAddr {
    s.parse().expect("ip")
}

fn iface(name: &str, index: u32, driver: &str, mtu: u32) -> Interface {
    Interface {
        name: name.to_string(),
        index,
        mtu,
        driver: driver.to_string(),
        state: LinkState::Up,
        ..Interface::default()
    }
}

fn route(dst: &str, dev: &str, gw: Option<&str>, scope: Scope) -> Route {
    Route {
        gw: gw.map(ip),
        scope,
        ..Route::new(dst.parse().expect("net"), dev)
    }
}

fn listen(port: u16) -> ConnStat {
    ConnStat {
        local_ip: ip("0.0.0.0"),
        local_port: port,
        remote_ip: None,
        remote_port: 0,
        protocol: Protocol::Tcp,
        state: SockState::Listen,
    }
}

/// 一台 flannel 节点以及它唯一的对端节点
struct HostFixture<'a> {
    name: &'a str,
    addr: &'a str,
    pod_cidr: &'a str,
    gateway: &'a str,
    peer_cidr: &'a str,
    peer_addr: &'a str,
    peer_vtep: &'a str,
    /// (veth 名, 序号)
    veths: &'a [(&'a str, u32)],
}

fn node_meta(host: &HostFixture<'_>, backend: FlannelBackend) -> NodeMeta {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        "flannel.alpha.coreos.com/public-ip".to_string(),
        host.addr.to_string(),
    );
    annotations.insert(
        "flannel.alpha.coreos.com/backend-type".to_string(),
        backend.as_str().to_string(),
    );
    NodeMeta {
        name: host.name.to_string(),
        addresses: vec![ip(host.addr)],
        pod_cidr: Some(host.pod_cidr.parse().expect("cidr")),
        annotations,
        conditions: vec![NodeCondition {
            kind: "Ready".into(),
            status: "True".into(),
            message: "kubelet is posting ready status".into(),
        }],
    }
}

fn node_netns(host: &HostFixture<'_>, backend: FlannelBackend) -> NetNsInfo {
    let mut eth0 = iface("eth0", 2, "", 1500);
    eth0.addrs = vec![format!("{}/24", host.addr).parse().expect("net")];
    let mut cni0 = iface("cni0", 3, "bridge", 1500);
    cni0.addrs = vec![format!("{}/24", host.gateway).parse().expect("net")];
    let mut interfaces = vec![iface("lo", 1, "", 65536), eth0, cni0];
    for (name, index) in host.veths {
        interfaces.push(Interface {
            master_index: 3,
            ..iface(name, *index, "veth", 1500)
        });
    }

    let mut sysctl_info: BTreeMap<String, String> = [
        ("net.bridge.bridge-nf-call-iptables", "1"),
        ("net.ipv4.ip_forward", "1"),
        ("net.ipv4.conf.cni0.forwarding", "1"),
        ("net.ipv4.conf.eth0.forwarding", "1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let mut route_info = vec![
        route(host.pod_cidr, "cni0", None, Scope::Link),
        route("192.168.0.0/24", "eth0", None, Scope::Link),
        route("0.0.0.0/0", "eth0", Some("192.168.0.1"), Scope::Universe),
    ];
    match backend {
        FlannelBackend::Vxlan => {
            let mac = "0a:58:0a:f4:00:01";
            interfaces.push(Interface {
                neigh_info: vec![Neigh {
                    link_index: 4,
                    state: NudState::PERMANENT,
                    ip: Some(ip(host.peer_vtep)),
                    hardware_addr: mac.into(),
                }],
                fdb_info: vec![Neigh {
                    link_index: 4,
                    state: NudState::PERMANENT,
                    ip: Some(ip(host.peer_addr)),
                    hardware_addr: mac.into(),
                }],
                ..iface("flannel.1", 4, "vxlan", 1450)
            });
            sysctl_info.insert("net.ipv4.conf.flannel/1.forwarding".into(), "1".into());
            route_info.push(route(
                host.peer_cidr,
                "flannel.1",
                Some(host.peer_vtep),
                Scope::Universe,
            ));
        }
        _ => route_info.push(route(
            host.peer_cidr,
            "eth0",
            Some(host.peer_addr),
            Scope::Universe,
        )),
    }

    NetNsInfo {
        netns: "/proc/1/ns/net".into(),
        netns_id: format!("{}-host", host.name),
        interfaces,
        sysctl_info,
        route_info,
        conn_stats: vec![listen(10250)],
        ..NetNsInfo::default()
    }
}

fn pod_meta(name: &str, addr: &str, node: &str) -> PodMeta {
    PodMeta {
        namespace: "default".into(),
        name: name.into(),
        ip: ip(addr),
        node_name: node.into(),
        host_network: false,
        containers: vec![ContainerStatus {
            name: "app".into(),
            ready: true,
        }],
        labels: [("app".to_string(), name.to_string())].into_iter().collect(),
    }
}

fn pod_netns(addr: &str, gateway: &str, peer_index: u32, mtu: u32, ports: &[u16]) -> NetNsInfo {
    let mut eth0 = iface("eth0", 2, "veth", mtu);
    eth0.addrs = vec![format!("{addr}/24").parse().expect("net")];
    eth0.peer_index = peer_index;
    let subnet: ipnet::IpNet = format!("{addr}/24").parse().expect("net");
    NetNsInfo {
        interfaces: vec![iface("lo", 1, "", 65536), eth0],
        route_info: vec![
            route(&subnet.trunc().to_string(), "eth0", None, Scope::Link),
            route("0.0.0.0/0", "eth0", Some(gateway), Scope::Universe),
        ],
        conn_stats: ports.iter().map(|p| listen(*p)).collect(),
        ..NetNsInfo::default()
    }
}

const NODE1: HostFixture<'static> = HostFixture {
    name: "node1",
    addr: "192.168.0.10",
    pod_cidr: "10.244.0.0/24",
    gateway: "10.244.0.1",
    peer_cidr: "10.244.1.0/24",
    peer_addr: "192.168.0.11",
    peer_vtep: "10.244.1.0",
    veths: &[("veth-a", 10), ("veth-b", 11)],
};

const NODE2: HostFixture<'static> = HostFixture {
    name: "node2",
    addr: "192.168.0.11",
    pod_cidr: "10.244.1.0/24",
    gateway: "10.244.1.1",
    peer_cidr: "10.244.0.0/24",
    peer_addr: "192.168.0.10",
    peer_vtep: "10.244.0.0",
    veths: &[("veth-c", 10)],
};

pub(super) const POD_A: &str = "10.244.0.2";
pub(super) const POD_B: &str = "10.244.0.3";
pub(super) const POD_C: &str = "10.244.1.2";
pub(super) const SERVICE_IP: &str = "10.96.0.10";

/// node1 上有 pod a、b（b 只监听 8080），node2 上有 pod c（监听 80）
pub(super) fn cluster(backend: FlannelBackend) -> StaticCluster {
    let mtu = FlannelOptions {
        backend,
        ..FlannelOptions::default()
    }
    .pod_mtu();

    let mut pods = BTreeMap::new();
    pods.insert("default/a".to_string(), pod_netns(POD_A, "10.244.0.1", 10, mtu, &[]));
    pods.insert("default/b".to_string(), pod_netns(POD_B, "10.244.0.1", 11, mtu, &[8080]));
    pods.insert("default/c".to_string(), pod_netns(POD_C, "10.244.1.1", 10, mtu, &[80]));

    let mut nodes = BTreeMap::new();
    nodes.insert("node1".to_string(), node_netns(&NODE1, backend));
    nodes.insert("node2".to_string(), node_netns(&NODE2, backend));

    StaticCluster {
        pods: vec![
            pod_meta("a", POD_A, "node1"),
            pod_meta("b", POD_B, "node1"),
            pod_meta("c", POD_C, "node2"),
        ],
        nodes: vec![node_meta(&NODE1, backend), node_meta(&NODE2, backend)],
        services: vec![web_service()],
        pod_netns: pods,
        node_netns: nodes,
        ..StaticCluster::default()
    }
}

fn web_service() -> ServiceMeta {
    ServiceMeta {
        namespace: "default".into(),
        name: "web".into(),
        kind: ServiceType::ClusterIP,
        cluster_ip: Some(ip(SERVICE_IP)),
        external_ips: Vec::new(),
        load_balancer_ips: Vec::new(),
        external_traffic_policy: TrafficPolicy::Cluster,
        ports: vec![ServicePort {
            name: "http".into(),
            protocol: Protocol::Tcp,
            port: 80,
            target_port: 8080,
            node_port: 0,
        }],
        endpoints: vec![EndpointAddress {
            ip: ip(POD_B),
            node_name: Some("node1".into()),
        }],
    }
}

pub(super) fn scenario(cluster: StaticCluster, backend: FlannelBackend) -> Scenario {
    Scenario {
        cluster,
        config: ClusterConfig {
            cluster_cidr: Some("10.244.0.0/16".parse().expect("cidr")),
            proxy_mode: KubeProxyMode::Iptables,
            flannel: FlannelOptions {
                backend,
                ..FlannelOptions::default()
            },
            ..ClusterConfig::default()
        },
    }
}

pub(super) fn run(
    scenario: Scenario,
    src: &str,
    dst: &str,
    dst_type: EndpointType,
    port: u16,
) -> Diagnosis {
    scenario
        .into_diagnostor()
        .diagnose(
            &Endpoint::new(ip(src), EndpointType::Pod, 0),
            &Endpoint::new(ip(dst), dst_type, port),
            Protocol::Tcp,
        )
        .expect("diagnose")
}

fn fatal_messages(d: &Diagnosis) -> Vec<String> {
    d.path
        .suspicions()
        .into_iter()
        .filter(|s| s.level == SuspicionLevel::Fatal)
        .map(|s| s.message)
        .collect()
}

#[test]
fn same_node_pod_without_listener() {
    let d = run(
        scenario(cluster(FlannelBackend::HostGw), FlannelBackend::HostGw),
        POD_A,
        POD_B,
        EndpointType::Pod,
        80,
    );
    assert!(d.interrupted.is_none());
    assert_eq!(d.path.links().count(), 2);
    assert_eq!(
        fatal_messages(&d),
        vec![format!("no process listening on 0.0.0.0:80 or {POD_B}:80 protocol tcp")]
    );

    let graph = d.path.graph();
    let kinds: Vec<LinkType> = d.path.links().map(|(_, l)| l.kind).collect();
    assert_eq!(kinds, vec![LinkType::Veth, LinkType::Veth]);
    let ids: Vec<&str> = d
        .path
        .nodes()
        .into_iter()
        .map(|n| graph.node(n).id.as_str())
        .collect();
    assert_eq!(ids, vec!["default/a", "node1", "default/b"]);
    let levels: Vec<usize> = d.path.links().map(|(_, l)| l.level).collect();
    assert_eq!(levels, vec![0, 1]);
}

#[test]
fn same_node_pod_with_listener_is_clean() {
    let d = run(
        scenario(cluster(FlannelBackend::HostGw), FlannelBackend::HostGw),
        POD_A,
        POD_B,
        EndpointType::Pod,
        8080,
    );
    assert_eq!(d.path.links().count(), 2);
    assert!(fatal_messages(&d).is_empty());
    let (last_id, last) = d.path.links().last().expect("last link");
    let dst = last.destination.expect("received");
    assert_eq!(
        d.path.graph().node(dst).action_of(Some(last_id)).map(|a| a.kind),
        Some(ActionType::Serve)
    );
}

#[test]
fn unreachable_route_in_source_pod_stops_at_origin() {
    let mut cluster = cluster(FlannelBackend::HostGw);
    let a = cluster.pod_netns.get_mut("default/a").expect("pod a netns");
    a.route_info.push(Route {
        kind: RouteType::Unreachable,
        ..Route::new(format!("{POD_B}/32").parse().expect("net"), "")
    });

    let d = run(
        scenario(cluster, FlannelBackend::HostGw),
        POD_A,
        POD_B,
        EndpointType::Pod,
        8080,
    );
    assert_eq!(d.path.links().count(), 0);
    assert_eq!(d.path.nodes().len(), 1);
    let fatal = fatal_messages(&d);
    assert_eq!(fatal.len(), 1);
    assert!(fatal[0].contains("unreachable"), "{}", fatal[0]);
}

#[test]
fn cross_node_host_gw_routes_via_peer_address() {
    let d = run(
        scenario(cluster(FlannelBackend::HostGw), FlannelBackend::HostGw),
        POD_A,
        POD_C,
        EndpointType::Pod,
        80,
    );
    assert!(d.interrupted.is_none());
    assert!(fatal_messages(&d).is_empty(), "{:?}", fatal_messages(&d));

    let links: Vec<_> = d.path.links().map(|(_, l)| l.clone()).collect();
    assert_eq!(links.len(), 3);
    assert_eq!(links[1].kind, LinkType::Infra);
    assert!(!links[1].packet.is_encapsulated());
    assert_eq!(links[1].packet.src, ip(POD_A));
    assert_eq!(links[1].packet.dst, ip(POD_C));
}

#[test]
fn cross_node_host_gw_missing_peer_route_is_fatal() {
    let mut cluster = cluster(FlannelBackend::HostGw);
    let node1 = cluster.node_netns.get_mut("node1").expect("node1 netns");
    node1.route_info.retain(|r| r.dst.to_string() != "10.244.1.0/24");

    let d = run(
        scenario(cluster, FlannelBackend::HostGw),
        POD_A,
        POD_C,
        EndpointType::Pod,
        80,
    );
    // 默认路由经 eth0 但没有网关 192.168.0.11
    let fatal = fatal_messages(&d);
    assert!(
        fatal.iter().any(|m| m.starts_with("invalid route")),
        "{fatal:?}"
    );
}

#[test]
fn cross_node_vxlan_encapsulates_to_peer_vtep() {
    let d = run(
        scenario(cluster(FlannelBackend::Vxlan), FlannelBackend::Vxlan),
        POD_A,
        POD_C,
        EndpointType::Pod,
        80,
    );
    assert!(d.interrupted.is_none(), "{:?}", d.interrupted);
    assert!(fatal_messages(&d).is_empty(), "{:?}", fatal_messages(&d));

    let links: Vec<_> = d.path.links().map(|(_, l)| l.clone()).collect();
    assert_eq!(links.len(), 3);
    let wire = &links[1].packet;
    assert!(wire.is_encapsulated());
    assert_eq!(wire.protocol, Protocol::Udp);
    assert_eq!(wire.dport, 8472);
    assert_eq!(wire.src, ip("192.168.0.10"));
    assert_eq!(wire.dst, ip("192.168.0.11"));
    let inner = wire.encap.as_deref().expect("inner");
    assert_eq!(inner.dst, ip(POD_C));

    // 最后一跳已解封装
    assert!(!links[2].packet.is_encapsulated());
}

#[test]
fn vxlan_fdb_pointing_elsewhere_is_critical() {
    let mut cluster = cluster(FlannelBackend::Vxlan);
    let node1 = cluster.node_netns.get_mut("node1").expect("node1 netns");
    for i in &mut node1.interfaces {
        for fdb in &mut i.fdb_info {
            fdb.ip = Some(ip("192.168.0.99"));
        }
    }
    let d = run(
        scenario(cluster, FlannelBackend::Vxlan),
        POD_A,
        POD_C,
        EndpointType::Pod,
        80,
    );
    let critical: Vec<_> = d
        .path
        .suspicions()
        .into_iter()
        .filter(|s| s.level == SuspicionLevel::Critical)
        .collect();
    assert_eq!(critical.len(), 1);
    assert!(critical[0].message.starts_with("fdb table for"));
}

#[test]
fn cluster_ip_is_balanced_to_endpoint() {
    let d = run(
        scenario(cluster(FlannelBackend::HostGw), FlannelBackend::HostGw),
        POD_A,
        SERVICE_IP,
        EndpointType::Service,
        80,
    );
    assert!(fatal_messages(&d).is_empty(), "{:?}", fatal_messages(&d));
    let links: Vec<_> = d.path.links().collect();
    assert_eq!(links.len(), 2);

    let (first, _) = links[0];
    let node1 = d.path.graph().link(first).destination.expect("node1");
    assert_eq!(
        d.path.graph().node(node1).action_of(Some(first)).map(|a| a.kind),
        Some(ActionType::Service)
    );
    let (_, to_backend) = links[1];
    assert_eq!(to_backend.packet.dst, ip(POD_B));
    assert_eq!(to_backend.packet.dport, 8080);
    assert_eq!(to_backend.packet.src, ip(POD_A));
}

#[test]
fn service_without_endpoints_is_fatal_on_node() {
    let mut cluster = cluster(FlannelBackend::HostGw);
    cluster.services[0].endpoints.clear();
    let d = run(
        scenario(cluster, FlannelBackend::HostGw),
        POD_A,
        SERVICE_IP,
        EndpointType::Service,
        80,
    );
    assert!(d.interrupted.is_none());
    assert_eq!(d.path.links().count(), 1);
    assert_eq!(
        fatal_messages(&d),
        vec!["service default/web has no valid endpoint".to_string()]
    );
}

#[test]
fn not_ready_node_is_reported() {
    let mut cluster = cluster(FlannelBackend::HostGw);
    cluster.nodes[0].conditions[0].status = "False".into();
    let d = run(
        scenario(cluster, FlannelBackend::HostGw),
        POD_A,
        POD_B,
        EndpointType::Pod,
        8080,
    );
    assert_eq!(d.path.links().count(), 2);
    assert_eq!(
        fatal_messages(&d),
        vec!["node ready status is \"False\", message: kubelet is posting ready status".to_string()]
    );
}

#[test]
fn missing_peer_annotation_interrupts_walk() {
    let mut cluster = cluster(FlannelBackend::HostGw);
    cluster.nodes[1]
        .annotations
        .remove("flannel.alpha.coreos.com/public-ip");
    let d = run(
        scenario(cluster, FlannelBackend::HostGw),
        POD_A,
        POD_C,
        EndpointType::Pod,
        80,
    );
    let reason = d.interrupted.expect("interrupted").to_string();
    assert_eq!(reason, "node node2 does not have flannel public-ip annotation");
    // pod -> node1 的链路已经走过
    assert_eq!(d.path.links().count(), 1);
}

#[test]
fn scenario_json_uses_defaults() {
    let scenario = Scenario::from_json(
        r#"{"config": {"cluster_cidr": "10.244.0.0/16", "flannel": {"backend": "vxlan"}}}"#,
    )
    .expect("scenario");
    assert!(scenario.cluster.pods.is_empty());
    assert_eq!(scenario.config.proxy_mode, KubeProxyMode::Iptables);
    assert_eq!(scenario.config.flannel.backend, FlannelBackend::Vxlan);
    assert_eq!(scenario.config.flannel.bridge, "cni0");
    assert!(scenario.config.flannel.ip_masq);
    assert_eq!(scenario.config.flannel.pod_mtu(), 1450);

    assert!(Scenario::from_json("{\"config\": {\"proxy_mode\": \"nft\"}}").is_err());
}

#[test]
fn unknown_source_pod_is_error() {
    let result = scenario(cluster(FlannelBackend::HostGw), FlannelBackend::HostGw)
        .into_diagnostor()
        .diagnose(
            &Endpoint::new(ip("10.244.0.99"), EndpointType::Pod, 0),
            &Endpoint::new(ip(POD_B), EndpointType::Pod, 80),
            Protocol::Tcp,
        );
    assert!(result.is_err());
}

struct DenyPort(u16);

impl NetworkPolicyHandler for DenyPort {
    fn check_network_policy(
        &self,
        _src: &Endpoint,
        dst: &Endpoint,
        _protocol: Protocol,
    ) -> Result<Vec<Suspicion>> {
        if dst.port == self.0 {
            return Ok(vec![Suspicion::new(
                SuspicionLevel::Fatal,
                format!("network policy denies port {}", self.0),
            )]);
        }
        Ok(Vec::new())
    }
}

struct SecurityGroup;

impl InfraShim for SecurityGroup {
    fn node_to_node(
        &self,
        src: &NodeMeta,
        oif: &str,
        dst: &NodeMeta,
        packet: &Packet,
    ) -> Result<Vec<Suspicion>> {
        Ok(vec![Suspicion::new(
            SuspicionLevel::Warning,
            format!(
                "{} -> {} via {oif}: port {} not in security group",
                src.name, dst.name, packet.dport
            ),
        )])
    }

    fn node_to_external(
        &self,
        _src: &NodeMeta,
        _oif: &str,
        _packet: &Packet,
    ) -> Result<Vec<Suspicion>> {
        Ok(Vec::new())
    }
}

#[test]
fn policy_and_infra_checks_are_collected() {
    let cluster = Arc::new(cluster(FlannelBackend::HostGw));
    let cidr = "10.244.0.0/16".parse().ok();
    let service = Arc::new(KubeProxyServiceProcessor::new(KubeProxyMode::Iptables, cidr));
    let plugin = FlannelPlugin::new(
        FlannelOptions {
            cluster_cidr: cidr,
            ..FlannelOptions::default()
        },
        cluster.clone(),
        service,
    )
    .with_infra_shim(Arc::new(SecurityGroup));
    let manager = Arc::new(DefaultNetNodeManager::new(
        cluster.clone(),
        cluster.clone(),
        Arc::new(plugin),
    ));
    let diagnostor = Diagnostor::new(cluster, manager).with_network_policy(Arc::new(DenyPort(80)));

    let d = diagnostor
        .diagnose(
            &Endpoint::new(ip(POD_A), EndpointType::Pod, 0),
            &Endpoint::new(ip(POD_C), EndpointType::Pod, 80),
            Protocol::Tcp,
        )
        .expect("diagnose");
    assert_eq!(
        d.suspicions,
        vec![Suspicion::new(SuspicionLevel::Fatal, "network policy denies port 80")]
    );
    // 网络策略不影响路径模拟
    assert_eq!(d.path.links().count(), 3);

    let graph = d.path.graph();
    let node1 = graph.find(crate::model::NetNodeType::Node, "node1").expect("node1");
    assert_eq!(
        graph.node(node1).suspicions(),
        &[Suspicion::new(
            SuspicionLevel::Warning,
            "node1 -> node2 via eth0: port 80 not in security group"
        )]
    );
    assert_eq!(graph.node_count(), 4);
    assert_eq!(graph.link_count(), 3);
}

fn with_ipvs(cluster: &mut StaticCluster, real_server: &str) {
    let node1 = cluster.node_netns.get_mut("node1").expect("node1 netns");
    node1.ipvs_info = vec![
        format!("-A -t {SERVICE_IP}:80 -s rr"),
        format!("-a -t {SERVICE_IP}:80 -r {real_server}:8080 -m -w 1"),
    ];
}

#[test]
fn ipvs_real_server_matches_endpoint() {
    let mut cluster = cluster(FlannelBackend::HostGw);
    with_ipvs(&mut cluster, POD_B);
    let mut scenario = scenario(cluster, FlannelBackend::HostGw);
    scenario.config.proxy_mode = KubeProxyMode::Ipvs;

    let d = run(scenario, POD_A, SERVICE_IP, EndpointType::Service, 80);
    assert!(d.path.suspicions().is_empty(), "{:?}", d.path.suspicions());
    assert_eq!(d.path.links().count(), 2);
}

#[test]
fn ipvs_real_server_outside_endpoints() {
    let mut cluster = cluster(FlannelBackend::HostGw);
    with_ipvs(&mut cluster, "10.244.0.9");
    let mut scenario = scenario(cluster, FlannelBackend::HostGw);
    scenario.config.proxy_mode = KubeProxyMode::Ipvs;

    let d = run(scenario, POD_A, SERVICE_IP, EndpointType::Service, 80);
    assert_eq!(
        fatal_messages(&d),
        vec![
            "validate endpoint of service default/web failed: ipvs realserver 10.244.0.9:8080 \
             is not a valid k8s service backend, which could make network issues"
                .to_string()
        ]
    );
    let warnings: Vec<String> = d
        .path
        .suspicions()
        .into_iter()
        .filter(|s| s.level == SuspicionLevel::Warning)
        .map(|s| s.message)
        .collect();
    assert_eq!(
        warnings,
        vec![format!("ipvs service {SERVICE_IP} has no endpoint {POD_B}:8080")]
    );
    // 后端仍按 endpoint 转发
    assert_eq!(d.path.links().count(), 2);
}

#[test]
fn alloc_peer_falls_back_to_local_backend() {
    let mut cluster = cluster(FlannelBackend::HostGw);
    cluster.nodes[1] = node_meta(&NODE2, FlannelBackend::Alloc);
    let d = run(
        scenario(cluster, FlannelBackend::HostGw),
        POD_A,
        POD_C,
        EndpointType::Pod,
        80,
    );
    assert!(d.interrupted.is_none(), "{:?}", d.interrupted);
    assert!(fatal_messages(&d).is_empty(), "{:?}", fatal_messages(&d));

    let links: Vec<_> = d.path.links().map(|(_, l)| l.clone()).collect();
    assert_eq!(links.len(), 3);
    assert_eq!(links[1].kind, LinkType::Infra);
    assert!(!links[1].packet.is_encapsulated());
    assert_eq!(links[1].packet.dst, ip(POD_C));
}

#[test]
fn alloc_peer_under_vxlan_expects_host_interface() {
    let mut cluster = cluster(FlannelBackend::Vxlan);
    cluster.nodes[1] = node_meta(&NODE2, FlannelBackend::Alloc);
    let d = run(
        scenario(cluster, FlannelBackend::Vxlan),
        POD_A,
        POD_C,
        EndpointType::Pod,
        80,
    );
    // 没有 vtep 时路由应走 eth0，而节点上的路由指向 flannel.1
    let fatal = fatal_messages(&d);
    assert!(
        fatal.iter().any(|m| m.starts_with("invalid route")),
        "{fatal:?}"
    );
}
