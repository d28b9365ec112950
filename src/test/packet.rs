use crate::model::{Packet, PacketPath, Graph, NetNodeType, Protocol};
use std::net::IpAddr;

fn ip(s: &str) -> IpAddr {
    s.parse().expect("ip")
}

fn tcp(src: &str, dst: &str, dport: u16) -> Packet {
    let mut pkt = Packet::new(ip(dst), dport, Protocol::Tcp);
    pkt.src = ip(src);
    pkt.sport = 34567;
    pkt
}

#[test]
fn packet_new_leaves_source_unspecified() {
    let pkt = Packet::new(ip("10.0.0.1"), 80, Protocol::Udp);
    assert!(pkt.src.is_unspecified());
    assert_eq!(pkt.sport, 0);
    assert_eq!(pkt.mark, 0);
    assert!(!pkt.is_encapsulated());
}

#[test]
fn packet_deep_copy_isolates_encap_chain() {
    let inner = tcp("10.244.0.2", "10.244.1.2", 80);
    let outer = inner.encapsulate(ip("192.168.0.10"), ip("192.168.0.11"), 8472, Protocol::Udp);

    let mut copy = outer.deep_copy();
    copy.dst = ip("192.168.0.99");
    copy.mark = 0x4000;
    if let Some(encap) = copy.encap.as_mut() {
        encap.dst = ip("10.244.9.9");
        encap.dport = 8080;
    }

    assert_eq!(outer.dst, ip("192.168.0.11"));
    assert_eq!(outer.mark, 0);
    let original_inner = outer.encap.as_deref().expect("inner packet");
    assert_eq!(original_inner, &inner);
    assert_eq!(original_inner.dport, 80);
}

#[test]
fn packet_reply_swaps_endpoints() {
    let mut pkt = tcp("10.244.0.2", "10.96.0.10", 443);
    pkt.mark = 0x1;
    let reply = pkt.reply();
    assert_eq!(reply.src, ip("10.96.0.10"));
    assert_eq!(reply.dst, ip("10.244.0.2"));
    assert_eq!(reply.sport, 443);
    assert_eq!(reply.dport, 34567);
    assert_eq!(reply.protocol, Protocol::Tcp);
    assert_eq!(reply.mark, 0);
}

#[test]
fn packet_encapsulate_wraps_inner() {
    let inner = tcp("10.244.0.2", "10.244.1.2", 80);
    let outer = inner.encapsulate(ip("192.168.0.10"), ip("192.168.0.11"), 8472, Protocol::Udp);
    assert!(outer.is_encapsulated());
    assert_eq!(outer.protocol, Protocol::Udp);
    assert_eq!(outer.dport, 8472);
    assert_eq!(outer.to_string(), "udp 192.168.0.10:34567->192.168.0.11:8472 [0]");
}

#[test]
fn protocol_parses_case_insensitive() {
    assert_eq!("TCP".parse::<Protocol>().expect("tcp"), Protocol::Tcp);
    assert_eq!("udp".parse::<Protocol>().expect("udp"), Protocol::Udp);
    assert_eq!("ip".parse::<Protocol>().expect("ip"), Protocol::Ipv4);
    assert!("sctp".parse::<Protocol>().is_err());
}

#[test]
fn packet_path_of_silent_origin_has_only_origin() {
    let mut graph = Graph::new();
    let origin = graph.node_for(NetNodeType::Pod, "default/a");
    let path = PacketPath::new(graph, origin);
    assert_eq!(path.links().count(), 0);
    assert_eq!(path.nodes(), vec![origin]);
    assert_eq!(path.to_dot(), "digraph {\n}\n");
}
