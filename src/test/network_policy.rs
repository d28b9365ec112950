use crate::cluster::{
    IpBlock, LabelSelector, LabelSelectorRequirement, NamespaceMeta, NetworkPolicyMeta,
    NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicyRule, PolicyType, SelectorOperator,
    StaticCluster,
};
use crate::model::{Endpoint, EndpointType, Protocol, Suspicion, SuspicionLevel};
use crate::plugin::{
    FlannelBackend, KubeNetworkPolicy, KubeProxyMode, KubeProxyServiceProcessor,
    NetworkPolicyHandler, NetworkPolicyOptions,
};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::diagnose::{POD_A, POD_B, POD_C, SERVICE_IP, cluster, ip, run, scenario};

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn selector(pairs: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: labels(pairs),
        ..LabelSelector::default()
    }
}

fn pods(pairs: &[(&str, &str)]) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        pod_selector: Some(selector(pairs)),
        ..NetworkPolicyPeer::default()
    }
}

fn rule(peers: Vec<NetworkPolicyPeer>) -> NetworkPolicyRule {
    NetworkPolicyRule {
        ports: Vec::new(),
        peers,
    }
}

fn ingress(name: &str, app: &str, rules: Vec<NetworkPolicyRule>) -> NetworkPolicyMeta {
    NetworkPolicyMeta {
        namespace: "default".into(),
        name: name.into(),
        pod_selector: selector(&[("app", app)]),
        policy_types: vec![PolicyType::Ingress],
        ingress: rules,
        egress: Vec::new(),
    }
}

fn egress(name: &str, app: &str, rules: Vec<NetworkPolicyRule>) -> NetworkPolicyMeta {
    NetworkPolicyMeta {
        policy_types: vec![PolicyType::Egress],
        ingress: Vec::new(),
        egress: rules,
        ..ingress(name, app, Vec::new())
    }
}

/// 只放行带 `app` 标签的 pod 访问 pod b
fn allow_b_from(app: &str) -> NetworkPolicyMeta {
    let name = format!("allow-{app}");
    ingress(&name, "b", vec![rule(vec![pods(&[("app", app)])])])
}

fn denial(policy: &str, dst: &str, port: u16) -> String {
    format!("network policy default/{policy} deny the packet from {POD_A} to(tcp) {dst}:{port}")
}

fn with_policies(policies: Vec<NetworkPolicyMeta>) -> StaticCluster {
    StaticCluster {
        network_policies: policies,
        namespaces: vec![NamespaceMeta {
            name: "default".into(),
            labels: labels(&[("team", "web")]),
        }],
        ..cluster(FlannelBackend::HostGw)
    }
}

fn handler(cluster: StaticCluster, options: NetworkPolicyOptions) -> KubeNetworkPolicy {
    let cidr = "10.244.0.0/16".parse().ok();
    KubeNetworkPolicy::new(
        Arc::new(cluster),
        Arc::new(KubeProxyServiceProcessor::new(KubeProxyMode::Iptables, cidr)),
        options,
    )
}

fn check(policy: &KubeNetworkPolicy, dst: &str, kind: EndpointType, port: u16) -> Vec<String> {
    policy
        .check_network_policy(
            &Endpoint::new(ip(POD_A), EndpointType::Pod, 0),
            &Endpoint::new(ip(dst), kind, port),
            Protocol::Tcp,
        )
        .expect("check")
        .into_iter()
        .map(|s| {
            assert_eq!(s.level, SuspicionLevel::Critical);
            s.message
        })
        .collect()
}

#[test]
fn label_selector_expressions() {
    let pod = labels(&[("app", "web"), ("tier", "front")]);
    let req = |key: &str, operator, values: &[&str]| LabelSelectorRequirement {
        key: key.into(),
        operator,
        values: values.iter().map(|v| v.to_string()).collect(),
    };
    let matches = |reqs: Vec<LabelSelectorRequirement>| {
        LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: reqs,
        }
        .matches(&pod)
    };

    assert!(matches(vec![req("app", SelectorOperator::In, &["web", "api"])]).expect("in"));
    assert!(!matches(vec![req("app", SelectorOperator::NotIn, &["web"])]).expect("notin"));
    assert!(matches(vec![req("env", SelectorOperator::NotIn, &["prod"])]).expect("notin"));
    assert!(matches(vec![req("tier", SelectorOperator::Exists, &[])]).expect("exists"));
    assert!(matches(vec![req("env", SelectorOperator::DoesNotExist, &[])]).expect("dne"));
    assert!(
        !matches(vec![
            req("app", SelectorOperator::Exists, &[]),
            req("tier", SelectorOperator::In, &["back"]),
        ])
        .expect("all")
    );

    assert!(matches(vec![req("app", SelectorOperator::In, &[])]).is_err());
    assert!(matches(vec![req("app", SelectorOperator::Exists, &["web"])]).is_err());

    assert!(LabelSelector::default().is_empty());
    assert!(LabelSelector::default().matches(&pod).expect("empty"));
    assert!(!selector(&[("app", "api")]).matches(&pod).expect("labels"));
}

#[test]
fn policy_port_ranges_and_protocols() {
    let any = NetworkPolicyPort::default();
    assert!(any.contains(8080, Protocol::Tcp));
    assert!(any.contains(8080, Protocol::Ipv4));
    assert!(!any.contains(8080, Protocol::Udp));

    let dns = NetworkPolicyPort {
        protocol: Some(Protocol::Udp),
        port: Some(53),
        end_port: None,
    };
    assert!(dns.contains(53, Protocol::Udp));
    assert!(!dns.contains(54, Protocol::Udp));
    assert!(!dns.contains(53, Protocol::Tcp));

    let range = NetworkPolicyPort {
        port: Some(8000),
        end_port: Some(8100),
        ..NetworkPolicyPort::default()
    };
    assert!(range.contains(8080, Protocol::Tcp));
    assert!(!range.contains(8101, Protocol::Tcp));

    let none = NetworkPolicyPort {
        port: Some(0),
        ..NetworkPolicyPort::default()
    };
    assert!(!none.contains(0, Protocol::Tcp));
    assert!(rule(Vec::new()).contains_port(1, Protocol::Udp));
}

#[test]
fn ingress_from_other_pod_is_denied() {
    let cluster = with_policies(vec![allow_b_from("c")]);
    let policy = handler(cluster, NetworkPolicyOptions::default());
    assert_eq!(
        check(&policy, POD_B, EndpointType::Pod, 8080),
        vec![denial("allow-c", POD_B, 8080)]
    );
    // 策略不选中 pod c
    assert!(check(&policy, POD_C, EndpointType::Pod, 80).is_empty());
}

#[test]
fn ingress_from_selected_pod_is_allowed() {
    let cluster = with_policies(vec![allow_b_from("a")]);
    let policy = handler(cluster, NetworkPolicyOptions::default());
    assert!(check(&policy, POD_B, EndpointType::Pod, 8080).is_empty());
}

#[test]
fn ingress_rules_filter_on_destination_port() {
    let web_only = NetworkPolicyRule {
        ports: vec![NetworkPolicyPort {
            port: Some(80),
            ..NetworkPolicyPort::default()
        }],
        peers: Vec::new(),
    };
    let cluster = with_policies(vec![ingress("web-only", "b", vec![web_only])]);
    let policy = handler(cluster, NetworkPolicyOptions::default());
    assert!(check(&policy, POD_B, EndpointType::Pod, 80).is_empty());
    assert_eq!(check(&policy, POD_B, EndpointType::Pod, 8080).len(), 1);
}

#[test]
fn rule_without_peers_allows_everyone_and_no_rule_denies_all() {
    let open = with_policies(vec![ingress("open", "b", vec![rule(Vec::new())])]);
    assert!(check(&handler(open, Default::default()), POD_B, EndpointType::Pod, 8080).is_empty());

    let closed = with_policies(vec![ingress("closed", "b", Vec::new())]);
    assert_eq!(
        check(&handler(closed, Default::default()), POD_B, EndpointType::Pod, 8080).len(),
        1
    );
}

#[test]
fn egress_ip_block_honours_except() {
    let block = NetworkPolicyPeer {
        ip_block: Some(IpBlock {
            cidr: "10.244.0.0/16".parse().expect("cidr"),
            except: vec!["10.244.1.0/24".parse().expect("cidr")],
        }),
        ..NetworkPolicyPeer::default()
    };
    let cluster = with_policies(vec![egress("egress-a", "a", vec![rule(vec![block])])]);

    let policy = handler(cluster.clone(), NetworkPolicyOptions::default());
    assert!(check(&policy, POD_B, EndpointType::Pod, 8080).is_empty());
    assert_eq!(
        check(&policy, POD_C, EndpointType::Pod, 80),
        vec![denial("egress-a", POD_C, 80)]
    );

    // 忽略 ipBlock 时集群内的 pod 都不在放行范围
    let omit = NetworkPolicyOptions {
        omit_ip_block_in_cluster: true,
        ..NetworkPolicyOptions::default()
    };
    let policy = handler(cluster, omit);
    assert_eq!(check(&policy, POD_B, EndpointType::Pod, 8080).len(), 1);
    assert_eq!(check(&policy, POD_C, EndpointType::Pod, 80).len(), 1);
}

#[test]
fn namespace_selector_matches_namespace_labels() {
    let by_namespace = |pairs: &[(&str, &str)]| NetworkPolicyPeer {
        namespace_selector: Some(selector(pairs)),
        ..NetworkPolicyPeer::default()
    };
    let denials = |peer: NetworkPolicyPeer| {
        let cluster = with_policies(vec![ingress("ns", "b", vec![rule(vec![peer])])]);
        check(&handler(cluster, Default::default()), POD_B, EndpointType::Pod, 8080).len()
    };

    assert_eq!(denials(by_namespace(&[("team", "web")])), 0);
    assert_eq!(denials(by_namespace(&[("team", "db")])), 1);
    assert_eq!(denials(by_namespace(&[])), 0);

    // 两个选择器同时给出时须同时满足
    let both = NetworkPolicyPeer {
        pod_selector: Some(selector(&[("app", "c")])),
        ..by_namespace(&[("team", "web")])
    };
    assert_eq!(denials(both), 1);
}

#[test]
fn policy_in_other_namespace_does_not_apply() {
    let mut policy = ingress("deny-b", "b", Vec::new());
    policy.namespace = "prod".into();
    let policy = handler(with_policies(vec![policy]), Default::default());
    assert!(check(&policy, POD_B, EndpointType::Pod, 8080).is_empty());
}

#[test]
fn service_is_checked_against_each_backend() {
    let cluster = with_policies(vec![allow_b_from("c"), egress("egress-a", "a", Vec::new())]);

    let policy = handler(cluster.clone(), NetworkPolicyOptions::default());
    assert_eq!(
        check(&policy, SERVICE_IP, EndpointType::Service, 80),
        vec![
            denial("egress-a", POD_B, 8080),
            denial("allow-c", POD_B, 8080),
            denial("egress-a", SERVICE_IP, 80),
        ]
    );

    let skip = NetworkPolicyOptions {
        skip_service_address: true,
        ..NetworkPolicyOptions::default()
    };
    let policy = handler(cluster, skip);
    assert_eq!(check(&policy, SERVICE_IP, EndpointType::Service, 80).len(), 2);
}

#[test]
fn service_backed_by_itself_is_error() {
    let mut cluster = with_policies(Vec::new());
    cluster.services[0].endpoints[0].ip = ip(SERVICE_IP);
    let policy = handler(cluster, NetworkPolicyOptions::default());
    let result = policy.check_network_policy(
        &Endpoint::new(ip(POD_A), EndpointType::Pod, 0),
        &Endpoint::new(ip(SERVICE_IP), EndpointType::Service, 80),
        Protocol::Tcp,
    );
    assert!(result.is_err());
}

#[test]
fn policy_json_accepts_from_and_to() {
    let policy: NetworkPolicyMeta = serde_json::from_str(
        r#"{
            "namespace": "default",
            "name": "db",
            "pod_selector": {"match_labels": {"app": "db"}},
            "policy_types": ["Ingress", "Egress"],
            "ingress": [{"from": [{"pod_selector": {"match_labels": {"app": "web"}}}],
                         "ports": [{"protocol": "tcp", "port": 5432}]}],
            "egress": [{"to": [{"ip_block": {"cidr": "10.0.0.0/8"}}]}]
        }"#,
    )
    .expect("policy");
    assert_eq!(policy.key(), "default/db");
    assert!(policy.has_policy_type(PolicyType::Egress));
    assert_eq!(policy.ingress[0].peers, vec![pods(&[("app", "web")])]);
    assert!(policy.ingress[0].contains_port(5432, Protocol::Tcp));
    assert!(!policy.ingress[0].contains_port(5433, Protocol::Tcp));
    let block = policy.egress[0].peers[0].ip_block.as_ref().expect("ip block");
    assert!(block.contains(ip("10.1.2.3")));
}

#[test]
fn diagnosis_reports_policy_denial() {
    let cluster = with_policies(vec![allow_b_from("c")]);
    let d = run(
        scenario(cluster, FlannelBackend::HostGw),
        POD_A,
        POD_B,
        EndpointType::Pod,
        8080,
    );
    assert_eq!(
        d.suspicions,
        vec![Suspicion::new(
            SuspicionLevel::Critical,
            denial("allow-c", POD_B, 8080)
        )]
    );
    // 策略不影响路径
    assert_eq!(d.path.links().count(), 2);
}
