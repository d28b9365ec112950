use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "skoop-rs-{prefix}-{}-{nanos}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn write_file(dir: &PathBuf, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write temp file");
    path
}

/// 单节点 host-gw：pod a (10.244.0.2) 与 pod b (10.244.0.3, 监听 8080) 同在 node1
const SCENARIO: &str = r#"
{
    "cluster": {
        "nodes": [
            {
                "name": "node1",
                "addresses": ["192.168.0.10"],
                "pod_cidr": "10.244.0.0/24",
                "annotations": {
                    "flannel.alpha.coreos.com/public-ip": "192.168.0.10",
                    "flannel.alpha.coreos.com/backend-type": "host-gw"
                },
                "conditions": [ { "type": "Ready", "status": "True" } ]
            }
        ],
        "pods": [
            { "namespace": "default", "name": "a", "ip": "10.244.0.2", "node_name": "node1",
              "containers": [ { "name": "app", "ready": true } ] },
            { "namespace": "default", "name": "b", "ip": "10.244.0.3", "node_name": "node1",
              "containers": [ { "name": "app", "ready": true } ] }
        ],
        "node_netns": {
            "node1": {
                "netns_id": "node1-host",
                "interfaces": [
                    { "name": "lo", "index": 1, "mtu": 65536, "state": "up" },
                    { "name": "eth0", "index": 2, "mtu": 1500, "state": "up", "addrs": ["192.168.0.10/24"] },
                    { "name": "cni0", "index": 3, "mtu": 1500, "driver": "bridge", "state": "up", "addrs": ["10.244.0.1/24"] },
                    { "name": "veth-a", "index": 10, "mtu": 1500, "driver": "veth", "state": "up", "master_index": 3 },
                    { "name": "veth-b", "index": 11, "mtu": 1500, "driver": "veth", "state": "up", "master_index": 3 }
                ],
                "sysctl_info": {
                    "net.bridge.bridge-nf-call-iptables": "1",
                    "net.ipv4.ip_forward": "1",
                    "net.ipv4.conf.cni0.forwarding": "1",
                    "net.ipv4.conf.eth0.forwarding": "1"
                },
                "route_info": [
                    { "dst": "10.244.0.0/24", "oif_name": "cni0", "scope": "link" },
                    { "dst": "192.168.0.0/24", "oif_name": "eth0", "scope": "link" },
                    { "dst": "0.0.0.0/0", "oif_name": "eth0", "gw": "192.168.0.1" }
                ]
            }
        },
        "pod_netns": {
            "default/a": {
                "interfaces": [
                    { "name": "lo", "index": 1, "mtu": 65536, "state": "up" },
                    { "name": "eth0", "index": 2, "mtu": 1500, "driver": "veth", "state": "up",
                      "addrs": ["10.244.0.2/24"], "peer_index": 10 }
                ],
                "route_info": [
                    { "dst": "10.244.0.0/24", "oif_name": "eth0", "scope": "link" },
                    { "dst": "0.0.0.0/0", "oif_name": "eth0", "gw": "10.244.0.1" }
                ]
            },
            "default/b": {
                "interfaces": [
                    { "name": "lo", "index": 1, "mtu": 65536, "state": "up" },
                    { "name": "eth0", "index": 2, "mtu": 1500, "driver": "veth", "state": "up",
                      "addrs": ["10.244.0.3/24"], "peer_index": 11 }
                ],
                "route_info": [
                    { "dst": "10.244.0.0/24", "oif_name": "eth0", "scope": "link" },
                    { "dst": "0.0.0.0/0", "oif_name": "eth0", "gw": "10.244.0.1" }
                ],
                "conn_stats": [
                    { "local_ip": "0.0.0.0", "local_port": 8080, "protocol": "tcp", "state": "listen" }
                ]
            }
        }
    },
    "config": {
        "cluster_cidr": "10.244.0.0/16",
        "flannel": { "backend": "host-gw" }
    }
}
"#;

fn run_diagnose(dir: &PathBuf, extra: &[&str]) -> Output {
    let scenario = write_file(dir, "scenario.json", SCENARIO);
    let mut args = vec![
        "--scenario",
        scenario.to_str().unwrap(),
        "--src",
        "10.244.0.2",
        "--dst",
        "10.244.0.3",
    ];
    args.extend_from_slice(extra);
    Command::new(env!("CARGO_BIN_EXE_skoop_diagnose"))
        .args(&args)
        .output()
        .expect("run skoop_diagnose")
}

fn fatal_count(report: &Value) -> usize {
    report["nodes"]
        .as_array()
        .map(|nodes| {
            nodes
                .iter()
                .flat_map(|n| n["suspicions"].as_array().cloned().unwrap_or_default())
                .filter(|s| s["level"] == "FATAL")
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn diagnose_json_reports_clean_path() {
    let dir = unique_temp_dir("diagnose-json");
    let output = run_diagnose(&dir, &["--dport", "8080", "--format", "json"]);
    assert!(
        output.status.success(),
        "skoop_diagnose failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    let v: Value = serde_json::from_slice(&output.stdout).expect("parse report");
    let links = v["links"].as_array().expect("links");
    assert_eq!(links.len(), 2);
    assert_eq!(links[1]["action"], "serve");
    assert_eq!(fatal_count(&v), 0, "unexpected fatal: {v}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn diagnose_json_flags_missing_listener() {
    let dir = unique_temp_dir("diagnose-listen");
    let output = run_diagnose(&dir, &["--dport", "80", "--format", "json"]);
    assert!(output.status.success());

    let v: Value = serde_json::from_slice(&output.stdout).expect("parse report");
    assert_eq!(fatal_count(&v), 1);
    let b = v["nodes"]
        .as_array()
        .and_then(|nodes| nodes.iter().find(|n| n["id"] == "default/b"))
        .expect("pod b in report");
    assert_eq!(
        b["suspicions"][0]["message"],
        "no process listening on 0.0.0.0:80 or 10.244.0.3:80 protocol tcp"
    );

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn diagnose_text_and_dot_output() {
    let dir = unique_temp_dir("diagnose-text");
    let output = run_diagnose(&dir, &["--dport", "8080"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("nodes:\n"), "stdout={stdout}");
    assert!(stdout.contains("links:\n"));

    let output = run_diagnose(&dir, &["--dport", "8080", "--format", "dot"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("digraph {\n"));
    assert!(stdout.contains("arrowhead=\"dot\""));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn missing_scenario_file_fails() {
    let dir = unique_temp_dir("diagnose-missing");
    let output = Command::new(env!("CARGO_BIN_EXE_skoop_diagnose"))
        .args([
            "--scenario",
            dir.join("nope.json").to_str().unwrap(),
            "--src",
            "10.244.0.2",
            "--dst",
            "10.244.0.3",
        ])
        .output()
        .expect("run skoop_diagnose");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("error: IO error"));

    let _ = fs::remove_dir_all(&dir);
}
