use clap::{Parser, ValueEnum};
use ipnet::IpNet;
use skoop_rs::cluster::ClusterCache;
use skoop_rs::diagnose::{NetworkPlugin, Scenario};
use skoop_rs::model::{Endpoint, EndpointType, Protocol};
use skoop_rs::plugin::{FlannelBackend, KubeProxyMode};
use skoop_rs::report::Report;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Dot,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "skoop-diagnose",
    about = "Diagnose the packet path between two endpoints of a cluster scenario"
)]
struct Args {
    /// Path to scenario.json (cluster objects, netns snapshots, plugin config)
    #[arg(long)]
    scenario: PathBuf,

    /// Source address
    #[arg(long)]
    src: IpAddr,

    /// Destination address
    #[arg(long)]
    dst: IpAddr,

    /// Destination port
    #[arg(long, default_value_t = 0)]
    dport: u16,

    /// Protocol: tcp, udp or ipv4
    #[arg(long, default_value = "tcp")]
    protocol: Protocol,

    /// Source endpoint type; looked up in the cluster when omitted
    #[arg(long, value_enum)]
    src_type: Option<EndpointType>,

    /// Destination endpoint type; looked up in the cluster when omitted
    #[arg(long, value_enum)]
    dst_type: Option<EndpointType>,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Override cluster pod CIDR
    #[arg(long)]
    cluster_cidr: Option<IpNet>,

    /// Override kube-proxy mode
    #[arg(long, value_enum)]
    proxy_mode: Option<KubeProxyMode>,

    /// Override network plugin
    #[arg(long, value_enum)]
    network_plugin: Option<NetworkPlugin>,

    /// Override flannel backend type
    #[arg(long, value_enum)]
    flannel_backend_type: Option<FlannelBackend>,

    /// Override flannel bridge name
    #[arg(long)]
    flannel_bridge: Option<String>,

    /// Override flannel host interface
    #[arg(long)]
    flannel_host_interface: Option<String>,

    /// Override pod MTU (0 picks the backend default)
    #[arg(long)]
    flannel_pod_mtu: Option<u32>,

    /// Override flannel ip-masq
    #[arg(long)]
    flannel_ip_masq: Option<bool>,

    /// Override calico host interface
    #[arg(long)]
    calico_host_interface: Option<String>,

    /// Override calico host MTU
    #[arg(long)]
    calico_host_mtu: Option<u32>,

    /// Override calico pod MTU in BGP mode
    #[arg(long)]
    calico_pod_mtu: Option<u32>,

    /// Override calico pod MTU in IPIP mode
    #[arg(long)]
    calico_ipip_pod_mtu: Option<u32>,
}

fn apply_overrides(scenario: &mut Scenario, args: &Args) {
    let config = &mut scenario.config;
    if let Some(cidr) = args.cluster_cidr {
        config.cluster_cidr = Some(cidr);
        config.flannel.cluster_cidr = Some(cidr);
    }
    if let Some(mode) = args.proxy_mode {
        config.proxy_mode = mode;
    }
    if let Some(plugin) = args.network_plugin {
        config.plugin = plugin;
    }
    if let Some(backend) = args.flannel_backend_type {
        config.flannel.backend = backend;
    }
    if let Some(bridge) = &args.flannel_bridge {
        config.flannel.bridge = bridge.clone();
    }
    if let Some(iface) = &args.flannel_host_interface {
        config.flannel.interface = iface.clone();
    }
    if let Some(mtu) = args.flannel_pod_mtu {
        config.flannel.pod_mtu = mtu;
    }
    if let Some(masq) = args.flannel_ip_masq {
        config.flannel.ip_masq = masq;
    }
    if let Some(iface) = &args.calico_host_interface {
        config.calico.interface = iface.clone();
    }
    if let Some(mtu) = args.calico_host_mtu {
        config.calico.host_mtu = mtu;
    }
    if let Some(mtu) = args.calico_pod_mtu {
        config.calico.pod_mtu = mtu;
    }
    if let Some(mtu) = args.calico_ipip_pod_mtu {
        config.calico.ipip_pod_mtu = mtu;
    }
}

fn endpoint(
    cluster: &dyn ClusterCache,
    ip: IpAddr,
    kind: Option<EndpointType>,
    port: u16,
) -> skoop_rs::Result<Endpoint> {
    let kind = match kind {
        Some(kind) => kind,
        None => cluster.ip_type(ip)?,
    };
    Ok(Endpoint::new(ip, kind, port))
}

fn run(args: &Args) -> skoop_rs::Result<String> {
    let mut scenario = Scenario::load(&args.scenario)?;
    apply_overrides(&mut scenario, args);

    let src = endpoint(&scenario.cluster, args.src, args.src_type, 0)?;
    let dst = endpoint(&scenario.cluster, args.dst, args.dst_type, args.dport)?;
    info!(src = %src, dst = %dst, protocol = %args.protocol, "diagnose");

    let diagnostor = scenario.into_diagnostor();
    let diagnosis = diagnostor.diagnose(&src, &dst, args.protocol)?;
    let out = match args.format {
        OutputFormat::Dot => diagnosis.path.to_dot(),
        OutputFormat::Text => Report::new(&diagnosis).to_text(),
        OutputFormat::Json => serde_json::to_string_pretty(&Report::new(&diagnosis))?,
    };
    Ok(out)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(out) => {
            print!("{out}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "diagnose failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
