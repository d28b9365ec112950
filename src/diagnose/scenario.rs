//! 场景文件：集群对象、命名空间快照和插件配置（flannel 或 calico）

use std::fs;
use std::path::Path;
use std::sync::Arc;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::diagnostor::Diagnostor;
use super::manager::DefaultNetNodeManager;
use crate::cluster::StaticCluster;
use crate::error::Result;
use crate::plugin::{
    CalicoOptions, CalicoPlugin, FlannelOptions, FlannelPlugin, KubeNetworkPolicy, KubeProxyMode,
    KubeProxyServiceProcessor, NetworkPolicyOptions, Plugin,
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPlugin {
    #[default]
    Flannel,
    Calico,
}

impl NetworkPlugin {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkPlugin::Flannel => "flannel",
            NetworkPlugin::Calico => "calico",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub cluster_cidr: Option<IpNet>,
    pub proxy_mode: KubeProxyMode,
    pub plugin: NetworkPlugin,
    pub flannel: FlannelOptions,
    pub calico: CalicoOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub cluster: StaticCluster,
    pub config: ClusterConfig,
}

impl Scenario {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// 以所选插件、kube-proxy 和 NetworkPolicy 检查组装诊断器。
    /// flannel 未单独配置集群网段时沿用 `config.cluster_cidr`。
    pub fn into_diagnostor(self) -> Diagnostor {
        let Scenario { cluster, config } = self;
        info!(
            pods = cluster.pods.len(),
            nodes = cluster.nodes.len(),
            services = cluster.services.len(),
            policies = cluster.network_policies.len(),
            plugin = config.plugin.as_str(),
            "scenario loaded"
        );

        let cluster = Arc::new(cluster);
        let service = Arc::new(KubeProxyServiceProcessor::new(
            config.proxy_mode,
            config.cluster_cidr,
        ));
        // calico 在 pod 访问 service 时不检查 service 地址本身
        let (plugin, policy): (Arc<dyn Plugin>, NetworkPolicyOptions) = match config.plugin {
            NetworkPlugin::Flannel => {
                let mut flannel = config.flannel;
                if flannel.cluster_cidr.is_none() {
                    flannel.cluster_cidr = config.cluster_cidr;
                }
                info!(backend = flannel.backend.as_str(), "flannel plugin");
                let plugin = FlannelPlugin::new(flannel, cluster.clone(), service.clone());
                (Arc::new(plugin), NetworkPolicyOptions::default())
            }
            NetworkPlugin::Calico => {
                info!(pools = config.calico.ip_pools.len(), "calico plugin");
                let plugin = CalicoPlugin::new(config.calico, cluster.clone(), service.clone());
                let policy = NetworkPolicyOptions {
                    skip_service_address: true,
                    ..NetworkPolicyOptions::default()
                };
                (Arc::new(plugin), policy)
            }
        };
        let policy = KubeNetworkPolicy::new(cluster.clone(), service, policy);
        let manager = Arc::new(DefaultNetNodeManager::new(
            cluster.clone(),
            cluster.clone(),
            plugin,
        ));
        Diagnostor::new(cluster, manager).with_network_policy(Arc::new(policy))
    }
}
