use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::cluster::{ClusterCache, SnapshotSource};
use crate::error::{Error, Result};
use crate::model::{Graph, Hop, NetNodeType};
use crate::netstack::NetNs;
use crate::plugin::{GenericNetNode, NetNodeAction, NodeInfo, Plugin, PodInfo};

/// 按下一跳创建节点行为；节点实体建在本次诊断的 `graph` 中
pub trait NetNodeManager: Send + Sync {
    fn create_net_node(&self, graph: &mut Graph, hop: &Hop) -> Result<Box<dyn NetNodeAction>>;
}

/// pod 以 IP 为 hop id，节点以节点名为 hop id，其余地址生成只接收的通用节点。
/// 模拟出的命名空间在多次诊断之间复用。
pub struct DefaultNetNodeManager {
    cluster: Arc<dyn ClusterCache>,
    snapshots: Arc<dyn SnapshotSource>,
    plugin: Arc<dyn Plugin>,
    pods: Mutex<HashMap<String, Arc<PodInfo>>>,
    nodes: Mutex<HashMap<String, Arc<NodeInfo>>>,
}

impl DefaultNetNodeManager {
    pub fn new(
        cluster: Arc<dyn ClusterCache>,
        snapshots: Arc<dyn SnapshotSource>,
        plugin: Arc<dyn Plugin>,
    ) -> Self {
        Self {
            cluster,
            snapshots,
            plugin,
            pods: Mutex::new(HashMap::new()),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn pod_info(&self, ip: &str) -> Result<Arc<PodInfo>> {
        let mut pods = self.pods.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(info) = pods.get(ip) {
            return Ok(Arc::clone(info));
        }

        let addr = ip
            .parse()
            .map_err(|_| Error::Invariant(format!("pod hop id {ip} is not an ip address")))?;
        let meta = self
            .cluster
            .pod_by_ip(addr)?
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pod with ip {ip}")))?;
        let snapshot = self.snapshots.pod_netns(&meta.namespace, &meta.name)?;
        let info = Arc::new(PodInfo {
            meta,
            netns: NetNs::new(snapshot)?,
        });
        debug!(pod = %info.meta.key(), "pod netns loaded");
        pods.insert(ip.to_string(), Arc::clone(&info));
        Ok(info)
    }

    fn node_info(&self, name: &str) -> Result<Arc<NodeInfo>> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(info) = nodes.get(name) {
            return Ok(Arc::clone(info));
        }

        let snapshot = self.snapshots.node_netns(name)?;
        let info = Arc::new(NodeInfo {
            name: name.to_string(),
            netns: NetNs::new(snapshot.netns)?,
            sub_netns: snapshot.sub_netns,
        });
        debug!(node = name, sub_netns = info.sub_netns.len(), "node netns loaded");
        nodes.insert(name.to_string(), Arc::clone(&info));
        Ok(info)
    }
}

impl NetNodeManager for DefaultNetNodeManager {
    fn create_net_node(&self, graph: &mut Graph, hop: &Hop) -> Result<Box<dyn NetNodeAction>> {
        match hop.kind {
            NetNodeType::Pod => {
                let info = self.pod_info(&hop.id)?;
                self.plugin.create_pod(graph, info)
            }
            NetNodeType::Node => {
                let info = self.node_info(&hop.id)?;
                self.plugin.create_node(graph, info)
            }
            kind => Ok(Box::new(GenericNetNode::new(graph.node_for(kind, &hop.id)))),
        }
    }
}
