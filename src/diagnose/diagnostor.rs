use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::manager::NetNodeManager;
use crate::cluster::ClusterCache;
use crate::error::{Error, Result};
use crate::model::{
    Endpoint, EndpointType, Graph, Hop, NetNodeType, PacketPath, Protocol, Suspicion, Transmission,
};
use crate::plugin::{NetNodeAction, NetworkPolicyHandler};

/// 一次诊断的结果
#[derive(Debug)]
pub struct Diagnosis {
    /// 与具体节点无关的结论（网络策略）
    pub suspicions: Vec<Suspicion>,
    pub path: PacketPath,
    /// 遍历被中途打断时的原因，此时 `path` 只包含已走过的部分
    pub interrupted: Option<Error>,
}

pub struct Diagnostor {
    cluster: Arc<dyn ClusterCache>,
    manager: Arc<dyn NetNodeManager>,
    policy: Option<Arc<dyn NetworkPolicyHandler>>,
}

impl Diagnostor {
    pub fn new(cluster: Arc<dyn ClusterCache>, manager: Arc<dyn NetNodeManager>) -> Self {
        Self {
            cluster,
            manager,
            policy: None,
        }
    }

    pub fn with_network_policy(mut self, handler: Arc<dyn NetworkPolicyHandler>) -> Self {
        self.policy = Some(handler);
        self
    }

    fn source_hop(&self, src: &Endpoint) -> Result<Hop> {
        match src.kind {
            EndpointType::Node => {
                let node = self
                    .cluster
                    .node_by_ip(src.ip)?
                    .ok_or_else(|| Error::NotFound(format!("node with ip {}", src.ip)))?;
                Ok(Hop::new(NetNodeType::Node, &node.name))
            }
            EndpointType::Pod => Ok(Hop::new(NetNodeType::Pod, src.ip.to_string())),
            _ => Ok(Hop::new(NetNodeType::Generic, src.ip.to_string())),
        }
    }

    fn check_network_policy(
        &self,
        src: &Endpoint,
        dst: &Endpoint,
        protocol: Protocol,
    ) -> Vec<Suspicion> {
        let Some(handler) = &self.policy else {
            return Vec::new();
        };
        handler
            .check_network_policy(src, dst, protocol)
            .unwrap_or_else(|e| {
                error!(error = %e, "network policy check failed");
                Vec::new()
            })
    }

    /// 从 `src` 向 `dst` 发包并逐跳模拟。
    ///
    /// 源节点无法发出时返回只含源节点的路径；某一跳接收失败时停止遍历并带回已有路径。
    /// 只有源节点解析失败和内部不变量被破坏时返回 `Err`。
    #[tracing::instrument(skip_all, fields(src = %src, dst = %dst, protocol = %protocol))]
    pub fn diagnose(
        &self,
        src: &Endpoint,
        dst: &Endpoint,
        protocol: Protocol,
    ) -> Result<Diagnosis> {
        let suspicions = self.check_network_policy(src, dst, protocol);
        let mut graph = Graph::new();
        let mut actions: HashMap<Hop, Box<dyn NetNodeAction>> = HashMap::new();

        let hop = self.source_hop(src)?;
        let mut origin = self.manager.create_net_node(&mut graph, &hop)?;
        let origin_id = origin.net_node();
        let transmissions = match origin.send(&mut graph, dst, protocol) {
            Ok(t) => t,
            Err(Error::CannotBuildTransmission { node, source }) => {
                info!(node = ?node, reason = %source, "source cannot send");
                return Ok(Diagnosis {
                    suspicions,
                    path: PacketPath::new(graph, node),
                    interrupted: None,
                });
            }
            Err(e) => return Err(e),
        };
        if transmissions.is_empty() {
            return Err(Error::Invariant(
                "unexpected zero size transmission output".to_string(),
            ));
        }
        actions.insert(hop, origin);

        let mut queue: VecDeque<Transmission> = transmissions.into();
        let mut interrupted = None;
        while let Some(trans) = queue.pop_front() {
            debug!(next_hop = %trans.next_hop, link = ?trans.link, "receive");
            match self.receive(&mut graph, &mut actions, &trans) {
                Ok(generated) => queue.extend(generated),
                Err(Error::CannotBuildTransmission { node, source }) => {
                    warn!(node = ?node, reason = %source, "branch terminated");
                }
                Err(e @ Error::Invariant(_)) => return Err(e),
                Err(e) => {
                    error!(next_hop = %trans.next_hop, error = %e, "failed do receive action");
                    interrupted = Some(e);
                    break;
                }
            }
        }

        Ok(Diagnosis {
            suspicions,
            path: PacketPath::new(graph, origin_id),
            interrupted,
        })
    }

    fn receive(
        &self,
        graph: &mut Graph,
        actions: &mut HashMap<Hop, Box<dyn NetNodeAction>>,
        trans: &Transmission,
    ) -> Result<Vec<Transmission>> {
        if !actions.contains_key(&trans.next_hop) {
            let action = self.manager.create_net_node(graph, &trans.next_hop)?;
            actions.insert(trans.next_hop.clone(), action);
        }
        let action = actions
            .get_mut(&trans.next_hop)
            .ok_or_else(|| Error::Invariant(format!("node {} not created", trans.next_hop)))?;
        action.receive(graph, trans.link)
    }
}
