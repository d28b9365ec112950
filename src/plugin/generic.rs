//! 非 pod/node 地址的节点：只能接收

use super::NetNodeAction;
use crate::assertions::Assertion;
use crate::error::{Error, Result};
use crate::model::{
    Action, Endpoint, Graph, LinkAttribute, LinkId, NodeId, Protocol, SuspicionLevel, Transmission,
};

const UNSUPPORTED_SOURCE: &str = "non pod/node address as source is not supported";

#[derive(Debug, Clone, Copy)]
pub struct GenericNetNode {
    node: NodeId,
}

impl GenericNetNode {
    pub fn new(node: NodeId) -> Self {
        Self { node }
    }
}

impl NetNodeAction for GenericNetNode {
    fn net_node(&self) -> NodeId {
        self.node
    }

    fn send(
        &mut self,
        graph: &mut Graph,
        _dst: &Endpoint,
        _protocol: Protocol,
    ) -> Result<Vec<Transmission>> {
        graph
            .node_mut(self.node)
            .add_suspicion(SuspicionLevel::Fatal, UNSUPPORTED_SOURCE.to_string());
        Err(Error::cannot_build(
            self.node,
            Error::Other(UNSUPPORTED_SOURCE.to_string()),
        ))
    }

    fn receive(&mut self, graph: &mut Graph, upstream: LinkId) -> Result<Vec<Transmission>> {
        graph.accept_link(upstream, self.node, LinkAttribute::Null);
        graph.node_mut(self.node).do_action(Action::serve(upstream));
        Ok(Vec::new())
    }
}
