//! 诊断图模型
//!
//! 包含数据包、端点、节点、链路、动作以及最终输出的路径。

mod action;
mod endpoint;
mod graph;
mod id;
mod link;
mod node;
mod packet;
mod path;
mod suspicion;
mod transmission;

pub use action::{Action, ActionType};
pub use endpoint::{Endpoint, EndpointType};
pub use graph::Graph;
pub use id::{LinkId, NodeId};
pub use link::{Link, LinkAttribute, LinkType};
pub use node::{NetNode, NetNodeType};
pub use packet::{Packet, Protocol};
pub use path::PacketPath;
pub use suspicion::{Suspicion, SuspicionLevel};
pub use transmission::{Hop, Transmission};
