//! 诊断入口
//!
//! `NetNodeManager` 把下一跳解析为节点行为，`Diagnostor` 从源节点出发按层 BFS 走完整条路径。

mod diagnostor;
mod manager;
mod scenario;

pub use diagnostor::{Diagnosis, Diagnostor};
pub use manager::{DefaultNetNodeManager, NetNodeManager};
pub use scenario::{ClusterConfig, NetworkPlugin, Scenario};
