//! 标识符类型
//!
//! 诊断图中节点和链路的句柄，均为单次诊断内 arena 的下标。

use serde::{Deserialize, Serialize};

/// 节点句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// 链路句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub usize);
