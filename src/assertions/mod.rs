//! 断言层
//!
//! 把“期望配置 vs. 快照状态”的比较结果转成带级别的 suspicion，挂到节点上。
//! 断言本身从不中断诊断。

mod k8s;
mod netstack;
mod route;

pub use k8s::KubernetesAssertion;
pub use netstack::{InterfaceExpectation, NetstackAssertion};
pub use route::RouteAssertion;

use crate::model::{Suspicion, SuspicionLevel};

/// suspicion 的接收端
pub trait Assertion {
    fn add_suspicion(&mut self, level: SuspicionLevel, message: String);
}

pub fn assert_true(sink: &mut dyn Assertion, test: bool, level: SuspicionLevel, message: String) {
    if !test {
        sink.add_suspicion(level, message);
    }
}

/// 不依附节点的 suspicion 收集器（网络策略等全局检查）
#[derive(Debug, Clone, Default)]
pub struct SuspicionList(pub Vec<Suspicion>);

impl SuspicionList {
    pub fn into_inner(self) -> Vec<Suspicion> {
        self.0
    }
}

impl Assertion for SuspicionList {
    fn add_suspicion(&mut self, level: SuspicionLevel, message: String) {
        self.0.push(Suspicion { level, message });
    }
}
