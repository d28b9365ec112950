use super::{Assertion, assert_true};
use crate::cluster::{NodeMeta, PodMeta};
use crate::model::SuspicionLevel;

pub struct KubernetesAssertion<'a> {
    sink: &'a mut dyn Assertion,
}

impl<'a> KubernetesAssertion<'a> {
    pub fn new(sink: &'a mut dyn Assertion) -> Self {
        Self { sink }
    }

    /// 没有 Ready 状态的节点不做判断
    pub fn assert_node(&mut self, node: &NodeMeta) {
        if let Some(ready) = node.ready_condition() {
            assert_true(
                self.sink,
                ready.status == "True",
                SuspicionLevel::Fatal,
                format!(
                    "node ready status is {:?}, message: {}",
                    ready.status, ready.message
                ),
            );
        }
    }

    pub fn assert_pod(&mut self, pod: &PodMeta) {
        for c in &pod.containers {
            assert_true(
                self.sink,
                c.ready,
                SuspicionLevel::Warning,
                format!("pod container {:?} is not ready.", c.name),
            );
        }
    }
}
