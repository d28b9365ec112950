//! IPSet 快照
//!
//! 解析 `ipset save -o xml` 输出，成员按原样保存，具体怎么匹配由 iptables 的 set 模块按类型决定。

use std::collections::{BTreeSet, HashMap};

use roxmltree::{Document, Node};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSet {
    pub name: String,
    /// 如 `hash:net`、`hash:ip,port`
    pub kind: String,
    pub members: BTreeSet<String>,
}

impl IpSet {
    pub fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }
}

#[derive(Debug, Clone, Default)]
pub struct IpSetManager {
    sets: HashMap<String, IpSet>,
}

impl IpSetManager {
    pub fn new(sets: impl IntoIterator<Item = IpSet>) -> Self {
        Self {
            sets: sets.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&IpSet> {
        self.sets.get(name)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// 解析 XML；空串得到空集合
    pub fn parse(dump: &str) -> Result<Self> {
        if dump.trim().is_empty() {
            return Ok(Self::default());
        }
        let doc = Document::parse(dump).map_err(|e| Error::IpsetParse(e.to_string()))?;
        let mut sets = HashMap::new();
        for node in doc.root_element().children().filter(Node::is_element) {
            let set = parse_one(node)?;
            sets.insert(set.name.clone(), set);
        }
        Ok(Self { sets })
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == tag)
}

fn parse_one(node: Node<'_, '_>) -> Result<IpSet> {
    let name = node
        .attribute("name")
        .ok_or_else(|| Error::IpsetParse("ipset without name".to_string()))?
        .to_string();
    let kind = child(node, "type")
        .and_then(|t| t.text())
        .map(|t| t.trim().to_string())
        .ok_or_else(|| Error::IpsetParse(format!("ipset {name} without type")))?;

    let mut members = BTreeSet::new();
    if let Some(xml_members) = child(node, "members") {
        for member in xml_members
            .children()
            .filter(|c| c.is_element() && c.tag_name().name() == "member")
        {
            if let Some(elem) = child(member, "elem").and_then(|e| e.text()) {
                members.insert(elem.trim().to_string());
            }
        }
    }

    Ok(IpSet {
        name,
        kind,
        members,
    })
}
