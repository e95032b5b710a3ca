// src/core/hive.rs

//! The hive: an in-memory tree of small, versioned configuration and state
//! nodes. Every mutation arrives through a nexus edit, so a leader and its
//! mirrors that have applied the same offset hold byte-identical trees.
//! Reads never touch the nexus and observe the latest applied state.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One node in the tree. `BTreeMap` keeps child order deterministic so the
/// serialised form is stable across nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HiveNode {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kids: BTreeMap<String, HiveNode>,
}

impl HiveNode {
    fn descend(&self, path: &[&str]) -> Option<&HiveNode> {
        let mut node = self;
        for step in path {
            node = node.kids.get(*step)?;
        }
        Some(node)
    }

    fn descend_or_create(&mut self, path: &[&str]) -> &mut HiveNode {
        let mut node = self;
        for step in path {
            node = node.kids.entry(step.to_string()).or_default();
        }
        node
    }
}

/// The tree plus its lock. Writers are already serialised by the nexus;
/// the `RwLock` only protects readers from observing a torn update.
#[derive(Debug, Default)]
pub struct Hive {
    root: RwLock<HiveNode>,
}

impl Hive {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the value at a path, if the node exists.
    pub fn get(&self, path: &[&str]) -> Option<Value> {
        let root = self.root.read();
        let node = root.descend(path)?;
        if node.value.is_null() {
            None
        } else {
            Some(node.value.clone())
        }
    }

    /// True when the node exists, even with a null value.
    pub fn exists(&self, path: &[&str]) -> bool {
        self.root.read().descend(path).is_some()
    }

    /// A typed dict view: child name → child value.
    pub fn dict(&self, path: &[&str]) -> BTreeMap<String, Value> {
        let root = self.root.read();
        let Some(node) = root.descend(path) else {
            return BTreeMap::new();
        };
        node.kids
            .iter()
            .map(|(name, kid)| (name.clone(), kid.value.clone()))
            .collect()
    }

    /// Names of the children under a path.
    pub fn kids(&self, path: &[&str]) -> Vec<String> {
        let root = self.root.read();
        match root.descend(path) {
            Some(node) => node.kids.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Sets the value at a path, creating intermediate nodes.
    /// Only the nexus apply path may call this.
    pub(crate) fn set(&self, path: &[&str], value: Value) {
        let mut root = self.root.write();
        root.descend_or_create(path).value = value;
    }

    /// Removes a node (and its subtree), returning its value.
    /// Only the nexus apply path may call this.
    pub(crate) fn pop(&self, path: &[&str]) -> Option<Value> {
        let Some((leaf, stem)) = path.split_last() else {
            return None;
        };
        let mut root = self.root.write();
        let mut node = &mut *root;
        for step in stem {
            node = node.kids.get_mut(*step)?;
        }
        node.kids.remove(*leaf).map(|kid| kid.value)
    }

    /// Serialises the whole tree. Used for snapshots and the
    /// leader/mirror equality invariant.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(&*self.root.read()).unwrap_or(Value::Null)
    }

    /// Replaces the whole tree from a snapshot.
    pub fn load(&self, snap: Value) -> Result<(), serde_json::Error> {
        let node: HiveNode = serde_json::from_value(snap)?;
        *self.root.write() = node;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_pop() {
        let hive = Hive::new();
        hive.set(&["aha", "services", "mynet", "cryo"], json!({"ready": true}));

        assert!(hive.exists(&["aha", "services", "mynet"]));
        assert_eq!(
            hive.get(&["aha", "services", "mynet", "cryo"]),
            Some(json!({"ready": true}))
        );

        let dict = hive.dict(&["aha", "services", "mynet"]);
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get("cryo").unwrap(), &json!({"ready": true}));

        assert_eq!(
            hive.pop(&["aha", "services", "mynet", "cryo"]),
            Some(json!({"ready": true}))
        );
        assert!(hive.get(&["aha", "services", "mynet", "cryo"]).is_none());
    }

    #[test]
    fn snapshot_round_trip_is_byte_stable() {
        let hive = Hive::new();
        hive.set(&["b"], json!(2));
        hive.set(&["a"], json!(1));
        hive.set(&["a", "kid"], json!("x"));

        let snap = hive.snapshot();
        let other = Hive::new();
        other.load(snap.clone()).unwrap();

        let bytes0 = serde_json::to_vec(&snap).unwrap();
        let bytes1 = serde_json::to_vec(&other.snapshot()).unwrap();
        assert_eq!(bytes0, bytes1);
    }
}
