//! Notify order — dependency ranking of object types.
//!
//! Objects reference other objects by key (an app instance names its app
//! and cluster instance, a cluster instance names its cloudlet and flavor).
//! A receiver must see the referenced object before the one that refers to
//! it, so types are ranked: every type ranks strictly above everything it
//! depends on. Senders and the sync dispatcher order their work by rank.
//!
//! The graph is built once from a dependency map and is read-only
//! afterwards.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::objects::{
    APP, APP_INST, APP_INST_INFO, CLOUDLET, CLOUDLET_INFO, CLUSTER_INST, CLUSTER_INST_INFO,
    FLAVOR,
};

/// `type -> [types it depends on]`.
pub type DependencyMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Default)]
struct Node {
    name: String,
    order: u32,
    depends_on: BTreeSet<usize>,
    depended_on_by: BTreeSet<usize>,
}

/// Ranked object types.
#[derive(Debug, Default)]
pub struct NotifyOrder {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl NotifyOrder {
    /// Build the ranking from `deps`. A cycle (including a type that
    /// depends on itself) is an error.
    pub fn new(deps: &DependencyMap) -> CacheResult<Self> {
        let mut order = Self::default();
        for (typ, dep_types) in deps {
            let node = order.node_id(typ);
            for dep_type in dep_types {
                let dep = order.node_id(dep_type);
                order.nodes[node].depends_on.insert(dep);
                order.nodes[dep].depended_on_by.insert(node);
                let mut path = Vec::new();
                order.propagate(dep, &mut path)?;
            }
        }
        debug!(types = order.nodes.len(), "notify order built");
        Ok(order)
    }

    fn node_id(&mut self, name: &str) -> usize {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_string(),
            ..Default::default()
        });
        self.index.insert(name.to_string(), id);
        id
    }

    /// Push `id`'s rank into everything that depends on it.
    fn propagate(&mut self, id: usize, path: &mut Vec<usize>) -> CacheResult<()> {
        if path.contains(&id) {
            return Err(CacheError::DependencyCycle(self.nodes[id].name.clone()));
        }
        path.push(id);
        let dependents: Vec<usize> = self.nodes[id].depended_on_by.iter().copied().collect();
        for dependent in dependents {
            if dependent == id || path.contains(&dependent) {
                return Err(CacheError::DependencyCycle(
                    self.nodes[dependent].name.clone(),
                ));
            }
            if self.nodes[id].order >= self.nodes[dependent].order {
                self.nodes[dependent].order = self.nodes[id].order + 1;
                self.propagate(dependent, path)?;
            }
        }
        path.pop();
        Ok(())
    }

    /// Rank of `typ`. Unknown types rank 0.
    pub fn order(&self, typ: &str) -> u32 {
        self.index.get(typ).map_or(0, |&id| self.nodes[id].order)
    }

    /// `a` must be sent before `b`.
    pub fn less(&self, a: &str, b: &str) -> bool {
        self.order(a) < self.order(b)
    }

    /// Sort `types` by rank, keeping the relative order of equal ranks.
    pub fn sort_types<S: AsRef<str>>(&self, types: &mut [S]) {
        types.sort_by_key(|typ| self.order(typ.as_ref()));
    }

    /// Every known type, by rank then name.
    pub fn send_order(&self) -> Vec<String> {
        let mut types: Vec<&Node> = self.nodes.iter().collect();
        types.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
        types.into_iter().map(|node| node.name.clone()).collect()
    }

    pub fn depends_on(&self, typ: &str) -> Vec<String> {
        self.related(typ, |node| &node.depends_on)
    }

    pub fn depended_on_by(&self, typ: &str) -> Vec<String> {
        self.related(typ, |node| &node.depended_on_by)
    }

    fn related(&self, typ: &str, edges: impl Fn(&Node) -> &BTreeSet<usize>) -> Vec<String> {
        let Some(&id) = self.index.get(typ) else {
            return Vec::new();
        };
        let mut names: Vec<String> = edges(&self.nodes[id])
            .iter()
            .map(|&other| self.nodes[other].name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Dependencies between the controller's object types.
pub fn default_dependencies() -> DependencyMap {
    let edges: [(&str, &[&str]); 8] = [
        (FLAVOR, &[]),
        (CLOUDLET, &[FLAVOR]),
        (CLOUDLET_INFO, &[CLOUDLET]),
        (CLUSTER_INST, &[CLOUDLET, FLAVOR]),
        (CLUSTER_INST_INFO, &[CLUSTER_INST]),
        (APP, &[FLAVOR]),
        (APP_INST, &[APP, CLUSTER_INST]),
        (APP_INST_INFO, &[APP_INST]),
    ];
    edges
        .into_iter()
        .map(|(typ, deps)| {
            (
                typ.to_string(),
                deps.iter().map(|dep| dep.to_string()).collect(),
            )
        })
        .collect()
}
