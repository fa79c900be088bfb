use std::collections::BTreeMap;
use std::path::Path;

use crate::error::TopologyError;
use crate::xml::{self, XmlNode};

// ── Declarations ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementKind {
    GroupName,
    HostName,
    WnName,
    MaxInstancesPerHost,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub kind: RequirementKind,
    pub value: String,
}

#[derive(Debug, Clone)]
struct DeclTask {
    requirements: Vec<String>,
}

#[derive(Debug, Clone)]
struct DeclCollection {
    requirements: Vec<String>,
    tasks: Vec<String>,
}

/// One occurrence of a collection inside the main group tree.
#[derive(Debug, Clone)]
pub struct CollectionPlacement {
    pub collection: String,
    /// Enclosing group name, `None` when placed directly under the root.
    pub group: Option<String>,
    /// Replication factor of the enclosing group (1 when ungrouped).
    pub n: i32,
}

// ── Runtime view ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeTask {
    pub id: u64,
    pub name: String,
    pub path: String,
    /// 0 for tasks outside any collection.
    pub collection_id: u64,
    pub collection_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCollection {
    pub id: u64,
    pub name: String,
    pub path: String,
    /// Enclosing group name, `None` when placed directly under the root.
    pub group: Option<String>,
}

/// Parsed topology document: declarations, placements and the expanded
/// runtime view. Task and collection ids are FNV-1a hashes of the runtime
/// path, so independent readers of the same file agree on ids.
#[derive(Debug, Clone)]
pub struct Topology {
    name: String,
    root: XmlNode,
    requirements: BTreeMap<String, Requirement>,
    decl_tasks: BTreeMap<String, DeclTask>,
    decl_collections: BTreeMap<String, DeclCollection>,
    placements: Vec<CollectionPlacement>,
    runtime_tasks: Vec<RuntimeTask>,
    runtime_collections: Vec<RuntimeCollection>,
}

pub const ROOT_GROUP: &str = "main";

pub fn fnv1a64(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

impl Topology {
    pub fn load(path: &Path) -> Result<Self, TopologyError> {
        let content = std::fs::read_to_string(path).map_err(|e| TopologyError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self, TopologyError> {
        let root = xml::parse(content)?;
        if root.name != "topology" {
            return Err(TopologyError::Xml(format!(
                "expected <topology> root, found <{}>",
                root.name
            )));
        }
        let name = root.attr("name").unwrap_or_default().to_string();

        let mut requirements = BTreeMap::new();
        for req in root.children_named("declrequirement") {
            let req_name = required_attr(req, "name")?;
            let kind = match req.attr("type").unwrap_or_default() {
                "groupname" => RequirementKind::GroupName,
                "hostname" => RequirementKind::HostName,
                "wnname" => RequirementKind::WnName,
                "maxinstances" => RequirementKind::MaxInstancesPerHost,
                "custom" => RequirementKind::Custom,
                other => {
                    return Err(TopologyError::Xml(format!(
                        "declrequirement {:?} has unknown type {:?}",
                        req_name, other
                    )))
                }
            };
            requirements.insert(
                req_name.clone(),
                Requirement { name: req_name, kind, value: req.attr("value").unwrap_or_default().to_string() },
            );
        }

        let mut decl_tasks = BTreeMap::new();
        for task in root.children_named("decltask") {
            let task_name = required_attr(task, "name")?;
            decl_tasks.insert(task_name, DeclTask { requirements: requirement_refs(task) });
        }

        let mut decl_collections = BTreeMap::new();
        for col in root.children_named("declcollection") {
            let col_name = required_attr(col, "name")?;
            let tasks = col
                .child("tasks")
                .map(|t| t.children_named("name").map(|n| n.text.clone()).collect())
                .unwrap_or_default();
            decl_collections.insert(
                col_name,
                DeclCollection { requirements: requirement_refs(col), tasks },
            );
        }

        let main = root
            .child("main")
            .ok_or_else(|| TopologyError::Xml("topology has no <main> group".to_string()))?;

        let mut topo = Topology {
            name,
            root: root.clone(),
            requirements,
            decl_tasks,
            decl_collections,
            placements: Vec::new(),
            runtime_tasks: Vec::new(),
            runtime_collections: Vec::new(),
        };
        topo.expand_main(main)?;
        Ok(topo)
    }

    fn expand_main(&mut self, main: &XmlNode) -> Result<(), TopologyError> {
        for child in &main.children {
            match child.name.as_str() {
                "task" => {
                    let task_name = required_attr(child, "name")?;
                    self.ensure_task_declared(&task_name)?;
                    let path = format!("{}/{}", ROOT_GROUP, task_name);
                    self.push_runtime_task(&task_name, path, 0, String::new());
                }
                "collection" => {
                    let col_name = required_attr(child, "name")?;
                    self.expand_collection(&col_name, None, 1)?;
                }
                "group" => {
                    let group_name = required_attr(child, "name")?;
                    let n: i32 = child
                        .attr("n")
                        .unwrap_or("1")
                        .parse()
                        .map_err(|_| TopologyError::Xml(format!(
                            "group {:?} has a non-numeric n attribute",
                            group_name
                        )))?;
                    for col in child.children_named("collection") {
                        let col_name = required_attr(col, "name")?;
                        self.expand_collection(&col_name, Some(group_name.clone()), n)?;
                    }
                }
                other => {
                    return Err(TopologyError::Xml(format!(
                        "unexpected element <{}> inside <main>",
                        other
                    )))
                }
            }
        }
        Ok(())
    }

    fn expand_collection(
        &mut self,
        col_name: &str,
        group: Option<String>,
        n: i32,
    ) -> Result<(), TopologyError> {
        let decl = self
            .decl_collections
            .get(col_name)
            .ok_or_else(|| TopologyError::Xml(format!("collection {:?} is not declared", col_name)))?
            .clone();
        for task in &decl.tasks {
            self.ensure_task_declared(task)?;
        }

        self.placements.push(CollectionPlacement {
            collection: col_name.to_string(),
            group: group.clone(),
            n,
        });

        for idx in 0..n.max(1) {
            let prefix = match &group {
                Some(g) if n > 1 => format!("{}/{}_{}", ROOT_GROUP, g, idx),
                Some(g) => format!("{}/{}", ROOT_GROUP, g),
                None => ROOT_GROUP.to_string(),
            };
            let col_path = format!("{}/{}", prefix, col_name);
            let col_id = fnv1a64(&col_path);
            self.runtime_collections.push(RuntimeCollection {
                id: col_id,
                name: col_name.to_string(),
                path: col_path.clone(),
                group: group.clone(),
            });

            let mut seen: BTreeMap<&str, u32> = BTreeMap::new();
            for task in &decl.tasks {
                let occurrence = seen.entry(task.as_str()).or_insert(0);
                let task_path = if *occurrence == 0 {
                    format!("{}/{}", col_path, task)
                } else {
                    format!("{}/{}_{}", col_path, task, occurrence)
                };
                *occurrence += 1;
                self.push_runtime_task(task, task_path, col_id, col_name.to_string());
            }
        }
        Ok(())
    }

    fn push_runtime_task(
        &mut self,
        name: &str,
        path: String,
        collection_id: u64,
        collection_name: String,
    ) {
        let id = fnv1a64(&path);
        self.runtime_tasks.push(RuntimeTask {
            id,
            name: name.to_string(),
            path,
            collection_id,
            collection_name,
        });
    }

    fn ensure_task_declared(&self, name: &str) -> Result<(), TopologyError> {
        if self.decl_tasks.contains_key(name) {
            Ok(())
        } else {
            Err(TopologyError::Xml(format!("task {:?} is not declared", name)))
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &XmlNode {
        &self.root
    }

    pub fn runtime_tasks(&self) -> &[RuntimeTask] {
        &self.runtime_tasks
    }

    pub fn runtime_collections(&self) -> &[RuntimeCollection] {
        &self.runtime_collections
    }

    pub fn collection_placements(&self) -> &[CollectionPlacement] {
        &self.placements
    }

    pub fn runtime_task_by_path(&self, path: &str) -> Option<&RuntimeTask> {
        self.runtime_tasks.iter().find(|t| t.path == path)
    }

    pub fn runtime_collection_by_id(&self, id: u64) -> Option<&RuntimeCollection> {
        self.runtime_collections.iter().find(|c| c.id == id)
    }

    /// Tasks whose runtime path equals `path` or continues it at a `/`
    /// boundary.
    pub fn runtime_tasks_matching(&self, path: &str) -> Vec<&RuntimeTask> {
        self.runtime_tasks
            .iter()
            .filter(|t| {
                t.path == path
                    || (t.path.starts_with(path)
                        && t.path.as_bytes().get(path.len()) == Some(&b'/'))
            })
            .collect()
    }

    /// Resolved requirements of a declared task.
    pub fn task_requirements(&self, task_name: &str) -> Vec<&Requirement> {
        self.decl_tasks
            .get(task_name)
            .map(|t| self.resolve_requirements(&t.requirements))
            .unwrap_or_default()
    }

    /// Resolved requirements of a declared collection.
    pub fn collection_requirements(&self, col_name: &str) -> Vec<&Requirement> {
        self.decl_collections
            .get(col_name)
            .map(|c| self.resolve_requirements(&c.requirements))
            .unwrap_or_default()
    }

    fn resolve_requirements(&self, names: &[String]) -> Vec<&Requirement> {
        names.iter().filter_map(|n| self.requirements.get(n)).collect()
    }
}

fn required_attr(node: &XmlNode, attr: &str) -> Result<String, TopologyError> {
    node.attr(attr)
        .map(str::to_string)
        .ok_or_else(|| TopologyError::Xml(format!("<{}> is missing the {:?} attribute", node.name, attr)))
}

fn requirement_refs(node: &XmlNode) -> Vec<String> {
    node.child("requirements")
        .map(|reqs| reqs.children_named("name").map(|n| n.text.clone()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const TOPO: &str = r#"
<topology name="test">
    <declrequirement name="reco_group" type="groupname" value="reco"/>
    <declrequirement name="reco_zone" type="custom" value="calib"/>
    <decltask name="processor"><exe>/bin/processor</exe></decltask>
    <decltask name="sampler"><exe>/bin/sampler</exe></decltask>
    <declcollection name="RecoC">
        <requirements><name>reco_group</name></requirements>
        <tasks><name>processor</name><name>processor</name></tasks>
    </declcollection>
    <main name="main">
        <task name="sampler"/>
        <group name="recogrp" n="3">
            <collection name="RecoC"/>
        </group>
    </main>
</topology>
"#;

    #[test]
    fn expands_groups_into_runtime_instances() {
        let topo = Topology::from_str(TOPO).unwrap();
        assert_eq!(topo.name(), "test");
        assert_eq!(topo.runtime_collections().len(), 3);
        // 1 standalone sampler + 3 instances * 2 processors
        assert_eq!(topo.runtime_tasks().len(), 7);

        let paths: Vec<&str> = topo.runtime_collections().iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec![
            "main/recogrp_0/RecoC",
            "main/recogrp_1/RecoC",
            "main/recogrp_2/RecoC",
        ]);
    }

    #[test]
    fn duplicate_tasks_in_a_collection_get_indexed_paths() {
        let topo = Topology::from_str(TOPO).unwrap();
        let tasks: Vec<&str> = topo
            .runtime_tasks()
            .iter()
            .filter(|t| t.path.starts_with("main/recogrp_0/"))
            .map(|t| t.path.as_str())
            .collect();
        assert_eq!(tasks, vec![
            "main/recogrp_0/RecoC/processor",
            "main/recogrp_0/RecoC/processor_1",
        ]);
    }

    #[test]
    fn ids_are_stable_across_loads() {
        let a = Topology::from_str(TOPO).unwrap();
        let b = Topology::from_str(TOPO).unwrap();
        assert_eq!(
            a.runtime_tasks().iter().map(|t| t.id).collect::<Vec<_>>(),
            b.runtime_tasks().iter().map(|t| t.id).collect::<Vec<_>>(),
        );
    }

    #[test]
    fn path_matching_respects_segment_boundaries() {
        let topo = Topology::from_str(TOPO).unwrap();
        assert_eq!(topo.runtime_tasks_matching("main/recogrp_1").len(), 2);
        assert_eq!(topo.runtime_tasks_matching("main/recogrp").len(), 0);
        assert_eq!(topo.runtime_tasks_matching("main").len(), 7);
        assert!(topo.runtime_task_by_path("main/sampler").is_some());
    }

    #[test]
    fn standalone_tasks_carry_no_collection() {
        let topo = Topology::from_str(TOPO).unwrap();
        let sampler = topo.runtime_task_by_path("main/sampler").unwrap();
        assert_eq!(sampler.collection_id, 0);
        assert!(sampler.collection_name.is_empty());
    }

    #[test]
    fn undeclared_members_are_rejected() {
        let doc = r#"<topology name="t"><main name="main"><task name="ghost"/></main></topology>"#;
        assert!(Topology::from_str(doc).is_err());
    }

    #[test]
    fn collection_requirements_resolve_declared_entries() {
        let topo = Topology::from_str(TOPO).unwrap();
        let reqs = topo.collection_requirements("RecoC");
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].kind, RequirementKind::GroupName);
        assert_eq!(reqs[0].value, "reco");
    }
}
