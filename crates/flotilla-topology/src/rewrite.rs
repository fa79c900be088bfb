use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use flotilla_domain::CollectionNInfo;
use tracing::info;
use uuid::Uuid;

use crate::error::TopologyError;
use crate::xml;

/// Rewrite `topo_file` so every non-root group holding a collection tracked
/// in `n_info` replicates `n_current` times. The result is written to a fresh
/// `topo_<partition>_reduced.xml` under a unique temp directory; the original
/// file is left untouched.
pub fn reduce_groups(
    topo_file: &Path,
    partition_id: &str,
    n_info: &BTreeMap<String, CollectionNInfo>,
) -> Result<PathBuf, TopologyError> {
    let content = std::fs::read_to_string(topo_file).map_err(|e| TopologyError::Io {
        path: topo_file.display().to_string(),
        source: e,
    })?;
    let mut root = xml::parse(&content)?;

    if let Some(main) = root.children.iter_mut().find(|c| c.name == "main") {
        for group in main.children.iter_mut().filter(|c| c.name == "group") {
            let reduced = group
                .children
                .iter()
                .filter(|c| c.name == "collection")
                .filter_map(|c| c.attr("name"))
                .find_map(|name| n_info.get(name).map(|i| (name.to_string(), i.n_current)));
            if let Some((collection, n_current)) = reduced {
                info!(
                    collection = %collection,
                    n = n_current,
                    "nMin: updating group replication for reduced collection"
                );
                group.set_attr("n", n_current.to_string());
            }
        }
    }

    let dir = std::env::temp_dir().join(Uuid::new_v4().to_string());
    std::fs::create_dir_all(&dir).map_err(|e| TopologyError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;
    let out_path = dir.join(format!("topo_{}_reduced.xml", partition_id));
    std::fs::write(&out_path, xml::write(&root)).map_err(|e| TopologyError::Io {
        path: out_path.display().to_string(),
        source: e,
    })?;

    info!(path = %out_path.display(), "saved reduced topology file");
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Topology;
    use flotilla_domain::CollectionNInfo;

    const TOPO: &str = r#"
<topology name="t">
    <declrequirement name="grp" type="groupname" value="g"/>
    <decltask name="w"><exe>/bin/w</exe></decltask>
    <declcollection name="C">
        <requirements><name>grp</name></requirements>
        <tasks><name>w</name></tasks>
    </declcollection>
    <main name="main">
        <group name="g" n="4"><collection name="C"/></group>
        <group name="other" n="2"><collection name="C2"/></group>
    </main>
    <declcollection name="C2"><tasks><name>w</name></tasks></declcollection>
</topology>
"#;

    #[test]
    fn rewrites_only_tracked_groups() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("topo.xml");
        std::fs::write(&src, TOPO).unwrap();

        let mut n_info = BTreeMap::new();
        n_info.insert(
            "C".to_string(),
            CollectionNInfo { n_original: 4, n_current: 3, n_min: 2, agent_group: "g".into() },
        );

        let reduced = reduce_groups(&src, "pt1", &n_info).unwrap();
        assert!(reduced.file_name().unwrap().to_str().unwrap().contains("topo_pt1_reduced"));

        let topo = Topology::load(&reduced).unwrap();
        let instances = topo
            .runtime_collections()
            .iter()
            .filter(|c| c.name == "C")
            .count();
        assert_eq!(instances, 3);
        // untracked group is untouched
        let others = topo
            .runtime_collections()
            .iter()
            .filter(|c| c.name == "C2")
            .count();
        assert_eq!(others, 2);

        // original file is unchanged
        assert_eq!(std::fs::read_to_string(&src).unwrap(), TOPO);
    }
}
