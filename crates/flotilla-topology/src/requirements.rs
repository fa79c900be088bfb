use std::collections::{BTreeMap, HashSet};

use flotilla_domain::{CollectionNInfo, ZoneGroup};
use tracing::{debug, error, info};

use crate::error::TopologyError;
use crate::model::{RequirementKind, Topology};

pub const EXPENDABLE_PREFIX: &str = "odc_expendable_";
pub const NCORES_PREFIX: &str = "odc_ncores_";
pub const ZONE_PREFIX: &str = "odc_zone_";
pub const NMIN_PREFIX: &str = "odc_nmin_";

/// Submission and recovery parameters derived from a topology document.
#[derive(Debug, Clone, Default)]
pub struct ExtractedRequirements {
    /// Runtime task ids whose individual failure must not fail the partition.
    pub expendable_tasks: HashSet<u64>,
    /// Per-collection nMin bookkeeping, keyed by collection name.
    pub n_info: BTreeMap<String, CollectionNInfo>,
    /// Ordered group lists per zone name.
    pub zone_infos: BTreeMap<String, Vec<ZoneGroup>>,
}

/// Walk the topology's tasks and collection placements and collect the
/// `odc_*` custom requirements.
pub fn extract(topo: &Topology) -> Result<ExtractedRequirements, TopologyError> {
    let mut out = ExtractedRequirements::default();

    for task in topo.runtime_tasks() {
        for req in topo.task_requirements(&task.name) {
            if req.kind != RequirementKind::Custom || !req.name.starts_with(EXPENDABLE_PREFIX) {
                continue;
            }
            match req.value.as_str() {
                "true" => {
                    debug!(task = task.id, path = %task.path, "task is expendable");
                    out.expendable_tasks.insert(task.id);
                }
                "false" => {
                    debug!(task = task.id, path = %task.path, "task is not expendable");
                }
                other => {
                    error!(
                        task = task.id,
                        path = %task.path,
                        value = %other,
                        "'odc_expendable_*' requirement has an unknown value, ignoring"
                    );
                }
            }
        }
    }

    for placement in topo.collection_placements() {
        let mut agent_group = String::new();
        let mut zone = String::new();
        let mut ncores: i32 = 0;
        let n = placement.n;
        let mut nmin: i32 = -1;

        for req in topo.collection_requirements(&placement.collection) {
            match req.kind {
                RequirementKind::GroupName => {
                    info!(collection = %placement.collection, value = %req.value, "requirement: GroupName");
                    agent_group = req.value.clone();
                }
                RequirementKind::HostName => {
                    info!(collection = %placement.collection, value = %req.value, "requirement: HostName");
                }
                RequirementKind::WnName => {
                    info!(collection = %placement.collection, value = %req.value, "requirement: WnName");
                }
                RequirementKind::MaxInstancesPerHost => {
                    info!(collection = %placement.collection, value = %req.value, "requirement: MaxInstancesPerHost");
                }
                RequirementKind::Custom => {
                    if req.name.starts_with(NCORES_PREFIX) {
                        ncores = parse_int(&req.name, &req.value)?;
                    } else if req.name.starts_with(ZONE_PREFIX) {
                        zone = req.value.clone();
                    } else if req.name.starts_with(NMIN_PREFIX) {
                        // nMin only applies to collections replicated by a
                        // group other than the root.
                        if placement.group.is_some() {
                            nmin = parse_int(&req.name, &req.value)?;
                        }
                    } else {
                        debug!(
                            name = %req.name,
                            value = %req.value,
                            "unknown custom requirement"
                        );
                    }
                }
            }
        }

        if !agent_group.is_empty() && nmin >= 0 {
            out.n_info
                .entry(placement.collection.clone())
                .or_insert_with(|| CollectionNInfo {
                    n_original: n,
                    n_current: n,
                    n_min: nmin,
                    agent_group: agent_group.clone(),
                });
        }

        if !agent_group.is_empty() && !zone.is_empty() {
            out.zone_infos
                .entry(zone.clone())
                .or_default()
                .push(ZoneGroup { n, ncores, agent_group: agent_group.clone() });
        }
    }

    for (zone, groups) in &out.zone_infos {
        for zg in groups {
            info!(
                zone = %zone,
                n = zg.n,
                ncores = zg.ncores,
                agent_group = %zg.agent_group,
                "zone from the topology"
            );
        }
    }
    for (name, info) in &out.n_info {
        info!(
            collection = %name,
            n_original = info.n_original,
            n_current = info.n_current,
            n_min = info.n_min,
            agent_group = %info.agent_group,
            "nMin info"
        );
    }

    Ok(out)
}

fn parse_int(name: &str, value: &str) -> Result<i32, TopologyError> {
    value.parse().map_err(|_| TopologyError::InvalidRequirement {
        name: name.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Topology;

    const TOPO: &str = r#"
<topology name="nmin">
    <declrequirement name="grp" type="groupname" value="calib"/>
    <declrequirement name="zone" type="custom" value="online"/>
    <declrequirement name="odc_nmin_c" type="custom" value="2"/>
    <declrequirement name="odc_ncores_c" type="custom" value="8"/>
    <declrequirement name="odc_zone_c" type="custom" value="online"/>
    <declrequirement name="odc_expendable_t" type="custom" value="true"/>
    <declrequirement name="odc_expendable_bad" type="custom" value="maybe"/>
    <decltask name="worker"><exe>/bin/worker</exe></decltask>
    <decltask name="qc">
        <exe>/bin/qc</exe>
        <requirements><name>odc_expendable_t</name></requirements>
    </decltask>
    <declcollection name="C">
        <requirements>
            <name>grp</name>
            <name>odc_nmin_c</name>
            <name>odc_ncores_c</name>
            <name>odc_zone_c</name>
        </requirements>
        <tasks><name>worker</name></tasks>
    </declcollection>
    <main name="main">
        <task name="qc"/>
        <group name="g" n="4">
            <collection name="C"/>
        </group>
    </main>
</topology>
"#;

    #[test]
    fn extracts_nmin_zone_and_expendable() {
        let topo = Topology::from_str(TOPO).unwrap();
        let reqs = extract(&topo).unwrap();

        let info = reqs.n_info.get("C").expect("C should carry nMin info");
        assert_eq!(info.n_original, 4);
        assert_eq!(info.n_current, 4);
        assert_eq!(info.n_min, 2);
        assert_eq!(info.agent_group, "calib");

        let zone = reqs.zone_infos.get("online").expect("zone should be recorded");
        assert_eq!(zone.len(), 1);
        assert_eq!(zone[0].n, 4);
        assert_eq!(zone[0].ncores, 8);
        assert_eq!(zone[0].agent_group, "calib");

        let qc = topo.runtime_task_by_path("main/qc").unwrap();
        assert!(reqs.expendable_tasks.contains(&qc.id));
        assert_eq!(reqs.expendable_tasks.len(), 1);
    }

    #[test]
    fn nmin_outside_a_group_is_ignored() {
        let doc = r#"
<topology name="t">
    <declrequirement name="grp" type="groupname" value="g"/>
    <declrequirement name="odc_nmin_c" type="custom" value="2"/>
    <decltask name="w"><exe>/bin/w</exe></decltask>
    <declcollection name="C">
        <requirements><name>grp</name><name>odc_nmin_c</name></requirements>
        <tasks><name>w</name></tasks>
    </declcollection>
    <main name="main"><collection name="C"/></main>
</topology>
"#;
        let topo = Topology::from_str(doc).unwrap();
        let reqs = extract(&topo).unwrap();
        assert!(reqs.n_info.is_empty());
    }

    #[test]
    fn invalid_numeric_requirement_is_an_error() {
        let doc = r#"
<topology name="t">
    <declrequirement name="grp" type="groupname" value="g"/>
    <declrequirement name="odc_nmin_c" type="custom" value="two"/>
    <decltask name="w"><exe>/bin/w</exe></decltask>
    <declcollection name="C">
        <requirements><name>grp</name><name>odc_nmin_c</name></requirements>
        <tasks><name>w</name></tasks>
    </declcollection>
    <main name="main"><group name="g" n="2"><collection name="C"/></group></main>
</topology>
"#;
        let topo = Topology::from_str(doc).unwrap();
        assert!(matches!(
            extract(&topo),
            Err(TopologyError::InvalidRequirement { .. })
        ));
    }

    #[test]
    fn expendable_false_and_unknown_values_do_not_mark_tasks() {
        let doc = r#"
<topology name="t">
    <declrequirement name="odc_expendable_a" type="custom" value="false"/>
    <declrequirement name="odc_expendable_b" type="custom" value="maybe"/>
    <decltask name="w">
        <exe>/bin/w</exe>
        <requirements><name>odc_expendable_a</name><name>odc_expendable_b</name></requirements>
    </decltask>
    <main name="main"><task name="w"/></main>
</topology>
"#;
        let topo = Topology::from_str(doc).unwrap();
        let reqs = extract(&topo).unwrap();
        assert!(reqs.expendable_tasks.is_empty());
    }
}
