use std::collections::BTreeMap;
use std::time::Duration;

use flotilla_domain::{SubmissionDescriptor, ZoneGroup};
use flotilla_topology::xml::{self, XmlNode};
use tracing::info;

use crate::error::PluginError;
use crate::registry::PluginRegistry;

/// Invoke a resource plugin and turn its XML output into submission
/// descriptors, merging in the topology-derived zone/core/group information.
pub async fn make_params(
    registry: &PluginRegistry,
    plugin: &str,
    resources: &str,
    partition_id: &str,
    run_nr: u64,
    zone_infos: &BTreeMap<String, Vec<ZoneGroup>>,
    timeout: Duration,
) -> Result<Vec<SubmissionDescriptor>, PluginError> {
    let output = registry.exec(plugin, resources, partition_id, run_nr, timeout).await?;
    let mut params = parse_descriptors(&output)?;

    // Overlay zone information from the topology. Each zone must have a
    // matching descriptor; its first group claims the descriptor, additional
    // groups clone it.
    for (zone, groups) in zone_infos {
        let idx = params
            .iter()
            .position(|p| &p.zone == zone)
            .ok_or_else(|| PluginError::ZoneNotFound(zone.clone()))?;

        params[idx].num_cores = groups[0].ncores as u32;
        params[idx].agent_group = groups[0].agent_group.clone();
        // core-based scheduling collapses the zone to a single agent
        if params[idx].num_cores != 0 {
            params[idx].num_agents = 1;
        }
        let template = params[idx].clone();
        for zg in &groups[1..] {
            let mut clone = template.clone();
            clone.num_cores = zg.ncores as u32;
            clone.agent_group = zg.agent_group.clone();
            params.push(clone);
        }
    }

    // Descriptors that never received an agent count are dropped.
    params.retain(|p| p.num_agents != -1);

    info!(count = params.len(), "resource plugin produced submission descriptors");
    Ok(params)
}

/// Parse plugin output: either a root holding one or more `<submit>`
/// children, or a single flat descriptor.
pub fn parse_descriptors(output: &str) -> Result<Vec<SubmissionDescriptor>, PluginError> {
    let root = xml::parse(output).map_err(|e| PluginError::Parse(e.to_string()))?;

    let has_submit_children = root.children.iter().any(|c| c.name == "submit");
    if !has_submit_children {
        return Ok(vec![descriptor_from_node(&root)?]);
    }

    let mut params = Vec::new();
    for child in &root.children {
        if child.name != "submit" {
            return Err(PluginError::Parse(format!(
                "unknown top level tag {:?}",
                child.name
            )));
        }
        params.push(descriptor_from_node(child)?);
    }
    Ok(params)
}

fn descriptor_from_node(node: &XmlNode) -> Result<SubmissionDescriptor, PluginError> {
    const VALID_KEYS: [&str; 6] = ["rms", "configFile", "envFile", "agents", "slots", "zone"];
    for child in &node.children {
        if !VALID_KEYS.contains(&child.name.as_str()) {
            return Err(PluginError::Parse(format!("unknown key {:?}", child.name)));
        }
    }

    let text = |key: &str| node.child(key).map(|c| c.text.clone()).unwrap_or_default();
    let zone = text("zone");

    Ok(SubmissionDescriptor {
        rms_plugin: text("rms"),
        // the agent group starts out equal to the zone; the zone overlay may
        // overwrite it later
        agent_group: zone.clone(),
        zone,
        config_file: text("configFile"),
        env_file: text("envFile"),
        num_agents: parse_number(node, "agents", -1)?,
        min_agents: 0,
        num_slots: parse_number(node, "slots", 0)?,
        num_cores: 0,
    })
}

fn parse_number<T: std::str::FromStr>(
    node: &XmlNode,
    key: &str,
    default: T,
) -> Result<T, PluginError> {
    match node.child(key) {
        Some(child) => child
            .text
            .parse()
            .map_err(|_| PluginError::Parse(format!("key {:?} has non-numeric value {:?}", key, child.text))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone_infos(entries: &[(&str, &[ZoneGroup])]) -> BTreeMap<String, Vec<ZoneGroup>> {
        entries
            .iter()
            .map(|(zone, groups)| (zone.to_string(), groups.to_vec()))
            .collect()
    }

    fn zg(n: i32, ncores: i32, agent_group: &str) -> ZoneGroup {
        ZoneGroup { n, ncores, agent_group: agent_group.to_string() }
    }

    #[test]
    fn flat_output_parses_as_one_descriptor() {
        let params =
            parse_descriptors("<submit><rms>slurm</rms><agents>4</agents><slots>2</slots></submit>")
                .unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].rms_plugin, "slurm");
        assert_eq!(params[0].num_agents, 4);
        assert_eq!(params[0].num_slots, 2);
    }

    #[test]
    fn wrapped_output_parses_each_submit_child() {
        let params = parse_descriptors(
            "<res><submit><rms>slurm</rms><zone>online</zone><agents>2</agents></submit>\
             <submit><rms>ssh</rms><zone>calib</zone><agents>1</agents></submit></res>",
        )
        .unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[1].zone, "calib");
    }

    #[test]
    fn agent_group_starts_equal_to_zone() {
        let params =
            parse_descriptors("<submit><zone>online</zone><agents>1</agents></submit>").unwrap();
        assert_eq!(params[0].agent_group, "online");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = parse_descriptors("<submit><rms>slurm</rms><cores>4</cores></submit>").unwrap_err();
        assert!(matches!(err, PluginError::Parse(_)));

        let err = parse_descriptors("<res><submit/><extra/></res>").unwrap_err();
        assert!(matches!(err, PluginError::Parse(_)));
    }

    #[tokio::test]
    async fn zone_overlay_rewrites_group_and_cores() {
        let mut registry = PluginRegistry::new();
        registry.register(
            "rp",
            "echo '<submit><rms>slurm</rms><zone>online</zone><agents>4</agents><slots>1</slots></submit>' #",
        );
        let zones = zone_infos(&[("online", &[zg(4, 0, "reco")])]);
        let params = make_params(&registry, "rp", "", "p1", 1, &zones, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].agent_group, "reco");
        assert_eq!(params[0].num_cores, 0);
        assert_eq!(params[0].num_agents, 4);
    }

    #[tokio::test]
    async fn core_scheduling_forces_a_single_agent() {
        let mut registry = PluginRegistry::new();
        registry.register(
            "rp",
            "echo '<submit><rms>slurm</rms><zone>calib</zone><agents>4</agents><slots>1</slots></submit>' #",
        );
        let zones = zone_infos(&[("calib", &[zg(1, 16, "calib-grp")])]);
        let params = make_params(&registry, "rp", "", "p1", 1, &zones, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(params[0].num_cores, 16);
        assert_eq!(params[0].num_agents, 1);
    }

    #[tokio::test]
    async fn additional_groups_clone_the_descriptor() {
        let mut registry = PluginRegistry::new();
        registry.register(
            "rp",
            "echo '<submit><rms>slurm</rms><zone>online</zone><agents>8</agents><slots>2</slots></submit>' #",
        );
        let zones = zone_infos(&[("online", &[zg(4, 0, "reco"), zg(2, 0, "qc")])]);
        let params = make_params(&registry, "rp", "", "p1", 1, &zones, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].agent_group, "reco");
        assert_eq!(params[1].agent_group, "qc");
        assert_eq!(params[1].rms_plugin, "slurm");
        assert_eq!(params[1].num_slots, 2);
    }

    #[tokio::test]
    async fn missing_zone_is_an_error() {
        let mut registry = PluginRegistry::new();
        registry.register("rp", "echo '<submit><rms>ssh</rms><agents>1</agents></submit>' #");
        let zones = zone_infos(&[("online", &[zg(1, 0, "g")])]);
        let err = make_params(&registry, "rp", "", "p1", 1, &zones, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ZoneNotFound(z) if z == "online"));
    }

    #[tokio::test]
    async fn descriptors_without_agents_are_dropped() {
        let mut registry = PluginRegistry::new();
        registry.register(
            "rp",
            "echo '<res><submit><rms>ssh</rms><zone>a</zone><agents>1</agents></submit><submit><rms>ssh</rms><zone>b</zone></submit></res>' #",
        );
        let params = make_params(&registry, "rp", "", "p1", 1, &BTreeMap::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].zone, "a");
    }
}
