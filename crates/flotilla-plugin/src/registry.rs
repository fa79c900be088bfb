use std::collections::HashMap;
use std::time::Duration;

use crate::error::PluginError;
use crate::runner;

/// Name of the pass-through resource plugin registered by default.
pub const DEFAULT_RESOURCE_PLUGIN: &str = "odc-rp-same";

/// A name → command mapping for external plugin executables. The same
/// registry type backs both resource plugins and request triggers; the last
/// registration under a name wins.
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the default resource plugin pre-registered, resolved
    /// next to the current executable.
    pub fn with_default_resource_plugin() -> Self {
        let mut registry = Self::new();
        if let Ok(exe) = std::env::current_exe() {
            if let Some(bin_dir) = exe.parent() {
                let cmd = bin_dir.join(DEFAULT_RESOURCE_PLUGIN);
                registry.register(DEFAULT_RESOURCE_PLUGIN, cmd.display().to_string());
            }
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, cmd: impl Into<String>) {
        self.plugins.insert(name.into(), cmd.into());
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Run the named plugin with the standard argument triple.
    pub async fn exec(
        &self,
        name: &str,
        resources: &str,
        partition_id: &str,
        run_nr: u64,
        timeout: Duration,
    ) -> Result<String, PluginError> {
        let cmd = self
            .plugins
            .get(name)
            .ok_or_else(|| PluginError::NotRegistered(name.to_string()))?;
        runner::exec_plugin(cmd, resources, partition_id, run_nr, timeout).await
    }
}

/// Parse a `name:cmd` registration as accepted by `--rp` / `--rt`.
pub fn parse_plugin_spec(spec: &str) -> Result<(String, String), PluginError> {
    match spec.split_once(':') {
        Some((name, cmd)) if !name.is_empty() && !cmd.is_empty() => {
            Ok((name.to_string(), cmd.to_string()))
        }
        _ => Err(PluginError::InvalidSpec(spec.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_registration_wins() {
        let mut registry = PluginRegistry::new();
        registry.register("rp", "first");
        registry.register("rp", "second");
        assert!(registry.is_registered("rp"));
        assert_eq!(registry.plugins.get("rp").unwrap(), "second");
    }

    #[test]
    fn unknown_names_are_not_registered() {
        let registry = PluginRegistry::new();
        assert!(!registry.is_registered("rp"));
    }

    #[tokio::test]
    async fn exec_of_unregistered_plugin_fails() {
        let registry = PluginRegistry::new();
        let err = registry
            .exec("nosuch", "", "p1", 0, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn exec_delegates_to_the_registered_command() {
        let mut registry = PluginRegistry::new();
        registry.register("echoer", "echo");
        let out = registry
            .exec("echoer", "r", "p1", 3, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "--res r --id p1 --rn 3");
    }

    #[test]
    fn plugin_spec_parsing() {
        let (name, cmd) = parse_plugin_spec("zones:/usr/bin/rp --zones a,b").unwrap();
        assert_eq!(name, "zones");
        assert_eq!(cmd, "/usr/bin/rp --zones a,b");

        assert!(parse_plugin_spec("nocolon").is_err());
        assert!(parse_plugin_spec(":cmd").is_err());
        assert!(parse_plugin_spec("name:").is_err());
    }
}
