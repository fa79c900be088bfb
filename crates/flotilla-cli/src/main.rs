mod cli;
mod repl;

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use flotilla_controller::{smart_path, Controller};
use flotilla_driver::{LocalBackend, LocalCluster};
use flotilla_plugin::parse_plugin_spec;
use tracing_subscriber::EnvFilter;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let cluster = LocalCluster::new();
    let mut controller = Controller::new(Arc::new(LocalBackend::new(cluster)));
    controller.set_timeout(Duration::from_secs(cli.timeout));
    controller.set_history_dir(smart_path(&cli.history_dir));

    let plugins = cli
        .resource_plugins
        .iter()
        .map(|spec| parse_plugin_spec(spec))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid --rp registration")?;
    controller.register_resource_plugins(plugins);

    let triggers = cli
        .request_triggers
        .iter()
        .map(|spec| parse_plugin_spec(spec))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid --rt registration")?;
    controller.register_request_triggers(triggers)?;

    if let Some(restore_id) = &cli.restore {
        controller
            .restore(restore_id, Some(smart_path(&cli.restore_dir)))
            .await;
    }

    if !cli.batch_commands.is_empty() {
        for command in &cli.batch_commands {
            println!("> {}", command);
            if !repl::dispatch(&controller, command).await {
                break;
            }
        }
        return Ok(());
    }

    let stdin = std::io::stdin();
    loop {
        print!("flotilla> ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        if !repl::dispatch(&controller, line.trim()).await {
            break;
        }
    }
    Ok(())
}
