use std::collections::HashMap;
use std::time::Duration;

use flotilla_controller::Controller;
use flotilla_domain::{
    ActivateParams, CommonParams, DeviceParams, InitializeParams, RunParams, SetPropertiesParams,
    StatusParams, SubmitParams,
};

const HELP: &str = "\
commands (first token is the verb, then --key value pairs):
  init     [--id P] [--rn N] [--session SID]
  submit   [--id P] [--rn N] --plugin NAME --resources RES
  activate [--id P] [--rn N] --topo FILE | --content XML | --script CMD
  run      [--id P] [--rn N] --plugin NAME --resources RES --topo FILE
  update   [--id P] [--rn N] --topo FILE | --content XML | --script CMD
  config | start | stop | reset | term | state
           [--id P] [--rn N] [--path PATH] [--detailed]
  prop     [--id P] [--rn N] [--path PATH] --set KEY=VALUE ...
  down     [--id P] [--rn N]
  status   [--running]
  help, quit";

/// Execute one command line against the controller. Returns `false` when the
/// loop should stop.
pub async fn dispatch(controller: &Controller, line: &str) -> bool {
    let mut tokens = line.split_whitespace();
    let verb = match tokens.next() {
        Some(verb) => verb,
        None => return true,
    };
    let args = parse_args(tokens);

    match verb {
        "quit" | "exit" | ".quit" => return false,
        "help" | ".help" => println!("{}", HELP),
        "init" => {
            let params = InitializeParams {
                session_id: args.value("session").unwrap_or_default(),
            };
            print_result(&controller.exec_initialize(common(&args), params).await);
        }
        "submit" => {
            let params = SubmitParams {
                plugin: args.value("plugin").unwrap_or_default(),
                resources: args.value("resources").unwrap_or_default(),
            };
            print_result(&controller.exec_submit(common(&args), params).await);
        }
        "activate" => {
            print_result(&controller.exec_activate(common(&args), topo_params(&args)).await);
        }
        "run" => {
            let topo = topo_params(&args);
            let params = RunParams {
                plugin: args.value("plugin").unwrap_or_default(),
                resources: args.value("resources").unwrap_or_default(),
                topo_file: topo.topo_file,
                topo_content: topo.topo_content,
                topo_script: topo.topo_script,
            };
            print_result(&controller.exec_run(common(&args), params).await);
        }
        "update" => {
            print_result(&controller.exec_update(common(&args), topo_params(&args)).await);
        }
        "config" => {
            print_result(&controller.exec_configure(common(&args), device_params(&args)).await);
        }
        "start" => {
            print_result(&controller.exec_start(common(&args), device_params(&args)).await);
        }
        "stop" => {
            print_result(&controller.exec_stop(common(&args), device_params(&args)).await);
        }
        "reset" => {
            print_result(&controller.exec_reset(common(&args), device_params(&args)).await);
        }
        "term" => {
            print_result(&controller.exec_terminate(common(&args), device_params(&args)).await);
        }
        "state" => {
            print_result(&controller.exec_get_state(common(&args), device_params(&args)).await);
        }
        "prop" => {
            let properties = args
                .values("set")
                .iter()
                .filter_map(|kv| kv.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let params = SetPropertiesParams {
                path: args.value("path").unwrap_or_default(),
                properties,
            };
            print_result(&controller.exec_set_properties(common(&args), params).await);
        }
        "down" => {
            print_result(&controller.exec_shutdown(common(&args)).await);
        }
        "status" => {
            let result = controller.exec_status(StatusParams::new(args.flag("running"))).await;
            match serde_json::to_string_pretty(&result) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("failed to render result: {}", e),
            }
        }
        other => eprintln!("unknown command {:?}, try 'help'", other),
    }
    true
}

fn print_result<T: serde::Serialize>(result: &T) {
    match serde_json::to_string_pretty(result) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to render result: {}", e),
    }
}

fn common(args: &Args) -> CommonParams {
    let mut common = CommonParams::new(
        args.value("id").unwrap_or_else(|| "default".to_string()),
        args.value("rn").and_then(|v| v.parse().ok()).unwrap_or(0),
    );
    if let Some(secs) = args.value("timeout").and_then(|v| v.parse().ok()) {
        common = common.with_timeout(Duration::from_secs(secs));
    }
    common
}

fn topo_params(args: &Args) -> ActivateParams {
    ActivateParams {
        topo_file: args.value("topo").unwrap_or_default(),
        topo_content: args.value("content").unwrap_or_default(),
        topo_script: args.value("script").unwrap_or_default(),
    }
}

fn device_params(args: &Args) -> DeviceParams {
    DeviceParams {
        path: args.value("path").unwrap_or_default(),
        detailed: args.flag("detailed"),
    }
}

// ── Argument scanning ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Args {
    values: HashMap<String, Vec<String>>,
    flags: Vec<String>,
}

impl Args {
    fn value(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(|v| v.first()).cloned()
    }

    fn values(&self, key: &str) -> Vec<String> {
        self.values.get(key).cloned().unwrap_or_default()
    }

    fn flag(&self, key: &str) -> bool {
        self.flags.iter().any(|f| f == key)
    }
}

fn parse_args<'a>(tokens: impl Iterator<Item = &'a str>) -> Args {
    let mut args = Args::default();
    let mut pending: Option<String> = None;
    for token in tokens {
        if let Some(key) = token.strip_prefix("--") {
            if let Some(flag) = pending.take() {
                args.flags.push(flag);
            }
            pending = Some(key.to_string());
        } else if let Some(key) = pending.take() {
            args.values.entry(key).or_default().push(token.to_string());
        }
    }
    if let Some(flag) = pending.take() {
        args.flags.push(flag);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_values_and_flags() {
        let args = parse_args("--id pt1 --detailed --set a=1 --set b=2".split_whitespace());
        assert_eq!(args.value("id").as_deref(), Some("pt1"));
        assert!(args.flag("detailed"));
        assert_eq!(args.values("set"), vec!["a=1", "b=2"]);
        assert!(!args.flag("running"));
    }

    #[test]
    fn trailing_flag_is_recorded() {
        let args = parse_args("--running".split_whitespace());
        assert!(args.flag("running"));
    }
}
