use clap::Parser;

/// Interactive command server for the orchestration controller.
#[derive(Debug, Parser)]
#[command(name = "flotilla", about = "Partition lifecycle orchestration controller", version)]
pub struct Cli {
    /// Timeout of requests in seconds.
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Register resource plugins ( name1:cmd1 name2:cmd2 ).
    #[arg(long = "rp", value_name = "NAME:CMD", num_args = 1..)]
    pub resource_plugins: Vec<String>,

    /// Register request triggers ( name1:cmd1 name2:cmd2 ).
    #[arg(long = "rt", value_name = "NAME:CMD", num_args = 1..)]
    pub request_triggers: Vec<String>,

    /// Restore sessions recorded under this id on startup.
    #[arg(long)]
    pub restore: Option<String>,

    /// Directory where restore files are kept.
    #[arg(long, default_value = "$HOME/.ODC/restore/")]
    pub restore_dir: String,

    /// Directory where the session history log is kept.
    #[arg(long, default_value = "$HOME/.ODC/history/")]
    pub history_dir: String,

    /// Commands to execute in batch mode; the server exits afterwards.
    #[arg(long = "cmds", value_name = "CMD", num_args = 1..)]
    pub batch_commands: Vec<String>,
}
