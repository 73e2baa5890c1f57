//! integ-runner entry point

use integ_cli::{cli, ConsoleReporter};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbosity: u8, json: bool) {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = installed {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli::command().get_matches();
    let args = cli::from_matches(&matches)?;
    init_tracing(matches.get_count("verbose"), args.log_json);

    let cwd = std::env::current_dir()?;
    let reporter = Arc::new(ConsoleReporter::stdout());
    let code = integ_cli::run(args, &cwd, reporter).await?;
    std::process::exit(code);
}
