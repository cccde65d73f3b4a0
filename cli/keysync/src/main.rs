use std::process::ExitCode;

use anyhow::Result;
use commands::{keysync_cli, Command, KeysyncCli};
use tracing::debug;
use utils::init::init_logger;

mod commands;
mod config;
mod utils;

async fn run(command: Command, config: config::Config) -> Result<ExitCode> {
    command.handle(config).await
}

fn main() -> ExitCode {
    let KeysyncCli {
        verbose,
        config: config_path,
        command,
    } = keysync_cli().run();

    init_logger(verbose);

    let config = match config::Config::parse(config_path.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("keysync: {err}");
            return ExitCode::from(2);
        },
    };
    if let Err(err) = config.validate() {
        eprintln!("keysync: invalid configuration: {err}");
        return ExitCode::from(2);
    }
    debug!(
        sources = config.sources.len(),
        targets = config.targets.len(),
        "configuration loaded"
    );

    // Runtime owns the SIGINT handler; drop it last
    let runtime = tokio::runtime::Runtime::new().expect("failed to start async runtime");

    match runtime.block_on(run(command, config)) {
        Ok(exit_code) => exit_code,
        Err(err) => {
            let message = err
                .chain()
                .skip(1)
                .fold(err.to_string(), |acc, cause| format!("{acc}: {cause}"));
            eprintln!("keysync: {message}");
            ExitCode::from(4)
        },
    }
}
