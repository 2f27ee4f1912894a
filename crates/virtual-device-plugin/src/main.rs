use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use utils::logging;
use utils::version;
use virtual_device_plugin::app::Application;
use virtual_device_plugin::config::Cli;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_global_hooks();

    let cli = Cli::parse();

    let log_path = std::env::var_os(logging::LOG_PATH_ENV_VAR).map(PathBuf::from);
    let _guard = logging::init(log_path.as_deref());

    tracing::info!("Starting virtual device plugin {}", &**version::VERSION);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let app = Application::build(cli)?;
    app.run().await
}
