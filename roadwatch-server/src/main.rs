use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use miette::{IntoDiagnostic, Result, WrapErr};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

use roadwatch_server::{supervisor, Cli, Session};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::from_env(Env::default())
        .filter_level(args.verbose.log_level_filter())
        .init();

    let config = args
        .into_config()
        .into_diagnostic()
        .wrap_err("invalid configuration")?;

    Toplevel::new(move |s| async move {
        let session = Session::new(config);
        s.start(SubsystemBuilder::new("Supervisor", move |subsys| {
            supervisor::run(session, subsys)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(10))
    .await
    .into_diagnostic()
}
