use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tracing::{error, info};

use app::{App, Driver};
use cli::Cli;
use config::{Config, Mode};
use presenter::{
    console::ConsolePresenter,
    web::{Page, WebState},
};
use table::CounterTable;

pub(crate) mod app;
pub(crate) mod cli;
pub(crate) mod config;
pub(crate) mod hook;
pub(crate) mod presenter;
pub(crate) mod snapshot;
pub(crate) mod table;

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit here, before anything touches the kernel.
    let cli = Cli::parse();

    if let Err(report) = color_eyre::install() {
        eprintln!("ipstat: {report:?}");
    }
    let logging = match app::initialize_logging() {
        Ok(()) => true,
        Err(report) => {
            eprintln!("ipstat: failed to initialize logging: {report:?}");
            false
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) if logging => {
            error!("{report:?}");
            ExitCode::FAILURE
        }
        Err(report) => {
            eprintln!("ipstat: {report:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.into_config().wrap_err("invalid configuration")?;
    info!(
        "Starting on {} with the {:?} hook",
        config.iface, config.hook
    );

    // Registered before attaching so a signal during attach still ends in a detach.
    let shutdown = app::termination_signal().wrap_err("failed to register signal handlers")?;

    // A failed attach leaves nothing behind, so there is nothing to clean up here.
    let (attachment, table) = hook::attach(&config)
        .wrap_err_with(|| format!("failed to attach to {}", config.iface))?;
    let app = App::new(attachment, Arc::new(table));

    match driver(&config, app.table()).await {
        Ok(driver) => app.run(driver, shutdown).await,
        Err(report) => {
            if let Err(stop) = app.stop() {
                error!("{stop:#}");
            }
            Err(report)
        }
    }
}

/// Builds the snapshot driver for the configured mode.
async fn driver(config: &Config, table: Arc<dyn CounterTable>) -> Result<Driver> {
    let driver = match &config.mode {
        Mode::Console { interval } => Driver::Timer {
            interval: *interval,
            presenter: Box::new(ConsolePresenter::stdout()),
        },
        Mode::Web {
            limit,
            listen,
            refresh,
        } => {
            let listener = TcpListener::bind(listen)
                .await
                .wrap_err_with(|| format!("failed to listen on {listen}"))?;
            Driver::Http {
                listener,
                state: WebState::new(table, *limit, Page::new(&config.iface, *refresh)),
                grace: *refresh,
            }
        }
    };

    Ok(driver)
}
