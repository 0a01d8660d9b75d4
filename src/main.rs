// SPDX-License-Identifier: GPL-3.0-only

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use pitv::config::{Cli, Settings};
use pitv::control::{ProcessControl, spawn_signal_listener};
use pitv::{driver, logging};
use tracing::error;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("pitv-server: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log = match logging::init(&settings.logging) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("pitv-server: {e}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let control = Arc::new(ProcessControl::new());
    let result = runtime.block_on(async {
        let _signals = spawn_signal_listener(Arc::clone(&control))?;
        driver::run(cli, settings, control, log).await
    });

    match result {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}
