// src/main.rs

use std::process::ExitCode;

use tracerelay::{cli, logging, run};

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    if let Err(err) = logging::init_logging(args.log_level) {
        eprintln!("tracerelay: {err:#}");
        return ExitCode::from(2);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "tracerelay failed");
            eprintln!("tracerelay error: {err:?}");
            ExitCode::FAILURE
        }
    }
}
