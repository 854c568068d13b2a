mod cli;
mod devops;
mod engine;
mod error;
mod logging;
mod model;
mod orchestrator;
mod scoring;
#[cfg(test)]
mod testutil;
mod text_summary;

use clap::Parser;

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();
    let guard = logging::init_logging(cli::logging_config(&args));

    let code = match cli::run(args).await {
        Ok(()) => 0,
        Err(e) if e.downcast_ref::<engine::Cancelled>().is_some() => {
            tracing::warn!("Cancelled");
            130
        }
        Err(e) => {
            tracing::error!("{e:#}");
            1
        }
    };

    // process::exit skips destructors; flush the file log first.
    drop(guard);
    std::process::exit(code);
}
