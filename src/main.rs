use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    tripharvest::logging::init().context("init logging")?;

    let cli = tripharvest::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        tripharvest::cli::Command::Restaurant(args) => {
            tripharvest::restaurant::run(args)
                .await
                .context("restaurant")?;
        }
        tripharvest::cli::Command::Overall(args) => {
            tripharvest::overall::run(args).await.context("overall")?;
        }
    }

    Ok(())
}
