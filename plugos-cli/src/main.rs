//! plugos command-line tool
//!
//! Usage:
//!   plugos --db plugos.db set name '"Pete"'
//!   plugos --db plugos.db query --spec '{"orderBy": "age", "limit": 1}'

use anyhow::Result;
use clap::Parser;
use plugos_cli::{Args, render, run};
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(log_level).into())
        .from_env_lossy();
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let output = run(&args).await?;
    if let Some(text) = render(&output)? {
        println!("{text}");
    }
    Ok(())
}
