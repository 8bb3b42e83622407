use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use proctyper::{TyperEngine, settings::Settings, telemetry};

#[derive(Debug, Parser)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// YAML settings file; environment variables take precedence
    #[clap(short, long, env = "PROCTYPER_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single discovery scan and exit
    #[clap(long)]
    once: bool,

    /// Classify one process, print the result and exit
    #[clap(long, conflicts_with = "once")]
    pid: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let settings = Settings::load(opt.config.as_deref()).context("Failed to load settings")?;
    let mut engine = TyperEngine::new(settings)?;

    if let Some(pid) = opt.pid {
        let result = engine.classify_pid(pid).await?;
        match &result.error {
            Some(reason) => println!("{}\t{}\t{}", pid, result.kind.as_str(), reason),
            None => {
                let offsets = result
                    .offsets
                    .map(|o| {
                        o.as_slice()
                            .iter()
                            .map(|addr| format!("{:#x}", addr))
                            .collect::<Vec<_>>()
                            .join(",")
                    })
                    .unwrap_or_default();
                println!("{}\t{}\t{}", pid, result.kind.as_str(), offsets);
            }
        }
        return Ok(());
    }

    telemetry::init_metrics()?;

    if opt.once {
        engine.scan_once().await?;
        let cache = engine.typer().cache();
        info!(
            "Scan complete: {} executables cached, {} processes tracked",
            cache.len(),
            engine.tracker().owners()
        );
    } else {
        engine.run().await?;
    }

    telemetry::shutdown_metrics();
    Ok(())
}
