mod cli;

use anyhow::Context;
use clap::Parser;

use sourcescan_engine::cancel::CancelToken;
use sourcescan_engine::manager::{Manager, ManagerConfig};
use sourcescan_engine::source::filesystem::FilesystemSource;
use sourcescan_engine::source::json_bundle_source::JsonBundleSource;
use sourcescan_engine::source::SourceCapability;

use crate::cli::{Cli, SourceCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let manager = Manager::new(ManagerConfig {
        unit_concurrency: cli.unit_concurrency.max(1),
        ..ManagerConfig::default()
    });

    let handle = match &cli.source {
        SourceCommand::Filesystem { root } => {
            let root = root.clone();
            manager.enroll(
                root.display().to_string(),
                "filesystem",
                Box::new(move || SourceCapability::UnitAware(Box::new(FilesystemSource::new(root.clone())))),
                Vec::new(),
            )?
        }
        SourceCommand::JsonBundle { path } => {
            let path = path.clone();
            manager.enroll(
                path.display().to_string(),
                "json-bundle",
                Box::new(move || {
                    let file = std::fs::File::open(&path)
                        .unwrap_or_else(|e| panic!("open {}: {e}", path.display()));
                    SourceCapability::Monolithic(Box::new(JsonBundleSource::new(tokio::fs::File::from_std(file))))
                }),
                Vec::new(),
            )?
        }
    };

    let mut chunks = manager.chunks();
    let job_ref = manager.schedule_run(handle, CancelToken::new()).await.context("scheduling run")?;

    let mut total = 0u64;
    while let Some(chunk) = chunks.recv().await {
        total += 1;
        if cli.verbose {
            println!("chunk #{total}: {:?} ({} bytes)", chunk.metadata, chunk.len());
        } else {
            println!("chunk #{total}: {} ({} bytes)", chunk.source_type, chunk.len());
        }
    }

    job_ref.wait().await;
    manager.wait().await;

    let snapshot = job_ref.snapshot();
    println!(
        "done: {} chunks, {} units enumerated, {} units finished, {:.1}% complete",
        snapshot.chunks_total,
        snapshot.enumerated_units,
        snapshot.finished_units,
        snapshot.percent_complete()
    );
    if let Some(err) = snapshot.fatal_error() {
        anyhow::bail!("job ended with a fatal error: {err}");
    }

    Ok(())
}
