use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fractal_embeddings::{Cli, DendrogramExport, PipelineRunner};
use tracing::info;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const REPORT_EVERY: u32 = 10;

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.build_config();
    let service = cli.build_service().context("failed to build Cohere client")?;
    let colors_path = cli.colors_path();

    let mut runner =
        PipelineRunner::new(config, Arc::new(service)).context("invalid pipeline configuration")?;
    runner.start().context("failed to start pipeline")?;

    let mut ticks = 0u32;
    while runner.is_alive() {
        thread::sleep(POLL_INTERVAL);
        ticks += 1;
        if ticks % REPORT_EVERY == 0 {
            let progress = runner.progress();
            info!(
                embedded = progress.embedded_chunks,
                planned = progress.total_chunks,
                calls = progress.service_calls,
                "still running"
            );
        }
    }

    info!(status = ?runner.status(), "pipeline stopped");
    let output = runner.join().context("pipeline failed")?;

    let export = DendrogramExport::new(&output.combined.names, &output.linkage, &output.colors)?;
    if let Some(parent) = colors_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {:?}", parent))?;
    }
    let file =
        File::create(&colors_path).with_context(|| format!("failed to create {:?}", colors_path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &export).context("failed to write colors")?;
    writer.flush()?;

    let report = &output.report;
    eprintln!(
        "embedded {} chunks in {} calls; {} rows, {} nodes; {} stages cached, {} computed",
        report.chunks_embedded,
        report.service_calls,
        report.rows,
        output.colors.len(),
        report.cached.len(),
        report.computed.len()
    );
    eprintln!("wrote {}", colors_path.display());
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
