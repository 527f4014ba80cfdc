use anyhow::{Context, Result};
use clap::Parser;
use paramine::embedder::RemoteEmbedder;
use paramine::{run_pipeline, Cli, ResultCache};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let controls = cli
        .build_controls()
        .context("invalid mining configuration")?;
    let cache = ResultCache::open(&cli.cache_dir)
        .with_context(|| format!("failed to open cache at {:?}", cli.cache_dir))?;
    let embedder = RemoteEmbedder::new(
        &cli.embedding_server,
        cli.model_version.clone(),
        cli.embed_timeout(),
    )
    .context("failed to build embedding client")?;

    eprintln!(
        "mining corpus {:?} against embedding server {} (model {})...",
        cli.corpus_root, cli.embedding_server, cli.model_version
    );
    let report = run_pipeline(
        &cli.corpus_root,
        &cache,
        &controls,
        &embedder,
        None,
        &cli.dataset,
    )
    .context("mining run failed")?;
    report.print();
    Ok(())
}
