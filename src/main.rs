use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod catalog;
mod cli;
mod config;
mod context;
mod embeddings;
mod errors;
mod fetch;
mod images;
mod index;
mod matcher;
mod price;
#[cfg(test)]
mod tests;
mod web;

use config::Config;
use context::{AppContext, ImageSource};
use index::{IndexBuilder, PRODUCTS_FILE};

fn load_config(args: &cli::Args) -> anyhow::Result<Config> {
    let mut config = Config::load_with(&args.data_dir)?;
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn build_index(config: &Config) -> anyhow::Result<()> {
    let data_dir = config.data_dir();
    let products = catalog::load_catalog(&data_dir.join(PRODUCTS_FILE))?;
    let embedder = context::load_embedder(config)?;

    let progress = indicatif::ProgressBar::new(products.len() as u64);
    progress.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("[{bar:40.cyan/blue}] {pos}/{len} products {msg}")
            .context("invalid progress bar template")?
            .progress_chars("##."),
    );

    let (artifacts, report) = IndexBuilder::new(embedder.as_ref(), data_dir)
        .with_progress(progress)
        .build(products)?;

    artifacts.save(data_dir, &embedder.model_id_hash())?;

    log::info!(
        "indexed {} images across {} products ({} skipped, {} products without images)",
        report.images_indexed,
        report.products,
        report.images_skipped,
        report.empty_products.len()
    );
    if report.images_unpriced > 0 {
        log::warn!(
            "{} indexed images have no usable price and will pass every price filter",
            report.images_unpriced
        );
    }

    Ok(())
}

fn match_once(
    ctx: AppContext,
    source: ImageSource,
    params: matcher::MatchParams,
) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let bytes = runtime.block_on(ctx.read_source(Some(source)))?;
    let matches = ctx.match_image(&bytes, &params)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&web::MatchResponse {
            query_matches: matches
        })?
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("VPM_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::Args::parse();
    let mut config = load_config(&args)?;

    match args.command {
        cli::Command::Serve { listen } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            let ctx = AppContext::load(config)?;
            web::start_daemon(ctx)
        }

        cli::Command::Build {} => build_index(&config),

        cli::Command::Match {
            source,
            top_k,
            threshold,
            price_min,
            price_max,
        } => {
            let source = match (source.file, source.url) {
                (Some(file), _) => ImageSource::Upload(
                    std::fs::read(&file)
                        .with_context(|| format!("failed to read {}", file.display()))?,
                ),
                (None, Some(url)) => ImageSource::Url(url),
                (None, None) => anyhow::bail!("no image provided (pass --file or --url)"),
            };

            let ctx = AppContext::load(config)?;
            let params = ctx.params(top_k, threshold, price_min, price_max);
            match_once(ctx, source, params)
        }
    }
}
