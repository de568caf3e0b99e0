use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Visual product matcher", long_about = None)]
pub struct Args {
    /// Directory holding products.json, catalog images and built artifacts
    #[clap(long, global = true, default_value = "data/products")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct QuerySource {
    /// Query image on disk
    #[clap(long)]
    pub file: Option<PathBuf>,

    /// Query image URL
    #[clap(long)]
    pub url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP matching service.
    Serve {
        /// Address to bind, overrides `listen` from config.yaml
        #[clap(long)]
        listen: Option<String>,
    },

    /// Embed the catalog and write product/image embeddings and the image index.
    Build {},

    /// Match a single image against the built index and print the results.
    Match {
        #[clap(flatten)]
        source: QuerySource,

        /// Number of products to return
        #[clap(short = 'k', long)]
        top_k: Option<usize>,

        /// Minimum product similarity
        #[clap(short, long, allow_hyphen_values = true)]
        threshold: Option<f32>,

        /// Drop images priced below this
        #[clap(long)]
        price_min: Option<f64>,

        /// Drop images priced above this
        #[clap(long)]
        price_max: Option<f64>,
    },
}
