//! Command-line entry point: `florapipe-train <config.yaml>`

use std::path::PathBuf;

use anyhow::{Context, Result};

use florapipe_nodes::default_constructors;
use florapipe_train::{load_config, run};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .context("usage: florapipe-train <config.yaml>")?;
    let config = load_config(&PathBuf::from(path))?;

    run(&default_constructors(), &config)
}
