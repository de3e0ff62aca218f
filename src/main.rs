mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Args;

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr below the progress bar; RUST_LOG=blobdl=debug for block-level detail.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if let Some(destination) = &args.status {
            return crate::commands::show_status(destination).await;
        }

        let Some(url) = args.url.clone() else {
            anyhow::bail!("a URL is required");
        };
        let destination =
            crate::commands::resolve_destination(&url, args.output.clone(), &args.download_dir)?;
        let options = crate::commands::load_options(args.config.as_deref())
            .await?
            .merge(args.flag_options());

        crate::commands::run_single_download(url, destination, options).await
    })
}
