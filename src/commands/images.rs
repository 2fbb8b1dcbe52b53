//! Hardened sandbox image management commands.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use tracing::info;

use execbox::sandbox::{build_images, image_status};

use super::format::format_image_table;
use super::GlobalOptions;

/// Image management actions.
#[derive(Subcommand, Debug)]
pub enum ImageAction {
    /// Build hardened images (all languages unless some are named)
    Build {
        /// Languages to build, by id or alias
        languages: Vec<String>,
    },

    /// Show which hardened images are present
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Run image management command.
pub async fn run(options: &GlobalOptions, action: ImageAction) -> Result<()> {
    let config = options.load_config()?;

    match action {
        ImageAction::Build { languages } => {
            let built = build_images(&config, &languages)
                .await
                .context("Failed to build sandbox images. Is Docker running?")?;
            for tag in &built {
                info!("Built {}", tag);
                println!("{} {}", "✓".green(), tag);
            }
        }
        ImageAction::Status { json } => {
            let statuses = image_status(&config)
                .await
                .context("Failed to inspect sandbox images. Is Docker running?")?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&statuses).context("Failed to serialize status")?
                );
            } else {
                print!("{}", format_image_table(&statuses));
            }
        }
    }

    Ok(())
}
