//! `languages`: list supported languages and their effective limits.

use anyhow::{Context, Result};

use execbox::ProfileRegistry;

use super::format::format_language_table;
use super::GlobalOptions;

pub fn run(options: &GlobalOptions, json: bool) -> Result<()> {
    let config = options.load_config()?;
    let registry = ProfileRegistry::new(&config)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(registry.list()).context("Failed to serialize profiles")?
        );
    } else {
        print!("{}", format_language_table(registry.list()));
    }
    Ok(())
}
