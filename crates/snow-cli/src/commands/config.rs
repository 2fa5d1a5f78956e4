//! Config command handlers

use std::path::PathBuf;

use anyhow::Result;

use snow_core::Config;

use crate::output::{Output, OutputFormat};

fn or_unset(value: Option<&str>) -> &str {
    value.unwrap_or("(not set)")
}

/// Show current configuration
pub fn show(config: &Config, config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    match output.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        OutputFormat::Quiet => {
            println!("{}", config.backend.name);
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            let backend = &config.backend;
            let log_file = config.log_file.as_ref().map(|p| p.display().to_string());

            println!("Configuration:");
            println!("  data_dir:      {}", config.data_dir.display());
            println!("  log_file:      {}", or_unset(log_file.as_deref()));
            println!("  media_folder:  {}", config.media_folder);
            println!("  public_folder: {}", config.public_folder);
            println!("  custom_actions: {}", config.custom_actions);
            println!();
            println!("Backend: {}", backend.name);
            match backend.name.as_str() {
                "local" => {
                    println!("  repo_folder:   {}", or_unset(backend.repo_folder.as_deref()));
                }
                "github" => {
                    println!("  repo:          {}", or_unset(backend.repo.as_deref()));
                    println!("  branch:        {}", backend.branch);
                    println!("  app_name:      {}", or_unset(backend.app_name.as_deref()));
                    println!("  client_id:     {}", or_unset(backend.client_id.as_deref()));
                    println!("  api_root:      {}", or_unset(backend.api_root.as_deref()));
                    println!("  redirect_uri:  {}", backend.redirect_uri);
                }
                _ => {}
            }
            println!();
            if config.collections.is_empty() {
                println!("No collections configured.");
            } else {
                println!("Collections:");
                for c in &config.collections {
                    println!(
                        "  {:<12} {}/*.{}  (slug: {})",
                        c.name,
                        c.folder_path(),
                        c.extension,
                        c.slug
                    );
                }
            }
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}
