//! Snow CLI
//!
//! Command-line interface for Snow - manage static-site content through a
//! local directory or a GitHub repository.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use snow_core::{BackendError, Config};

mod commands;
mod editor;
mod logging;
mod output;
mod picker;

use commands::entries::EntryInput;
use commands::{parse_key_val, Connection};
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "snow")]
#[command(about = "Snow - headless CMS for static sites")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to $SNOW_CONFIG or ~/.config/snow/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address the browser returned to after GitHub sign-in
    #[arg(long, global = true, value_name = "URL")]
    callback: Option<String>,

    /// Login form value (repeatable)
    #[arg(long = "login-field", global = true, value_name = "NAME=VALUE", value_parser = parse_key_val)]
    login_fields: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Log in to the configured backend
    Login,
    /// Forget stored credentials
    Logout,
    /// Index a site directory (local backend)
    Scan {
        /// Site root (defaults to the current directory)
        dir: Option<PathBuf>,
    },
    /// Manage content entries
    Entries {
        #[command(subcommand)]
        command: EntryCommands,
    },
    /// Manage media files
    Media {
        #[command(subcommand)]
        command: MediaCommands,
    },
    /// Rewrite media links between public and preview URLs
    Resolve {
        /// Rewrite preview URLs back to public URLs
        #[arg(long)]
        to_public: bool,
        /// Markdown text (reads stdin if omitted)
        text: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
}

#[derive(Subcommand)]
enum EntryCommands {
    /// List entries in a collection
    #[command(alias = "ls")]
    List { collection: String },
    /// Show one entry
    Show { collection: String, name: String },
    /// Create an entry, or update one with --name
    Save {
        collection: String,
        /// File name of an existing entry
        #[arg(long)]
        name: Option<String>,
        #[arg(short = 'T', long)]
        title: Option<String>,
        #[arg(long)]
        date: Option<String>,
        /// Entry body
        #[arg(short, long, conflicts_with = "body_file")]
        body: Option<String>,
        /// Read the body from a file
        #[arg(long, value_name = "PATH")]
        body_file: Option<PathBuf>,
        /// Edit the body in $EDITOR
        #[arg(short, long, conflicts_with_all = ["body", "body_file"])]
        edit: bool,
        /// Front matter value (repeatable)
        #[arg(short, long = "field", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        fields: Vec<(String, String)>,
        /// Where to write a new entry (local backend)
        #[arg(long, value_name = "PATH")]
        dest: Option<PathBuf>,
    },
    /// Delete entries
    #[command(alias = "rm")]
    Delete {
        collection: String,
        #[arg(required = true)]
        names: Vec<String>,
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum MediaCommands {
    /// List media files
    #[command(alias = "ls")]
    List,
    /// Upload a file into the media folder
    Upload {
        file: PathBuf,
        /// Where to write the copy (local backend)
        #[arg(long, value_name = "PATH")]
        dest: Option<PathBuf>,
    },
    /// Delete media files
    #[command(alias = "rm")]
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    match run(cli, &output).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn report_error(e: &anyhow::Error) {
    eprintln!("Error: {:#}", e);
    if let Some(suggestion) = e
        .downcast_ref::<BackendError>()
        .and_then(BackendError::recovery_suggestion)
    {
        eprintln!("Hint: {}", suggestion);
    }
}

async fn run(cli: Cli, output: &Output) -> Result<()> {
    let config = Config::load_with_cli_override(cli.config.as_ref())
        .context("Failed to load configuration")?;
    logging::init(&config, cli.verbose);

    if let Commands::Config { command } = &cli.command {
        return match command {
            Some(ConfigCommands::Show) | None => {
                commands::config::show(&config, cli.config.as_ref(), output)
            }
        };
    }

    let connection = Connection {
        config,
        callback: cli.callback,
        fields: cli.login_fields,
    };

    match cli.command {
        Commands::Config { .. } => Ok(()),
        Commands::Login => commands::login::login(&connection, output).await,
        Commands::Logout => commands::login::logout(&connection, output).await,
        Commands::Scan { dir } => commands::scan::scan(&connection, dir, output).await,
        Commands::Entries { command } => handle_entry_command(command, &connection, output).await,
        Commands::Media { command } => handle_media_command(command, &connection, output).await,
        Commands::Resolve { to_public, text } => {
            commands::resolve::resolve(&connection, text, to_public, output).await
        }
    }
}

async fn handle_entry_command(
    command: EntryCommands,
    connection: &Connection,
    output: &Output,
) -> Result<()> {
    match command {
        EntryCommands::List { collection } => {
            commands::entries::list(connection, &collection, output).await
        }
        EntryCommands::Show { collection, name } => {
            commands::entries::show(connection, &collection, &name, output).await
        }
        EntryCommands::Save {
            collection,
            name,
            title,
            date,
            body,
            body_file,
            edit,
            fields,
            dest,
        } => {
            let input = EntryInput {
                name,
                title,
                date,
                body,
                body_file,
                edit,
                fields,
                dest,
            };
            commands::entries::save(connection, &collection, input, output).await
        }
        EntryCommands::Delete {
            collection,
            names,
            yes,
        } => commands::entries::delete(connection, &collection, &names, yes, output).await,
    }
}

async fn handle_media_command(
    command: MediaCommands,
    connection: &Connection,
    output: &Output,
) -> Result<()> {
    match command {
        MediaCommands::List => commands::media::list(connection, output).await,
        MediaCommands::Upload { file, dest } => {
            commands::media::upload(connection, file, dest, output).await
        }
        MediaCommands::Delete { names, yes } => {
            commands::media::delete(connection, &names, yes, output).await
        }
    }
}
