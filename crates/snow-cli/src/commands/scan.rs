//! Site directory scan

use std::path::PathBuf;

use anyhow::{Context, Result};

use super::{connect, Connection};
use crate::output::Output;
use crate::picker::PathPicker;

/// Index `dir` (current directory when omitted) with the configured backend
pub async fn scan(connection: &Connection, dir: Option<PathBuf>, output: &Output) -> Result<()> {
    let dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let dir = dir
        .canonicalize()
        .with_context(|| format!("Directory not found: {}", dir.display()))?;

    let picker = PathPicker {
        directory: Some(dir),
        ..PathPicker::default()
    };
    let (_session, backend) = connect(connection, picker, output).await?;

    let report = backend.select_directory().await?;
    output.print_scan(&report);
    Ok(())
}
