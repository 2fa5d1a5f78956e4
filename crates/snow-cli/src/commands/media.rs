//! Media command handlers

use std::path::PathBuf;

use anyhow::{Context, Result};

use snow_core::Document;

use super::{connect, dest_path, Connection};
use crate::editor;
use crate::output::Output;
use crate::picker::PathPicker;

pub async fn list(connection: &Connection, output: &Output) -> Result<()> {
    let (_session, backend) = connect(connection, PathPicker::default(), output).await?;
    let assets = backend.list_media_files().await?;
    output.print_assets(&assets);
    Ok(())
}

/// Copy `file` into the media folder
pub async fn upload(
    connection: &Connection,
    file: PathBuf,
    dest: Option<PathBuf>,
    output: &Output,
) -> Result<()> {
    let file = file
        .canonicalize()
        .with_context(|| format!("File not found: {}", file.display()))?;
    let picker = PathPicker {
        open: Some(file),
        save: dest_path(dest)?,
        ..PathPicker::default()
    };
    let (_session, backend) = connect(connection, picker, output).await?;

    let asset = backend.upload_media_file().await?;
    if output.is_json() || output.is_quiet() {
        output.print_asset(&asset);
    } else {
        output.success(&format!("Uploaded {}", asset.name));
        output.print_asset(&asset);
    }
    Ok(())
}

/// Delete media files by name
pub async fn delete(
    connection: &Connection,
    names: &[String],
    yes: bool,
    output: &Output,
) -> Result<()> {
    let (session, backend) = connect(connection, PathPicker::default(), output).await?;
    let assets = backend.list_media_files().await?;

    let mut docs = Vec::with_capacity(names.len());
    for name in names {
        let asset = assets
            .iter()
            .find(|a| &a.name == name)
            .with_context(|| format!("No media file named '{}'", name))?;
        docs.push(Document::Asset(asset.clone()));
    }

    if output.should_prompt() && !yes {
        let prompt = format!("Delete {} media file(s)?", docs.len());
        if !editor::confirm(&prompt)? {
            output.message("Cancelled.");
            return Ok(());
        }
    }

    session.delete_entries(&docs).await?;
    output.success(&format!("Deleted {} media file(s)", docs.len()));
    Ok(())
}
