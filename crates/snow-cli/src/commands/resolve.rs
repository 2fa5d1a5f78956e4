//! Link resolution between public and preview URLs

use std::io::Read;

use anyhow::{Context, Result};

use super::{connect, Connection};
use crate::output::Output;
use crate::picker::PathPicker;

/// Rewrite asset links in `text` (stdin when omitted)
pub async fn resolve(
    connection: &Connection,
    text: Option<String>,
    to_public: bool,
    output: &Output,
) -> Result<()> {
    let text = match text {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };

    let (_session, backend) = connect(connection, PathPicker::default(), output).await?;
    // Remote backends only know the assets they have listed
    backend.list_media_files().await?;
    let resolved = if to_public {
        backend.resolve_preview_to_public(&text).await?
    } else {
        backend.resolve_public_to_preview(&text).await?
    };

    if output.is_json() {
        println!("{}", serde_json::json!({ "text": resolved }));
    } else {
        print!("{}", resolved);
        if !resolved.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}
