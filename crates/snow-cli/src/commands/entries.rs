//! Entry command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_yaml::Value;

use snow_core::front_matter::Fields;
use snow_core::{Backend, ContentDocument, Document};

use super::{connect, dest_path, field_value, Connection};
use crate::editor;
use crate::output::Output;
use crate::picker::PathPicker;

/// Field values and body for a save
#[derive(Debug, Default)]
pub struct EntryInput {
    /// Existing entry to update (a new entry is created when unset)
    pub name: Option<String>,
    pub title: Option<String>,
    pub date: Option<String>,
    pub body: Option<String>,
    pub body_file: Option<PathBuf>,
    /// Open $EDITOR on the body
    pub edit: bool,
    pub fields: Vec<(String, String)>,
    /// Where a new local entry is written
    pub dest: Option<PathBuf>,
}

impl EntryInput {
    fn body(&self, current: &str) -> Result<Option<String>> {
        if let Some(body) = &self.body {
            return Ok(Some(body.clone()));
        }
        if let Some(path) = &self.body_file {
            let body = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read body file: {}", path.display()))?;
            return Ok(Some(body));
        }
        if self.edit {
            return editor::edit_text(current).map(Some);
        }
        Ok(None)
    }

    /// Apply the given values on top of `fields`
    fn apply(&self, fields: &mut Fields) {
        if let Some(title) = &self.title {
            fields.insert("title".into(), Value::String(title.clone()));
        }
        if let Some(date) = &self.date {
            fields.insert("date".into(), Value::String(date.clone()));
        }
        for (key, value) in &self.fields {
            fields.insert(Value::String(key.clone()), field_value(value));
        }
    }
}

async fn find_entry(
    backend: &dyn Backend,
    collection: &str,
    name: &str,
) -> Result<ContentDocument> {
    backend
        .list_entries(collection)
        .await?
        .into_iter()
        .find(|doc| doc.name == name)
        .with_context(|| format!("No entry named '{}' in {}", name, collection))
}

/// List entries in a collection, newest first
pub async fn list(connection: &Connection, collection: &str, output: &Output) -> Result<()> {
    let (_session, backend) = connect(connection, PathPicker::default(), output).await?;
    let docs = backend.list_entries(collection).await?;
    output.print_entries(&docs);
    Ok(())
}

/// Show one entry
pub async fn show(
    connection: &Connection,
    collection: &str,
    name: &str,
    output: &Output,
) -> Result<()> {
    let (_session, backend) = connect(connection, PathPicker::default(), output).await?;
    let doc = find_entry(backend.as_ref(), collection, name).await?;
    output.print_entry(&doc);
    Ok(())
}

/// Create or update an entry
pub async fn save(
    connection: &Connection,
    collection: &str,
    input: EntryInput,
    output: &Output,
) -> Result<()> {
    let Some(target) = connection.config.collection(collection).cloned() else {
        bail!(
            "Unknown collection '{}'. Check [[collections]] in your config.",
            collection
        );
    };

    let picker = PathPicker {
        save: dest_path(input.dest.clone())?,
        ..PathPicker::default()
    };
    let (session, backend) = connect(connection, picker, output).await?;

    let doc = match &input.name {
        Some(name) => {
            let mut doc = find_entry(backend.as_ref(), collection, name).await?;
            input.apply(&mut doc.fields);
            if let Some(body) = input.body(&doc.body)? {
                doc.body = body;
            }
            doc
        }
        None => {
            let mut fields = Fields::new();
            input.apply(&mut fields);
            if fields.get("title").is_none() {
                bail!("A new entry needs a title. Pass --title.");
            }
            let body = input.body("")?.unwrap_or_default();
            fields.insert("body".into(), Value::String(body));
            ContentDocument::from_form(&target, fields)
                .context("Failed to build entry from the given fields")?
        }
    };

    let saved = session.save_entry(collection, doc).await?;
    if output.is_json() {
        output.print_entry(&saved);
    } else {
        output.success(&format!("Saved {}", saved.file_path()));
    }
    Ok(())
}

/// Delete entries by file name
pub async fn delete(
    connection: &Connection,
    collection: &str,
    names: &[String],
    yes: bool,
    output: &Output,
) -> Result<()> {
    let (session, backend) = connect(connection, PathPicker::default(), output).await?;
    let entries = backend.list_entries(collection).await?;

    let mut docs = Vec::with_capacity(names.len());
    for name in names {
        let doc = entries
            .iter()
            .find(|doc| &doc.name == name)
            .with_context(|| format!("No entry named '{}' in {}", name, collection))?;
        docs.push(Document::Content(doc.clone()));
    }

    if output.should_prompt() && !yes {
        let prompt = format!("Delete {} entry(ies) from {}?", docs.len(), collection);
        if !editor::confirm(&prompt)? {
            output.message("Cancelled.");
            return Ok(());
        }
    }

    session.delete_entries(&docs).await?;
    output.success(&format!("Deleted {} entry(ies)", docs.len()));
    Ok(())
}
