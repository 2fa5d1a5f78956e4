//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use snow_core::{AssetDocument, ContentDocument, LoginConfig, ScanReport};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

/// Entry fields shown in listings and JSON output
#[derive(Serialize)]
struct EntrySummary<'a> {
    id: Option<&'a str>,
    name: &'a str,
    collection: &'a str,
    title: Option<&'a str>,
    date: String,
    path: String,
}

impl<'a> From<&'a ContentDocument> for EntrySummary<'a> {
    fn from(doc: &'a ContentDocument) -> Self {
        Self {
            id: doc.id.as_deref(),
            name: &doc.name,
            collection: &doc.collection,
            title: doc.title(),
            date: doc.date.to_rfc3339(),
            path: doc.file_path(),
        }
    }
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    fn print_json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to serialize output: {}", e),
        }
    }

    /// Print a single entry with its front matter and body
    pub fn print_entry(&self, doc: &ContentDocument) {
        match self.format {
            OutputFormat::Human => {
                println!("Name:       {}", doc.name);
                println!("Collection: {}", doc.collection);
                println!("Path:       {}", doc.file_path());
                if let Some(title) = doc.title() {
                    println!("Title:      {}", title);
                }
                println!("Date:       {}", doc.date.format("%Y-%m-%d %H:%M"));
                if let Some(ref id) = doc.id {
                    println!("ID:         {}", id);
                }
                if let Some(ref rev) = doc.rev {
                    println!("Revision:   {}", rev);
                }
                if !doc.body.is_empty() {
                    println!();
                    println!("{}", doc.body);
                }
            }
            OutputFormat::Json => self.print_json(doc),
            OutputFormat::Quiet => println!("{}", doc.file_path()),
        }
    }

    /// Print a list of entries
    pub fn print_entries(&self, docs: &[ContentDocument]) {
        match self.format {
            OutputFormat::Human => {
                if docs.is_empty() {
                    println!("No entries found.");
                    return;
                }
                for doc in docs {
                    println!(
                        "{} | {} | {}",
                        doc.date.format("%Y-%m-%d"),
                        truncate(doc.title().unwrap_or("(untitled)"), 40),
                        truncate(&doc.name, 45)
                    );
                }
                println!("\n{} entry(ies)", docs.len());
            }
            OutputFormat::Json => {
                let summaries: Vec<EntrySummary> = docs.iter().map(EntrySummary::from).collect();
                self.print_json(&summaries);
            }
            OutputFormat::Quiet => {
                for doc in docs {
                    println!("{}", doc.name);
                }
            }
        }
    }

    /// Print a list of media files
    pub fn print_assets(&self, assets: &[AssetDocument]) {
        match self.format {
            OutputFormat::Human => {
                if assets.is_empty() {
                    println!("No media files found.");
                    return;
                }
                for asset in assets {
                    println!(
                        "{} | {} | {}",
                        truncate(&asset.name, 30),
                        truncate(&asset.public, 40),
                        asset.mime
                    );
                }
                println!("\n{} media file(s)", assets.len());
            }
            OutputFormat::Json => self.print_json(assets),
            OutputFormat::Quiet => {
                for asset in assets {
                    println!("{}", asset.public);
                }
            }
        }
    }

    pub fn print_asset(&self, asset: &AssetDocument) {
        match self.format {
            OutputFormat::Human => {
                println!("Name:    {}", asset.name);
                println!("Public:  {}", asset.public);
                println!("Preview: {}", asset.preview);
                println!("Type:    {}", asset.mime);
            }
            OutputFormat::Json => self.print_json(asset),
            OutputFormat::Quiet => println!("{}", asset.public),
        }
    }

    pub fn print_scan(&self, report: &ScanReport) {
        match self.format {
            OutputFormat::Human => {
                println!("Scanned {}", report.root.display());
                println!("  entries: {}", report.entries);
                println!("  media:   {}", report.media);
            }
            OutputFormat::Json => self.print_json(report),
            OutputFormat::Quiet => println!("{} {}", report.entries, report.media),
        }
    }

    /// Describe a login form
    pub fn print_login_config(&self, config: &LoginConfig) {
        match self.format {
            OutputFormat::Human => {
                println!("{}", config.title);
                if !config.message.is_empty() {
                    println!("{}", config.message);
                }
                for field in &config.fields {
                    println!("  --field {}=<{:?}>", field.name, field.kind);
                }
            }
            OutputFormat::Json => self.print_json(config),
            OutputFormat::Quiet => {}
        }
    }

    /// Tell the user to continue in the browser
    pub fn print_redirect(&self, url: &str) {
        match self.format {
            OutputFormat::Human => {
                println!("Continue in your browser:");
                println!("  {}", url);
            }
            OutputFormat::Json => println!("{}", serde_json::json!({ "redirect": url })),
            OutputFormat::Quiet => println!("{}", url),
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ünïcödé tïtle", 6), "ünï...");
    }

    #[test]
    fn test_entry_summary() {
        let doc = ContentDocument::from_raw(
            "posts",
            "content/posts",
            "hello.md",
            "---\ntitle: Hello\ndate: 2024-01-01\n---\n\nHi",
        )
        .unwrap();
        let summary = EntrySummary::from(&doc);
        assert_eq!(summary.title, Some("Hello"));
        assert_eq!(summary.path, "content/posts/hello.md");
        assert!(summary.date.starts_with("2024-01-01"));
    }
}
