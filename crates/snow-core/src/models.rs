//! Document models for Snow
//!
//! Defines the two document shapes every backend hands out: content entries
//! (front matter + body) and media assets (public URL + preview URL).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::config::Collection;
use crate::front_matter::{self, Fields, FrontMatterError};

/// A handle to a file on the local file system
///
/// Only the local backend hands these out. The parent directory handle is
/// derived from the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHandle {
    path: PathBuf,
}

impl FileHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name component
    pub fn name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    /// Handle of the containing directory
    pub fn parent(&self) -> Option<FileHandle> {
        self.path.parent().map(FileHandle::new)
    }

    pub async fn read_text(&self) -> std::io::Result<String> {
        tokio::fs::read_to_string(&self.path).await
    }

    pub async fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    /// Write the whole file, creating parent directories as needed
    pub async fn write(&self, contents: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, contents).await
    }

    /// Remove the file. Returns `false` if it was already gone.
    pub async fn remove(&self) -> std::io::Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// A content entry: front matter fields plus body text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentDocument {
    /// Storage key (file path for local, blob id for remote)
    pub id: Option<String>,
    /// File name including extension
    pub name: String,
    /// Name of the collection this entry belongs to
    pub collection: String,
    /// Effective ordering date
    pub date: DateTime<Utc>,
    /// Full file text, front matter and body
    pub raw: String,
    /// Front matter, never containing `body`
    pub fields: Fields,
    /// Text after the front matter
    pub body: String,
    /// Containing folder, relative to the site root
    pub path: String,
    /// Local file handle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<FileHandle>,
    /// Revision token (local backend only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
}

impl ContentDocument {
    /// Build a document from file text
    pub fn from_raw(
        collection: impl Into<String>,
        path: impl Into<String>,
        name: impl Into<String>,
        raw: impl Into<String>,
    ) -> Result<Self, FrontMatterError> {
        let raw = raw.into();
        let (fields, body) = front_matter::parse(&raw)?;
        Ok(Self {
            id: None,
            name: name.into(),
            collection: collection.into(),
            date: front_matter::effective_date(&fields),
            raw,
            fields,
            body,
            path: path.into(),
            handle: None,
            rev: None,
        })
    }

    /// Build a document from submitted form fields
    ///
    /// The body travels inside the fields under `body`; it is lifted out and
    /// the file name is derived from the collection's slug template.
    pub fn from_form(collection: &Collection, fields: Fields) -> Result<Self, FrontMatterError> {
        let mut doc = Self {
            id: None,
            name: String::new(),
            collection: collection.name.clone(),
            date: front_matter::sentinel_date(),
            raw: String::new(),
            fields,
            body: String::new(),
            path: collection.folder_path().to_string(),
            handle: None,
            rev: None,
        };
        doc.prepare(collection)?;
        Ok(doc)
    }

    /// Normalize before persisting into `collection`
    ///
    /// Fills in collection, folder and file name when absent, then
    /// rebuilds `date` and `raw` from fields and body.
    pub fn prepare(&mut self, collection: &Collection) -> Result<(), FrontMatterError> {
        if let Some(body) = self.fields.remove("body") {
            self.body = match body {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => serde_yaml::to_string(&other)?.trim_end().to_string(),
            };
        }

        self.collection = collection.name.clone();
        if self.path.is_empty() {
            self.path = collection.folder_path().to_string();
        }
        if self.name.is_empty() {
            self.name = create_filename(collection, &self.fields);
        }

        self.render()
    }

    /// Rebuild `date` and `raw` from `fields` and `body`
    pub fn render(&mut self) -> Result<(), FrontMatterError> {
        self.date = front_matter::effective_date(&self.fields);
        self.raw = front_matter::serialize(&self.fields, &self.body)?;
        Ok(())
    }

    /// `title` field, if it is a string
    pub fn title(&self) -> Option<&str> {
        front_matter::get_str(&self.fields, "title")
    }

    /// Path of the file relative to the site root
    pub fn file_path(&self) -> String {
        join_path(&self.path, &self.name)
    }
}

/// A media file: stable public URL plus a session-scoped preview URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDocument {
    pub id: Option<String>,
    pub name: String,
    pub date: DateTime<Utc>,
    /// URL other documents reference
    pub public: String,
    /// Renderable URL valid for this session only
    pub preview: String,
    /// Containing folder, relative to the site root
    pub path: String,
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<FileHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
}

impl AssetDocument {
    pub fn file_path(&self) -> String {
        join_path(&self.path, &self.name)
    }
}

/// Either kind of document, as accepted by `delete_entries`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Document {
    Content(ContentDocument),
    Asset(AssetDocument),
}

impl Document {
    pub fn id(&self) -> Option<&str> {
        match self {
            Document::Content(doc) => doc.id.as_deref(),
            Document::Asset(doc) => doc.id.as_deref(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Document::Content(doc) => &doc.name,
            Document::Asset(doc) => &doc.name,
        }
    }

    pub fn file_path(&self) -> String {
        match self {
            Document::Content(doc) => doc.file_path(),
            Document::Asset(doc) => doc.file_path(),
        }
    }

    pub fn handle(&self) -> Option<&FileHandle> {
        match self {
            Document::Content(doc) => doc.handle.as_ref(),
            Document::Asset(doc) => doc.handle.as_ref(),
        }
    }

    pub fn as_asset(&self) -> Option<&AssetDocument> {
        match self {
            Document::Asset(doc) => Some(doc),
            Document::Content(_) => None,
        }
    }
}

impl From<ContentDocument> for Document {
    fn from(doc: ContentDocument) -> Self {
        Document::Content(doc)
    }
}

impl From<AssetDocument> for Document {
    fn from(doc: AssetDocument) -> Self {
        Document::Asset(doc)
    }
}

fn join_path(folder: &str, name: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", folder, name)
    }
}

/// Lower-case a title and collapse each run of non-word characters to `-`
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut in_run = false;
    for c in title.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c);
            in_run = false;
        } else if !in_run {
            slug.push('-');
            in_run = true;
        }
    }
    slug
}

/// Derive a file name from a collection's slug template
///
/// Supported placeholders: `{{slug}}`, `{{year}}`, `{{month}}`, `{{day}}`,
/// `{{hour}}`, `{{minute}}`, `{{second}}`. Dates come from the `date` field,
/// or the current time when absent.
pub fn create_filename(collection: &Collection, fields: &Fields) -> String {
    let title = front_matter::get_str(fields, "title")
        .filter(|t| !t.trim().is_empty())
        .unwrap_or("untitled");
    let date = front_matter::field_date(fields).unwrap_or_else(Utc::now);

    let stem = collection
        .slug
        .replace("{{slug}}", &slugify(title))
        .replace("{{year}}", &format!("{:04}", date.year()))
        .replace("{{month}}", &format!("{:02}", date.month()))
        .replace("{{day}}", &format!("{:02}", date.day()))
        .replace("{{hour}}", &format!("{:02}", date.hour()))
        .replace("{{minute}}", &format!("{:02}", date.minute()))
        .replace("{{second}}", &format!("{:02}", date.second()));

    format!("{}.{}", stem, collection.extension)
}

/// MIME type for a media file extension
pub fn asset_mime(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "apng" => "image/apng",
        "avif" => "image/avif",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "ico" => "image/vnd.microsoft.icon",
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "tif" | "tiff" => "image/tiff",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// MIME type for a content file extension
pub fn content_mime(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "md" | "markdown" => "text/markdown",
        _ => "text/plain",
    }
}

/// Lower-cased extension of a file name, without the dot
pub fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn posts() -> Collection {
        Collection::new("posts", "/content/posts/")
    }

    fn fields(yaml: &str) -> Fields {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_from_raw_scenario() {
        let doc = ContentDocument::from_raw(
            "posts",
            "content/posts",
            "hello.md",
            "---\ntitle: \"Hi\"\ndate: 2024-01-01T00:00:00Z\n---\n\nBody text",
        )
        .unwrap();

        assert_eq!(doc.title(), Some("Hi"));
        assert_eq!(doc.date, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(doc.body, "Body text");
        assert_eq!(doc.file_path(), "content/posts/hello.md");
    }

    #[test]
    fn test_render_matches_front_matter_layout() {
        let mut doc = ContentDocument::from_raw("posts", "content/posts", "a.md", "plain").unwrap();
        doc.fields
            .insert(Value::from("title"), Value::from("Plain"));
        doc.render().unwrap();

        let expected = front_matter::serialize(&doc.fields, "plain").unwrap();
        assert_eq!(doc.raw, expected);
        assert!(doc.raw.ends_with("---\n\nplain"));
    }

    #[test]
    fn test_from_form_lifts_body_and_names_file() {
        let doc = ContentDocument::from_form(
            &posts(),
            fields("title: Hello World!\ndate: 2024-02-03T04:05:06Z\nbody: Some text\n"),
        )
        .unwrap();

        assert_eq!(doc.name, "hello-world-.md");
        assert_eq!(doc.body, "Some text");
        assert!(!doc.fields.contains_key("body"));
        assert_eq!(doc.path, "content/posts");
        assert_eq!(doc.collection, "posts");
        assert_eq!(doc.date, Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap());
        assert!(!doc.raw.contains("body:"));
    }

    #[test]
    fn test_create_filename_template() {
        let mut collection = posts();
        collection.slug = "{{year}}/{{month}}/{{day}}/{{hour}}{{minute}}{{second}}-{{slug}}".into();
        collection.extension = "markdown".into();

        let name = create_filename(
            &collection,
            &fields("title: Ünïcode & Friends\ndate: 2023-07-09T08:01:02Z\n"),
        );
        assert_eq!(name, "2023/07/09/080102--n-code-friends.markdown");
    }

    #[test]
    fn test_create_filename_without_title() {
        let name = create_filename(&posts(), &fields("date: 2024-01-01\n"));
        assert_eq!(name, "untitled.md");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello, World"), "hello-world");
        assert_eq!(slugify("a - b"), "a-b");
        assert_eq!(slugify("snake_case_ok"), "snake_case_ok");
    }

    #[test]
    fn test_mime_maps() {
        assert_eq!(asset_mime("PNG"), "image/png");
        assert_eq!(asset_mime("jpg"), "image/jpeg");
        assert_eq!(asset_mime("ico"), "image/vnd.microsoft.icon");
        assert_eq!(asset_mime("svg"), "image/svg+xml");
        assert_eq!(asset_mime("tif"), "image/tiff");
        assert_eq!(asset_mime("zip"), "application/octet-stream");
        assert_eq!(content_mime("markdown"), "text/markdown");
        assert_eq!(content_mime("txt"), "text/plain");
        assert_eq!(extension_of("photo.PNG"), "png");
        assert_eq!(extension_of("README"), "");
    }

    #[tokio::test]
    async fn test_file_handle_remove_is_idempotent() {
        let temp = tempfile::TempDir::new().unwrap();
        let handle = FileHandle::new(temp.path().join("nested/dir/file.md"));

        handle.write(b"hello").await.unwrap();
        assert_eq!(handle.read_text().await.unwrap(), "hello");
        assert_eq!(handle.name(), Some("file.md"));
        assert!(handle.parent().unwrap().path().ends_with("nested/dir"));

        assert!(handle.remove().await.unwrap());
        assert!(!handle.remove().await.unwrap());
    }

    #[test]
    fn test_document_enum_accessors() {
        let doc: Document = ContentDocument::from_raw("posts", "", "x.md", "x").unwrap().into();
        assert_eq!(doc.name(), "x.md");
        assert_eq!(doc.file_path(), "x.md");
        assert!(doc.as_asset().is_none());
    }
}
