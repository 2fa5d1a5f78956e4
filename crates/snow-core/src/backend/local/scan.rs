//! Directory scanning
//!
//! Walks a site directory and classifies files as collection entries or
//! media. Files matching neither are skipped without being reported.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use tracing::debug;

use crate::config::{Collection, Config};
use crate::models::extension_of;

const SKIP_DIRS: &[&str] = &["node_modules"];

/// What a discovered file is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Class {
    /// Entry of the named collection
    Content(String),
    Media,
}

/// A classified file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    /// Path relative to the site root, `/`-separated
    pub relative: String,
    pub absolute: PathBuf,
    pub class: Class,
}

impl Discovered {
    pub fn name(&self) -> &str {
        self.relative.rsplit('/').next().unwrap_or(&self.relative)
    }

    /// Containing folder relative to the site root
    pub fn folder(&self) -> &str {
        self.relative
            .rsplit_once('/')
            .map(|(folder, _)| folder)
            .unwrap_or("")
    }
}

/// Whether `folder` (relative, `/`-separated) ends with `pattern`'s components
fn folder_matches(folder: &str, pattern: &str) -> bool {
    let pattern = pattern.trim_matches('/').to_lowercase();
    if pattern.is_empty() {
        return false;
    }
    let folder = folder.to_lowercase();
    folder == pattern || folder.ends_with(&format!("/{}", pattern))
}

/// Classify a file by its path relative to the site root
///
/// Media wins over collections, and the first matching collection wins.
pub fn classify(relative: &str, media_folder: &str, collections: &[Collection]) -> Option<Class> {
    let (folder, name) = relative.rsplit_once('/').unwrap_or(("", relative));

    if name.starts_with('.') || name.starts_with('_') {
        return None;
    }

    if folder_matches(folder, media_folder) {
        return Some(Class::Media);
    }

    let extension = extension_of(name);
    collections
        .iter()
        .find(|c| folder_matches(folder, &c.folder) && c.extension.eq_ignore_ascii_case(&extension))
        .map(|c| Class::Content(c.name.clone()))
}

/// Walk `root` and return every classified file
///
/// Directories named `node_modules` and entries starting with `.` are not
/// descended into.
pub fn scan(root: &Path, config: &Config) -> Result<Vec<Discovered>> {
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !name.starts_with('.') && !SKIP_DIRS.contains(&&*name)
        })
        .build();

    let mut found = Vec::new();
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {:?}", root))?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let absolute = entry.into_path();
        let relative = match absolute.strip_prefix(root) {
            Ok(rel) => rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => continue,
        };

        match classify(&relative, &config.media_folder, &config.collections) {
            Some(class) => found.push(Discovered {
                relative,
                absolute,
                class,
            }),
            None => debug!(path = %relative, "Skipping unrecognized file"),
        }
    }

    found.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn collections() -> Vec<Collection> {
        let mut pages = Collection::new("pages", "content/pages");
        pages.extension = "markdown".to_string();
        vec![Collection::new("posts", "content/posts"), pages]
    }

    #[test]
    fn test_classify() {
        let cols = collections();
        let media = "static/media";

        assert_eq!(
            classify("content/posts/hello.md", media, &cols),
            Some(Class::Content("posts".to_string()))
        );
        assert_eq!(
            classify("Content/Posts/hello.md", media, &cols),
            Some(Class::Content("posts".to_string()))
        );
        assert_eq!(
            classify("content/pages/about.markdown", media, &cols),
            Some(Class::Content("pages".to_string()))
        );
        assert_eq!(classify("static/media/photo.png", media, &cols), Some(Class::Media));

        // Hidden and underscore files
        assert_eq!(classify("content/posts/_draft.md", media, &cols), None);
        assert_eq!(classify("content/posts/.hidden.md", media, &cols), None);
        // Wrong extension, nested folder, unrelated folder
        assert_eq!(classify("content/posts/notes.txt", media, &cols), None);
        assert_eq!(classify("content/posts/2024/hello.md", media, &cols), None);
        assert_eq!(classify("mycontent/posts/hello.md", media, &cols), None);
        assert_eq!(classify("README.md", media, &cols), None);
    }

    #[test]
    fn test_scan_walks_and_skips() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        for (path, contents) in [
            ("content/posts/hello.md", "hi"),
            ("content/posts/_index.md", "skip"),
            ("static/media/photo.png", "png"),
            ("node_modules/content/posts/dep.md", "skip"),
            (".git/content/posts/obj.md", "skip"),
            ("README.md", "skip"),
        ] {
            let full = root.join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, contents).unwrap();
        }

        let config = Config {
            collections: collections(),
            ..Config::default()
        };
        let found = scan(root, &config).unwrap();

        let relative: Vec<_> = found.iter().map(|d| d.relative.as_str()).collect();
        assert_eq!(relative, vec!["content/posts/hello.md", "static/media/photo.png"]);
        assert_eq!(found[0].name(), "hello.md");
        assert_eq!(found[0].folder(), "content/posts");
        assert_eq!(found[1].class, Class::Media);
        assert!(found[1].absolute.ends_with("static/media/photo.png"));
    }
}
