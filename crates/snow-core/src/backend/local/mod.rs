//! Local storage backend
//!
//! Serves documents from a site directory on disk. A SQLite index keeps one
//! row per discovered file so listings never touch the file system; file
//! contents are only read during a directory scan and written on save.
//!
//! The backend is ready as soon as its index opens. A directory must be
//! selected (and scanned) before listings return anything.

pub mod index;
pub mod scan;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{join_all, try_join_all};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::backend::{log_failure, Backend, InitOutcome, Retirement, ScanReport};
use crate::config::{require, Collection, Config};
use crate::error::{BackendError, BackendResult};
use crate::links;
use crate::models::{asset_mime, extension_of, AssetDocument, ContentDocument, Document, FileHandle};
use crate::picker::FilePicker;
use crate::preview::{LeaseTable, PreviewLease, PreviewRegistry};

use self::index::{Index, IndexError, Record, RecordKind};
use self::scan::{Class, Discovered};

const NAME: &str = "local";

/// Backend over a local site directory
pub struct LocalBackend {
    config: Arc<Config>,
    repo_folder: String,
    picker: Arc<dyn FilePicker>,
    previews: PreviewRegistry,
    index: Mutex<Option<Index>>,
    leases: std::sync::Mutex<LeaseTable>,
    retirement: Retirement,
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

fn index_conflict(err: IndexError) -> BackendError {
    match err {
        IndexError::Conflict { .. } => BackendError::Conflict(err.to_string()),
        other => BackendError::retrieval("local index", other),
    }
}

fn content_from_record(record: Record) -> BackendResult<ContentDocument> {
    let raw = record.raw.unwrap_or_default();
    let mut doc = ContentDocument::from_raw(
        record.collection.unwrap_or_default(),
        record.path,
        record.name,
        raw,
    )
    .map_err(|e| BackendError::retrieval(format!("entry '{}'", record.id), e))?;
    doc.id = Some(record.id);
    doc.rev = record.rev;
    doc.handle = Some(FileHandle::new(record.file_path));
    Ok(doc)
}

fn asset_from_record(record: Record) -> AssetDocument {
    let public = record.public_url.unwrap_or_default();
    AssetDocument {
        id: Some(record.id),
        name: record.name,
        date: record.date,
        preview: record.preview_url.unwrap_or_else(|| public.clone()),
        public,
        path: record.path,
        mime: record
            .mime
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        handle: Some(FileHandle::new(record.file_path)),
        rev: record.rev,
    }
}

/// Root of the indexed site; writes are refused until one is selected
fn site_root(index: &Index) -> BackendResult<PathBuf> {
    index
        .root()
        .map_err(|e| BackendError::retrieval("site directory", e))?
        .filter(|root| !root.as_os_str().is_empty())
        .ok_or(BackendError::NoSiteDirectory)
}

fn outside_site(path: &Path) -> String {
    format!("{} is outside the selected site directory", path.display())
}

/// Relative `/`-separated path of `path` under `root`
fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

async fn modified_date(path: &Path) -> DateTime<Utc> {
    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(time) => DateTime::<Utc>::from(time),
        Err(_) => Utc::now(),
    }
}

impl LocalBackend {
    /// Create the backend. Fails if `backend.repo_folder` is not configured.
    pub fn new(
        config: Arc<Config>,
        picker: Arc<dyn FilePicker>,
        previews: PreviewRegistry,
    ) -> BackendResult<Self> {
        let repo_folder = require(&config.backend.repo_folder, "backend.repo_folder")?.to_string();
        Ok(Self {
            config,
            repo_folder,
            picker,
            previews,
            index: Mutex::new(None),
            leases: std::sync::Mutex::new(LeaseTable::new()),
            retirement: Retirement::default(),
        })
    }

    fn leases(&self) -> std::sync::MutexGuard<'_, LeaseTable> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock the index, opening it on first use
    async fn index(&self) -> BackendResult<MappedMutexGuard<'_, Index>> {
        let mut guard = self.index.lock().await;
        if guard.is_none() {
            let path = self.config.index_path(&self.repo_folder);
            let index = Index::open(&path).map_err(|e| BackendError::retrieval("local index", e))?;
            debug!(?path, "Opened local index");
            *guard = Some(index);
        }
        MutexGuard::try_map(guard, Option::as_mut).map_err(|_| BackendError::NoActiveBackend)
    }

    fn document_id(&self, relative: &str) -> String {
        format!("{}/{}", self.repo_folder, relative)
    }

    /// Give every indexed asset a preview URL for this session
    async fn refresh_previews(&self) -> BackendResult<()> {
        let assets = self
            .index()
            .await?
            .list_assets()
            .map_err(|e| BackendError::retrieval("media files", e))?;

        let loaded = join_all(assets.into_iter().map(|record| async move {
            let bytes = tokio::fs::read(&record.file_path).await;
            (record, bytes)
        }))
        .await;

        let index = self.index().await?;
        let mut leases = self.leases();
        for (record, bytes) in loaded {
            let preview = match bytes {
                Ok(bytes) => {
                    let mime = record.mime.clone().unwrap_or_default();
                    let lease = self.previews.create(mime, bytes);
                    let url = lease.url().to_string();
                    leases.insert(record.id.clone(), lease);
                    url
                }
                Err(e) => {
                    warn!(path = ?record.file_path, error = %e, "Media file unreadable, previewing by public URL");
                    leases.release(&record.id);
                    record.public_url.clone().unwrap_or_default()
                }
            };
            index
                .set_preview(&record.id, &preview)
                .map_err(|e| BackendError::retrieval("media files", e))?;
        }
        Ok(())
    }

    /// Read a discovered file and build its index record
    async fn build_record(
        &self,
        found: &Discovered,
    ) -> BackendResult<(Record, Option<PreviewLease>)> {
        let handle = FileHandle::new(&found.absolute);
        let id = self.document_id(&found.relative);

        match &found.class {
            Class::Content(collection) => {
                let raw = handle
                    .read_text()
                    .await
                    .map_err(|e| BackendError::retrieval(found.relative.clone(), e))?;
                let doc = ContentDocument::from_raw(collection, found.folder(), found.name(), raw)
                    .map_err(|e| BackendError::retrieval(found.relative.clone(), e))?;

                Ok((
                    Record {
                        id,
                        rev: None,
                        kind: RecordKind::Content,
                        name: doc.name,
                        collection: Some(doc.collection),
                        date: doc.date,
                        path: doc.path,
                        file_path: found.absolute.clone(),
                        raw: Some(doc.raw),
                        mime: None,
                        public_url: None,
                        preview_url: None,
                    },
                    None,
                ))
            }
            Class::Media => {
                let name = found.name().to_string();
                let mime = asset_mime(&extension_of(&name));
                let public = self.config.public_url(&name);
                let date = modified_date(&found.absolute).await;

                let (preview, lease) = match handle.read_bytes().await {
                    Ok(bytes) => {
                        let lease = self.previews.create(mime, bytes);
                        (lease.url().to_string(), Some(lease))
                    }
                    Err(e) => {
                        warn!(path = %found.relative, error = %e, "Media file unreadable, previewing by public URL");
                        (public.clone(), None)
                    }
                };

                Ok((
                    Record {
                        id,
                        rev: None,
                        kind: RecordKind::Asset,
                        name,
                        collection: None,
                        date,
                        path: found.folder().to_string(),
                        file_path: found.absolute.clone(),
                        raw: None,
                        mime: Some(mime.to_string()),
                        public_url: Some(public),
                        preview_url: Some(preview),
                    },
                    lease,
                ))
            }
        }
    }

    async fn scan_directory(&self, root: PathBuf) -> BackendResult<ScanReport> {
        let config = Arc::clone(&self.config);
        let scan_root = root.clone();
        let discovered = tokio::task::spawn_blocking(move || scan::scan(&scan_root, &config))
            .await
            .map_err(|e| BackendError::retrieval("site directory", e))?
            .map_err(|e| BackendError::retrieval("site directory", e))?;

        // Every file is read before anything is written
        let built = try_join_all(discovered.iter().map(|found| self.build_record(found))).await?;

        let (mut records, leases): (Vec<Record>, Vec<Option<PreviewLease>>) =
            built.into_iter().unzip();

        let mut index = self.index().await?;
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let revs = index
            .revisions(&ids)
            .map_err(|e| BackendError::retrieval("site directory", e))?;
        for record in &mut records {
            record.rev = revs.get(&record.id).cloned();
        }

        index
            .put_batch(&records)
            .map_err(|e| BackendError::retrieval("site directory", e))?;
        index
            .set_root(&root)
            .map_err(|e| BackendError::retrieval("site directory", e))?;
        drop(index);

        let mut table = self.leases();
        for (record, lease) in records.iter().zip(leases) {
            match lease {
                Some(lease) => table.insert(record.id.clone(), lease),
                None => {
                    table.release(&record.id);
                }
            }
        }

        let entries = records
            .iter()
            .filter(|r| r.kind == RecordKind::Content)
            .count();
        let report = ScanReport {
            root,
            entries,
            media: records.len() - entries,
        };
        info!(root = ?report.root, entries = report.entries, media = report.media, "Scanned site directory");
        Ok(report)
    }

    async fn save(
        &self,
        collection: &Collection,
        mut doc: ContentDocument,
    ) -> BackendResult<ContentDocument> {
        doc.prepare(collection)
            .map_err(|e| BackendError::persist(doc.name.clone(), e))?;
        let id = match &doc.id {
            Some(id) => id.clone(),
            None => {
                let id = self.document_id(&doc.file_path());
                doc.id = Some(id.clone());
                id
            }
        };

        // Held for the whole save so local saves are serialized
        let mut index = self.index().await?;
        let current = index
            .get(&id)
            .map_err(|e| BackendError::persist(doc.name.clone(), e))?;

        if let Some(current) = &current {
            if current.rev != doc.rev {
                if current.raw.as_deref() == Some(doc.raw.as_str()) {
                    debug!(%id, "Save matches stored content");
                    doc.rev = current.rev.clone();
                    doc.handle = Some(FileHandle::new(&current.file_path));
                    return Ok(doc);
                }
                return Err(BackendError::persist(
                    doc.name.clone(),
                    BackendError::Conflict(format!(
                        "'{}' changed since it was loaded (stored revision {})",
                        id,
                        current.rev.as_deref().unwrap_or("none")
                    )),
                ));
            }
        }

        let handle = match doc.handle.clone() {
            Some(handle) => handle,
            None => match &current {
                Some(current) => FileHandle::new(&current.file_path),
                None => {
                    let root = site_root(&index)?;
                    let suggested = root.join(doc.file_path());
                    let handle = self
                        .picker
                        .save_file(&suggested)
                        .await?
                        .ok_or(BackendError::Cancelled)?;
                    if relative_to(&root, handle.path()).is_none() {
                        return Err(BackendError::persist(
                            doc.name.clone(),
                            outside_site(handle.path()),
                        ));
                    }
                    handle
                }
            },
        };

        handle
            .write(doc.raw.as_bytes())
            .await
            .map_err(|e| BackendError::persist(doc.name.clone(), e))?;

        let record = Record {
            id: id.clone(),
            rev: doc.rev.clone(),
            kind: RecordKind::Content,
            name: doc.name.clone(),
            collection: Some(doc.collection.clone()),
            date: doc.date,
            path: doc.path.clone(),
            file_path: handle.path().to_path_buf(),
            raw: Some(doc.raw.clone()),
            mime: None,
            public_url: None,
            preview_url: None,
        };

        let rev = index.put(&record).map_err(|e| BackendError::IndexOutOfSync {
            path: handle.path().to_path_buf(),
            source: Box::new(e),
        })?;

        info!(%id, %rev, "Saved entry");
        doc.rev = Some(rev);
        doc.handle = Some(handle);
        Ok(doc)
    }

    async fn delete(&self, docs: &[Document]) -> BackendResult<()> {
        let count = docs.len();
        let ids: Vec<&str> = docs.iter().filter_map(Document::id).collect();

        // Phase one: tombstones, plus the file paths they pointed at
        let mut files: Vec<PathBuf> = Vec::new();
        {
            let mut index = self.index().await?;
            for doc in docs {
                match (doc.handle(), doc.id()) {
                    (Some(handle), _) => files.push(handle.path().to_path_buf()),
                    (None, Some(id)) => {
                        let record = index
                            .get(id)
                            .map_err(|e| BackendError::deletion(count, e))?;
                        if let Some(record) = record {
                            files.push(record.file_path);
                        }
                    }
                    (None, None) => {}
                }
            }
            let changed = index
                .tombstone(&ids)
                .map_err(|e| BackendError::deletion(count, e))?;
            debug!(requested = count, changed, "Marked documents deleted");
        }

        {
            let mut leases = self.leases();
            for doc in docs {
                if let (Some(_), Some(id)) = (doc.as_asset(), doc.id()) {
                    leases.release(id);
                }
            }
        }

        // Phase two: the files themselves
        let results = join_all(files.iter().map(|path| async move {
            (path, FileHandle::new(path).remove().await)
        }))
        .await;

        let mut orphaned = Vec::new();
        for (path, result) in results {
            match result {
                Ok(true) => debug!(?path, "Removed file"),
                Ok(false) => debug!(?path, "File already removed"),
                Err(e) => {
                    warn!(?path, error = %e, "Failed to remove file");
                    orphaned.push(path.clone());
                }
            }
        }

        if !orphaned.is_empty() {
            return Err(BackendError::Orphaned { paths: orphaned });
        }
        info!(count, "Deleted documents");
        Ok(())
    }

    async fn upload(&self) -> BackendResult<AssetDocument> {
        let root = site_root(&*self.index().await?)?;
        let source = self
            .picker
            .open_file()
            .await?
            .ok_or(BackendError::Cancelled)?;
        let source_name = source.name().unwrap_or("upload").to_string();
        let bytes = source
            .read_bytes()
            .await
            .map_err(|e| BackendError::persist(source_name.clone(), e))?;

        let suggested = root.join(&self.config.media_folder).join(&source_name);
        let dest = self
            .picker
            .save_file(&suggested)
            .await?
            .ok_or(BackendError::Cancelled)?;
        let name = dest.name().unwrap_or(&source_name).to_string();
        let relative = relative_to(&root, dest.path())
            .ok_or_else(|| BackendError::persist(name.clone(), outside_site(dest.path())))?;

        if dest.path() != source.path() {
            dest.write(&bytes)
                .await
                .map_err(|e| BackendError::persist(name.clone(), e))?;
        }

        let mime = asset_mime(&extension_of(&name));
        let lease = self.previews.create(mime, bytes);
        let id = self.document_id(&relative);
        let folder = relative
            .rsplit_once('/')
            .map(|(folder, _)| folder.to_string())
            .unwrap_or_default();

        let mut record = Record {
            id: id.clone(),
            rev: None,
            kind: RecordKind::Asset,
            name: name.clone(),
            collection: None,
            date: Utc::now(),
            path: folder,
            file_path: dest.path().to_path_buf(),
            raw: None,
            mime: Some(mime.to_string()),
            public_url: Some(self.config.public_url(&name)),
            preview_url: Some(lease.url().to_string()),
        };

        let mut index = self.index().await?;
        let out_of_sync = |e: IndexError| BackendError::IndexOutOfSync {
            path: dest.path().to_path_buf(),
            source: Box::new(e),
        };
        record.rev = index.revision(&id).map_err(out_of_sync)?;
        let rev = index.put(&record).map_err(out_of_sync)?;
        drop(index);

        self.leases().insert(id.clone(), lease);
        record.rev = Some(rev);
        info!(%id, "Uploaded media file");
        Ok(asset_from_record(record))
    }

    async fn rewrite(&self, text: &str, to_preview: bool) -> BackendResult<String> {
        let index = self.index().await?;
        links::rewrite(text, |url| {
            if to_preview {
                index.preview_for_public(url)
            } else {
                index.public_for_preview(url)
            }
        })
        .map_err(BackendError::link_resolution)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        NAME
    }

    async fn initialize(&self) -> BackendResult<InitOutcome> {
        self.retirement.check(NAME)?;
        self.refresh_previews()
            .await
            .map_err(|e| log_failure("initialize", e))?;
        info!(repo_folder = %self.repo_folder, "Local backend ready");
        Ok(InitOutcome::Ready)
    }

    async fn select_directory(&self) -> BackendResult<ScanReport> {
        self.retirement.check(NAME)?;
        let root = self
            .picker
            .select_directory()
            .await?
            .ok_or(BackendError::Cancelled)?;
        self.scan_directory(root)
            .await
            .map_err(|e| log_failure("select_directory", e))
    }

    async fn list_entries(&self, collection: &str) -> BackendResult<Vec<ContentDocument>> {
        self.retirement.check(NAME)?;
        let records = self
            .index()
            .await?
            .list_content(collection)
            .map_err(|e| {
                let err = BackendError::retrieval(format!("collection '{}'", collection), e);
                log_failure("list_entries", err)
            })?;

        records
            .into_iter()
            .filter(|r| !is_hidden(&r.name))
            .map(content_from_record)
            .collect::<BackendResult<Vec<_>>>()
            .map_err(|e| log_failure("list_entries", e))
    }

    async fn save_entry(
        &self,
        collection: &Collection,
        doc: ContentDocument,
    ) -> BackendResult<ContentDocument> {
        self.retirement.check(NAME)?;
        self.save(collection, doc)
            .await
            .map_err(|e| log_failure("save_entry", e))
    }

    async fn delete_entries(&self, docs: &[Document]) -> BackendResult<()> {
        self.retirement.check(NAME)?;
        self.delete(docs)
            .await
            .map_err(|e| log_failure("delete_entries", e))
    }

    async fn list_media_files(&self) -> BackendResult<Vec<AssetDocument>> {
        self.retirement.check(NAME)?;
        let records = self
            .index()
            .await?
            .list_assets()
            .map_err(|e| {
                log_failure("list_media_files", BackendError::retrieval("media files", e))
            })?;
        Ok(records.into_iter().map(asset_from_record).collect())
    }

    async fn upload_media_file(&self) -> BackendResult<AssetDocument> {
        self.retirement.check(NAME)?;
        self.upload()
            .await
            .map_err(|e| log_failure("upload_media_file", e))
    }

    async fn resolve_public_to_preview(&self, text: &str) -> BackendResult<String> {
        self.retirement.check(NAME)?;
        self.rewrite(text, true)
            .await
            .map_err(|e| log_failure("resolve_public_to_preview", e))
    }

    async fn resolve_preview_to_public(&self, text: &str) -> BackendResult<String> {
        self.retirement.check(NAME)?;
        self.rewrite(text, false)
            .await
            .map_err(|e| log_failure("resolve_preview_to_public", e))
    }

    fn retire(&self) {
        if self.retirement.retire() {
            self.leases().clear();
            info!("Local backend retired");
        }
    }
}
