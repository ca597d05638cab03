//! Custom URL scheme handling: `muban://app/<path>` is served from the
//! archive that ships with the executable.

use crate::archive::{Archive, ArchiveError};
use crate::cipher::Decipher;
use crate::traits::ExecutableLocator;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub scheme: String,
    pub host: String,
    /// Served for `muban://app/` and for directory URLs.
    pub entry: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            scheme: "muban".to_string(),
            host: "app".to_string(),
            entry: "index.html".to_string(),
        }
    }
}

impl ProtocolConfig {
    /// The URL a webview should load for `path` on this platform. Windows
    /// webviews only accept custom schemes in the `http://<scheme>.localhost`
    /// form.
    pub fn url_for(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if cfg!(windows) {
            format!("http://{}.localhost/{}", self.scheme, path)
        } else {
            format!("{}://{}/{}", self.scheme, self.host, path)
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("malformed url: {0}")]
    Malformed(String),
    #[error("url {0} does not belong to this scheme")]
    ForeignUrl(String),
    #[error("path escapes the archive: {0}")]
    Traversal(String),
}

/// Map a request URL to a path inside the archive.
///
/// Accepts `scheme://host/<path>` and `http(s)://scheme.localhost/<path>`.
/// Query and fragment are dropped, segments are percent-decoded, and an
/// empty path maps to the configured entry document.
pub fn resolve_archive_path(raw: &str, config: &ProtocolConfig) -> Result<String, ResolveError> {
    let url = url::Url::parse(raw).map_err(|e| ResolveError::Malformed(format!("{}: {}", raw, e)))?;

    let host = url.host_str().unwrap_or("");
    let ours = (url.scheme() == config.scheme && host == config.host)
        || (matches!(url.scheme(), "http" | "https")
            && host == format!("{}.localhost", config.scheme));
    if !ours {
        return Err(ResolveError::ForeignUrl(raw.to_string()));
    }

    let mut parts = Vec::new();
    for segment in url.path().split('/') {
        let decoded = percent_decode_str(segment)
            .decode_utf8()
            .map_err(|_| ResolveError::Malformed(raw.to_string()))?;
        match decoded.as_ref() {
            "" | "." => {}
            ".." => return Err(ResolveError::Traversal(raw.to_string())),
            s if s.contains('/') || s.contains('\\') || s.contains('\0') => {
                return Err(ResolveError::Traversal(raw.to_string()))
            }
            s => parts.push(s.to_string()),
        }
    }

    let mut path = parts.join("/");
    if path.is_empty() {
        path = config.entry.clone();
    } else if url.path().ends_with('/') {
        path = format!("{}/{}", path, config.entry);
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolResponse {
    pub status: u16,
    pub mime_type: String,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl ProtocolResponse {
    fn ok(path: &str, body: Vec<u8>) -> Self {
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let mime_type = if mime.type_().as_str() == "text"
            || mime.essence_str() == "application/javascript"
        {
            format!("{}; charset=utf-8", mime.essence_str())
        } else {
            mime.essence_str().to_string()
        };
        Self {
            status: 200,
            mime_type,
            body,
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            mime_type: "text/plain; charset=utf-8".to_string(),
            body: message.as_bytes().to_vec(),
        }
    }

    /// What the page sees when no job could be created for a request.
    pub fn not_found() -> Self {
        Self::error(404, "not found")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Where the archive comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    /// Appended to the running executable, or `app.asar` beside it.
    Executable,
    /// An explicit archive file (development builds).
    Path(PathBuf),
}

/// Length and modification time of a file on disk.
type FileStamp = (u64, Option<SystemTime>);

fn file_stamp(path: &Path) -> Option<FileStamp> {
    std::fs::metadata(path)
        .ok()
        .map(|meta| (meta.len(), meta.modified().ok()))
}

/// A parsed archive plus the stamps of the requested path and of the file
/// it was actually read from (they differ for a sidecar).
#[derive(Debug)]
struct CachedArchive {
    stamps: [Option<FileStamp>; 2],
    archive: Arc<Archive>,
}

type ArchiveCache = Arc<Mutex<HashMap<PathBuf, CachedArchive>>>;

/// Serves one custom-scheme request from the archive.
#[derive(Debug)]
pub struct ArchiveJob {
    archive_path: PathBuf,
    colocated: bool,
    path: String,
    entry: String,
    decipher: Option<Decipher>,
    cache: ArchiveCache,
}

impl ArchiveJob {
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn stamps(&self, archive: &Archive) -> [Option<FileStamp>; 2] {
        [file_stamp(&self.archive_path), file_stamp(archive.path())]
    }

    /// The parsed archive, reopened whenever the file on disk has changed
    /// since it was cached.
    fn archive(&self) -> Result<Arc<Archive>, ArchiveError> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(cached) = cache.get(&self.archive_path) {
                if cached.stamps == self.stamps(&cached.archive) {
                    return Ok(Arc::clone(&cached.archive));
                }
                tracing::info!(archive = %self.archive_path.display(), "archive changed on disk, reloading");
            }
        }
        let archive = if self.colocated {
            Archive::open_colocated(&self.archive_path)?
        } else {
            Archive::open(&self.archive_path)?
        };
        let archive = Arc::new(archive);
        let stamps = self.stamps(&archive);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                self.archive_path.clone(),
                CachedArchive {
                    stamps,
                    archive: Arc::clone(&archive),
                },
            );
        }
        Ok(archive)
    }

    pub fn start(&self) -> ProtocolResponse {
        let archive = match self.archive() {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(archive = %self.archive_path.display(), error = %e, "cannot open archive");
                return match e {
                    ArchiveError::NotAnArchive(_) | ArchiveError::Io(_) => {
                        ProtocolResponse::error(404, "archive not found")
                    }
                    _ => ProtocolResponse::error(500, "archive unreadable"),
                };
            }
        };

        let mut path = self.path.clone();
        if archive.is_dir(&path) {
            path = format!("{}/{}", path.trim_end_matches('/'), self.entry);
        }

        match archive.read(&path, self.decipher.as_ref()) {
            Ok(body) => {
                tracing::debug!(path = %path, bytes = body.len(), "served");
                ProtocolResponse::ok(&path, body)
            }
            Err(e @ (ArchiveError::NotFound(_) | ArchiveError::IsDirectory(_) | ArchiveError::InvalidPath(_))) => {
                tracing::warn!(path = %path, error = %e, "not in archive");
                ProtocolResponse::error(404, "not found")
            }
            Err(e) => {
                tracing::error!(path = %path, error = %e, "failed to read archive entry");
                ProtocolResponse::error(500, "failed to read archive entry")
            }
        }
    }
}

/// Creates [`ArchiveJob`]s for incoming URLs.
pub struct ProtocolHandler {
    config: ProtocolConfig,
    source: ArchiveSource,
    locator: Box<dyn ExecutableLocator>,
    decipher: Option<Decipher>,
    cache: ArchiveCache,
}

impl ProtocolHandler {
    pub fn new(
        config: ProtocolConfig,
        source: ArchiveSource,
        locator: Box<dyn ExecutableLocator>,
        decipher: Option<Decipher>,
    ) -> Self {
        Self {
            config,
            source,
            locator,
            decipher,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn decipher(&self) -> Option<&Decipher> {
        self.decipher.as_ref()
    }

    pub fn source(&self) -> &ArchiveSource {
        &self.source
    }

    /// The file the archive is read from: the executable or the override.
    pub fn archive_location(&self) -> Option<PathBuf> {
        match &self.source {
            ArchiveSource::Path(p) => Some(p.clone()),
            ArchiveSource::Executable => self.locator.current_exe().ok(),
        }
    }

    /// Returns `None` when the request cannot be mapped to the archive,
    /// most importantly when the executable path cannot be resolved.
    pub fn create_job(&self, url: &str) -> Option<ArchiveJob> {
        let (archive_path, colocated) = match &self.source {
            ArchiveSource::Path(p) => (p.clone(), false),
            ArchiveSource::Executable => match self.locator.current_exe() {
                Ok(exe) => (exe, true),
                Err(e) => {
                    tracing::error!(error = %e, "cannot resolve executable path");
                    return None;
                }
            },
        };

        let path = match resolve_archive_path(url, &self.config) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(url, error = %e, "rejected protocol request");
                return None;
            }
        };

        Some(ArchiveJob {
            archive_path,
            colocated,
            path,
            entry: self.config.entry.clone(),
            decipher: self.decipher.clone(),
            cache: Arc::clone(&self.cache),
        })
    }

    /// Create and run a job; requests without a job get a 404.
    pub fn respond(&self, url: &str) -> ProtocolResponse {
        match self.create_job(url) {
            Some(job) => job.start(),
            None => ProtocolResponse::not_found(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
