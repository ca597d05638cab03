//! asar-style archive reader and builder.
//!
//! Layout on disk:
//!
//! ```text
//! [u32 4][u32 H]                     size pickle
//! [u32 H-4][u32 L][L bytes json][pad] header pickle (H bytes)
//! [file data...]                     starts at 8 + H
//! ```
//!
//! An archive can also be appended to an executable, in which case it is
//! followed by a trailer of `[u64 LE archive length][APPENDED_MAGIC]`.

use crate::cipher::{CipherError, Decipher};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const APPENDED_MAGIC: &[u8; 8] = b"MUBANASR";
const TRAILER_LEN: u64 = 16;

/// File name of the archive shipped next to the executable.
pub const SIDECAR_NAME: &str = "app.asar";

const MAX_LINK_DEPTH: usize = 16;
// Headers are JSON describing file trees; anything past this is garbage.
const MAX_HEADER_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("not an archive: {0}")]
    NotAnArchive(String),
    #[error("corrupt archive: {0}")]
    Corrupt(String),
    #[error("entry not found: {0}")]
    NotFound(String),
    #[error("entry is a directory: {0}")]
    IsDirectory(String),
    #[error("invalid entry path: {0}")]
    InvalidPath(String),
    #[error("link loop at {0}")]
    LinkLoop(String),
    #[error("entry {0} is encrypted but no key was supplied")]
    MissingKey(String),
    #[error("integrity check failed for {0}")]
    Integrity(String),
    #[error("cipher: {0}")]
    Cipher(#[from] CipherError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Header model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Directory { files: BTreeMap<String, Node> },
    Link { link: String },
    File(FileEntry),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileEntry {
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unpacked: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub executable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<Integrity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integrity {
    pub algorithm: String,
    pub hash: String,
}

impl Integrity {
    fn sha256(data: &[u8]) -> Self {
        Self {
            algorithm: "SHA256".to_string(),
            hash: hex::encode(Sha256::digest(data)),
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One row of [`Archive::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedEntry {
    pub path: String,
    pub size: u64,
    pub unpacked: bool,
    pub encrypted: bool,
    pub executable: bool,
}

/// Split an in-archive path into components, rejecting anything that could
/// escape the archive root. Leading separators and a single trailing `/`
/// are allowed; empty interior segments and `..` are not.
pub fn split_path(path: &str) -> Result<Vec<&str>, ArchiveError> {
    let trimmed = path.trim_start_matches('/');
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut parts = Vec::new();
    for part in trimmed.split(['/', '\\']) {
        match part {
            "." => continue,
            "" | ".." => return Err(ArchiveError::InvalidPath(path.to_string())),
            p => parts.push(p),
        }
    }
    Ok(parts)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Archive {
    path: PathBuf,
    /// Absolute offset of the archive inside `path` (non-zero when appended).
    base_offset: u64,
    /// Absolute offset of the file data section.
    data_offset: u64,
    /// Absolute offset one past the archive's last byte.
    end: u64,
    root: BTreeMap<String, Node>,
}

impl Archive {
    /// Open a standalone archive or an executable with an appended archive.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();

        if let Some(archive) = Self::try_parse_at(path, &mut file, 0, len)? {
            return Ok(archive);
        }

        if len >= TRAILER_LEN {
            let mut trailer = [0u8; TRAILER_LEN as usize];
            file.seek(SeekFrom::Start(len - TRAILER_LEN))?;
            file.read_exact(&mut trailer)?;
            if &trailer[8..] == APPENDED_MAGIC {
                let size = u64::from_le_bytes(trailer[..8].try_into().unwrap_or_default());
                let end = len - TRAILER_LEN;
                if size > end {
                    return Err(ArchiveError::Corrupt(format!(
                        "appended archive length {} exceeds file length {}",
                        size, end
                    )));
                }
                return Self::try_parse_at(path, &mut file, end - size, end)?.ok_or_else(|| {
                    ArchiveError::Corrupt("appended archive has an invalid header".into())
                });
            }
        }

        Err(ArchiveError::NotAnArchive(path.display().to_string()))
    }

    /// Find the archive that belongs to `exe`: appended to it, or the
    /// sidecar file next to it.
    pub fn open_colocated(exe: &Path) -> Result<Self, ArchiveError> {
        match Self::open(exe) {
            Ok(a) => return Ok(a),
            Err(ArchiveError::NotAnArchive(_)) => {}
            Err(ArchiveError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let sidecar = exe.with_file_name(SIDECAR_NAME);
        if sidecar.is_file() {
            tracing::debug!(path = %sidecar.display(), "using sidecar archive");
            return Self::open(&sidecar);
        }
        Err(ArchiveError::NotAnArchive(format!(
            "no archive appended to {} and no {} next to it",
            exe.display(),
            SIDECAR_NAME
        )))
    }

    fn try_parse_at(
        path: &Path,
        file: &mut File,
        start: u64,
        end: u64,
    ) -> Result<Option<Self>, ArchiveError> {
        if end.saturating_sub(start) < 16 {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(start))?;
        let mut head = [0u8; 16];
        file.read_exact(&mut head)?;
        let word = |i: usize| u32::from_le_bytes([head[i], head[i + 1], head[i + 2], head[i + 3]]);

        let (size_payload, header_size, header_payload, json_len) = (word(0), word(4), word(8), word(12));
        if size_payload != 4
            || header_size < 8
            || header_size > MAX_HEADER_LEN
            || header_payload != header_size - 4
            || json_len > header_payload - 4
        {
            return Ok(None);
        }
        let data_offset = start + 8 + u64::from(header_size);
        if data_offset > end {
            return Err(ArchiveError::Corrupt("header runs past end of file".into()));
        }

        let mut json = vec![0u8; json_len as usize];
        file.read_exact(&mut json)?;
        let root = match serde_json::from_slice::<Node>(&json) {
            Ok(Node::Directory { files }) => files,
            Ok(_) => return Err(ArchiveError::Corrupt("header root is not a directory".into())),
            Err(e) => return Err(ArchiveError::Corrupt(format!("header json: {}", e))),
        };

        Ok(Some(Self {
            path: path.to_path_buf(),
            base_offset: start,
            data_offset,
            end,
            root,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_appended(&self) -> bool {
        self.base_offset != 0
    }

    /// Directory holding entries that were left out of the archive body.
    pub fn unpacked_dir(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".unpacked");
        PathBuf::from(name)
    }

    /// Resolve `path` to a file entry, following links. Returns the entry and
    /// its canonical in-archive path.
    pub fn entry(&self, path: &str) -> Result<(&FileEntry, String), ArchiveError> {
        let mut current: Vec<String> = split_path(path)?.into_iter().map(String::from).collect();

        for _ in 0..MAX_LINK_DEPTH {
            let parts: Vec<&str> = current.iter().map(String::as_str).collect();
            let mut dir = &self.root;
            let mut rewritten = None;

            for (i, part) in parts.iter().enumerate() {
                let node = dir
                    .get(*part)
                    .ok_or_else(|| ArchiveError::NotFound(path.to_string()))?;
                match node {
                    Node::Directory { files } if i + 1 < parts.len() => dir = files,
                    Node::Directory { .. } => {
                        return Err(ArchiveError::IsDirectory(path.to_string()))
                    }
                    Node::File(entry) if i + 1 == parts.len() => {
                        return Ok((entry, parts.join("/")))
                    }
                    Node::File(_) => return Err(ArchiveError::NotFound(path.to_string())),
                    Node::Link { link } => {
                        // Links are relative to the archive root.
                        let mut next: Vec<String> =
                            split_path(link)?.into_iter().map(String::from).collect();
                        next.extend(parts[i + 1..].iter().map(|s| s.to_string()));
                        rewritten = Some(next);
                        break;
                    }
                }
            }

            match rewritten {
                Some(next) => current = next,
                None => return Err(ArchiveError::IsDirectory(path.to_string())),
            }
        }
        Err(ArchiveError::LinkLoop(path.to_string()))
    }

    /// Whether `path` names a directory (used to serve `dir/` as `dir/index.html`).
    /// Links are followed.
    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.entry(path), Err(ArchiveError::IsDirectory(_)))
    }

    /// Read the bytes as stored, without decryption.
    pub fn read_stored(&self, path: &str) -> Result<Vec<u8>, ArchiveError> {
        let (entry, canonical) = self.entry(path)?;
        self.read_entry_stored(entry, &canonical)
    }

    fn read_entry_stored(&self, entry: &FileEntry, canonical: &str) -> Result<Vec<u8>, ArchiveError> {
        if entry.unpacked {
            let mut on_disk = self.unpacked_dir();
            for part in canonical.split('/') {
                on_disk.push(part);
            }
            return Ok(std::fs::read(&on_disk)?);
        }

        let offset: u64 = entry
            .offset
            .as_deref()
            .ok_or_else(|| ArchiveError::Corrupt(format!("{} has no offset", canonical)))?
            .parse()
            .map_err(|_| ArchiveError::Corrupt(format!("{} has a bad offset", canonical)))?;

        let start = self
            .data_offset
            .checked_add(offset)
            .filter(|start| start.checked_add(entry.size).is_some_and(|end| end <= self.end))
            .ok_or_else(|| ArchiveError::Corrupt(format!("{} lies outside the archive", canonical)))?;
        let size = usize::try_from(entry.size)
            .map_err(|_| ArchiveError::Corrupt(format!("{} is too large", canonical)))?;

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; size];
        file.read_exact(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                ArchiveError::Corrupt(format!("{} is truncated", canonical))
            }
            _ => ArchiveError::Io(e),
        })?;
        Ok(buf)
    }

    /// Read a file, decrypting it when the entry is flagged as encrypted.
    pub fn read(&self, path: &str, decipher: Option<&Decipher>) -> Result<Vec<u8>, ArchiveError> {
        let (entry, canonical) = self.entry(path)?;
        let stored = self.read_entry_stored(entry, &canonical)?;
        if !entry.encrypted {
            return Ok(stored);
        }
        let decipher = decipher.ok_or_else(|| ArchiveError::MissingKey(canonical.clone()))?;
        Ok(decipher.decrypt(&stored)?)
    }

    /// Check the stored bytes of `path` against its integrity hash. Entries
    /// without a hash pass.
    pub fn verify(&self, path: &str) -> Result<(), ArchiveError> {
        let (entry, canonical) = self.entry(path)?;
        let Some(expected) = &entry.integrity else {
            return Ok(());
        };
        let stored = self.read_entry_stored(entry, &canonical)?;
        if !expected.algorithm.eq_ignore_ascii_case("sha256")
            || Integrity::sha256(&stored).hash != expected.hash
        {
            return Err(ArchiveError::Integrity(canonical));
        }
        Ok(())
    }

    /// All files in the archive, sorted by path. Links are not listed.
    pub fn list(&self) -> Vec<ListedEntry> {
        fn walk(prefix: &str, files: &BTreeMap<String, Node>, out: &mut Vec<ListedEntry>) {
            for (name, node) in files {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", prefix, name)
                };
                match node {
                    Node::Directory { files } => walk(&path, files, out),
                    Node::File(e) => out.push(ListedEntry {
                        path,
                        size: e.size,
                        unpacked: e.unpacked,
                        encrypted: e.encrypted,
                        executable: e.executable,
                    }),
                    Node::Link { .. } => {}
                }
            }
        }
        let mut out = Vec::new();
        walk("", &self.root, &mut out);
        out
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

enum PendingNode {
    Dir(BTreeMap<String, PendingNode>),
    File {
        data: Vec<u8>,
        unpacked: bool,
        executable: bool,
    },
    Link(String),
}

/// Builds an archive from in-memory files or a directory tree.
pub struct ArchiveBuilder {
    root: BTreeMap<String, PendingNode>,
    cipher: Option<Decipher>,
    unpack: Vec<glob::Pattern>,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            root: BTreeMap::new(),
            cipher: None,
            unpack: Vec::new(),
        }
    }

    /// Encrypt every packed (not unpacked) file with `cipher`.
    pub fn encrypt_with(mut self, cipher: Decipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Leave files matching `pattern` (relative paths, `/`-separated) out
    /// of the archive body.
    pub fn unpack(mut self, pattern: &str) -> Result<Self, ArchiveError> {
        let p = glob::Pattern::new(pattern)
            .map_err(|e| ArchiveError::InvalidPath(format!("{}: {}", pattern, e)))?;
        self.unpack.push(p);
        Ok(self)
    }

    fn parent_dir(&mut self, parts: &[&str], original: &str) -> Result<&mut BTreeMap<String, PendingNode>, ArchiveError> {
        let mut dir = &mut self.root;
        for part in parts {
            let node = dir
                .entry(part.to_string())
                .or_insert_with(|| PendingNode::Dir(BTreeMap::new()));
            dir = match node {
                PendingNode::Dir(d) => d,
                _ => return Err(ArchiveError::InvalidPath(original.to_string())),
            };
        }
        Ok(dir)
    }

    fn insert(&mut self, path: &str, node: PendingNode) -> Result<(), ArchiveError> {
        let parts = split_path(path)?;
        let (name, parents) = parts
            .split_last()
            .ok_or_else(|| ArchiveError::InvalidPath(path.to_string()))?;
        let name = name.to_string();
        self.parent_dir(parents, path)?.insert(name, node);
        Ok(())
    }

    pub fn add_file(&mut self, path: &str, data: Vec<u8>) -> Result<&mut Self, ArchiveError> {
        self.add_file_with_mode(path, data, false)
    }

    pub fn add_file_with_mode(
        &mut self,
        path: &str,
        data: Vec<u8>,
        executable: bool,
    ) -> Result<&mut Self, ArchiveError> {
        let normalized = split_path(path)?.join("/");
        let unpacked = self.unpack.iter().any(|p| p.matches(&normalized));
        self.insert(
            path,
            PendingNode::File {
                data,
                unpacked,
                executable,
            },
        )?;
        Ok(self)
    }

    /// Add a link whose target is a path relative to the archive root.
    pub fn add_link(&mut self, path: &str, target: &str) -> Result<&mut Self, ArchiveError> {
        split_path(target)?;
        self.insert(path, PendingNode::Link(target.to_string()))?;
        Ok(self)
    }

    /// Recursively add the contents of `dir`. Symlinks pointing inside `dir`
    /// become archive links; others are followed.
    pub fn add_dir(&mut self, dir: &Path) -> Result<&mut Self, ArchiveError> {
        let canonical_root = dir.canonicalize()?;
        for entry in walkdir::WalkDir::new(dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                ArchiveError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
                )
            })?;
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|_| ArchiveError::InvalidPath(entry.path().display().to_string()))?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");

            let ft = entry.file_type();
            if ft.is_symlink() {
                let target = entry.path().canonicalize()?;
                if let Ok(inside) = target.strip_prefix(&canonical_root) {
                    let link = inside
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    self.add_link(&rel, &link)?;
                    continue;
                }
                if target.is_file() {
                    let data = std::fs::read(&target)?;
                    self.add_file(&rel, data)?;
                }
            } else if ft.is_dir() {
                let parts = split_path(&rel)?;
                self.parent_dir(&parts, &rel)?;
            } else if ft.is_file() {
                let data = std::fs::read(entry.path())?;
                let executable = is_executable(entry.path());
                self.add_file_with_mode(&rel, data, executable)?;
            }
        }
        Ok(self)
    }

    /// Serialize the archive. Returns the archive bytes and the unpacked
    /// files (relative path, contents) that must be written beside it.
    pub fn build(&self) -> Result<(Vec<u8>, Vec<(String, Vec<u8>)>), ArchiveError> {
        let mut body = Vec::new();
        let mut unpacked = Vec::new();
        let header = self.build_dir("", &self.root, &mut body, &mut unpacked);
        let json = serde_json::to_vec(&header)
            .map_err(|e| ArchiveError::Corrupt(format!("header json: {}", e)))?;

        let json_len = u32::try_from(json.len())
            .map_err(|_| ArchiveError::Corrupt("header too large".into()))?;
        let padding = (4 - (json.len() % 4)) % 4;
        let header_payload = 4 + json_len + padding as u32;
        let header_size = 4 + header_payload;

        let mut out = Vec::with_capacity(8 + header_size as usize + body.len());
        out.extend_from_slice(&4u32.to_le_bytes());
        out.extend_from_slice(&header_size.to_le_bytes());
        out.extend_from_slice(&header_payload.to_le_bytes());
        out.extend_from_slice(&json_len.to_le_bytes());
        out.extend_from_slice(&json);
        out.extend(std::iter::repeat(0u8).take(padding));
        out.extend_from_slice(&body);
        Ok((out, unpacked))
    }

    fn build_dir(
        &self,
        prefix: &str,
        files: &BTreeMap<String, PendingNode>,
        body: &mut Vec<u8>,
        unpacked: &mut Vec<(String, Vec<u8>)>,
    ) -> Node {
        let mut out = BTreeMap::new();
        for (name, node) in files {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            let built = match node {
                PendingNode::Dir(children) => self.build_dir(&path, children, body, unpacked),
                PendingNode::Link(target) => Node::Link {
                    link: target.clone(),
                },
                PendingNode::File {
                    data,
                    unpacked: true,
                    executable,
                } => {
                    unpacked.push((path.clone(), data.clone()));
                    Node::File(FileEntry {
                        size: data.len() as u64,
                        offset: None,
                        unpacked: true,
                        executable: *executable,
                        encrypted: false,
                        integrity: Some(Integrity::sha256(data)),
                    })
                }
                PendingNode::File {
                    data, executable, ..
                } => {
                    let stored = match &self.cipher {
                        Some(c) => c.encrypt(data),
                        None => data.clone(),
                    };
                    let entry = FileEntry {
                        size: stored.len() as u64,
                        offset: Some(body.len().to_string()),
                        unpacked: false,
                        executable: *executable,
                        encrypted: self.cipher.is_some(),
                        integrity: Some(Integrity::sha256(&stored)),
                    };
                    body.extend_from_slice(&stored);
                    Node::File(entry)
                }
            };
            out.insert(name.clone(), built);
        }
        Node::Directory { files: out }
    }

    /// Write the archive to `out`, plus `<out>.unpacked/` when needed.
    pub fn write_to(&self, out: &Path) -> Result<u64, ArchiveError> {
        let (bytes, unpacked) = self.build()?;
        std::fs::write(out, &bytes)?;
        let mut dir = out.as_os_str().to_owned();
        dir.push(".unpacked");
        write_unpacked(Path::new(&dir), &unpacked)?;
        Ok(bytes.len() as u64)
    }

    /// Write a copy of `exe` to `out` with the archive appended.
    pub fn append_to(&self, exe: &Path, out: &Path) -> Result<u64, ArchiveError> {
        let (bytes, unpacked) = self.build()?;
        if exe != out {
            std::fs::copy(exe, out)?;
        }
        let mut file = std::fs::OpenOptions::new().append(true).open(out)?;
        file.write_all(&bytes)?;
        file.write_all(&(bytes.len() as u64).to_le_bytes())?;
        file.write_all(APPENDED_MAGIC)?;
        file.flush()?;

        let mut dir = out.as_os_str().to_owned();
        dir.push(".unpacked");
        write_unpacked(Path::new(&dir), &unpacked)?;
        Ok(bytes.len() as u64)
    }
}

fn write_unpacked(dir: &Path, files: &[(String, Vec<u8>)]) -> Result<(), ArchiveError> {
    for (rel, data) in files {
        let mut target = dir.to_path_buf();
        for part in rel.split('/') {
            target.push(part);
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, data)?;
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::DEFAULT_IV;

    fn key() -> Decipher {
        Decipher::new(b"0123456789abcdef", DEFAULT_IV).unwrap()
    }

    fn sample() -> ArchiveBuilder {
        let mut b = ArchiveBuilder::new();
        b.add_file("index.html", b"<h1>hi</h1>".to_vec()).unwrap();
        b.add_file("js/app.js", b"console.log(1)".to_vec()).unwrap();
        b.add_file("js/lib/util.js", b"export {}".to_vec()).unwrap();
        b
    }

    #[test]
    fn test_header_layout() {
        let (bytes, _) = sample().build().unwrap();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 4);
        let header_size = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(header_size % 4, 0);
        let json_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        let json: serde_json::Value = serde_json::from_slice(&bytes[16..16 + json_len]).unwrap();
        assert_eq!(json["files"]["index.html"]["size"], 11);
        assert_eq!(json["files"]["index.html"]["offset"], "0");
        assert!(json["files"]["js"]["files"]["lib"]["files"]["util.js"].is_object());
    }

    #[test]
    fn test_read_plain_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.asar");
        sample().write_to(&path).unwrap();

        let archive = Archive::open(&path).unwrap();
        assert!(!archive.is_appended());
        assert_eq!(archive.read("index.html", None).unwrap(), b"<h1>hi</h1>");
        assert_eq!(archive.read("/js/lib/util.js", None).unwrap(), b"export {}");
        assert!(archive.is_dir("js"));
        assert!(!archive.is_dir("index.html"));

        let listed: Vec<String> = archive.list().into_iter().map(|e| e.path).collect();
        assert_eq!(listed, vec!["index.html", "js/app.js", "js/lib/util.js"]);
    }

    #[test]
    fn test_lookup_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.asar");
        sample().write_to(&path).unwrap();
        let archive = Archive::open(&path).unwrap();

        assert!(matches!(archive.read("missing.html", None), Err(ArchiveError::NotFound(_))));
        assert!(matches!(archive.read("js", None), Err(ArchiveError::IsDirectory(_))));
        assert!(matches!(archive.read("index.html/x", None), Err(ArchiveError::NotFound(_))));
        assert!(matches!(
            archive.read("js/../index.html", None),
            Err(ArchiveError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_encrypted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.asar");
        sample().encrypt_with(key()).write_to(&path).unwrap();

        let archive = Archive::open(&path).unwrap();
        let stored = archive.read_stored("index.html").unwrap();
        assert_ne!(stored, b"<h1>hi</h1>");
        assert_eq!(stored.len() % 16, 0);

        assert_eq!(archive.read("index.html", Some(&key())).unwrap(), b"<h1>hi</h1>");
        assert!(matches!(archive.read("index.html", None), Err(ArchiveError::MissingKey(_))));
        assert!(archive.list().iter().all(|e| e.encrypted));
    }

    #[test]
    fn test_appended_to_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("fake-exe");
        std::fs::write(&exe, b"\x7fELF pretend this is machine code").unwrap();
        let out = dir.path().join("muban");
        sample().encrypt_with(key()).append_to(&exe, &out).unwrap();

        let archive = Archive::open(&out).unwrap();
        assert!(archive.is_appended());
        assert_eq!(archive.read("js/app.js", Some(&key())).unwrap(), b"console.log(1)");
        // Original executable prefix is untouched.
        let bytes = std::fs::read(&out).unwrap();
        assert!(bytes.starts_with(b"\x7fELF"));
        assert!(bytes.ends_with(APPENDED_MAGIC));
    }

    #[test]
    fn test_open_colocated_prefers_appended_then_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("muban");
        std::fs::write(&exe, b"MZ not an archive").unwrap();
        assert!(matches!(Archive::open_colocated(&exe), Err(ArchiveError::NotAnArchive(_))));

        let mut b = ArchiveBuilder::new();
        b.add_file("index.html", b"sidecar".to_vec()).unwrap();
        b.write_to(&dir.path().join(SIDECAR_NAME)).unwrap();
        let archive = Archive::open_colocated(&exe).unwrap();
        assert_eq!(archive.read("index.html", None).unwrap(), b"sidecar");

        let mut b = ArchiveBuilder::new();
        b.add_file("index.html", b"appended".to_vec()).unwrap();
        b.append_to(&exe, &exe).unwrap();
        let archive = Archive::open_colocated(&exe).unwrap();
        assert_eq!(archive.read("index.html", None).unwrap(), b"appended");
    }

    #[test]
    fn test_not_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        std::fs::write(&path, b"just some text that is long enough").unwrap();
        assert!(matches!(Archive::open(&path), Err(ArchiveError::NotAnArchive(_))));
    }

    #[test]
    fn test_unpacked_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.asar");
        let mut b = ArchiveBuilder::new().encrypt_with(key()).unpack("*.node").unwrap();
        b.add_file("native/addon.node", b"binary".to_vec()).unwrap();
        b.add_file("index.html", b"page".to_vec()).unwrap();
        b.write_to(&path).unwrap();

        assert!(dir.path().join("app.asar.unpacked/native/addon.node").is_file());
        let archive = Archive::open(&path).unwrap();
        let listed = archive.list();
        let addon = listed.iter().find(|e| e.path == "native/addon.node").unwrap();
        assert!(addon.unpacked);
        assert!(!addon.encrypted);
        assert_eq!(archive.read("native/addon.node", Some(&key())).unwrap(), b"binary");
        assert_eq!(archive.read("index.html", Some(&key())).unwrap(), b"page");
    }

    #[test]
    fn test_links() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.asar");
        let mut b = sample();
        b.add_link("current", "js").unwrap();
        b.add_link("home.html", "index.html").unwrap();
        b.add_link("loop", "loop").unwrap();
        b.write_to(&path).unwrap();

        let archive = Archive::open(&path).unwrap();
        assert_eq!(archive.read("home.html", None).unwrap(), b"<h1>hi</h1>");
        let (_, canonical) = archive.entry("current/lib/util.js").unwrap();
        assert_eq!(canonical, "js/lib/util.js");
        assert!(matches!(archive.read("loop", None), Err(ArchiveError::LinkLoop(_))));
    }

    #[test]
    fn test_add_dir_and_verify() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("css")).unwrap();
        std::fs::write(src.path().join("index.html"), "<p>x</p>").unwrap();
        std::fs::write(src.path().join("css/site.css"), "p{}").unwrap();

        let out = tempfile::tempdir().unwrap();
        let path = out.path().join("app.asar");
        let mut b = ArchiveBuilder::new();
        b.add_dir(src.path()).unwrap();
        b.write_to(&path).unwrap();

        let archive = Archive::open(&path).unwrap();
        assert_eq!(archive.read("css/site.css", None).unwrap(), b"p{}");
        archive.verify("index.html").unwrap();
        archive.verify("css/site.css").unwrap();
    }

    #[test]
    fn test_verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.asar");
        sample().write_to(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        // index.html is the first file in the body, and the body is the tail.
        let body_start = bytes.len() - ("<h1>hi</h1>".len() + "console.log(1)".len() + "export {}".len());
        bytes[body_start] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let archive = Archive::open(&path).unwrap();
        assert!(matches!(archive.verify("index.html"), Err(ArchiveError::Integrity(_))));
        archive.verify("js/app.js").unwrap();
    }

    /// Write a single-entry archive whose header is `json` verbatim, followed
    /// by a short body.
    fn forged(dir: &Path, json: &str) -> PathBuf {
        let padding = (4 - json.len() % 4) % 4;
        let header_payload = (4 + json.len() + padding) as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&(header_payload + 4).to_le_bytes());
        bytes.extend_from_slice(&header_payload.to_le_bytes());
        bytes.extend_from_slice(&(json.len() as u32).to_le_bytes());
        bytes.extend_from_slice(json.as_bytes());
        bytes.extend(std::iter::repeat(0u8).take(padding));
        bytes.extend_from_slice(b"<h1>hi</h1>");
        let path = dir.join("app.asar");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_oversized_entry_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = forged(
            dir.path(),
            r#"{"files":{"index.html":{"size":9223372036854775807,"offset":"0"}}}"#,
        );
        let archive = Archive::open(&path).unwrap();
        assert!(matches!(archive.read("index.html", None), Err(ArchiveError::Corrupt(_))));
    }

    #[test]
    fn test_overflowing_offset_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = forged(
            dir.path(),
            r#"{"files":{"index.html":{"size":11,"offset":"18446744073709551615"}}}"#,
        );
        let archive = Archive::open(&path).unwrap();
        assert!(matches!(archive.read("index.html", None), Err(ArchiveError::Corrupt(_))));

        let path = forged(dir.path(), r#"{"files":{"index.html":{"size":12,"offset":"0"}}}"#);
        let archive = Archive::open(&path).unwrap();
        assert!(matches!(archive.read("index.html", None), Err(ArchiveError::Corrupt(_))));
    }

    #[test]
    fn test_appended_entry_cannot_reach_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("fake-exe");
        std::fs::write(&exe, b"\x7fELF").unwrap();
        let out = dir.path().join("muban");
        let mut b = ArchiveBuilder::new();
        b.add_file("index.html", b"page".to_vec()).unwrap();
        b.append_to(&exe, &out).unwrap();

        let archive = Archive::open(&out).unwrap();
        assert_eq!(archive.end, std::fs::metadata(&out).unwrap().len() - TRAILER_LEN);
        assert_eq!(archive.read("index.html", None).unwrap(), b"page");
    }

    #[test]
    fn test_empty_segments_are_rejected() {
        assert_eq!(split_path("js/").unwrap(), vec!["js"]);
        assert_eq!(split_path("/js/./app.js").unwrap(), vec!["js", "app.js"]);
        assert!(split_path("/").unwrap().is_empty());
        assert!(matches!(split_path("js//app.js"), Err(ArchiveError::InvalidPath(_))));
        assert!(matches!(split_path("js/app.js//"), Err(ArchiveError::InvalidPath(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.asar");
        sample().write_to(&path).unwrap();
        let archive = Archive::open(&path).unwrap();
        assert!(matches!(archive.read("js//app.js", None), Err(ArchiveError::InvalidPath(_))));
        assert!(matches!(archive.read("js/", None), Err(ArchiveError::IsDirectory(_))));
    }

    #[test]
    fn test_is_dir_follows_links() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.asar");
        let mut b = sample();
        b.add_file("docs/index.html", b"docs".to_vec()).unwrap();
        b.add_link("current", "docs").unwrap();
        b.add_link("home.html", "index.html").unwrap();
        b.write_to(&path).unwrap();

        let archive = Archive::open(&path).unwrap();
        assert!(archive.is_dir(""));
        assert!(archive.is_dir("current"));
        assert!(archive.is_dir("current/"));
        assert!(!archive.is_dir("home.html"));
        assert!(!archive.is_dir("missing"));
    }

    #[test]
    fn test_builder_rejects_escaping_paths() {
        let mut b = ArchiveBuilder::new();
        assert!(b.add_file("../evil", vec![]).is_err());
        assert!(b.add_file("", vec![]).is_err());
        assert!(b.add_link("x", "../../etc/passwd").is_err());
    }
}
