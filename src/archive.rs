//! Tar serialisation of file trees, used for build contexts.
//!
//! A [`FileTree`] is either a directory on the local filesystem ([`LocalTree`], honouring
//! `.dockerignore`) or an in-memory tree ([`MemoryTree`]). Trees are written either fully
//! buffered ([`stream_tree`]) or through a pipe to a concurrent consumer ([`spawn_stream`]).
//! Only regular files become entries; directories are implied by the entry paths, which are
//! relative to the tree root and always use forward slashes.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tracing::debug;

const PIPE_CAPACITY: usize = 256 * 1024;
const DOCKERIGNORE: &str = ".dockerignore";

/// One regular file of a tree, ready to be copied into an archive entry.
pub struct FileEntry<'a> {
    pub size: u64,
    pub mode: u32,
    pub reader: Box<dyn Read + 'a>,
}

pub trait FileTree: Send + Sync {
    /// Relative, forward-slash paths of every regular file, in a stable order.
    fn files(&self) -> io::Result<Vec<String>>;

    fn open(&self, path: &str) -> io::Result<FileEntry<'_>>;

    fn contains(&self, path: &str) -> bool;

    fn describe(&self) -> String;
}

/// A directory on the local filesystem.
#[derive(Debug)]
pub struct LocalTree {
    root: PathBuf,
    ignore: Option<IgnoreRules>,
    /// Paths shipped even when an ignore rule matches them.
    always: Vec<String>,
}

impl LocalTree {
    /// Opens `root`, loading its `.dockerignore` if one exists.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let metadata = std::fs::metadata(&root)?;
        if !metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            ));
        }
        let ignore = match std::fs::read_to_string(root.join(DOCKERIGNORE)) {
            Ok(content) => Some(IgnoreRules::parse(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        Ok(Self {
            root,
            ignore,
            always: vec![DOCKERIGNORE.to_string()],
        })
    }

    /// Ships `path` (typically the build's Dockerfile) even if `.dockerignore` excludes it.
    pub fn including(mut self, path: &str) -> Self {
        let path = normalize_pattern(path).to_string();
        if !path.is_empty() && !self.always.contains(&path) {
            self.always.push(path);
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_ignored(&self, relative: &str) -> bool {
        if self.always.iter().any(|path| path == relative) {
            return false;
        }
        self.ignore
            .as_ref()
            .is_some_and(|rules| rules.is_ignored(relative))
    }

    /// An ignored directory is still walked when an exception could re-include part of it.
    fn descend_into_ignored(&self, relative: &str) -> bool {
        let forced = self
            .always
            .iter()
            .any(|path| path.starts_with(&format!("{}/", relative)));
        forced || self.ignore.as_ref().is_some_and(|rules| rules.has_exceptions)
    }

    fn resolve(&self, relative: &str) -> io::Result<PathBuf> {
        let path = Path::new(relative);
        let escapes = path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} escapes {}", relative, self.root.display()),
            ));
        }
        Ok(self.root.join(path))
    }
}

/// `.dockerignore` rules. Patterns are matched against root-relative paths with `*` not
/// crossing `/`, a pattern also covers everything below a matching directory, and the last
/// matching rule wins, so `!pattern` re-includes what an earlier rule excluded.
#[derive(Debug)]
struct IgnoreRules {
    set: GlobSet,
    /// Rule index of every glob in `set`.
    owners: Vec<usize>,
    negated: Vec<bool>,
    has_exceptions: bool,
}

impl IgnoreRules {
    fn parse(content: &str) -> io::Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut owners = Vec::new();
        let mut negated = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (exception, pattern) = match line.strip_prefix('!') {
                Some(rest) => (true, normalize_pattern(rest.trim())),
                None => (false, normalize_pattern(line)),
            };
            if pattern.is_empty() {
                continue;
            }
            let rule = negated.len();
            negated.push(exception);
            for candidate in [pattern.to_string(), format!("{}/**", pattern)] {
                let glob = GlobBuilder::new(&candidate)
                    .literal_separator(true)
                    .build()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                builder.add(glob);
                owners.push(rule);
            }
        }
        let set = builder
            .build()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let has_exceptions = negated.iter().any(|exception| *exception);
        Ok(Self {
            set,
            owners,
            negated,
            has_exceptions,
        })
    }

    fn is_ignored(&self, relative: &str) -> bool {
        self.set
            .matches(relative)
            .into_iter()
            .map(|glob| self.owners[glob])
            .max()
            .is_some_and(|rule| !self.negated[rule])
    }
}

fn normalize_pattern(pattern: &str) -> &str {
    let mut pattern = pattern.trim_end_matches('/');
    while let Some(rest) = pattern.strip_prefix("./") {
        pattern = rest;
    }
    pattern.trim_start_matches('/')
}

impl FileTree for LocalTree {
    fn files(&self) -> io::Result<Vec<String>> {
        let mut files = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = std::fs::read_dir(&dir)?.collect::<io::Result<Vec<_>>>()?;
            entries.sort_by_key(|entry| entry.file_name());
            for entry in entries {
                let name = entry.file_name().to_string_lossy().into_owned();
                let relative = if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                };
                let ignored = self.is_ignored(&relative);
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    if !ignored || self.descend_into_ignored(&relative) {
                        pending.push((entry.path(), relative));
                    } else {
                        debug!("Skipping ignored directory {}", relative);
                    }
                } else if file_type.is_file() {
                    if ignored {
                        debug!("Skipping ignored path {}", relative);
                    } else {
                        files.push(relative);
                    }
                }
            }
        }
        files.sort();
        Ok(files)
    }

    fn open(&self, path: &str) -> io::Result<FileEntry<'_>> {
        let full = self.resolve(path)?;
        let file = File::open(&full)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", full.display()),
            ));
        }
        Ok(FileEntry {
            size: metadata.len(),
            mode: file_mode(&metadata),
            reader: Box::new(file),
        })
    }

    fn contains(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|full| full.is_file()) && !self.is_ignored(path)
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

/// A tree held in memory, e.g. a generated Dockerfile plus a few assets.
#[derive(Debug, Clone, Default)]
pub struct MemoryTree {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file; backslashes and leading slashes in `path` are normalised away.
    pub fn insert(&mut self, path: &str, content: impl Into<Vec<u8>>) -> &mut Self {
        let normalized = path.replace('\\', "/").trim_start_matches('/').to_string();
        self.files.insert(normalized, content.into());
        self
    }
}

impl FileTree for MemoryTree {
    fn files(&self) -> io::Result<Vec<String>> {
        Ok(self.files.keys().cloned().collect())
    }

    fn open(&self, path: &str) -> io::Result<FileEntry<'_>> {
        let content = self.files.get(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} not in tree", path))
        })?;
        Ok(FileEntry {
            size: content.len() as u64,
            mode: 0o644,
            reader: Box::new(content.as_slice()),
        })
    }

    fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn describe(&self) -> String {
        format!("in-memory tree ({} files)", self.files.len())
    }
}

/// Reads exactly `remaining` bytes, failing instead of yielding a short entry when the file
/// shrinks while it is being archived.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
    path: String,
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let limit = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let read = self.inner.read(&mut buf[..limit])?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank while being archived", self.path),
            ));
        }
        self.remaining -= read as u64;
        Ok(read)
    }
}

/// Writes `tree` as a tar archive into `writer` and returns the number of entries.
/// The first read or stat error aborts the walk.
pub fn write_tree<W: Write>(tree: &dyn FileTree, writer: W) -> io::Result<u64> {
    let mut builder = tar::Builder::new(writer);
    let mut count = 0;
    for path in tree.files()? {
        let entry = tree
            .open(&path)
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {}", path, e)))?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(entry.size);
        header.set_mode(entry.mode);
        header.set_mtime(0);
        let reader = ExactReader {
            inner: entry.reader,
            remaining: entry.size,
            path: path.clone(),
        };
        builder.append_data(&mut header, &path, reader)?;
        count += 1;
    }
    let mut writer = builder.into_inner()?;
    writer.flush()?;
    debug!("Archived {} files from {}", count, tree.describe());
    Ok(count)
}

/// Buffers the whole archive in memory; suited to small contexts.
pub fn stream_tree(tree: &dyn FileTree) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    write_tree(tree, &mut buffer)?;
    Ok(buffer)
}

/// Writes the archive of `tree` to `destination`, removing the file again on failure.
pub fn archive_to_file(tree: &dyn FileTree, destination: &Path) -> io::Result<u64> {
    let result = File::create(destination).and_then(|file| {
        let mut writer = io::BufWriter::new(file);
        let count = write_tree(tree, &mut writer)?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(count)
    });
    if result.is_err() {
        let _ = std::fs::remove_file(destination);
    }
    result
}

/// Producer/consumer archive: a blocking task writes the tar into a pipe while the caller
/// reads from [`ArchiveStream::reader`]. The consumer's result must only be trusted once
/// [`ArchiveProducer::finish`] reports that the producer completed.
pub struct ArchiveStream {
    pub reader: DuplexStream,
    producer: JoinHandle<io::Result<u64>>,
}

impl ArchiveStream {
    pub fn into_parts(self) -> (DuplexStream, ArchiveProducer) {
        (
            self.reader,
            ArchiveProducer {
                handle: self.producer,
            },
        )
    }
}

pub struct ArchiveProducer {
    handle: JoinHandle<io::Result<u64>>,
}

impl ArchiveProducer {
    /// Waits for the producer and returns the number of archived entries.
    pub async fn finish(self) -> io::Result<u64> {
        self.handle
            .await
            .map_err(|e| io::Error::other(format!("archive producer panicked: {}", e)))?
    }
}

/// Starts archiving `tree` on a blocking thread. Must be called within a tokio runtime.
pub fn spawn_stream(tree: Arc<dyn FileTree>) -> ArchiveStream {
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let bridge = SyncIoBridge::new(writer);
    let producer = tokio::task::spawn_blocking(move || write_tree(tree.as_ref(), bridge));
    ArchiveStream { reader, producer }
}
