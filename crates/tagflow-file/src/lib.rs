//! A durable, file-backed [`Chunk`]/[`ChunkBacking`] pair.
//!
//! Each chunk is one file on disk, named `.b<id>_<key>` while open for
//! appends and renamed to `.q<id>_<key>` the moment it's enqueued. `resume()`
//! scans the backing directory on startup and reconstructs the in-memory
//! `Map`/`Queue` `tagflow::Buffer` expects, so a process restart picks back
//! up chunks a previous run queued but never flushed.
//!
//! The routing key isn't otherwise recoverable from a bare numeric chunk id,
//! so it's encoded directly in the filename (sanitized to filesystem-safe
//! characters) rather than in a separate sidecar metadata file the way a
//! production implementation might do it — a deliberate simplification
//! recorded in `DESIGN.md`.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, warn};
use tagflow::chunk::{Chunk, ChunkBacking, ChunkId};
use tagflow::error::BufferError;
use tagflow::record::Record;

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

fn open_name(id: ChunkId, key: &str) -> String {
    format!(".b{}_{}", id.get(), sanitize_key(key))
}

fn queued_name(id: ChunkId, key: &str) -> String {
    format!(".q{}_{}", id.get(), sanitize_key(key))
}

/// A chunk whose bytes are mirrored to a file on disk as they're appended.
pub struct FileChunk {
    id: ChunkId,
    key: String,
    dir: PathBuf,
    bytes: Vec<u8>,
    locked: AtomicBool,
    queued: AtomicBool,
    purged: bool,
}

impl FileChunk {
    fn new(dir: PathBuf, key: impl Into<String>) -> Self {
        Self {
            id: ChunkId::generate(),
            key: key.into(),
            dir,
            bytes: Vec::new(),
            locked: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            purged: false,
        }
    }

    fn current_path(&self) -> PathBuf {
        if self.queued.load(Ordering::Acquire) {
            self.dir.join(queued_name(self.id, &self.key))
        } else {
            self.dir.join(open_name(self.id, &self.key))
        }
    }
}

impl Chunk for FileChunk {
    fn id(&self) -> ChunkId {
        self.id
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn append(&mut self, _time: i64, record: &Record, limit: usize) -> Result<(), BufferError> {
        let encoded = serde_json::to_vec(record).unwrap_or_default();
        let before = self.bytes.len();
        if before + encoded.len() > limit {
            return Err(BufferError::ChunkTooLarge {
                size: before + encoded.len(),
                limit,
            });
        }

        let path = self.current_path();
        match fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut file) => {
                if let Err(err) = file.write_all(&encoded).and_then(|()| file.write_all(b"\n")) {
                    warn!("failed to append to chunk file {}: {err}", path.display());
                }
            }
            Err(err) => warn!("failed to open chunk file {}: {err}", path.display()),
        }

        self.bytes.extend_from_slice(&encoded);
        self.bytes.push(b'\n');
        Ok(())
    }

    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn purge(&mut self) {
        let path = self.current_path();
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                error!("failed to remove purged chunk file {}: {err}", path.display());
            }
        }
        self.bytes.clear();
        self.purged = true;
    }

    fn is_purged(&self) -> bool {
        self.purged
    }

    fn read(&self) -> &[u8] {
        &self.bytes
    }
}

/// Backs a `tagflow::Buffer` with one file per chunk under `dir`.
pub struct FileBacking {
    dir: PathBuf,
}

impl FileBacking {
    /// Creates (if needed) and uses `dir` as the chunk storage directory.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn rename_to_queued(&self, chunk: &FileChunk) {
        let from = self.dir.join(open_name(chunk.id, &chunk.key));
        let to = self.dir.join(queued_name(chunk.id, &chunk.key));
        if from.exists() {
            if let Err(err) = fs::rename(&from, &to) {
                error!(
                    "failed to rename {} to {} on enqueue: {err}",
                    from.display(),
                    to.display()
                );
            }
        }
        chunk.queued.store(true, Ordering::Release);
    }
}

impl ChunkBacking for FileBacking {
    type Chunk = FileChunk;

    fn new_chunk(&self, key: &str) -> Self::Chunk {
        FileChunk::new(self.dir.clone(), key)
    }

    fn on_enqueue(&self, chunk: &Self::Chunk) {
        self.rename_to_queued(chunk);
    }

    fn resume(&self) -> (HashMap<String, Self::Chunk>, VecDeque<Self::Chunk>) {
        let mut map = HashMap::new();
        let mut queue = VecDeque::new();

        let Ok(entries) = fs::read_dir(&self.dir) else {
            return (map, queue);
        };

        let mut found: Vec<(PathBuf, bool, u64, String)> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let (queued, rest) = if let Some(rest) = name.strip_prefix(".b") {
                (false, rest)
            } else if let Some(rest) = name.strip_prefix(".q") {
                (true, rest)
            } else {
                continue;
            };
            let Some((id_str, key)) = rest.split_once('_') else {
                continue;
            };
            let Ok(id) = id_str.parse::<u64>() else { continue };
            found.push((entry.path(), queued, id, key.to_string()));
        }
        found.sort_by_key(|(_, _, id, _)| *id);

        for (path, queued, id, key) in found {
            let bytes = fs::read(&path).unwrap_or_default();
            let chunk = FileChunk {
                id: ChunkId::from_raw(id),
                key,
                dir: self.dir.clone(),
                bytes,
                locked: AtomicBool::new(false),
                queued: AtomicBool::new(queued),
                purged: false,
            };
            if queued {
                queue.push_back(chunk);
            } else {
                map.insert(chunk.key.clone(), chunk);
            }
        }

        (map, queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagflow::buffer::{Buffer, BufferConfig};

    #[test]
    fn append_persists_bytes_to_an_open_chunk_file() {
        let dir = tempfile::tempdir().unwrap();
        let backing = FileBacking::new(dir.path()).unwrap();
        let mut chunk = backing.new_chunk("app.access");
        chunk
            .append(0, &Record::new().with_field("a", 1_i64), 4096)
            .unwrap();

        let path = dir.path().join(open_name(chunk.id(), "app.access"));
        assert!(path.exists());
        assert!(fs::read(&path).unwrap().len() > 0);
    }

    #[test]
    fn enqueue_renames_open_file_to_queued_name() {
        let dir = tempfile::tempdir().unwrap();
        let backing = FileBacking::new(dir.path()).unwrap();
        let mut chunk = backing.new_chunk("app.access");
        chunk
            .append(0, &Record::new().with_field("a", 1_i64), 4096)
            .unwrap();
        backing.on_enqueue(&chunk);

        assert!(!dir.path().join(open_name(chunk.id(), "app.access")).exists());
        assert!(dir.path().join(queued_name(chunk.id(), "app.access")).exists());
    }

    #[test]
    fn purge_removes_the_chunk_file() {
        let dir = tempfile::tempdir().unwrap();
        let backing = FileBacking::new(dir.path()).unwrap();
        let mut chunk = backing.new_chunk("app.access");
        chunk
            .append(0, &Record::new().with_field("a", 1_i64), 4096)
            .unwrap();
        let path = dir.path().join(open_name(chunk.id(), "app.access"));
        chunk.purge();
        assert!(!path.exists());
    }

    #[test]
    fn resume_reconstructs_map_and_queue_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backing = FileBacking::new(dir.path()).unwrap();
            let mut open_chunk = backing.new_chunk("app.access");
            open_chunk
                .append(0, &Record::new().with_field("a", 1_i64), 4096)
                .unwrap();

            let mut queued_chunk = backing.new_chunk("app.error");
            queued_chunk
                .append(0, &Record::new().with_field("b", 2_i64), 4096)
                .unwrap();
            backing.on_enqueue(&queued_chunk);
            // chunks drop here without purging, simulating a crash.
        }

        let backing = FileBacking::new(dir.path()).unwrap();
        let (map, queue) = backing.resume();
        assert!(map.contains_key("app.access"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].key(), "app.error");
    }

    #[test]
    fn buffer_over_file_backing_round_trips_through_resume() {
        let dir = tempfile::tempdir().unwrap();
        let backing = FileBacking::new(dir.path()).unwrap();
        let buffer = Buffer::new(backing, BufferConfig::default());
        buffer
            .append("app.access", 0, &Record::new().with_field("a", 1_i64))
            .unwrap();
        buffer.force_flush("app.access").unwrap();
        assert_eq!(buffer.queue_len(), 1);

        let backing2 = FileBacking::new(dir.path()).unwrap();
        let buffer2 = Buffer::new(backing2, BufferConfig::default());
        assert_eq!(buffer2.queue_len(), 1);
    }
}
