use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use sha2::Sha256;

use crate::checksum::digest_reader;
use crate::{EngineOptions, Result};

/// How a chunk's backing file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create or truncate.
    Create,
    /// Create if missing, otherwise continue after existing bytes.
    Append,
}

/// Size and MD5 of a chunk, measured from the bytes on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDigest {
    pub byte_size: u64,
    pub digest: String,
}

/// Byte sink/source for chunk files.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    buffer_size: usize,
    sync_writes: bool,
}

impl ChunkStore {
    pub fn new(options: &EngineOptions) -> Self {
        Self {
            buffer_size: options.effective_buffer_size(),
            sync_writes: options.sync_writes,
        }
    }

    /// Opens a chunk file for writing, creating parent directories as needed.
    ///
    /// The returned handle closes the file when dropped, so early returns
    /// never leak it. Call [`ChunkHandle::release`] to flush and observe
    /// close errors.
    pub fn acquire(&self, path: &Path, mode: OpenMode) -> Result<ChunkHandle> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut opts = OpenOptions::new();
        opts.create(true).write(true);
        match mode {
            OpenMode::Create => {
                opts.truncate(true);
            }
            OpenMode::Append => {
                opts.append(true);
            }
        }
        let file = opts.open(path)?;

        Ok(ChunkHandle {
            writer: Some(BufWriter::with_capacity(self.buffer_size, file)),
            path: path.to_path_buf(),
            written: 0,
            sync: self.sync_writes,
        })
    }

    /// Writes `data` as the complete content of the chunk at `path`.
    pub fn write_chunk(&self, path: &Path, data: &[u8]) -> Result<u64> {
        let mut handle = self.acquire(path, OpenMode::Create)?;
        handle.write_bytes(data)?;
        handle.release()
    }

    /// Reads a closed chunk back and measures it.
    pub fn inspect(&self, path: &Path) -> Result<ChunkDigest> {
        let mut file = File::open(path)?;
        let (byte_size, digest) = digest_reader::<Md5>(&mut file, self.buffer_size)?;
        Ok(ChunkDigest { byte_size, digest })
    }

    /// SHA-256 of a whole file, e.g. a finalised artifact.
    pub fn checksum(&self, path: &Path) -> Result<String> {
        let mut file = File::open(path)?;
        let (_, digest) = digest_reader::<Sha256>(&mut file, self.buffer_size)?;
        Ok(digest)
    }

    /// Appends the chunk at `chunk` onto `artifact` starting at `offset`,
    /// measuring the chunk in the same pass.
    ///
    /// The artifact is first truncated to `offset`, which discards bytes
    /// left behind by an append whose metadata update never happened.
    pub(crate) fn append_into(
        &self,
        chunk: &Path,
        artifact: &Path,
        offset: u64,
    ) -> Result<ChunkDigest> {
        let mut source = File::open(chunk)?;

        if let Some(parent) = artifact.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut target = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(artifact)?;

        let len = target.metadata()?.len();
        if len < offset {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "partial artifact {} holds {len} bytes, expected at least {offset}",
                    artifact.display()
                ),
            )
            .into());
        }
        target.set_len(offset)?;
        target.seek(SeekFrom::Start(offset))?;

        let mut hasher = Md5::new();
        let mut buf = vec![0u8; self.buffer_size];
        let mut byte_size = 0u64;
        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            target.write_all(&buf[..n])?;
            byte_size += n as u64;
        }

        if self.sync_writes {
            target.sync_all()?;
        }

        Ok(ChunkDigest {
            byte_size,
            digest: hex::encode(hasher.finalize()),
        })
    }
}

/// Scoped write access to one chunk file.
pub struct ChunkHandle {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    written: u64,
    sync: bool,
}

impl ChunkHandle {
    /// Writes `data` after any bytes already written through this handle.
    ///
    /// May be called any number of times while a body streams in.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let writer = self.writer()?;
        writer.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Bytes written through this handle so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and closes the file, returning the bytes written.
    pub fn release(mut self) -> Result<u64> {
        if let Some(writer) = self.writer.take() {
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            if self.sync {
                file.sync_all()?;
            }
        }
        tracing::debug!(path = %self.path.display(), bytes = self.written, "chunk released");
        Ok(self.written)
    }

    fn writer(&mut self) -> std::io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| std::io::Error::other("chunk handle already released"))
    }
}

impl Write for ChunkHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.writer()?.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer()?.flush()
    }
}

impl Drop for ChunkHandle {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take()
            && let Err(e) = writer.flush()
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to flush dropped chunk handle");
        }
    }
}
