//! Chunked file access for transfers
//!
//! [`ChunkSource`] hands out a file in fixed-size chunks, [`ChunkSink`]
//! appends received chunks to a newly created file. Both apply netascii
//! line-ending transcoding transparently when the transfer asks for it.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::protocol::TransferMode;
use crate::resolver::{FileResolver, ResolvedLocation, confine_existing};

const RAW_READ_SIZE: usize = 4096;

/// Local text to netascii.
///
/// Bare LF becomes CR-LF, CR-LF is kept, a bare CR becomes CR-NUL. A CR at
/// the end of one input slice is held back until the next byte is known.
#[derive(Debug, Default)]
pub struct NetasciiEncoder {
    pending_cr: bool,
}

impl NetasciiEncoder {
    pub fn encode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &byte in input {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    out.extend_from_slice(b"\r\n");
                    continue;
                }
                out.extend_from_slice(b"\r\0");
            }

            match byte {
                b'\r' => self.pending_cr = true,
                b'\n' => out.extend_from_slice(b"\r\n"),
                _ => out.push(byte),
            }
        }
    }

    /// Flush a CR held back at end of input
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if std::mem::take(&mut self.pending_cr) {
            out.extend_from_slice(b"\r\0");
        }
    }
}

/// Netascii to local text.
///
/// CR-LF becomes LF, CR-NUL becomes CR, a CR followed by anything else is
/// kept as-is.
#[derive(Debug, Default)]
pub struct NetasciiDecoder {
    pending_cr: bool,
}

impl NetasciiDecoder {
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &byte in input {
            if self.pending_cr {
                self.pending_cr = false;
                match byte {
                    b'\n' => {
                        out.push(b'\n');
                        continue;
                    }
                    b'\0' => {
                        out.push(b'\r');
                        continue;
                    }
                    _ => out.push(b'\r'),
                }
            }

            if byte == b'\r' {
                self.pending_cr = true;
            } else {
                out.push(byte);
            }
        }
    }

    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if std::mem::take(&mut self.pending_cr) {
            out.push(b'\r');
        }
    }
}

/// A file opened for reading, consumed chunk by chunk
#[derive(Debug)]
pub struct ChunkSource {
    path: PathBuf,
    file: Option<File>,
    encoder: Option<NetasciiEncoder>,
    pending: Vec<u8>,
    finished: bool,
}

impl ChunkSource {
    /// Open `path` for reading.
    ///
    /// Directories are reported as not found.
    pub fn open(path: impl Into<PathBuf>, mode: TransferMode) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        if file.metadata()?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is a directory", path.display()),
            ));
        }

        Ok(Self {
            path,
            file: Some(file),
            encoder: (mode == TransferMode::NetAscii).then(NetasciiEncoder::default),
            pending: Vec::new(),
            finished: false,
        })
    }

    /// Resolve `filename` under `root` with `resolver`, then open the result.
    ///
    /// An unresolved name is still opened so that the filesystem reports the
    /// not-found error against the path the client asked for. A resolved file
    /// whose real location is outside the resolver's confinement is refused
    /// with `PermissionDenied`.
    pub fn open_resolved(
        resolver: &dyn FileResolver,
        root: &Path,
        filename: &Path,
        mode: TransferMode,
    ) -> io::Result<Self> {
        let location = resolver.resolve(root, filename);
        match &location {
            ResolvedLocation::Found(path) => {
                confine_existing(resolver.confinement(root), path)?;
            }
            ResolvedLocation::NotFound(path) => {
                tracing::debug!("{} not found in any search location", path.display());
            }
        }
        Self::open(location.into_path(), mode)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once a short chunk has been returned
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Read the next chunk of at most `size` bytes.
    ///
    /// The chunk is only shorter than `size` when the data is exhausted, at
    /// which point the underlying file is closed and later calls return an
    /// empty chunk.
    pub fn read_chunk(&mut self, size: usize) -> io::Result<Vec<u8>> {
        if self.finished {
            return Ok(Vec::new());
        }

        while self.pending.len() < size && self.file.is_some() {
            self.fill()?;
        }

        let take = size.min(self.pending.len());
        let chunk: Vec<u8> = self.pending.drain(..take).collect();
        if chunk.len() < size {
            self.finished = true;
        }
        Ok(chunk)
    }

    fn fill(&mut self) -> io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        let mut raw = [0u8; RAW_READ_SIZE];
        let n = loop {
            match file.read(&mut raw) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        match self.encoder.as_mut() {
            Some(encoder) if n == 0 => encoder.finish(&mut self.pending),
            Some(encoder) => encoder.encode(&raw[..n], &mut self.pending),
            None => self.pending.extend_from_slice(&raw[..n]),
        }

        if n == 0 {
            self.file = None;
        }
        Ok(())
    }
}

/// A newly created file receiving chunks
#[derive(Debug)]
pub struct ChunkSink {
    path: PathBuf,
    writer: BufWriter<File>,
    decoder: Option<NetasciiDecoder>,
    scratch: Vec<u8>,
    bytes_written: u64,
}

impl ChunkSink {
    /// Create `path` exclusively; an existing file is never overwritten.
    pub fn create(path: impl Into<PathBuf>, mode: TransferMode) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            decoder: (mode == TransferMode::NetAscii).then(NetasciiDecoder::default),
            scratch: Vec::new(),
            bytes_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write one received chunk, returning the number of bytes that reached the file.
    pub fn write_chunk(&mut self, data: &[u8]) -> io::Result<usize> {
        let Some(decoder) = self.decoder.as_mut() else {
            self.writer.write_all(data)?;
            self.bytes_written += data.len() as u64;
            return Ok(data.len());
        };

        self.scratch.clear();
        decoder.decode(data, &mut self.scratch);
        self.writer.write_all(&self.scratch)?;
        self.bytes_written += self.scratch.len() as u64;
        Ok(self.scratch.len())
    }

    /// Flush everything to disk and close the file.
    pub fn close(mut self) -> io::Result<()> {
        if let Some(decoder) = self.decoder.as_mut() {
            self.scratch.clear();
            decoder.finish(&mut self.scratch);
            self.writer.write_all(&self.scratch)?;
            self.bytes_written += self.scratch.len() as u64;
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }
}
