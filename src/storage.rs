//! # Output Writer
//!
//! Writes verified pieces through to local storage.
//!
//! The writer exposes the content as one logical byte stream. In single-file
//! mode that stream is a single regular file; in multi-file mode it is the
//! concatenation of the declared files in order, so one piece write may
//! straddle a file boundary and is split into the correct per-file offsets.
//!
//! Files are created with their full declared length up front (sparse where
//! the filesystem supports it), so every write is positioned and the final
//! lengths are exact regardless of completion order.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::metainfo::FileEntry;

struct OutputFile {
    file: File,
    /// Offset of this file's first byte in the logical stream.
    start: u64,
    length: u64,
}

/// Positioned piece writer over the declared file list.
pub struct StorageWriter {
    files: Vec<OutputFile>,
    total_length: u64,
}

impl StorageWriter {
    /// Create the output layout under `root`.
    ///
    /// Single-file mode: `root` is the output file itself. Multi-file mode:
    /// `root` is the content directory and every entry path is created
    /// beneath it.
    pub fn create(root: &Path, entries: &[FileEntry], multi_file: bool) -> Result<StorageWriter> {
        let mut files = Vec::with_capacity(entries.len());
        let mut start = 0u64;

        for entry in entries {
            let path: PathBuf = if multi_file {
                root.join(&entry.path)
            } else {
                root.to_path_buf()
            };

            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(Error::Io)?;
                }
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .map_err(Error::Io)?;
            file.set_len(entry.length).map_err(Error::Io)?;

            debug!("created {} ({} bytes)", path.display(), entry.length);

            files.push(OutputFile {
                file,
                start,
                length: entry.length,
            });
            start += entry.length;
        }

        Ok(StorageWriter {
            files,
            total_length: start,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Write `data` at `offset` in the logical stream, splitting across file
    /// boundaries as needed.
    pub fn write_piece(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        if end > self.total_length {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("write past declared length: {end} > {}", self.total_length),
            )));
        }

        let mut cursor = offset;
        let mut remaining = data;

        for output in &mut self.files {
            let file_end = output.start + output.length;
            if cursor >= file_end || remaining.is_empty() {
                continue;
            }

            let within = cursor - output.start;
            let take = ((output.length - within) as usize).min(remaining.len());
            let (chunk, rest) = remaining.split_at(take);

            output.file.seek(SeekFrom::Start(within)).map_err(Error::Io)?;
            output.file.write_all(chunk).map_err(Error::Io)?;

            cursor += take as u64;
            remaining = rest;
        }

        Ok(())
    }

    /// Read `length` bytes at `offset` in the logical stream, crossing file
    /// boundaries as needed. Serves upload requests for verified pieces.
    pub fn read_block(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let end = offset + length as u64;
        if end > self.total_length {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("read past declared length: {end} > {}", self.total_length),
            )));
        }

        let mut block = Vec::with_capacity(length);
        let mut cursor = offset;

        for output in &mut self.files {
            let file_end = output.start + output.length;
            if cursor >= file_end || block.len() == length {
                continue;
            }

            let within = cursor - output.start;
            let take = ((output.length - within) as usize).min(length - block.len());
            let mut chunk = vec![0u8; take];

            output.file.seek(SeekFrom::Start(within)).map_err(Error::Io)?;
            output.file.read_exact(&mut chunk).map_err(Error::Io)?;

            block.extend_from_slice(&chunk);
            cursor += take as u64;
        }

        Ok(block)
    }

    /// Flush all file handles.
    pub fn sync(&mut self) -> Result<()> {
        for output in &self.files {
            output.file.sync_all().map_err(Error::Io)?;
        }
        Ok(())
    }
}
