use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use blobferry_model::ByteRange;

use crate::TransferError;

// ---------------------------------------------------------------------------
// Positional I/O
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

// ---------------------------------------------------------------------------
// Range reads
// ---------------------------------------------------------------------------

/// Reads exactly `range` from the file at `path`.
///
/// Fails with [`TransferError::ShortResponse`] if the file is shorter than
/// the range, e.g. because it was truncated after the transfer was created.
pub fn read_range(path: &Path, range: ByteRange) -> Result<Vec<u8>, TransferError> {
    let file = File::open(path)?;
    let mut buf = vec![0u8; range.len() as usize];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = read_at(&file, &mut buf[filled..], range.start + filled as u64)?;
        if n == 0 {
            return Err(TransferError::ShortResponse {
                expected: range.len(),
                actual: filled as u64,
            });
        }
        filled += n;
    }
    Ok(buf)
}

// ---------------------------------------------------------------------------
// RangeWriter
// ---------------------------------------------------------------------------

/// Download destination opened once per transfer.
///
/// Chunks write disjoint ranges concurrently with positional writes, so the
/// handle is shared without a lock.
#[derive(Debug)]
pub struct RangeWriter {
    file: File,
    path: PathBuf,
}

impl RangeWriter {
    /// Opens (or creates) `path` without truncating existing content.
    ///
    /// Creates intermediate directories as needed.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Writes `data` at byte `offset`.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        write_all_at(&self.file, data, offset)?;
        Ok(())
    }

    /// Sets the file length, trimming stale bytes from an older file.
    pub fn set_len(&self, len: u64) -> Result<(), TransferError> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Flushes data and metadata to disk.
    pub fn sync(&self) -> Result<(), TransferError> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
