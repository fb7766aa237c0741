//! Block data file: an array of fixed-size extents.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use crate::storage::traits::StorageError;

/// Name of the data file inside the database directory.
pub const DATA_FILE: &str = "blocks.dat";

/// Shared handle on `blocks.dat`.
///
/// Reads and writes are positioned at an extent offset and never move a
/// shared cursor, so writes to different extents run in parallel.
#[derive(Debug)]
pub struct DataFile {
    path: PathBuf,
    file: File,
}

impl DataFile {
    /// Opens or creates the data file.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StorageError::io("open data file", &e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Writes `bytes` at `offset`, then syncs if `sync` is set.
    pub fn write_at(&self, offset: u64, bytes: &[u8], sync: bool) -> Result<(), StorageError> {
        write_all_at(&self.file, bytes, offset)
            .map_err(|e| StorageError::io(format!("write extent at {offset}"), &e))?;
        if sync {
            self.file
                .sync_data()
                .map_err(|e| StorageError::io("sync data file", &e))?;
        }
        Ok(())
    }

    /// Reads `len` bytes at `offset`.
    ///
    /// Reading past the end of the file reports [`StorageError::ExtentNotFound`].
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let mut bytes = vec![0u8; len];
        match read_exact_at(&self.file, &mut bytes, offset) {
            Ok(()) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                Err(StorageError::ExtentNotFound { location: offset })
            }
            Err(e) => Err(StorageError::io(format!("read extent at {offset}"), &e)),
        }
    }

    /// Current file length in bytes.
    pub fn len(&self) -> Result<u64, StorageError> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| StorageError::io("stat data file", &e))
    }

    /// Returns true if nothing has been written yet.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Path of the data file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "failed to write whole extent")),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::Error::new(ErrorKind::UnexpectedEof, "extent past end of file")),
            Ok(n) => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_positioned_write_and_read() {
        let dir = tempdir().unwrap();
        let data = DataFile::open(&dir.path().join(DATA_FILE)).unwrap();
        assert!(data.is_empty().unwrap());

        data.write_at(200, &[7u8; 100], false).unwrap();
        data.write_at(0, &[1u8; 100], true).unwrap();
        assert_eq!(data.len().unwrap(), 300);

        assert_eq!(data.read_at(200, 100).unwrap(), vec![7u8; 100]);
        assert_eq!(data.read_at(0, 100).unwrap(), vec![1u8; 100]);
        // Never-written gap reads back as zeros.
        assert_eq!(data.read_at(100, 100).unwrap(), vec![0u8; 100]);
    }

    #[test]
    fn test_parallel_writes_to_distinct_extents() {
        let dir = tempdir().unwrap();
        let data = Arc::new(DataFile::open(&dir.path().join(DATA_FILE)).unwrap());

        let writers: Vec<_> = (0..8u8)
            .map(|i| {
                let data = Arc::clone(&data);
                std::thread::spawn(move || {
                    for round in 0..50u64 {
                        let offset = (u64::from(i) * 50 + round) * 64;
                        data.write_at(offset, &[i; 64], false).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(data.len().unwrap(), 8 * 50 * 64);
        for i in 0..8u8 {
            for round in 0..50u64 {
                let offset = (u64::from(i) * 50 + round) * 64;
                assert_eq!(data.read_at(offset, 64).unwrap(), vec![i; 64]);
            }
        }
    }

    #[test]
    fn test_read_past_end_is_not_found() {
        let dir = tempdir().unwrap();
        let data = DataFile::open(&dir.path().join(DATA_FILE)).unwrap();
        data.write_at(0, &[1u8; 10], false).unwrap();

        let err = data.read_at(100, 10).unwrap_err();
        assert!(matches!(err, StorageError::ExtentNotFound { location: 100 }));
    }
}
