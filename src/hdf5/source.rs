use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::sync::Mutex;

use crate::error::SyncError;

/// Random access to the bytes of an HDF5 file.
pub trait ByteSource {
    /// Reads exactly `len` bytes starting at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, SyncError>;
}

impl ByteSource for Vec<u8> {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, SyncError> {
        let start = usize::try_from(offset).map_err(|_| past_end(offset, len))?;
        start
            .checked_add(len)
            .and_then(|end| self.get(start..end))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| past_end(offset, len))
    }
}

/// A file on local disk.
pub struct FileSource {
    file: Mutex<File>,
}

impl FileSource {
    pub fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }
}

impl ByteSource for FileSource {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, SyncError> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| SyncError::Filesystem("file source lock poisoned".to_string()))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let mut buf = vec![0; len];
        file.read_exact(&mut buf).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => past_end(offset, len),
            _ => SyncError::Filesystem(err.to_string()),
        })?;
        Ok(buf)
    }
}

pub fn past_end(offset: u64, len: usize) -> SyncError {
    SyncError::Hdf5Format(format!(
        "read of {len} bytes at offset {offset} runs past the end of the file"
    ))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn memory_reads_are_exact() {
        let bytes = b"0123456789".to_vec();
        assert_eq!(bytes.read_at(2, 3).unwrap(), b"234");
        assert_matches!(bytes.read_at(8, 3), Err(SyncError::Hdf5Format(_)));
    }

    #[test]
    fn file_reads_are_exact() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"abcdef").unwrap();
        let source = FileSource::new(file);
        assert_eq!(source.read_at(4, 2).unwrap(), b"ef");
        assert_eq!(source.read_at(0, 1).unwrap(), b"a");
        assert_matches!(source.read_at(5, 2), Err(SyncError::Hdf5Format(_)));
    }
}
