//! Byte sources behind a [`StreamRef`](super::StreamRef).
//!
//! A [`NativeStream`] is the minimal seek/read surface. Line, string, byte
//! and swapped reads are built on top of it by the stream table, so a new
//! backing medium only has to provide these few calls.

use super::Whence;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A seekable byte source.
pub trait NativeStream: Send {
    /// Reposition; returns the new absolute position or `-1`.
    fn seek(&mut self, offset: i64, whence: Whence) -> i64;

    /// Total length, or `-1` when unknown.
    fn size(&mut self) -> i64;

    /// Fill `buf` as far as possible; bytes read, or `-1` on error.
    fn read(&mut self, buf: &mut [u8]) -> isize;

    /// Current absolute position.
    fn tell(&mut self) -> i64 {
        self.seek(0, Whence::Current)
    }
}

// =============================================================================
// std::io Plumbing
// =============================================================================

fn seek_from(offset: i64, whence: Whence) -> Option<SeekFrom> {
    match whence {
        Whence::Set => u64::try_from(offset).ok().map(SeekFrom::Start),
        Whence::Current => Some(SeekFrom::Current(offset)),
        Whence::End => Some(SeekFrom::End(offset)),
    }
}

fn seek_io<S: Seek>(source: &mut S, offset: i64, whence: Whence) -> i64 {
    let Some(pos) = seek_from(offset, whence) else {
        return -1;
    };
    match source.seek(pos) {
        Ok(pos) => i64::try_from(pos).unwrap_or(-1),
        Err(_) => -1,
    }
}

/// Read until `buf` is full or the source is exhausted.
///
/// An error after some bytes arrived still reports those bytes; the error
/// resurfaces on the next call.
fn fill<R: Read>(source: &mut R, buf: &mut [u8]) -> isize {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) if filled == 0 => return -1,
            Err(_) => break,
        }
    }
    filled as isize
}

fn file_size(file: &File) -> i64 {
    file.metadata()
        .ok()
        .and_then(|m| i64::try_from(m.len()).ok())
        .unwrap_or(-1)
}

// =============================================================================
// FileStream
// =============================================================================

/// A file opened and owned by the stream table.
#[derive(Debug)]
pub struct FileStream {
    file: File,
    path: PathBuf,
}

impl FileStream {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        if file.metadata()?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Is a directory",
            ));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NativeStream for FileStream {
    fn seek(&mut self, offset: i64, whence: Whence) -> i64 {
        seek_io(&mut self.file, offset, whence)
    }

    fn size(&mut self) -> i64 {
        file_size(&self.file)
    }

    fn read(&mut self, buf: &mut [u8]) -> isize {
        fill(&mut self.file, buf)
    }
}

// =============================================================================
// RawStream
// =============================================================================

/// Adaptation layer over a caller-owned handle.
///
/// Dropping it releases only this layer's share of the handle.
#[derive(Debug)]
pub struct RawStream {
    file: Arc<File>,
}

impl RawStream {
    pub(crate) fn new(file: Arc<File>) -> Self {
        Self { file }
    }
}

impl NativeStream for RawStream {
    fn seek(&mut self, offset: i64, whence: Whence) -> i64 {
        seek_io(&mut &*self.file, offset, whence)
    }

    fn size(&mut self) -> i64 {
        file_size(&self.file)
    }

    fn read(&mut self, buf: &mut [u8]) -> isize {
        fill(&mut &*self.file, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    fn temp_with(contents: &[u8]) -> NamedTempFile {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), contents).unwrap();
        tmp
    }

    #[test]
    fn test_seek_negative_absolute_rejected() {
        let mut c = Cursor::new(vec![0u8; 4]);
        assert_eq!(seek_io(&mut c, -1, Whence::Set), -1);
        assert_eq!(seek_io(&mut c, 2, Whence::Set), 2);
        assert_eq!(seek_io(&mut c, -1, Whence::End), 3);
    }

    #[test]
    fn test_fill_stops_at_eof() {
        let mut c = Cursor::new(b"abc".to_vec());
        let mut buf = [0u8; 8];
        assert_eq!(fill(&mut c, &mut buf), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(fill(&mut c, &mut buf), 0);
    }

    #[test]
    fn test_file_stream_read_and_size() {
        let tmp = temp_with(b"hello world");
        let mut s = FileStream::open(tmp.path()).unwrap();
        assert_eq!(s.size(), 11);
        assert_eq!(s.seek(6, Whence::Set), 6);
        let mut buf = [0u8; 5];
        assert_eq!(s.read(&mut buf), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(s.tell(), 11);
    }

    #[test]
    fn test_file_stream_open_missing() {
        assert!(FileStream::open("/nonexistent/path/to/file").is_err());
    }

    #[test]
    fn test_file_stream_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileStream::open(dir.path()).is_err());
    }

    #[test]
    fn test_raw_stream_shares_position() {
        let tmp = temp_with(b"0123456789");
        let file = Arc::new(File::open(tmp.path()).unwrap());
        let mut s = RawStream::new(Arc::clone(&file));
        assert_eq!(s.seek(4, Whence::Set), 4);
        let mut one = [0u8; 1];
        (&*file).read_exact(&mut one).unwrap();
        assert_eq!(&one, b"4");
        assert_eq!(s.tell(), 5);
    }
}
