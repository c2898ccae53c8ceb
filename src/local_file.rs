//! The capability the engine uses to open/read/write/size/time/delete a
//! named target on a host filesystem (spec section 6). YMODEM writes
//! through this trait; bare XMODEM transfers (no filename envelope) can
//! write to any `Write`/`Read` instead, see `xmodem::XmodemEngine`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{Error, Result};

/// Capability to open/read/write/size/time/delete a named target on a host
/// filesystem, exposed so the engine never depends on `std::fs` directly.
pub trait LocalFile {
    /// Opens (or reopens) the file for reading from the start.
    fn open_for_read(&mut self) -> Result<()>;

    /// Opens (or reopens) the file for writing. `truncate` clears any
    /// existing content; otherwise writes append to the current position.
    fn open_for_write(&mut self, truncate: bool) -> Result<()>;

    /// Reads into `buf`, same contract as `std::io::Read::read`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all of `buf`.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// The name the peer should see (not necessarily the full local path).
    fn name(&self) -> &str;

    /// Current size on disk.
    fn size(&self) -> Result<u64>;

    /// Truncates (or extends) the file to exactly `len` bytes. Used to
    /// strip XMODEM pad bytes once YMODEM's declared size is known.
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Last-modified time, if the filesystem records one.
    fn modtime(&self) -> Result<Option<SystemTime>>;

    /// Sets the last-modified time (YMODEM block-0 carries this in seconds).
    fn set_modtime(&mut self, t: SystemTime) -> Result<()>;

    /// Unix permission bits; on non-unix targets this is limited to the
    /// portable readonly bit `std::fs::Permissions` exposes everywhere.
    fn protection(&self) -> Result<u32>;

    /// Sets permission bits; see [`protection`](Self::protection).
    fn set_protection(&mut self, mode: u32) -> Result<()>;

    /// Deletes the underlying file.
    fn delete(self) -> Result<()>
    where
        Self: Sized;

    /// Heuristic: no NUL byte in a sample of the file's content and the
    /// sample decodes as UTF-8.
    fn is_text(&self) -> Result<bool>;
}

/// `LocalFile` backed by `std::fs`.
pub struct FsFile {
    path: PathBuf,
    name: String,
    handle: Option<File>,
}

const TEXT_SNIFF_LEN: usize = 8192;

impl FsFile {
    /// Creates a handle for `path` without opening it yet. `name` is the
    /// remote-facing filename (YMODEM block 0), which may differ from
    /// `path`'s file stem if the caller sanitized it.
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        FsFile {
            path: path.into(),
            name: name.into(),
            handle: None,
        }
    }

    /// Convenience constructor for the sender side, where `name` is just
    /// the path's own file name.
    pub fn for_upload(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        FsFile {
            path,
            name,
            handle: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle_mut(&mut self) -> io::Result<&mut File> {
        self.handle
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "file not open"))
    }
}

impl LocalFile for FsFile {
    fn open_for_read(&mut self) -> Result<()> {
        let mut f = File::open(&self.path)
            .map_err(|e| Error::FileOpenFailure(format!("{}: {e}", self.path.display())))?;
        f.seek(SeekFrom::Start(0))
            .map_err(|e| Error::FileOpenFailure(format!("{}: {e}", self.path.display())))?;
        self.handle = Some(f);
        Ok(())
    }

    fn open_for_write(&mut self, truncate: bool) -> Result<()> {
        if self.path.exists() && truncate {
            fs::remove_file(&self.path)
                .map_err(|e| Error::FileOpenFailure(format!("{}: {e}", self.path.display())))?;
        }
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(truncate)
            .append(!truncate)
            .open(&self.path)
            .map_err(|e| Error::FileOpenFailure(format!("{}: {e}", self.path.display())))?;
        self.handle = Some(f);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle_mut()?.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.handle_mut()?.write_all(buf)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)
            .map_err(|e| Error::FileWriteFailure(format!("{}: {e}", self.path.display())))?
            .len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.handle_mut()
            .map_err(|e| Error::FileWriteFailure(e.to_string()))?
            .set_len(len)
            .map_err(|e| Error::FileWriteFailure(format!("{}: {e}", self.path.display())))
    }

    fn modtime(&self) -> Result<Option<SystemTime>> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.modified().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn set_modtime(&mut self, t: SystemTime) -> Result<()> {
        let ft = filetime::FileTime::from_system_time(t);
        filetime::set_file_mtime(&self.path, ft)
            .map_err(|e| Error::FileWriteFailure(format!("{}: {e}", self.path.display())))
    }

    #[cfg(unix)]
    fn protection(&self) -> Result<u32> {
        use std::os::unix::fs::PermissionsExt;
        Ok(fs::metadata(&self.path)
            .map_err(|e| Error::FileWriteFailure(e.to_string()))?
            .permissions()
            .mode())
    }

    #[cfg(not(unix))]
    fn protection(&self) -> Result<u32> {
        let readonly = fs::metadata(&self.path)
            .map_err(|e| Error::FileWriteFailure(e.to_string()))?
            .permissions()
            .readonly();
        Ok(if readonly { 0o444 } else { 0o644 })
    }

    #[cfg(unix)]
    fn set_protection(&mut self, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(mode))
            .map_err(|e| Error::FileWriteFailure(format!("{}: {e}", self.path.display())))
    }

    #[cfg(not(unix))]
    fn set_protection(&mut self, mode: u32) -> Result<()> {
        let mut perms = fs::metadata(&self.path)
            .map_err(|e| Error::FileWriteFailure(e.to_string()))?
            .permissions();
        perms.set_readonly(mode & 0o200 == 0);
        fs::set_permissions(&self.path, perms)
            .map_err(|e| Error::FileWriteFailure(format!("{}: {e}", self.path.display())))
    }

    fn delete(self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::FileWriteFailure(format!("{}: {e}", self.path.display()))),
        }
    }

    fn is_text(&self) -> Result<bool> {
        let mut f = File::open(&self.path).map_err(Error::Io)?;
        let mut buf = vec![0u8; TEXT_SNIFF_LEN];
        let n = f.read(&mut buf).map_err(Error::Io)?;
        buf.truncate(n);
        Ok(!buf.contains(&0) && std::str::from_utf8(&buf).is_ok())
    }
}

impl Read for FsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        LocalFile::read(self, buf)
    }
}

impl Write for FsFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle_mut()?.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_content_and_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        let mut f = FsFile::new(&path, "hello.txt");
        f.open_for_write(true).unwrap();
        f.write_all(b"hello world").unwrap();
        assert_eq!(f.size().unwrap(), 11);

        let mut reader = FsFile::new(&path, "hello.txt");
        reader.open_for_read().unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4];
        loop {
            let n = reader.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(buf, b"hello world");
    }

    #[test]
    fn refuses_missing_handle_operations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.bin");
        let mut f = FsFile::new(&path, "nope.bin");
        assert!(f.write_all(b"x").is_err());
    }

    #[test]
    fn is_text_detects_binary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bin.dat");
        let mut f = FsFile::new(&path, "bin.dat");
        f.open_for_write(true).unwrap();
        f.write_all(&[0u8, 1, 2, 0, 3]).unwrap();
        assert!(!f.is_text().unwrap());
    }
}
