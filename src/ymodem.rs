//! The YMODEM batch layer: block-0 envelope encode/decode and the batch
//! loop that drives an [`XmodemEngine`] once per file (spec 4.6/4.7).
//! `YmodemEngine` holds the `XmodemEngine` by value and extends it through
//! this module's functions rather than inheriting from it (REDESIGN FLAGS).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::io::TimedByteSource;
use crate::local_file::{FsFile, LocalFile};
use crate::session::{
    Control, FileInfo, MessageKind, SessionState, TransferState, YmodemFlavor,
};
use crate::xmodem::XmodemEngine;

/// YMODEM's sequence-0 envelope block: `filename NUL decimal-size (SP
/// octal-mtime-sec)? NUL`, padded with NULs to the block length (spec
/// section 6). An empty `filename` is the batch terminator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Block0 {
    pub filename: String,
    pub size: Option<u64>,
    pub mtime_secs: Option<u64>,
}

impl Block0 {
    /// The terminal all-NUL block that ends a batch.
    pub fn terminator() -> Self {
        Block0::default()
    }

    /// 128 bytes ordinarily; 1024 only if the encoded fields don't fit in
    /// 110 bytes (spec 4.7).
    pub fn block_len(&self) -> usize {
        let unpadded = self.filename.len()
            + 1
            + self.size.map(|s| s.to_string().len()).unwrap_or(0)
            + self
                .mtime_secs
                .map(|t| 1 + format!("{t:o}").len())
                .unwrap_or(0)
            + 1;
        if unpadded > 110 {
            1024
        } else {
            128
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let block_len = self.block_len();
        let mut buf = Vec::with_capacity(block_len);
        buf.extend_from_slice(self.filename.as_bytes());
        buf.push(0);
        if let Some(size) = self.size {
            buf.extend_from_slice(size.to_string().as_bytes());
        }
        if let Some(mtime) = self.mtime_secs {
            buf.push(b' ');
            buf.extend_from_slice(format!("{mtime:o}").as_bytes());
        }
        buf.push(0);
        buf.resize(block_len, 0);
        buf
    }

    /// Parses a received block-0 payload. `Ok(None)` means the empty-name
    /// terminator (batch complete); the filename field is read strictly to
    /// its terminating NUL, and the size/mtime suffix is then split on a
    /// single space only (spec 9 open question resolution).
    pub fn decode(payload: &[u8]) -> Result<Option<Block0>> {
        let mut fields = payload.splitn(2, |&b| b == 0);
        let filename_bytes = fields.next().unwrap_or(&[]);
        if filename_bytes.is_empty() {
            return Ok(None);
        }
        let filename = String::from_utf8_lossy(filename_bytes).into_owned();

        let rest = fields
            .next()
            .ok_or_else(|| Error::Block0ParseFailure("missing size field".into()))?;
        let meta_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let meta = std::str::from_utf8(&rest[..meta_end])
            .map_err(|_| Error::Block0ParseFailure("non-UTF-8 metadata".into()))?;

        let mut parts = meta.splitn(2, ' ');
        let size_str = parts.next().unwrap_or("");
        if size_str.is_empty() {
            return Err(Error::MissingFileSize);
        }
        let size = size_str.parse::<u64>().map_err(|_| Error::MissingFileSize)?;
        let mtime_secs = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .and_then(|s| u64::from_str_radix(s, 8).ok());

        Ok(Some(Block0 { filename, size: Some(size), mtime_secs }))
    }
}

/// Result of attempting one file within a receive batch: either the data
/// arrived, or a controller's `skip_file` moved the batch on without it.
enum FileOutcome {
    Received,
    Skipped,
}

/// Strips any directory components a peer-supplied filename might carry,
/// so a remote block 0 can never write outside `transfer_directory`.
fn sanitize_filename(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).to_string()
}

/// Batch driver wrapping an [`XmodemEngine`] configured to the flavor's
/// derived 1K/1K-G XMODEM variant (spec 4.6/4.7). Holds the engine by
/// value; YMODEM-specific behavior (block 0, the batch loop, per-file
/// accounting, the terminal null block) lives entirely in this module.
pub struct YmodemEngine {
    xmodem: XmodemEngine,
    flavor: YmodemFlavor,
    session: Arc<Mutex<SessionState>>,
    /// Whether an existing destination file may be overwritten (spec 6
    /// configuration: `overwrite`).
    pub overwrite: bool,
}

impl YmodemEngine {
    pub fn new(flavor: YmodemFlavor) -> Self {
        let mut xmodem = XmodemEngine::new(flavor.as_xmodem());
        let session = Arc::new(Mutex::new(SessionState::new(flavor.as_xmodem(), Some(flavor))));
        xmodem.set_session(session.clone());
        YmodemEngine { xmodem, flavor, session, overwrite: false }
    }

    pub fn flavor(&self) -> YmodemFlavor {
        self.flavor
    }

    /// A clone of the shared, observable session state for the whole batch.
    pub fn session(&self) -> Arc<Mutex<SessionState>> {
        self.session.clone()
    }

    /// Per-block/negotiation retry budget, forwarded to the inner
    /// `XmodemEngine` (spec 6 configuration: `max_consecutive_errors`).
    pub fn set_max_errors(&mut self, n: u32) {
        self.xmodem.max_errors = n;
        self.xmodem.max_initial_errors = n;
    }

    fn log(&self, kind: MessageKind, text: impl Into<String>) {
        self.session.lock().unwrap().log(kind, text);
    }

    /// Receives a whole batch of files into `transfer_directory`, looping
    /// until the terminal empty-name block 0 arrives (spec 4.6). Returns
    /// the `FileInfo` for every file received.
    pub fn recv_batch<S>(
        &mut self,
        stream: &mut S,
        transfer_directory: impl Into<PathBuf>,
        control: Option<&Receiver<Control>>,
    ) -> Result<Vec<FileInfo>>
    where
        S: TimedByteSource + Write,
    {
        let dir = transfer_directory.into();
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;
        self.session.lock().unwrap().transfer_directory = Some(dir.clone());

        loop {
            self.session.lock().unwrap().transition(TransferState::FileInfo);
            let payload = self.xmodem.recv_envelope_block(stream)?;
            let block0 = match Block0::decode(&payload) {
                Ok(b0) => b0,
                Err(e) => {
                    self.log(MessageKind::Error, format!("block 0 parse failure: {e}"));
                    return Err(e);
                }
            };
            let block0 = match block0 {
                None => {
                    self.session.lock().unwrap().transition(TransferState::End);
                    break;
                }
                Some(b) => b,
            };

            match self.recv_one_file(stream, &dir, &block0, control) {
                Ok(FileOutcome::Received) => {}
                Ok(FileOutcome::Skipped) => {
                    self.log(MessageKind::Warn, format!("skipped {}", block0.filename));
                    continue;
                }
                Err(e) => {
                    self.session.lock().unwrap().transition(TransferState::Abort);
                    return Err(e);
                }
            }
        }

        Ok(self.session.lock().unwrap().files.clone())
    }

    fn recv_one_file<S>(
        &mut self,
        stream: &mut S,
        dir: &Path,
        block0: &Block0,
        control: Option<&Receiver<Control>>,
    ) -> Result<FileOutcome>
    where
        S: TimedByteSource + Write,
    {
        let size = block0.size.ok_or(Error::MissingFileSize)?;
        let name = sanitize_filename(&block0.filename);
        let path = dir.join(&name);

        if path.exists() && !self.overwrite {
            return Err(Error::OverwriteRefused(block0.filename.clone()));
        }
        let mut file = FsFile::new(&path, block0.filename.clone());
        file.open_for_write(true)?;

        let mut info = FileInfo::new(block0.filename.clone(), Some(size), self.xmodem.flavor().block_len());
        if let Some(t) = block0.mtime_secs {
            info.modtime_millis = Some(t * 1000);
        }
        {
            let mut s = self.session.lock().unwrap();
            s.push_file(info);
            s.bytes_total = Some(s.bytes_total.unwrap_or(0) + size);
            s.transition(TransferState::Transfer);
        }

        // Zero-length files take the same path: no data blocks, just the
        // EOT handshake (spec 9 open question: size == 0 is legal).
        let xresult = self.xmodem.recv(stream, &mut file, control);
        // `skip_file` doesn't touch the wire (see `XmodemEngine::check_control`),
        // so a skipped file ordinarily still completes its `recv` as `Ok` —
        // it just never wrote real bytes. Check which controller message,
        // if any, last interrupted this file regardless of which branch
        // `recv` returned (spec 5: "if keepPartial is false, the current
        // output file is deleted at teardown").
        let ctrl = self.xmodem.take_last_control();
        let skipped = matches!(ctrl, Some(Control::SkipFile { .. }));
        let keep_partial = matches!(
            ctrl,
            Some(Control::Cancel { keep_partial: true }) | Some(Control::SkipFile { keep_partial: true })
        );

        match xresult {
            Ok(_) if skipped => {
                if !keep_partial {
                    let _ = file.delete();
                }
                // `XmodemEngine::finalize` already marked this `FileInfo`
                // complete, since discarding a file still runs its `recv`
                // to a normal EOT/ACK finish; override that, a skipped
                // file was never actually received.
                let mut s = self.session.lock().unwrap();
                s.current_file_writer().finish(false);
                s.transition(TransferState::FileDone);
                Ok(FileOutcome::Skipped)
            }
            Ok(_) => {
                file.set_len(size)?;
                if let Some(t) = block0.mtime_secs {
                    file.set_modtime(UNIX_EPOCH + Duration::from_secs(t))?;
                }
                self.session.lock().unwrap().transition(TransferState::FileDone);
                Ok(FileOutcome::Received)
            }
            Err(e) => {
                if !keep_partial {
                    let _ = file.delete();
                }
                if skipped {
                    Ok(FileOutcome::Skipped)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Sends `paths` as a YMODEM batch, finishing with the terminal
    /// all-NUL block 0 (spec 4.7).
    pub fn send_batch<S>(
        &mut self,
        stream: &mut S,
        paths: &[PathBuf],
        control: Option<&Receiver<Control>>,
    ) -> Result<()>
    where
        S: TimedByteSource + Write,
    {
        for path in paths {
            self.send_one_file(stream, path, control)?;
        }

        let terminal = Block0::terminator().encode();
        self.xmodem.send_envelope_block(stream, &terminal)?;
        self.session.lock().unwrap().transition(TransferState::End);
        Ok(())
    }

    fn send_one_file<S>(
        &mut self,
        stream: &mut S,
        path: &Path,
        control: Option<&Receiver<Control>>,
    ) -> Result<()>
    where
        S: TimedByteSource + Write,
    {
        let mut file = FsFile::for_upload(path);
        file.open_for_read()?;
        let size = file.size()?;
        let mtime_secs = file
            .modtime()?
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());

        let block0 = Block0 {
            filename: file.name().to_string(),
            size: Some(size),
            mtime_secs,
        };

        {
            let mut s = self.session.lock().unwrap();
            let info = FileInfo::new(block0.filename.clone(), Some(size), self.xmodem.flavor().block_len());
            s.push_file(info);
            s.bytes_total = Some(s.bytes_total.unwrap_or(0) + size);
            s.transition(TransferState::FileInfo);
        }

        self.xmodem.send_envelope_block(stream, &block0.encode())?;
        self.session.lock().unwrap().transition(TransferState::Transfer);
        self.xmodem.send(stream, &mut file, control)?;
        self.session.lock().unwrap().transition(TransferState::FileDone);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block0_round_trips_name_size_mtime() {
        let b0 = Block0 { filename: "readme.txt".into(), size: Some(4096), mtime_secs: Some(1_700_000_000) };
        let encoded = b0.encode();
        assert_eq!(encoded.len(), 128);
        let decoded = Block0::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, b0);
    }

    #[test]
    fn block0_without_mtime() {
        let b0 = Block0 { filename: "a.bin".into(), size: Some(0), mtime_secs: None };
        let decoded = Block0::decode(&b0.encode()).unwrap().unwrap();
        assert_eq!(decoded.filename, "a.bin");
        assert_eq!(decoded.size, Some(0));
        assert_eq!(decoded.mtime_secs, None);
    }

    #[test]
    fn empty_filename_is_terminator() {
        let terminal = Block0::terminator().encode();
        assert_eq!(terminal.len(), 128);
        assert!(terminal.iter().all(|&b| b == 0));
        assert!(Block0::decode(&terminal).unwrap().is_none());
    }

    #[test]
    fn missing_size_field_aborts() {
        let mut payload = vec![0u8; 128];
        payload[0..5].copy_from_slice(b"a.txt");
        // filename NUL immediately followed by another NUL: empty size field.
        assert!(matches!(Block0::decode(&payload), Err(Error::MissingFileSize)));
    }

    #[test]
    fn long_name_promotes_to_1k_block() {
        let b0 = Block0 {
            filename: "a".repeat(100),
            size: Some(123_456_789),
            mtime_secs: Some(1_700_000_000),
        };
        assert_eq!(b0.block_len(), 1024);
    }

    #[test]
    fn sanitize_strips_directory_components() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("dir\\file.bin"), "file.bin");
        assert_eq!(sanitize_filename("plain.txt"), "plain.txt");
    }
}
