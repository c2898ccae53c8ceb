//! Observable session/progress state (spec section 3). `SessionState` and
//! `FileInfo` are mutated only by the engine's run loop; everything else
//! (a progress UI, a controller) only ever reads a snapshot through
//! `Arc<Mutex<SessionState>>`.

use std::sync::mpsc::Sender;
use std::time::Instant;

/// XMODEM protocol flavor (spec section 3).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum XmodemFlavor {
    /// 128-byte blocks, 8-bit sum, 10s timeout.
    Vanilla,
    /// Vanilla framing, 100s per-block timeout.
    Relaxed,
    /// 128-byte blocks, CRC-16.
    Crc,
    /// 1024-byte blocks, CRC-16.
    X1k,
    /// 1024-byte blocks, CRC-16, receiver sends no per-block ACKs.
    X1kG,
}

impl XmodemFlavor {
    pub fn block_len(self) -> usize {
        match self {
            XmodemFlavor::Vanilla | XmodemFlavor::Relaxed | XmodemFlavor::Crc => 128,
            XmodemFlavor::X1k | XmodemFlavor::X1kG => 1024,
        }
    }

    pub fn uses_crc(self) -> bool {
        !matches!(self, XmodemFlavor::Vanilla | XmodemFlavor::Relaxed)
    }

    /// `_G` streaming: receiver sends no per-block ACK and any integrity
    /// failure or out-of-order block is fatal rather than retried.
    pub fn is_streaming(self) -> bool {
        matches!(self, XmodemFlavor::X1kG)
    }

    pub fn default_timeout_ms(self) -> u64 {
        match self {
            XmodemFlavor::Relaxed => 100_000,
            _ => 10_000,
        }
    }
}

/// YMODEM protocol flavor (spec section 3), mapped onto the XMODEM flavor
/// that actually carries the file data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum YmodemFlavor {
    Vanilla,
    G,
}

impl YmodemFlavor {
    pub fn as_xmodem(self) -> XmodemFlavor {
        match self {
            YmodemFlavor::Vanilla => XmodemFlavor::X1k,
            YmodemFlavor::G => XmodemFlavor::X1kG,
        }
    }
}

/// Overall state machine (spec section 3). Monotone: once `End` or
/// `Abort`, no further transitions happen.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferState {
    Init,
    FileInfo,
    Transfer,
    FileDone,
    Abort,
    End,
}

/// Severity of a logged session message; mirrors the `log` level used to
/// emit it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug)]
pub struct Message {
    pub kind: MessageKind,
    pub text: String,
}

/// Per-file accounting, created at block-0 decode (receiver) or at the
/// start of each upload (sender) and sealed with `end_time`/`complete` at
/// EOT or abort. Only the engine mutates this; see `FileInfoWriter`.
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub remote_filename: String,
    pub size: Option<u64>,
    pub modtime_millis: Option<u64>,
    pub block_size: usize,
    pub blocks_total: Option<u64>,
    pub blocks_transferred: u64,
    pub bytes_total: Option<u64>,
    pub bytes_transferred: u64,
    pub errors: u32,
    pub start_time: Instant,
    pub end_time: Option<Instant>,
    pub complete: bool,
}

impl FileInfo {
    pub fn new(remote_filename: String, size: Option<u64>, block_size: usize) -> Self {
        let blocks_total = size.map(|s| s.div_ceil(block_size as u64).max(1));
        FileInfo {
            remote_filename,
            size,
            modtime_millis: None,
            block_size,
            blocks_total,
            blocks_transferred: 0,
            bytes_total: size,
            bytes_transferred: 0,
            errors: 0,
            start_time: Instant::now(),
            end_time: None,
            complete: false,
        }
    }
}

/// Narrow modifier handle: the only way anything touches `FileInfo`
/// fields, constructed per-call by the engine (spec section 5). No other
/// component holds a `&mut FileInfo`.
pub struct FileInfoWriter<'a> {
    info: &'a mut FileInfo,
}

impl<'a> FileInfoWriter<'a> {
    fn new(info: &'a mut FileInfo) -> Self {
        FileInfoWriter { info }
    }

    pub fn record_block(&mut self, bytes: usize) {
        self.info.blocks_transferred += 1;
        self.info.bytes_transferred += bytes as u64;
    }

    pub fn record_error(&mut self) {
        self.info.errors += 1;
    }

    pub fn set_modtime_millis(&mut self, ms: u64) {
        self.info.modtime_millis = Some(ms);
    }

    pub fn finish(&mut self, complete: bool) {
        self.info.end_time = Some(Instant::now());
        self.info.complete = complete;
    }
}

/// Shared observable state for one transfer (spec section 3). Written
/// only by the engine, under `Arc<Mutex<SessionState>>` at each block
/// boundary; read freely by observers.
#[derive(Clone, Debug)]
pub struct SessionState {
    pub xmodem_flavor: XmodemFlavor,
    pub ymodem_flavor: Option<YmodemFlavor>,
    pub files: Vec<FileInfo>,
    pub current_file: Option<usize>,
    pub state: TransferState,
    pub bytes_total: Option<u64>,
    pub bytes_transferred: u64,
    pub blocks_transferred: u64,
    pub cancel_flag: u8,
    pub consecutive_errors: u32,
    pub messages: Vec<Message>,
    pub transfer_directory: Option<std::path::PathBuf>,
}

impl SessionState {
    pub fn new(xmodem_flavor: XmodemFlavor, ymodem_flavor: Option<YmodemFlavor>) -> Self {
        SessionState {
            xmodem_flavor,
            ymodem_flavor,
            files: Vec::new(),
            current_file: None,
            state: TransferState::Init,
            bytes_total: None,
            bytes_transferred: 0,
            blocks_transferred: 0,
            cancel_flag: 0,
            consecutive_errors: 0,
            messages: Vec::new(),
            transfer_directory: None,
        }
    }

    pub fn log(&mut self, kind: MessageKind, text: impl Into<String>) {
        let text = text.into();
        match kind {
            MessageKind::Info => log::info!("{text}"),
            MessageKind::Warn => log::warn!("{text}"),
            MessageKind::Error => log::error!("{text}"),
        }
        self.messages.push(Message { kind, text });
    }

    /// Begins tracking a new file, making it `current_file`.
    pub fn push_file(&mut self, info: FileInfo) -> usize {
        self.files.push(info);
        let idx = self.files.len() - 1;
        self.current_file = Some(idx);
        idx
    }

    /// Borrows the current file's `FileInfo` through the narrow writer
    /// capability; panics if invariant "current_file set while in
    /// FileInfo/Transfer/FileDone" is violated, which would be an engine bug.
    pub fn current_file_writer(&mut self) -> FileInfoWriter<'_> {
        let idx = self.current_file.expect("no current file to write");
        FileInfoWriter::new(&mut self.files[idx])
    }

    pub fn current_file_info(&self) -> Option<&FileInfo> {
        self.current_file.map(|i| &self.files[i])
    }

    /// Transitions state, refusing to leave a terminal state (spec
    /// invariant: monotone state machine).
    pub fn transition(&mut self, next: TransferState) {
        if matches!(self.state, TransferState::End | TransferState::Abort) {
            return;
        }
        self.state = next;
    }

    pub fn note_block(&mut self, bytes: usize) {
        self.blocks_transferred += 1;
        self.bytes_transferred += bytes as u64;
    }
}

/// Message a controller task sends to an in-progress engine run (spec
/// section 5). `Cancel` sends a double CAN and stops the transfer.
/// `SkipFile` discards the current file without signaling the peer — see
/// `XmodemEngine::check_control` — so it only has a meaningful effect
/// inside `YmodemEngine`'s batch loop; a bare `XmodemEngine` caller would
/// just get back a transfer whose data was silently discarded.
#[derive(Clone, Copy, Debug)]
pub enum Control {
    Cancel { keep_partial: bool },
    SkipFile { keep_partial: bool },
}

/// Sending half of the controller-to-engine channel (spec section 5,
/// REDESIGN FLAGS: replaces a shared mutated object with message passing).
pub type ControlSender = Sender<Control>;
