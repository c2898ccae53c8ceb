//! The XMODEM framed block engine: negotiation, receive loop, send loop,
//! and retry/abort policy (spec sections 4.4/4.5). `YmodemEngine` builds on
//! this by composition rather than inheritance (REDESIGN FLAGS): it holds
//! an `XmodemEngine` by value and drives it once per file in its batch.

use std::io::Write;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::checksum::{crc16_xmodem, sum8};
use crate::error::{Error, Result};
use crate::io::{ByteSource, TimedByteSource};
use crate::session::{Control, MessageKind, SessionState, TransferState, XmodemFlavor};

const SOH: u8 = 0x01;
const STX: u8 = 0x02;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
const CRC_CHAR: u8 = b'C';

/// 8-bit sum or CRC-16, as negotiated for this transfer. Distinct from
/// [`XmodemFlavor`]: a CRC-class flavor can still fall back to `Sum8` if
/// negotiation exhausts its `C` attempts and the receiver settles for a
/// plain NAK handshake (spec 4.4 boundary behavior: "CRC-class receiver,
/// after sending 4 C and 6 NAK, must accept vanilla-format blocks").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ChecksumKind {
    Sum8,
    Crc16,
}

impl ChecksumKind {
    fn integrity_len(self) -> usize {
        match self {
            ChecksumKind::Sum8 => 1,
            ChecksumKind::Crc16 => 2,
        }
    }
}

/// What a controller message asks the current block loop to do (spec 5).
enum ControlAction {
    None,
    Abort(Error),
    Discard,
}

/// Longest run of garbage `purge_to_frame` scans before giving up. Bounds
/// an otherwise-unbounded resync loop against a peer that never emits a
/// recognizable framing byte.
const MAX_PURGE: usize = 4096;

/// Block framing/negotiation/retry engine for one XMODEM file transfer.
/// Owns the `SessionState` for that transfer; only this type's methods
/// mutate it.
pub struct XmodemEngine {
    /// Consecutive recoverable errors before the transfer aborts (spec:
    /// "ten in a row -> abort with TOO MANY ERRORS").
    pub max_errors: u32,
    /// Negotiation attempts before giving up waiting for the first block.
    pub max_initial_errors: u32,
    /// Fill byte for the final, short block (`CPMEOF`).
    pub pad_byte: u8,
    flavor: XmodemFlavor,
    session: Arc<Mutex<SessionState>>,
    last_control: Option<Control>,
}

impl XmodemEngine {
    pub fn new(flavor: XmodemFlavor) -> Self {
        XmodemEngine {
            max_errors: 10,
            max_initial_errors: 10,
            pad_byte: 0x1A,
            flavor,
            session: Arc::new(Mutex::new(SessionState::new(flavor, None))),
            last_control: None,
        }
    }

    pub fn flavor(&self) -> XmodemFlavor {
        self.flavor
    }

    /// A clone of the shared, observable session state.
    pub fn session(&self) -> Arc<Mutex<SessionState>> {
        self.session.clone()
    }

    /// Replaces the engine's session state, e.g. so `YmodemEngine` can hand
    /// it a batch-scoped state shared across every file.
    pub fn set_session(&mut self, session: Arc<Mutex<SessionState>>) {
        self.session = session;
    }

    /// The `Control` variant that most recently arrived during a `recv`/
    /// `send` call, if any. `YmodemEngine` reads this after the call
    /// returns to tell a whole-batch cancel apart from a single-file skip
    /// (see [`ControlAction`]), since `recv`/`send` themselves return the
    /// same shape (`Err(CancelledLocally)` for a cancel, `Ok` for a
    /// completed discard) either way.
    pub fn take_last_control(&mut self) -> Option<Control> {
        self.last_control.take()
    }

    fn log(&self, kind: MessageKind, text: impl Into<String>) {
        self.session.lock().unwrap().log(kind, text);
    }

    /// Receives one file, writing its payload to `out`. Returns the number
    /// of bytes written. `control` is polled at every block boundary; see
    /// [`take_last_control`](Self::take_last_control).
    pub fn recv<S, W>(
        &mut self,
        stream: &mut S,
        out: &mut W,
        control: Option<&Receiver<Control>>,
    ) -> Result<u64>
    where
        S: TimedByteSource + Write,
        W: Write,
    {
        self.session.lock().unwrap().transition(TransferState::FileInfo);
        let result = self.recv_inner(stream, out, control);
        self.finalize(result.is_ok());
        result
    }

    fn recv_inner<S, W>(
        &mut self,
        stream: &mut S,
        out: &mut W,
        control: Option<&Receiver<Control>>,
    ) -> Result<u64>
    where
        S: TimedByteSource + Write,
        W: Write,
    {
        let (first_frame, checksum) = self.negotiate_receive(stream)?;
        self.session.lock().unwrap().transition(TransferState::Transfer);
        stream.set_timeout(Duration::from_millis(self.flavor.default_timeout_ms()));

        let mut expected: u8 = 1;
        let mut total: u64 = 0;
        let mut frame = Some(first_frame);
        let mut errors = 0u32;
        let mut can_count = 0u8;
        let mut discard = false;

        loop {
            match self.check_control(stream, control) {
                ControlAction::Abort(e) => return Err(e),
                ControlAction::Discard => discard = true,
                ControlAction::None => {}
            }

            let byte = match frame.take() {
                Some(b) => b,
                None => match read_or_timeout(stream)? {
                    Some(b) => b,
                    None => {
                        self.log(MessageKind::Warn, "timed out waiting for next block");
                        self.count_error(&mut errors)?;
                        continue;
                    }
                },
            };

            match byte {
                SOH | STX => {
                    if byte == STX && !matches!(self.flavor, XmodemFlavor::X1k | XmodemFlavor::X1kG)
                    {
                        self.send_double_can(stream);
                        return Err(Error::UnexpectedFrame { byte });
                    }
                    can_count = 0;
                    let block_len = if byte == SOH { 128 } else { 1024 };
                    let (seq, seq_c, data, integrity) =
                        match self.read_block_body(stream, block_len, checksum) {
                            Ok(v) => v,
                            Err(Error::Timeout) => {
                                self.log(MessageKind::Warn, "timed out mid-block");
                                if self.flavor.is_streaming() {
                                    self.send_double_can(stream);
                                    return Err(Error::Timeout);
                                }
                                stream.write_all(&[NAK]).map_err(Error::Io)?;
                                self.count_error(&mut errors)?;
                                continue;
                            }
                            Err(e) => return Err(e),
                        };

                    let header_ok = seq_c == 0xFF - seq;
                    let integrity_ok = match checksum {
                        ChecksumKind::Sum8 => sum8(&data) == integrity[0],
                        ChecksumKind::Crc16 => {
                            (((integrity[0] as u16) << 8) | integrity[1] as u16)
                                == crc16_xmodem(&data)
                        }
                    };

                    if !header_ok || !integrity_ok {
                        let err = if !header_ok {
                            Error::UnexpectedFrame { byte: seq }
                        } else {
                            Error::IntegrityFailure { seq }
                        };
                        if self.flavor.is_streaming() {
                            self.send_double_can(stream);
                            return Err(err);
                        }
                        stream.write_all(&[NAK]).map_err(Error::Io)?;
                        self.count_error(&mut errors)?;
                        continue;
                    }

                    if seq == expected {
                        if !discard {
                            out.write_all(&data)
                                .map_err(|e| Error::FileWriteFailure(e.to_string()))?;
                            total += data.len() as u64;
                        }
                        expected = expected.wrapping_add(1);
                        {
                            let mut s = self.session.lock().unwrap();
                            // The final block is padded to the full block
                            // length on the wire; cap what's counted at the
                            // declared size so `bytes_transferred` never
                            // exceeds `bytes_total`.
                            let counted = match s.current_file_info().and_then(|f| f.bytes_total) {
                                Some(bt) => {
                                    let already =
                                        s.current_file_info().map(|f| f.bytes_transferred).unwrap_or(0);
                                    (data.len() as u64).min(bt.saturating_sub(already)) as usize
                                }
                                None => data.len(),
                            };
                            s.note_block(counted);
                            s.current_file_writer().record_block(counted);
                        }
                        if !self.flavor.is_streaming() {
                            stream.write_all(&[ACK]).map_err(Error::Io)?;
                        }
                        errors = 0;
                    } else if seq == expected.wrapping_sub(1) {
                        // retransmit of the block we already wrote and
                        // acknowledged: re-ACK without rewriting.
                        if !self.flavor.is_streaming() {
                            stream.write_all(&[ACK]).map_err(Error::Io)?;
                        }
                    } else {
                        self.send_double_can(stream);
                        return Err(Error::SequenceOutOfOrder { expected, got: seq });
                    }
                }
                EOT => {
                    stream.write_all(&[ACK]).map_err(Error::Io)?;
                    return Ok(total);
                }
                CAN => {
                    can_count += 1;
                    self.session.lock().unwrap().cancel_flag = can_count;
                    if can_count >= 2 {
                        self.log(MessageKind::Error, "peer sent CAN CAN");
                        return Err(Error::CancelledByPeer);
                    }
                }
                other => {
                    can_count = 0;
                    self.session.lock().unwrap().cancel_flag = 0;
                    if self.flavor.is_streaming() {
                        self.send_double_can(stream);
                        return Err(Error::UnexpectedFrame { byte: other });
                    }
                    purge_to_frame(stream)?;
                    stream.write_all(&[NAK]).map_err(Error::Io)?;
                    self.count_error(&mut errors)?;
                }
            }
        }
    }

    /// Non-blocking check of the controller channel (spec 5: polled "at
    /// every block boundary"). `Cancel` sends a double CAN on the wire and
    /// stops the loop — there is no way to abort only the in-flight file
    /// without the peer reading it as a whole-transfer abort. `SkipFile`
    /// does *not* touch the wire: it asks the caller to keep consuming and
    /// ACKing this file's blocks (so the sender's batch loop proceeds
    /// normally to its next file) while discarding the payload instead of
    /// writing it.
    fn check_control<S: Write>(
        &mut self,
        stream: &mut S,
        control: Option<&Receiver<Control>>,
    ) -> ControlAction {
        let Some(rx) = control else { return ControlAction::None };
        let Ok(ctrl) = rx.try_recv() else { return ControlAction::None };
        self.last_control = Some(ctrl);
        match ctrl {
            Control::Cancel { .. } => {
                self.send_double_can(stream);
                self.log(MessageKind::Error, "transfer stopped by controller");
                ControlAction::Abort(Error::CancelledLocally)
            }
            Control::SkipFile { .. } => {
                self.log(MessageKind::Warn, "discarding current file by controller request");
                ControlAction::Discard
            }
        }
    }

    /// Reads a block's sequence byte, complement, payload, and integrity
    /// bytes following a framing byte already consumed by the caller.
    /// Propagates `Error::Timeout` like any other read error so the caller
    /// can decide whether a stalled mid-block read counts as one
    /// recoverable error or aborts, rather than treating it as
    /// unconditionally fatal.
    fn read_block_body<S: ByteSource>(
        &mut self,
        stream: &mut S,
        block_len: usize,
        checksum: ChecksumKind,
    ) -> Result<(u8, u8, Vec<u8>, [u8; 2])> {
        let seq = stream.read_byte()?;
        let seq_c = stream.read_byte()?;
        let mut data = vec![0u8; block_len];
        stream.read_into(&mut data)?;
        let mut integrity = [0u8; 2];
        stream.read_into(&mut integrity[..checksum.integrity_len()])?;
        Ok((seq, seq_c, data, integrity))
    }

    fn count_error(&mut self, errors: &mut u32) -> Result<()> {
        *errors += 1;
        {
            let mut s = self.session.lock().unwrap();
            s.consecutive_errors = *errors;
            s.current_file_writer().record_error();
        }
        if *errors >= self.max_errors {
            self.log(MessageKind::Error, "TOO MANY ERRORS");
            return Err(Error::RetryBudgetExhausted(self.max_errors));
        }
        Ok(())
    }

    /// Negotiates a receive: sends the flavor's handshake character,
    /// retransmitting every 3s, until a block begins or the attempt budget
    /// is exhausted (spec 4.4).
    fn negotiate_receive<S: TimedByteSource + Write>(
        &mut self,
        stream: &mut S,
    ) -> Result<(u8, ChecksumKind)> {
        stream.set_timeout(Duration::from_secs(3));
        let crc_attempts = if self.flavor.uses_crc() { 4 } else { 0 };
        let mut cancels = 0u8;

        for attempt in 0..self.max_initial_errors {
            let use_crc = attempt < crc_attempts;
            let handshake = if use_crc { CRC_CHAR } else { NAK };
            stream.write_all(&[handshake]).map_err(Error::Io)?;

            match read_or_timeout(stream)? {
                Some(SOH) => {
                    let checksum = if use_crc { ChecksumKind::Crc16 } else { ChecksumKind::Sum8 };
                    return Ok((SOH, checksum));
                }
                Some(STX) => {
                    if !matches!(self.flavor, XmodemFlavor::X1k | XmodemFlavor::X1kG) {
                        return Err(Error::UnexpectedFrame { byte: STX });
                    }
                    let checksum = if use_crc { ChecksumKind::Crc16 } else { ChecksumKind::Sum8 };
                    return Ok((STX, checksum));
                }
                Some(EOT) => {
                    // A zero-byte file: the sender has nothing to frame and
                    // goes straight to EOT (spec 9 open question: empty
                    // files are legal and transfer zero data blocks).
                    let checksum = if use_crc { ChecksumKind::Crc16 } else { ChecksumKind::Sum8 };
                    return Ok((EOT, checksum));
                }
                Some(CAN) => {
                    cancels += 1;
                    if cancels >= 2 {
                        return Err(Error::CancelledByPeer);
                    }
                }
                Some(other) => {
                    self.log(
                        MessageKind::Warn,
                        format!("unexpected byte 0x{other:02x} during negotiation"),
                    );
                }
                None => {
                    self.log(MessageKind::Info, format!("negotiation attempt {attempt} timed out"));
                }
            }
        }
        Err(Error::RetryBudgetExhausted(self.max_initial_errors))
    }

    fn send_double_can<S: Write>(&self, stream: &mut S) {
        let _ = stream.write_all(&[CAN, CAN]);
    }

    fn finalize(&mut self, ok: bool) {
        let mut s = self.session.lock().unwrap();
        if s.current_file.is_some() {
            s.current_file_writer().finish(ok);
        }
        s.transition(if ok { TransferState::FileDone } else { TransferState::Abort });
    }

    /// Sends one file read from `input`. Returns the number of bytes sent.
    pub fn send<S, R>(
        &mut self,
        stream: &mut S,
        input: &mut R,
        control: Option<&Receiver<Control>>,
    ) -> Result<u64>
    where
        S: TimedByteSource + Write,
        R: std::io::Read,
    {
        self.session.lock().unwrap().transition(TransferState::FileInfo);
        let result = self.send_inner(stream, input, control);
        self.finalize(result.is_ok());
        result
    }

    fn send_inner<S, R>(
        &mut self,
        stream: &mut S,
        input: &mut R,
        control: Option<&Receiver<Control>>,
    ) -> Result<u64>
    where
        S: TimedByteSource + Write,
        R: std::io::Read,
    {
        let checksum = self.negotiate_send(stream)?;
        self.session.lock().unwrap().transition(TransferState::Transfer);
        stream.set_timeout(Duration::from_millis(self.flavor.default_timeout_ms()));

        let block_len = self.flavor.block_len();
        let mut seq: u8 = 1;
        let mut total = 0u64;
        let mut errors = 0u32;

        loop {
            match self.check_control(stream, control) {
                ControlAction::Abort(e) => return Err(e),
                // No "discard" concept on the sending side: the closest
                // equivalent to skipping the rest of this file's upload is
                // ending it early, the same as reaching EOF on `input`.
                ControlAction::Discard => break,
                ControlAction::None => {}
            }

            let mut buf = vec![self.pad_byte; block_len];
            let n = input.read(&mut buf).map_err(Error::Io)?;
            if n == 0 {
                break;
            }

            let mut frame = Vec::with_capacity(block_len + 5);
            frame.push(if block_len == 128 { SOH } else { STX });
            frame.push(seq);
            frame.push(0xFF - seq);
            frame.extend_from_slice(&buf);
            match checksum {
                ChecksumKind::Sum8 => frame.push(sum8(&buf)),
                ChecksumKind::Crc16 => {
                    let crc = crc16_xmodem(&buf);
                    frame.push((crc >> 8) as u8);
                    frame.push(crc as u8);
                }
            }

            stream.write_all(&frame).map_err(Error::Io)?;
            total += n as u64;
            {
                let mut s = self.session.lock().unwrap();
                s.note_block(n);
                s.current_file_writer().record_block(n);
            }

            if !self.flavor.is_streaming() {
                let mut can_count = 0u8;
                loop {
                    match read_or_timeout(stream)? {
                        Some(ACK) => {
                            errors = 0;
                            break;
                        }
                        Some(NAK) => {
                            stream.write_all(&frame).map_err(Error::Io)?;
                            self.count_error(&mut errors)?;
                        }
                        Some(CAN) => {
                            can_count += 1;
                            if can_count >= 2 {
                                return Err(Error::CancelledByPeer);
                            }
                            self.count_error(&mut errors)?;
                        }
                        Some(_) | None => {
                            self.count_error(&mut errors)?;
                        }
                    }
                }
            }
            seq = seq.wrapping_add(1);
        }

        self.finish_send(stream)?;
        Ok(total)
    }

    fn negotiate_send<S: TimedByteSource + Write>(&mut self, stream: &mut S) -> Result<ChecksumKind> {
        stream.set_timeout(Duration::from_secs(60));
        match read_or_timeout(stream)? {
            Some(NAK) => Ok(ChecksumKind::Sum8),
            Some(CRC_CHAR) => Ok(ChecksumKind::Crc16),
            Some(CAN) => Err(Error::CancelledByPeer),
            Some(other) => Err(Error::UnexpectedFrame { byte: other }),
            None => Err(Error::Timeout),
        }
    }

    fn finish_send<S: TimedByteSource + Write>(&mut self, stream: &mut S) -> Result<()> {
        let mut errors = 0u32;
        loop {
            stream.write_all(&[EOT]).map_err(Error::Io)?;
            match read_or_timeout(stream)? {
                Some(ACK) => return Ok(()),
                Some(NAK) | None => {
                    self.count_error(&mut errors)?;
                }
                Some(other) => {
                    self.log(
                        MessageKind::Warn,
                        format!("expected ACK/NAK for EOT, got 0x{other:02x}"),
                    );
                    self.count_error(&mut errors)?;
                }
            }
        }
    }

    /// Negotiates and receives exactly one envelope block — YMODEM block 0
    /// (spec 4.6). Unlike [`recv`](Self::recv), this never writes to a file
    /// or touches `expected`/file counters; the caller decodes the raw
    /// payload itself. Sequence must be exactly 0.
    pub fn recv_envelope_block<S: TimedByteSource + Write>(
        &mut self,
        stream: &mut S,
    ) -> Result<Vec<u8>> {
        let (first_frame, checksum) = self.negotiate_receive(stream)?;
        stream.set_timeout(Duration::from_millis(self.flavor.default_timeout_ms()));

        let mut frame = Some(first_frame);
        let mut errors = 0u32;
        let mut can_count = 0u8;

        loop {
            let byte = match frame.take() {
                Some(b) => b,
                None => match read_or_timeout(stream)? {
                    Some(b) => b,
                    None => {
                        self.count_error(&mut errors)?;
                        continue;
                    }
                },
            };

            match byte {
                SOH | STX => {
                    can_count = 0;
                    let block_len = if byte == SOH { 128 } else { 1024 };
                    let (seq, seq_c, data, integrity) =
                        match self.read_block_body(stream, block_len, checksum) {
                            Ok(v) => v,
                            Err(Error::Timeout) => {
                                stream.write_all(&[NAK]).map_err(Error::Io)?;
                                self.count_error(&mut errors)?;
                                continue;
                            }
                            Err(e) => return Err(e),
                        };

                    let header_ok = seq == 0 && seq_c == 0xFF;
                    let integrity_ok = match checksum {
                        ChecksumKind::Sum8 => sum8(&data) == integrity[0],
                        ChecksumKind::Crc16 => {
                            (((integrity[0] as u16) << 8) | integrity[1] as u16)
                                == crc16_xmodem(&data)
                        }
                    };
                    if !header_ok || !integrity_ok {
                        stream.write_all(&[NAK]).map_err(Error::Io)?;
                        self.count_error(&mut errors)?;
                        continue;
                    }
                    stream.write_all(&[ACK]).map_err(Error::Io)?;
                    return Ok(data);
                }
                CAN => {
                    can_count += 1;
                    if can_count >= 2 {
                        return Err(Error::CancelledByPeer);
                    }
                }
                other => {
                    can_count = 0;
                    purge_to_frame(stream)?;
                    stream.write_all(&[NAK]).map_err(Error::Io)?;
                    self.log(
                        MessageKind::Warn,
                        format!("unexpected byte 0x{other:02x} before block 0"),
                    );
                    self.count_error(&mut errors)?;
                }
            }
        }
    }

    /// Negotiates (waiting for the receiver's handshake) and sends exactly
    /// one envelope block — YMODEM block 0 or the terminal all-NUL block
    /// (spec 4.7). `payload` must already be padded to its block length.
    pub fn send_envelope_block<S: TimedByteSource + Write>(
        &mut self,
        stream: &mut S,
        payload: &[u8],
    ) -> Result<()> {
        let checksum = self.negotiate_send(stream)?;
        stream.set_timeout(Duration::from_millis(self.flavor.default_timeout_ms()));

        let mut frame = Vec::with_capacity(payload.len() + 5);
        frame.push(if payload.len() == 128 { SOH } else { STX });
        frame.push(0);
        frame.push(0xFF);
        frame.extend_from_slice(payload);
        match checksum {
            ChecksumKind::Sum8 => frame.push(sum8(payload)),
            ChecksumKind::Crc16 => {
                let crc = crc16_xmodem(payload);
                frame.push((crc >> 8) as u8);
                frame.push(crc as u8);
            }
        }

        let mut errors = 0u32;
        loop {
            stream.write_all(&frame).map_err(Error::Io)?;
            match read_or_timeout(stream)? {
                Some(ACK) => return Ok(()),
                Some(CAN) => return Err(Error::CancelledByPeer),
                Some(_) | None => self.count_error(&mut errors)?,
            }
        }
    }
}

/// Reads a byte, turning [`Error::Timeout`] into `Ok(None)` — the common
/// pattern for a poll loop that treats a timed-out read as "nothing yet"
/// rather than an error, generalized here to any `ByteSource`.
fn read_or_timeout<S: ByteSource>(stream: &mut S) -> Result<Option<u8>> {
    match stream.read_byte() {
        Ok(b) => Ok(Some(b)),
        Err(Error::Timeout) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Reads and discards bytes until a framing byte (`SOH`/`STX`/`EOT`/`CAN`)
/// appears, returning it. Used to resync after an unrecognized byte (spec
/// 4.4 step 1: "purge until any framing byte appears").
fn purge_to_frame<S: ByteSource>(stream: &mut S) -> Result<u8> {
    for _ in 0..MAX_PURGE {
        let b = stream.read_byte()?;
        if matches!(b, SOH | STX | EOT | CAN) {
            return Ok(b);
        }
    }
    Err(Error::RetryBudgetExhausted(MAX_PURGE as u32))
}
