//! XMODEM and YMODEM file-transfer protocols: byte-level framing,
//! sequence/checksum validation, flavor negotiation, retry/timeout
//! discipline, and (for YMODEM) the batch envelope that carries filenames,
//! sizes, and modification times.
//!
//! The crate is split the way the protocol itself is layered:
//!
//! - [`io`] — stream-shaping primitives the engine relies on:
//!   [`io::TimeoutReader`] turns read-blocking into bounded timeouts plus
//!   cooperative cancellation; [`io::EofReader`] turns end-of-stream into
//!   an explicit condition.
//! - [`checksum`] — the two integrity functions, 8-bit additive sum and
//!   CRC-16/XMODEM.
//! - [`xmodem`] — [`xmodem::XmodemEngine`], the framed block engine:
//!   negotiation, receive/send loops, retry/abort policy.
//! - [`ymodem`] — [`ymodem::YmodemEngine`], the batch envelope layered on
//!   top of `XmodemEngine` by composition: block-0 encode/decode, the
//!   batch loop, per-file accounting, the terminal null block.
//! - [`local_file`] — the filesystem capability the engines write through.
//! - [`session`] — the observable progress/state value objects
//!   ([`session::SessionState`], [`session::FileInfo`]) plus the
//!   controller-to-engine [`session::Control`] channel.
//! - [`error`] — the crate's error type.
//!
//! Presentation/UI, CLI parsing, configuration-file loading, KERMIT,
//! ZMODEM, server-mode listeners, URL-scheme dispatch, and packaging are
//! out of scope; `demos/serial_xfer.rs` shows an embedder wiring a real
//! serial port through this crate without any of that scaffolding.

pub mod checksum;
pub mod error;
pub mod io;
pub mod local_file;
pub mod session;
pub mod xmodem;
pub mod ymodem;

pub use error::{Error, Result};
pub use session::{Control, FileInfo, SessionState, XmodemFlavor, YmodemFlavor};
pub use xmodem::XmodemEngine;
pub use ymodem::YmodemEngine;
