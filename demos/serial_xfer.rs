//! Thin illustration of wiring a real serial port through
//! `TimeoutReader`/`EofReader` into the engines. Not a CLI (no argument
//! parsing, no configuration loading) and not part of the crate's public
//! surface — see spec section 1's "thin scaffolding... treated as
//! external collaborators". Built only with `--features serial-demo`.
//!
//! Usage sketch (not wired to real args on purpose):
//!   cargo run --bin serial-xfer-demo --features serial-demo

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use modem_transfer::io::{EofReader, TimeoutReader, POLL_QUANTUM};
use modem_transfer::session::YmodemFlavor;
use modem_transfer::YmodemEngine;

fn main() {
    init_logging();

    let port_name = std::env::var("MODEM_PORT").unwrap_or_else(|_| "/dev/ttyUSB0".to_string());
    let baud_rate: u32 = std::env::var("MODEM_BAUD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(115_200);
    let dest_dir: PathBuf = std::env::var("MODEM_DEST")
        .unwrap_or_else(|_| ".".to_string())
        .into();

    let mut port = serialport::new(&port_name, baud_rate)
        .open()
        .expect("failed to open serial port");
    // The wrapped reader must return promptly so TimeoutReader's own
    // deadline logic can poll it; configure the port's own timeout at or
    // below the poll quantum, per TimeoutReader::new's caller contract.
    port.set_timeout(POLL_QUANTUM).expect("failed to set port timeout");

    let mut stream = EofReader::new(TimeoutReader::new(port));

    let mut engine = YmodemEngine::new(YmodemFlavor::G);
    engine.overwrite = false;

    log::info!("receiving YMODEM batch on {port_name} into {}", dest_dir.display());
    match engine.recv_batch(&mut stream, dest_dir, None) {
        Ok(files) => {
            for f in &files {
                log::info!("received {} ({} bytes)", f.remote_filename, f.bytes_transferred);
            }
        }
        Err(e) => {
            log::error!("transfer aborted: {e}");
            std::process::exit(1);
        }
    }
}

/// A minimal stand-in for whatever logger the embedding binary actually
/// wires up; this demo has no configuration-loading of its own (non-goal).
fn init_logging() {
    let _ = std::io::stdout().flush();
}
