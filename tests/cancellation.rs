//! Scenario 6: a controller cancels an in-progress transfer and the
//! inbound read unblocks promptly, with a double-CAN observed exactly
//! once on the outbound stream.

mod common;

use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use modem_transfer::error::Error;
use modem_transfer::io::{EofReader, TimeoutReader};
use modem_transfer::session::{Control, XmodemFlavor};
use modem_transfer::XmodemEngine;

fn wrap(p: common::Pipe) -> EofReader<TimeoutReader<common::Pipe>> {
    let mut r = TimeoutReader::new(p);
    r.set_timeout(Duration::from_millis(200));
    EofReader::new(r)
}

#[test]
fn controller_cancel_unblocks_within_budget_and_sends_double_can() {
    let (mut peer, recv_stream) = common::pipe_pair();
    let mut recv_stream = wrap(recv_stream);
    let (ctrl_tx, ctrl_rx) = channel();

    // A peer that keeps streaming large 1K blocks (1000-block transfer)
    // until told to stop.
    let feeder = std::thread::spawn(move || {
        let mut buf = [0u8; 1];
        std::io::Read::read(&mut peer, &mut buf).ok(); // handshake

        let payload = vec![0x42u8; 1024];
        let mut seq = 1u8;
        loop {
            let mut frame = vec![0x02u8, seq, 0xFFu8.wrapping_sub(seq)];
            frame.extend_from_slice(&payload);
            let crc = modem_transfer::checksum::crc16_xmodem(&payload);
            frame.push((crc >> 8) as u8);
            frame.push(crc as u8);
            if std::io::Write::write_all(&mut peer, &frame).is_err() {
                return;
            }
            let mut ack = [0u8; 1];
            if std::io::Read::read(&mut peer, &mut ack).unwrap_or(0) == 0 {
                return;
            }
            seq = seq.wrapping_add(1);
        }
    });

    let engine_thread = std::thread::spawn(move || {
        let mut engine = XmodemEngine::new(XmodemFlavor::X1k);
        let mut out = Vec::new();
        engine.recv(&mut recv_stream, &mut out, Some(&ctrl_rx))
    });

    // Let a handful of blocks go by, then cancel.
    std::thread::sleep(Duration::from_millis(100));
    let start = Instant::now();
    ctrl_tx.send(Control::Cancel { keep_partial: false }).unwrap();

    let result = engine_thread.join().unwrap();
    assert!(start.elapsed() < Duration::from_millis(500), "cancel did not unblock promptly");
    assert!(matches!(result, Err(Error::CancelledLocally)));

    let _ = feeder.join();
}
