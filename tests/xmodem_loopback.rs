//! Round-trip tests for the bare XMODEM engine (spec section 8: round-trip
//! and boundary properties, scenarios 1-2).

mod common;

use std::time::Duration;

use modem_transfer::io::{EofReader, TimeoutReader};
use modem_transfer::session::XmodemFlavor;
use modem_transfer::XmodemEngine;

fn wrap(p: common::Pipe) -> EofReader<TimeoutReader<common::Pipe>> {
    let mut r = TimeoutReader::new(p);
    r.set_timeout(Duration::from_millis(200));
    EofReader::new(r)
}

fn xmodem_loopback(flavor: XmodemFlavor, data: Vec<u8>) -> (Vec<u8>, Vec<u8>) {
    let (p1, p2) = common::pipe_pair();
    let mut tx_stream = wrap(p1);
    let mut rx_stream = wrap(p2);

    let tx = std::thread::spawn(move || {
        let mut engine = XmodemEngine::new(flavor);
        let mut input = &data[..];
        engine.send(&mut tx_stream, &mut input, None).unwrap();
        data
    });
    let rx = std::thread::spawn(move || {
        let mut engine = XmodemEngine::new(flavor);
        let mut out = Vec::new();
        engine.recv(&mut rx_stream, &mut out, None).unwrap();
        out
    });

    let sent = tx.join().unwrap();
    let received = rx.join().unwrap();
    (sent, received)
}

/// Scenario 1: a 5-byte file over vanilla XMODEM. The receiver's copy is
/// padded to 128 bytes with `CPMEOF` (0x1A); comparing with the pad
/// stripped passes.
#[test]
fn scenario_1_vanilla_short_file() {
    let (sent, received) = xmodem_loopback(XmodemFlavor::Vanilla, b"ABCDE".to_vec());
    assert_eq!(received.len(), 128);
    assert_eq!(&received[..sent.len()], &sent[..]);
    assert!(received[sent.len()..].iter().all(|&b| b == 0x1A));
}

/// Scenario 2: a 1K-G transfer over a lossless pipe. File matches
/// byte-for-byte once the pad is accounted for, and the block count is
/// `ceil(len/1024)`.
#[test]
fn scenario_2_1k_g_matches_and_counts_blocks() {
    let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let expected_blocks = data.len().div_ceil(1024) as u64;
    let (sent, received) = xmodem_loopback(XmodemFlavor::X1kG, data);
    assert_eq!(received.len(), expected_blocks as usize * 1024);
    assert_eq!(&received[..sent.len()], &sent[..]);
}

#[test]
fn crc_flavor_round_trips() {
    let data = b"the quick brown fox jumps over the lazy dog".to_vec();
    let (sent, received) = xmodem_loopback(XmodemFlavor::Crc, data);
    assert_eq!(&received[..sent.len()], &sent[..]);
}

#[test]
fn x1k_round_trips_multi_block() {
    let data: Vec<u8> = (0..3000u32).map(|i| (i * 7) as u8).collect();
    let (sent, received) = xmodem_loopback(XmodemFlavor::X1k, data.clone());
    assert_eq!(&received[..sent.len()], &sent[..]);
}

/// Relaxed uses vanilla framing, just a longer per-block timeout; it must
/// still interoperate byte-for-byte with a vanilla-expecting round trip.
#[test]
fn relaxed_round_trips_like_vanilla() {
    let data = b"relaxed timeout, vanilla framing".to_vec();
    let (sent, received) = xmodem_loopback(XmodemFlavor::Relaxed, data);
    assert_eq!(&received[..sent.len()], &sent[..]);
}

/// Empty files are legal (spec 9 open question) and transfer with zero
/// data blocks.
#[test]
fn empty_file_round_trips() {
    let (sent, received) = xmodem_loopback(XmodemFlavor::Crc, Vec::new());
    assert_eq!(sent, Vec::<u8>::new());
    assert_eq!(received, Vec::<u8>::new());
}
