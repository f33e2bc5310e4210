// BoardLink - Emulated Board Host Bridge
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use boardlink_config::{BoardConfig, BridgeConfig};
use boardlink_core::loopback::LoopbackCore;
use boardlink_core::{
    Board, ChannelBridge, EmulationCore, FlashImage, GuestReceiver, RunControl, UartListener,
};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(10);

fn open_peer(link: &Path) -> File {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(link)
        .expect("alias should open the pty secondary")
}

fn read_available(peer: &mut File, into: &mut Vec<u8>) {
    let mut buf = [0u8; 64];
    match peer.read(&mut buf) {
        Ok(n) => into.extend_from_slice(&buf[..n]),
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        Err(e) => panic!("peer read failed: {}", e),
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn bridge_settings(dir: &Path, ring_capacity: usize) -> BridgeConfig {
    BridgeConfig {
        ring_capacity,
        poll_interval_ms: 20,
        hangup_backoff_ms: 10,
        link_dir: Some(dir.to_path_buf()),
        link_prefix: "it".to_string(),
    }
}

struct VecGuest(Vec<u8>);

impl GuestReceiver for VecGuest {
    fn deliver_byte(&mut self, byte: u8) -> bool {
        self.0.push(byte);
        true
    }
}

#[test]
fn test_loopback_round_trip_through_alias() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = BoardConfig::default();
    config.flash.size = "4KiB".to_string();
    config.boot_pc = 0;
    config.uarts = vec!['0'];
    config.bridge = bridge_settings(dir.path(), 64);

    let mut flash = FlashImage::open_or_create(dir.path().join("pflash.dat"), 4096).unwrap();
    flash.apply_chunk(0, &[0x0C, 0x94]).unwrap();

    let mut board = Board::bring_up(&config, flash).unwrap();
    let link = board.bridges()[0].link_path().unwrap().to_path_buf();
    let mut peer = open_peer(&link);

    let mut core = LoopbackCore::new();
    core.reset(board.boot_pc());
    let control = RunControl::new();

    peer.write_all(b"hello").unwrap();
    let mut echoed = Vec::new();
    let deadline = Instant::now() + DEADLINE;
    while echoed.len() < 5 && Instant::now() < deadline {
        board.run(&mut core, Some(5), &control).unwrap();
        read_available(&mut peer, &mut echoed);
    }
    assert_eq!(echoed, b"hello");
    assert_eq!(core.echoed(), 5);

    let stats = board.bridges()[0].stats();
    assert_eq!(stats.from_host(), 5);
    assert_eq!(stats.to_guest(), 5);
    assert_eq!(stats.to_host(), 5);

    board.shutdown().unwrap();
    assert!(std::fs::symlink_metadata(&link).is_err());
}

#[test]
fn test_output_without_peer_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let (mut bridge, mut listener) =
        ChannelBridge::start('0', &bridge_settings(dir.path(), 64)).unwrap();

    for b in 0..10 {
        listener.on_byte_transmitted(b);
    }
    assert!(wait_for(|| bridge.stats().dropped() == 10));

    let mut peer = open_peer(bridge.link_path().unwrap());
    // Give the worker a moment to notice the peer before transmitting.
    std::thread::sleep(Duration::from_millis(100));
    listener.on_byte_transmitted(b'o');
    listener.on_byte_transmitted(b'k');

    let mut got = Vec::new();
    assert!(wait_for(|| {
        read_available(&mut peer, &mut got);
        got.len() >= 2
    }));
    assert_eq!(got, b"ok");

    bridge.stop().unwrap();
}

#[test]
fn test_input_waits_for_flow_control() {
    let dir = tempfile::tempdir().unwrap();
    let (mut bridge, mut listener) =
        ChannelBridge::start('1', &bridge_settings(dir.path(), 64)).unwrap();
    let mut peer = open_peer(bridge.link_path().unwrap());

    peer.write_all(b"abc").unwrap();
    assert!(wait_for(|| listener.pending_for_guest() == 3));

    // Deasserted: buffered input stays put.
    listener.on_flow_deasserted();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(listener.pending_for_guest(), 3);

    let mut guest = VecGuest(Vec::new());
    listener.on_flow_asserted(&mut guest);
    assert_eq!(guest.0, b"abc");

    peer.write_all(b"de").unwrap();
    assert!(wait_for(|| listener.pending_for_guest() == 2));
    listener.on_flow_asserted(&mut guest);
    assert_eq!(guest.0, b"abcde");

    bridge.stop().unwrap();
}

#[test]
fn test_saturated_ring_throttles_terminal_reads() {
    let dir = tempfile::tempdir().unwrap();
    let (mut bridge, mut listener) =
        ChannelBridge::start('2', &bridge_settings(dir.path(), 4)).unwrap();
    let mut peer = open_peer(bridge.link_path().unwrap());

    let sent: Vec<u8> = (b'A'..=b'P').collect();
    peer.write_all(&sent).unwrap();

    // Only a ring's worth is accepted until the guest drains it.
    assert!(wait_for(|| listener.pending_for_guest() == 4));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(listener.pending_for_guest(), 4);

    let mut guest = VecGuest(Vec::new());
    assert!(wait_for(|| {
        listener.on_flow_asserted(&mut guest);
        guest.0.len() == sent.len()
    }));
    assert_eq!(guest.0, sent);

    bridge.stop().unwrap();
}
