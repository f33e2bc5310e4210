// BoardLink - Emulated Board Host Bridge
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Bridges one emulated UART channel to a host pseudoterminal.
//!
//! Two threads share a channel. The emulation thread owns the
//! [`ChannelListener`]: it produces into `outgoing` (guest to host) and
//! consumes `incoming` (host to guest), and it is the only place bytes are
//! handed to the guest. The worker thread owns the pty master: it consumes
//! `outgoing` into the terminal and produces terminal input into `incoming`.
//! The two rings are the only state crossing threads.

pub mod pty;

use crate::ring::{ByteRing, RingConsumer, RingProducer};
use crate::{BoardError, BoardResult, GuestReceiver, UartListener};
use boardlink_config::BridgeConfig;
use pty::Pty;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Largest single read from the terminal.
pub const READ_CHUNK: usize = 255;
/// Largest single write to the terminal.
pub const WRITE_CHUNK: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Init,
    Running,
    Stopping,
    Stopped,
}

/// Byte counters for one channel, shared by both threads.
#[derive(Debug, Default)]
pub struct BridgeStats {
    to_host: AtomicU64,
    from_host: AtomicU64,
    to_guest: AtomicU64,
    dropped: AtomicU64,
}

impl BridgeStats {
    /// Bytes written to the terminal.
    pub fn to_host(&self) -> u64 {
        self.to_host.load(Ordering::SeqCst)
    }

    /// Bytes read from the terminal.
    pub fn from_host(&self) -> u64 {
        self.from_host.load(Ordering::SeqCst)
    }

    /// Bytes handed to the guest.
    pub fn to_guest(&self) -> u64 {
        self.to_guest.load(Ordering::SeqCst)
    }

    /// Guest output lost to a full ring, a missing peer or a short write.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    fn add_dropped(&self, n: usize) {
        self.dropped.fetch_add(n as u64, Ordering::SeqCst);
    }
}

/// Emulation-thread half of a channel, registered with the guest UART.
#[derive(Debug)]
pub struct ChannelListener {
    channel: char,
    outgoing: RingProducer,
    incoming: RingConsumer,
    ready: bool,
    stats: Arc<BridgeStats>,
}

impl ChannelListener {
    pub(crate) fn new(
        channel: char,
        outgoing: RingProducer,
        incoming: RingConsumer,
        stats: Arc<BridgeStats>,
    ) -> Self {
        Self {
            channel,
            outgoing,
            incoming,
            ready: false,
            stats,
        }
    }

    pub fn channel(&self) -> char {
        self.channel
    }

    /// Whether the guest last signalled that it can take input.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Host bytes waiting for the guest to assert flow control.
    pub fn pending_for_guest(&self) -> usize {
        self.incoming.len()
    }
}

impl UartListener for ChannelListener {
    fn on_byte_transmitted(&mut self, byte: u8) {
        if !self.outgoing.write(byte) {
            self.stats.add_dropped(1);
            trace!("UART{} outgoing ring full, dropped {:#04x}", self.channel, byte);
        }
    }

    fn on_flow_asserted(&mut self, guest: &mut dyn GuestReceiver) {
        if !self.ready {
            trace!("UART{} xon", self.channel);
        }
        self.ready = true;
        while self.ready {
            let Some(byte) = self.incoming.read() else {
                break;
            };
            self.stats.to_guest.fetch_add(1, Ordering::SeqCst);
            self.ready = guest.deliver_byte(byte);
        }
    }

    fn on_flow_deasserted(&mut self) {
        if self.ready {
            trace!("UART{} xoff", self.channel);
        }
        self.ready = false;
    }
}

/// Owner of a channel's worker thread, terminal and filesystem alias.
#[derive(Debug)]
pub struct ChannelBridge {
    channel: char,
    state: BridgeState,
    secondary_path: PathBuf,
    link: Option<PathBuf>,
    stop: Arc<AtomicBool>,
    waker: UnixStream,
    worker: Option<JoinHandle<BoardResult<()>>>,
    stats: Arc<BridgeStats>,
}

impl ChannelBridge {
    /// Opens the terminal, publishes its alias and starts the worker. The
    /// returned listener must be attached to the channel's UART.
    pub fn start(channel: char, settings: &BridgeConfig) -> BoardResult<(Self, ChannelListener)> {
        let pty = Pty::open().map_err(|e| {
            BoardError::resource(format!("Unable to create pty for UART{}", channel), e)
        })?;
        Self::launch(channel, settings, pty)
    }

    fn launch(
        channel: char,
        settings: &BridgeConfig,
        pty: Pty,
    ) -> BoardResult<(Self, ChannelListener)> {
        let (outgoing_tx, outgoing_rx) = ByteRing::new(settings.ring_capacity)?.split();
        let (incoming_tx, incoming_rx) = ByteRing::new(settings.ring_capacity)?.split();
        let stats = Arc::new(BridgeStats::default());
        let listener = ChannelListener::new(channel, outgoing_tx, incoming_rx, stats.clone());

        let (waker, wake_rx) = UnixStream::pair()
            .and_then(|(a, b)| {
                a.set_nonblocking(true)?;
                b.set_nonblocking(true)?;
                Ok((a, b))
            })
            .map_err(|e| {
                BoardError::resource(format!("Unable to create wakeup pair for UART{}", channel), e)
            })?;

        let stop = Arc::new(AtomicBool::new(false));
        let mut bridge = Self {
            channel,
            state: BridgeState::Init,
            secondary_path: pty.secondary_path().to_path_buf(),
            link: None,
            stop: stop.clone(),
            waker,
            worker: None,
            stats: stats.clone(),
        };
        let link = settings.link_path(std::process::id(), channel);
        bridge.link = publish_alias(channel, &bridge.secondary_path, &link);

        let worker = Worker {
            channel,
            pty,
            wake: wake_rx,
            stop,
            outgoing: outgoing_rx,
            incoming: incoming_tx,
            staging: [0; READ_CHUNK],
            staged_len: 0,
            staged_done: 0,
            poll_interval: settings.poll_interval(),
            hangup_backoff: settings.hangup_backoff(),
            stats,
        };
        // On failure `bridge` drops here and takes its alias with it.
        let handle = thread::Builder::new()
            .name(format!("uart{}-pty", channel))
            .spawn(move || worker.run())
            .map_err(|e| BoardError::Thread {
                channel,
                reason: format!("failed to spawn: {}", e),
            })?;

        bridge.worker = Some(handle);
        bridge.state = BridgeState::Running;
        debug!(
            "UART{} bridged to {}",
            channel,
            bridge.secondary_path.display()
        );
        Ok((bridge, listener))
    }

    pub fn channel(&self) -> char {
        self.channel
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// The pty device peers can open directly.
    pub fn secondary_path(&self) -> &Path {
        &self.secondary_path
    }

    /// The published alias, if it could be created.
    pub fn link_path(&self) -> Option<&Path> {
        self.link.as_deref()
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn is_worker_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Removes the alias, stops the worker and waits for it. The terminal is
    /// closed by the worker on its way out. Safe to call more than once.
    pub fn stop(&mut self) -> BoardResult<()> {
        if self.state == BridgeState::Stopped {
            return Ok(());
        }
        info!("Shutting down UART{}", self.channel);
        self.state = BridgeState::Stopping;

        if let Some(link) = self.link.take() {
            match fs::remove_file(&link) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("UART{}: unable to remove {:?}: {}", self.channel, link, e),
            }
        }

        self.stop.store(true, Ordering::Release);
        send_wakeup(&self.waker);

        let result = match self.worker.take() {
            Some(handle) => match handle.join() {
                Ok(loop_result) => loop_result,
                Err(_) => Err(BoardError::Thread {
                    channel: self.channel,
                    reason: "worker panicked".to_string(),
                }),
            },
            None => Ok(()),
        };
        self.state = BridgeState::Stopped;
        result
    }
}

impl Drop for ChannelBridge {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("UART{} teardown: {}", self.channel, e);
        }
    }
}

/// Recreates `link` pointing at `target`. Failure leaves the channel usable
/// through the device node itself.
fn publish_alias(channel: char, target: &Path, link: &Path) -> Option<PathBuf> {
    match fs::remove_file(link) {
        Ok(()) => debug!("Removed stale alias {:?}", link),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("UART{}: unable to remove stale {:?}: {}", channel, link, e),
    }
    match std::os::unix::fs::symlink(target, link) {
        Ok(()) => {
            info!("UART{} available at {}", channel, link.display());
            Some(link.to_path_buf())
        }
        Err(e) => {
            warn!(
                "UART{}: can't create symlink {:?} to {:?}: {}",
                channel, link, target, e
            );
            None
        }
    }
}

/// Worker-thread half of a channel.
struct Worker {
    channel: char,
    pty: Pty,
    wake: UnixStream,
    stop: Arc<AtomicBool>,
    outgoing: RingConsumer,
    incoming: RingProducer,
    staging: [u8; READ_CHUNK],
    staged_len: usize,
    staged_done: usize,
    poll_interval: Duration,
    hangup_backoff: Duration,
    stats: Arc<BridgeStats>,
}

impl Worker {
    fn run(mut self) -> BoardResult<()> {
        debug!("UART{} worker started", self.channel);
        let result = self.serve();
        if let Err(e) = &result {
            error!("{}", e);
        }
        debug!("UART{} worker exiting", self.channel);
        result
    }

    fn serve(&mut self) -> BoardResult<()> {
        while !self.stop.load(Ordering::Acquire) {
            let mut events = libc::POLLHUP;
            if self.staged_done == self.staged_len {
                events |= libc::POLLIN;
            }
            if !self.outgoing.is_empty() {
                events |= libc::POLLOUT;
            }
            let mut fds = [
                libc::pollfd {
                    fd: self.pty.as_raw_fd(),
                    events,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.wake.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let ready = poll_fds(&mut fds, self.poll_interval).map_err(|e| self.io_error(e))?;

            if fds[1].revents != 0 {
                self.drain_wake();
                continue;
            }

            let revents = if ready == 0 { 0 } else { fds[0].revents };
            if revents & libc::POLLNVAL != 0 {
                return Err(self.io_error(io::Error::from_raw_os_error(libc::EBADF)));
            }
            if revents & (libc::POLLHUP | libc::POLLERR) != 0 {
                self.on_hangup()?;
            }
            if revents & libc::POLLIN != 0 {
                self.fill_staging()?;
            }
            // Also runs on timeouts so staged input resumes once the guest drains.
            self.stage_into_incoming();
            if revents & libc::POLLOUT != 0 {
                self.flush_outgoing()?;
            }
        }
        Ok(())
    }

    /// No peer holds the terminal: drop the backlog and wait a little, since
    /// hangup stays signalled until someone opens the device.
    fn on_hangup(&mut self) -> BoardResult<()> {
        let dropped = self.outgoing.discard_all();
        if dropped > 0 {
            self.stats.add_dropped(dropped);
            trace!("UART{} no peer attached, dropped {} bytes", self.channel, dropped);
        }
        let mut fds = [libc::pollfd {
            fd: self.wake.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        if poll_fds(&mut fds, self.hangup_backoff).map_err(|e| self.io_error(e))? > 0 {
            self.drain_wake();
        }
        Ok(())
    }

    fn fill_staging(&mut self) -> BoardResult<()> {
        let mut master = self.pty.file();
        match master.read(&mut self.staging) {
            Ok(0) => {}
            Ok(n) => {
                self.staged_len = n;
                self.staged_done = 0;
                self.stats.from_host.fetch_add(n as u64, Ordering::SeqCst);
                trace!("UART{} pty recv {:02x?}", self.channel, &self.staging[..n]);
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => return Err(self.io_error(e)),
        }
        Ok(())
    }

    fn stage_into_incoming(&mut self) {
        while self.staged_done < self.staged_len && !self.incoming.is_full() {
            if !self.incoming.write(self.staging[self.staged_done]) {
                break;
            }
            self.staged_done += 1;
        }
    }

    fn flush_outgoing(&mut self) -> BoardResult<()> {
        let mut buf = [0u8; WRITE_CHUNK];
        let n = self.outgoing.read_into(&mut buf);
        if n == 0 {
            return Ok(());
        }
        let mut master = self.pty.file();
        match master.write(&buf[..n]) {
            Ok(written) => {
                self.stats.to_host.fetch_add(written as u64, Ordering::SeqCst);
                trace!("UART{} pty send {:02x?}", self.channel, &buf[..written]);
                if written < n {
                    self.stats.add_dropped(n - written);
                    debug!("UART{} short write, dropped {} bytes", self.channel, n - written);
                }
            }
            Err(e) if is_transient(&e) => self.stats.add_dropped(n),
            Err(e) => return Err(self.io_error(e)),
        }
        Ok(())
    }

    fn drain_wake(&mut self) {
        let mut buf = [0u8; 16];
        while matches!(self.wake.read(&mut buf), Ok(n) if n > 0) {}
    }

    fn io_error(&self, source: io::Error) -> BoardError {
        BoardError::Io {
            channel: self.channel,
            source,
        }
    }
}

/// Best effort. A full socket buffer already holds a pending wakeup, and a
/// worker that has exited needs none; the latter must not raise SIGPIPE.
fn send_wakeup(waker: &UnixStream) {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const FLAGS: libc::c_int = 0;

    let byte = [1u8];
    let rc = unsafe { libc::send(waker.as_raw_fd(), byte.as_ptr().cast(), byte.len(), FLAGS) };
    if rc < 0 {
        trace!("wakeup not sent: {}", io::Error::last_os_error());
    }
}

/// Errors that mean "not now" or "peer went away" rather than a broken loop.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || e.raw_os_error() == Some(libc::EIO)
}

fn poll_fds(fds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
