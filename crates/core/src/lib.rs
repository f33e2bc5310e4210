// BoardLink - Emulated Board Host Bridge
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod board;
pub mod bridge;
pub mod flash;
pub mod loopback;
pub mod memory;
pub mod peripherals;
pub mod ring;

use std::io;

pub use board::{Board, RunControl, RunOutcome};
pub use bridge::{BridgeState, ChannelBridge, ChannelListener};
pub use flash::{FlashImage, ERASED};
pub use peripherals::uart::Uart;
pub use ring::{ByteRing, RingConsumer, RingProducer};

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("Memory access violation at {0:#x}")]
    MemoryViolation(u64),
    #[error("Emulation core halted: {0}")]
    CoreFault(String),
}

pub type SimResult<T> = Result<T, SimulationError>;

/// Failures surfaced by board bring-up, firmware loads and channel lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("{context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("Chunk at {base:#x} with {len} bytes exceeds flash of {capacity} bytes")]
    OutOfRange {
        base: u64,
        len: usize,
        capacity: usize,
    },
    #[error("UART{channel} worker thread: {reason}")]
    Thread { channel: char, reason: String },
    #[error("UART{channel} I/O loop failed: {source}")]
    Io {
        channel: char,
        #[source]
        source: io::Error,
    },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("No firmware loaded in programmable flash at {0:#x}, unable to boot")]
    NoFirmware(u32),
    #[error(transparent)]
    Simulation(#[from] SimulationError),
}

impl BoardError {
    pub fn resource(context: impl Into<String>, source: io::Error) -> Self {
        Self::Resource {
            context: context.into(),
            source,
        }
    }
}

pub type BoardResult<T> = Result<T, BoardError>;

/// Guest side of a UART receive path. Only the emulation thread ever holds one.
pub trait GuestReceiver {
    /// Hands one byte to the guest. Returns `false` once the guest cannot take
    /// another byte (the peripheral deasserted its flow-control line).
    fn deliver_byte(&mut self, byte: u8) -> bool;
}

/// Notifications raised by an emulated UART on the emulation thread.
pub trait UartListener: std::fmt::Debug + Send {
    /// The guest wrote a byte to the transmit register.
    fn on_byte_transmitted(&mut self, byte: u8);
    /// The guest has room in its receive path. Queued input may be delivered
    /// through `guest` before returning.
    fn on_flow_asserted(&mut self, guest: &mut dyn GuestReceiver);
    /// The guest receive path is full.
    fn on_flow_deasserted(&mut self);
}

/// Trait for memory-mapped peripherals owned by the board.
pub trait Peripheral: std::fmt::Debug + Send {
    fn read(&mut self, offset: u64) -> SimResult<u8>;
    fn write(&mut self, offset: u64, value: u8) -> SimResult<()>;
    /// Side-effect free read used by debuggers and reports.
    fn peek(&self, offset: u64) -> Option<u8>;
    fn tick(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    /// The core executed guest work this step.
    Running,
    /// Nothing to do; the board may yield before the next step.
    Idle,
    Done,
    Crashed,
}

/// Run-loop primitive of an instruction-emulation core.
///
/// The board calls `step` from a single thread; implementations may touch
/// program memory and UART registers freely from inside it.
pub trait EmulationCore {
    fn reset(&mut self, boot_pc: u32);
    fn step(&mut self, flash: &mut FlashImage, uarts: &mut [Uart]) -> SimResult<CoreState>;
}
