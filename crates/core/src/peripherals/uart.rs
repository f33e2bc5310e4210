// BoardLink - Emulated Board Host Bridge
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{GuestReceiver, Peripheral, SimResult, SimulationError, UartListener};
use std::collections::VecDeque;

// USART register block, offsets from UCSRnA.
pub const STATUS: u64 = 0x00;
pub const CONTROL_B: u64 = 0x01;
pub const CONTROL_C: u64 = 0x02;
pub const BAUD_LOW: u64 = 0x04;
pub const BAUD_HIGH: u64 = 0x05;
pub const DATA: u64 = 0x06;
pub const REGISTER_SPAN: u64 = 0x07;

// STATUS bits
pub const RXC: u8 = 1 << 7;
pub const TXC: u8 = 1 << 6;
pub const UDRE: u8 = 1 << 5;
pub const DOR: u8 = 1 << 3;

/// Bounded receive FIFO of the guest UART.
#[derive(Debug, serde::Serialize)]
pub struct RxFifo {
    bytes: VecDeque<u8>,
    depth: usize,
    overruns: u64,
    #[serde(skip)]
    overrun_pending: bool,
}

impl RxFifo {
    pub fn new(depth: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(depth),
            depth,
            overruns: 0,
            overrun_pending: false,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.bytes.len() >= self.depth
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

impl GuestReceiver for RxFifo {
    fn deliver_byte(&mut self, byte: u8) -> bool {
        if self.is_full() {
            self.overruns += 1;
            self.overrun_pending = true;
            tracing::debug!("UART receive overrun, dropped {:#04x}", byte);
            return false;
        }
        self.bytes.push_back(byte);
        !self.is_full()
    }
}

/// Guest-facing USART model.
///
/// Transmit writes and flow-control changes are reported to the attached
/// [`UartListener`] on the thread that drives the board; received bytes only
/// ever enter through the listener's flow-assertion handler.
#[derive(Debug, serde::Serialize)]
pub struct Uart {
    channel: char,
    control_b: u8,
    control_c: u8,
    baud: u16,
    rx: RxFifo,
    tx_count: u64,
    rx_count: u64,
    #[serde(skip)]
    listener: Option<Box<dyn UartListener>>,
    #[serde(skip)]
    flow_stopped: bool,
}

impl Uart {
    pub fn new(channel: char, fifo_depth: usize) -> Self {
        Self {
            channel,
            control_b: 0,
            control_c: 0x06, // 8N1 after reset
            baud: 0,
            rx: RxFifo::new(fifo_depth.max(1)),
            tx_count: 0,
            rx_count: 0,
            listener: None,
            flow_stopped: false,
        }
    }

    pub fn channel(&self) -> char {
        self.channel
    }

    pub fn attach_listener(&mut self, listener: Box<dyn UartListener>) {
        tracing::debug!("UART{} listener attached", self.channel);
        self.listener = Some(listener);
        self.flow_stopped = false;
    }

    pub fn detach_listener(&mut self) -> Option<Box<dyn UartListener>> {
        self.listener.take()
    }

    pub fn rx_fifo(&self) -> &RxFifo {
        &self.rx
    }

    /// Bytes the guest has written to DATA.
    pub fn tx_count(&self) -> u64 {
        self.tx_count
    }

    /// Bytes the guest has read from DATA.
    pub fn rx_count(&self) -> u64 {
        self.rx_count
    }

    pub fn baud_divisor(&self) -> u16 {
        self.baud
    }

    fn status(&self) -> u8 {
        let mut status = UDRE | TXC;
        if !self.rx.is_empty() {
            status |= RXC;
        }
        if self.rx.overrun_pending {
            status |= DOR;
        }
        status
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Peripheral for Uart {
    fn read(&mut self, offset: u64) -> SimResult<u8> {
        match offset {
            DATA => match self.rx.bytes.pop_front() {
                Some(byte) => {
                    self.rx_count += 1;
                    self.rx.overrun_pending = false;
                    Ok(byte)
                }
                None => Ok(0),
            },
            _ => self
                .peek(offset)
                .ok_or(SimulationError::MemoryViolation(offset)),
        }
    }

    fn write(&mut self, offset: u64, value: u8) -> SimResult<()> {
        match offset {
            DATA => {
                self.tx_count += 1;
                match self.listener.as_mut() {
                    Some(listener) => listener.on_byte_transmitted(value),
                    None => tracing::trace!("UART{} tx {:#04x} with no listener", self.channel, value),
                }
            }
            CONTROL_B => self.control_b = value,
            CONTROL_C => self.control_c = value,
            BAUD_LOW => self.baud = (self.baud & 0xFF00) | value as u16,
            BAUD_HIGH => self.baud = (self.baud & 0x00FF) | ((value as u16 & 0x0F) << 8),
            // Flag bits are read-only here; reserved offset ignores writes.
            STATUS | 0x03 => {}
            _ => return Err(SimulationError::MemoryViolation(offset)),
        }
        Ok(())
    }

    fn peek(&self, offset: u64) -> Option<u8> {
        match offset {
            STATUS => Some(self.status()),
            CONTROL_B => Some(self.control_b),
            CONTROL_C => Some(self.control_c),
            0x03 => Some(0),
            BAUD_LOW => Some(self.baud as u8),
            BAUD_HIGH => Some((self.baud >> 8) as u8),
            DATA => Some(self.rx.bytes.front().copied().unwrap_or(0)),
            _ => None,
        }
    }

    /// Raises flow control: assertion on every tick while the receive FIFO
    /// has room, deassertion once when it fills up.
    fn tick(&mut self) {
        let Some(listener) = self.listener.as_mut() else {
            return;
        };
        if self.rx.is_full() {
            if !self.flow_stopped {
                self.flow_stopped = true;
                listener.on_flow_deasserted();
            }
        } else {
            self.flow_stopped = false;
            listener.on_flow_asserted(&mut self.rx);
        }
    }
}
