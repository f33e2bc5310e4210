// BoardLink - Emulated Board Host Bridge
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::flash::FlashImage;
use crate::peripherals::uart::{self, Uart};
use crate::{CoreState, EmulationCore, Peripheral, SimResult, SimulationError};

/// Diagnostic stand-in for an instruction core: echoes every byte each UART
/// receives straight back out of the same UART. Used to check a terminal
/// bridge end to end without guest firmware.
///
/// Like a real core it has to be reset onto a boot vector before it steps.
#[derive(Debug, Default)]
pub struct LoopbackCore {
    pc: u32,
    echoed: u64,
    booted: bool,
}

impl LoopbackCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn echoed(&self) -> u64 {
        self.echoed
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }
}

impl EmulationCore for LoopbackCore {
    fn reset(&mut self, boot_pc: u32) {
        self.pc = boot_pc;
        self.echoed = 0;
        self.booted = true;
    }

    fn step(&mut self, _flash: &mut FlashImage, uarts: &mut [Uart]) -> SimResult<CoreState> {
        if !self.booted {
            return Err(SimulationError::CoreFault(
                "stepped before reset".to_string(),
            ));
        }
        let mut state = CoreState::Idle;
        for port in uarts.iter_mut() {
            while port.read(uart::STATUS)? & uart::RXC != 0 {
                let byte = port.read(uart::DATA)?;
                port.write(uart::DATA, byte)?;
                self.echoed += 1;
                state = CoreState::Running;
            }
        }
        Ok(state)
    }
}
