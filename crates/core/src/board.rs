// BoardLink - Emulated Board Host Bridge
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::bridge::ChannelBridge;
use crate::flash::FlashImage;
use crate::peripherals::uart::Uart;
use crate::{BoardError, BoardResult, CoreState, EmulationCore, Peripheral};
use boardlink_config::BoardConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause between steps when the core reports nothing to do.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Requests raised from outside the run loop, typically by signal handlers.
/// Both flags are plain atomics, so raising them is async-signal-safe.
#[derive(Debug, Default)]
pub struct RunControl {
    stop: AtomicBool,
    reset: AtomicBool,
}

impl RunControl {
    pub const fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            reset: AtomicBool::new(false),
        }
    }

    /// Ends the current run before its next step.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Restarts the core from the boot vector before its next step; the run
    /// carries on afterwards.
    pub fn request_reset(&self) {
        self.reset.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The core finished.
    Done,
    /// The core crashed.
    Crashed,
    /// The step limit was reached.
    MaxStepsReached,
    /// A stop was requested through [`RunControl`].
    ManualStop,
}

/// Everything one emulated board owns: program memory, UARTs and the
/// terminal bridges behind them.
///
/// One board per process is the expected setup (aliases are keyed by process
/// id and channel), but nothing here is global.
pub struct Board {
    name: String,
    boot_pc: u32,
    flash: FlashImage,
    uarts: Vec<Uart>,
    bridges: Vec<ChannelBridge>,
    total_steps: u64,
}

impl Board {
    /// Refuses to boot from an erased cell.
    pub fn check_boot_vector(flash: &FlashImage, boot_pc: u32) -> BoardResult<()> {
        if flash.is_erased_at(boot_pc as u64) {
            return Err(BoardError::NoFirmware(boot_pc));
        }
        Ok(())
    }

    /// Brings the board up around an already populated flash image: checks
    /// the boot vector, creates one UART per configured channel and bridges
    /// each to a terminal. On failure every bridge started so far is torn
    /// down again.
    pub fn bring_up(config: &BoardConfig, flash: FlashImage) -> BoardResult<Self> {
        Self::check_boot_vector(&flash, config.boot_pc)?;

        let mut uarts = Vec::with_capacity(config.uarts.len());
        let mut bridges = Vec::with_capacity(config.uarts.len());
        for &channel in &config.uarts {
            let mut uart = Uart::new(channel, config.uart_fifo_depth);
            let (bridge, listener) = ChannelBridge::start(channel, &config.bridge)?;
            uart.attach_listener(Box::new(listener));
            uarts.push(uart);
            bridges.push(bridge);
        }

        info!("Board '{}' up, booting from {:#06x}", config.name, config.boot_pc);
        Ok(Self {
            name: config.name.clone(),
            boot_pc: config.boot_pc,
            flash,
            uarts,
            bridges,
            total_steps: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn boot_pc(&self) -> u32 {
        self.boot_pc
    }

    pub fn flash(&self) -> &FlashImage {
        &self.flash
    }

    pub fn uarts(&self) -> &[Uart] {
        &self.uarts
    }

    pub fn uart(&self, channel: char) -> Option<&Uart> {
        self.uarts.iter().find(|u| u.channel() == channel)
    }

    pub fn bridges(&self) -> &[ChannelBridge] {
        &self.bridges
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    /// Drives `core` on the calling thread, the only thread that touches
    /// guest state. UART flow control is evaluated after every step.
    pub fn run(
        &mut self,
        core: &mut dyn EmulationCore,
        max_steps: Option<u64>,
        control: &RunControl,
    ) -> BoardResult<RunOutcome> {
        let mut steps = 0u64;
        loop {
            if control.is_stop_requested() {
                return Ok(RunOutcome::ManualStop);
            }
            if control.reset.swap(false, Ordering::AcqRel) {
                info!("Reset requested, restarting core at {:#06x}", self.boot_pc);
                core.reset(self.boot_pc);
            }
            if let Some(max) = max_steps {
                if steps >= max {
                    return Ok(RunOutcome::MaxStepsReached);
                }
            }

            let state = core.step(&mut self.flash, &mut self.uarts)?;
            for uart in &mut self.uarts {
                uart.tick();
            }
            steps += 1;
            self.total_steps += 1;

            match state {
                CoreState::Running => {}
                CoreState::Idle => std::thread::sleep(IDLE_BACKOFF),
                CoreState::Done => return Ok(RunOutcome::Done),
                CoreState::Crashed => return Ok(RunOutcome::Crashed),
            }
        }
    }

    /// Stops every bridge, then releases program memory. All resources are
    /// released even when an earlier step fails; the first error is returned.
    pub fn shutdown(mut self) -> BoardResult<()> {
        let mut first_err = None;
        for bridge in &mut self.bridges {
            if let Err(e) = bridge.stop() {
                warn!("{}", e);
                first_err.get_or_insert(e);
            }
        }
        for uart in &mut self.uarts {
            uart.detach_listener();
        }
        debug!("Board '{}' ran {} steps", self.name, self.total_steps);
        if let Err(e) = self.flash.close() {
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("name", &self.name)
            .field("boot_pc", &self.boot_pc)
            .field("flash", &self.flash)
            .field("uarts", &self.uarts.len())
            .field("total_steps", &self.total_steps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimResult;

    /// Finishes after a fixed number of steps.
    struct CountdownCore {
        left: u32,
        reset_to: Option<u32>,
        resets: u32,
    }

    impl EmulationCore for CountdownCore {
        fn reset(&mut self, boot_pc: u32) {
            self.reset_to = Some(boot_pc);
            self.resets += 1;
        }

        fn step(&mut self, _flash: &mut FlashImage, _uarts: &mut [Uart]) -> SimResult<CoreState> {
            if self.left == 0 {
                return Ok(CoreState::Done);
            }
            self.left -= 1;
            Ok(CoreState::Running)
        }
    }

    fn config_in(dir: &std::path::Path) -> BoardConfig {
        let mut config = BoardConfig::default();
        config.flash.size = "4KiB".to_string();
        config.boot_pc = 0x100;
        config.bridge.link_dir = Some(dir.to_path_buf());
        config.bridge.poll_interval_ms = 20;
        config
    }

    #[test]
    fn test_erased_boot_vector_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let flash = FlashImage::open_or_create(dir.path().join("f.dat"), 4096).unwrap();

        let err = Board::bring_up(&config, flash).unwrap_err();
        assert!(matches!(err, BoardError::NoFirmware(0x100)));
    }

    #[test]
    fn test_run_limits_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut flash = FlashImage::open_or_create(dir.path().join("f.dat"), 4096).unwrap();
        flash.apply_chunk(0x100, &[0x0C, 0x94]).unwrap();

        let mut board = Board::bring_up(&config, flash).unwrap();
        assert_eq!(board.uarts().len(), 2);
        assert_eq!(board.bridges().len(), 2);
        assert!(board.uart('1').is_some());
        assert!(board.bridges().iter().all(|b| b.link_path().is_some()));

        let control = RunControl::new();
        let mut core = CountdownCore {
            left: 5,
            reset_to: None,
            resets: 0,
        };
        core.reset(board.boot_pc());
        assert_eq!(core.reset_to, Some(0x100));

        assert_eq!(
            board.run(&mut core, Some(3), &control).unwrap(),
            RunOutcome::MaxStepsReached
        );
        assert_eq!(board.run(&mut core, None, &control).unwrap(), RunOutcome::Done);
        assert_eq!(board.total_steps(), 6);

        control.request_stop();
        assert_eq!(
            board.run(&mut core, None, &control).unwrap(),
            RunOutcome::ManualStop
        );

        let links: Vec<_> = board
            .bridges()
            .iter()
            .filter_map(|b| b.link_path().map(|p| p.to_path_buf()))
            .collect();
        board.shutdown().unwrap();
        for link in links {
            assert!(std::fs::symlink_metadata(link).is_err());
        }
    }

    #[test]
    fn test_reset_request_restarts_core_and_keeps_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.uarts = vec!['0'];
        let mut flash = FlashImage::open_or_create(dir.path().join("f.dat"), 4096).unwrap();
        flash.apply_chunk(0x100, &[0x0C, 0x94]).unwrap();
        let mut board = Board::bring_up(&config, flash).unwrap();

        let control = RunControl::new();
        let mut core = CountdownCore {
            left: 100,
            reset_to: None,
            resets: 0,
        };

        control.request_reset();
        assert_eq!(
            board.run(&mut core, Some(4), &control).unwrap(),
            RunOutcome::MaxStepsReached
        );
        assert_eq!(core.resets, 1);
        assert_eq!(core.reset_to, Some(0x100));
        assert_eq!(board.total_steps(), 4);

        // The request is consumed by the first run.
        board.run(&mut core, Some(2), &control).unwrap();
        assert_eq!(core.resets, 1);

        board.shutdown().unwrap();
    }

    #[test]
    fn test_core_fault_surfaces_from_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.uarts = vec!['0'];
        let mut flash = FlashImage::open_or_create(dir.path().join("f.dat"), 4096).unwrap();
        flash.apply_chunk(0x100, &[0x0C, 0x94]).unwrap();
        let mut board = Board::bring_up(&config, flash).unwrap();

        let mut core = crate::loopback::LoopbackCore::new();
        let err = board.run(&mut core, Some(1), &RunControl::new()).unwrap_err();
        assert!(matches!(
            err,
            BoardError::Simulation(crate::SimulationError::CoreFault(_))
        ));
        board.shutdown().unwrap();
    }
}
