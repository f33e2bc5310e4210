// BoardLink - Emulated Board Host Bridge
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Location of the program memory file below `$HOME` when none is configured.
pub const DEFAULT_FLASH_RELATIVE_PATH: &str = ".boardlink/pflash.dat";

fn default_board_name() -> String {
    "m128rfa1".to_string()
}

fn default_flash_size() -> String {
    "128KiB".to_string()
}

fn default_boot_pc() -> u32 {
    // The bootloader section of a 128 KiB part, selected by the fuses.
    0x1f800
}

fn default_uarts() -> Vec<char> {
    vec!['0', '1']
}

fn default_uart_fifo_depth() -> usize {
    64
}

fn default_ring_capacity() -> usize {
    512
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_hangup_backoff_ms() -> u64 {
    50
}

fn default_link_prefix() -> String {
    "boardlink".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FlashConfig {
    /// Backing file. `None` selects `$HOME/.boardlink/pflash.dat`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Size of the device address space, e.g. "128KiB".
    #[serde(default = "default_flash_size")]
    pub size: String,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            path: None,
            size: default_flash_size(),
        }
    }
}

impl FlashConfig {
    pub fn size_bytes(&self) -> Result<usize> {
        let bytes = parse_size(&self.size)?;
        if bytes == 0 {
            return Err(anyhow!("Flash size must not be zero"));
        }
        usize::try_from(bytes).context("Flash size does not fit the host address space")
    }

    pub fn resolve_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => {
                let path = default_flash_path()?;
                debug!("No flash path configured, using {:?}", path);
                Ok(path)
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Per-direction ring capacity in bytes. Must be a power of two.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_hangup_backoff_ms")]
    pub hangup_backoff_ms: u64,
    /// Directory holding the terminal aliases. `None` selects the system temp dir.
    #[serde(default)]
    pub link_dir: Option<PathBuf>,
    #[serde(default = "default_link_prefix")]
    pub link_prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            hangup_backoff_ms: default_hangup_backoff_ms(),
            link_dir: None,
            link_prefix: default_link_prefix(),
        }
    }
}

impl BridgeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn hangup_backoff(&self) -> Duration {
        Duration::from_millis(self.hangup_backoff_ms)
    }

    pub fn resolve_link_dir(&self) -> PathBuf {
        self.link_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Alias path for one channel of one process, e.g. `/tmp/boardlink-4242-uart0`.
    pub fn link_path(&self, pid: u32, channel: char) -> PathBuf {
        self.resolve_link_dir()
            .join(format!("{}-{}-uart{}", self.link_prefix, pid, channel))
    }
}

/// Board descriptor (YAML). Every field is optional.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BoardConfig {
    #[serde(default = "default_board_name")]
    pub name: String,
    #[serde(default)]
    pub flash: FlashConfig,
    #[serde(default = "default_boot_pc")]
    pub boot_pc: u32,
    #[serde(default = "default_uarts")]
    pub uarts: Vec<char>,
    /// Depth of the guest UART receive FIFO.
    #[serde(default = "default_uart_fifo_depth")]
    pub uart_fifo_depth: usize,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            name: default_board_name(),
            flash: FlashConfig::default(),
            boot_pc: default_boot_pc(),
            uarts: default_uarts(),
            uart_fifo_depth: default_uart_fifo_depth(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl BoardConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read board descriptor {:?}", path))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Invalid board descriptor {:?}", path))?;
        debug!("Loaded board descriptor {:?} for '{}'", path, config.name);
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).context("Failed to parse Board Descriptor YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let flash_len = self.flash.size_bytes()?;
        if self.boot_pc as usize >= flash_len {
            return Err(anyhow!(
                "Boot address {:#x} lies outside of {} bytes of flash",
                self.boot_pc,
                flash_len
            ));
        }
        if !self.bridge.ring_capacity.is_power_of_two() {
            return Err(anyhow!(
                "bridge.ring_capacity must be a power of two, got {}",
                self.bridge.ring_capacity
            ));
        }
        if self.uart_fifo_depth == 0 {
            return Err(anyhow!("uart_fifo_depth must not be zero"));
        }
        for (i, ch) in self.uarts.iter().enumerate() {
            if !ch.is_ascii_alphanumeric() {
                return Err(anyhow!("Invalid UART channel id {:?}", ch));
            }
            if self.uarts[..i].contains(ch) {
                return Err(anyhow!("UART channel {} listed twice", ch));
            }
        }
        Ok(())
    }
}

/// `$HOME/.boardlink/pflash.dat`.
pub fn default_flash_path() -> Result<PathBuf> {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => Ok(PathBuf::from(home).join(DEFAULT_FLASH_RELATIVE_PATH)),
        _ => Err(anyhow!("Unable to determine your HOME")),
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}
