// BoardLink - Emulated Board Host Bridge
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{anyhow, bail, Context, Result};
use boardlink_core::memory::ProgramImage;
use boardlink_core::FlashImage;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

const DATA: u8 = 0x00;
const END_OF_FILE: u8 = 0x01;
const EXTENDED_SEGMENT_ADDRESS: u8 = 0x02;
const START_SEGMENT_ADDRESS: u8 = 0x03;
const EXTENDED_LINEAR_ADDRESS: u8 = 0x04;
const START_LINEAR_ADDRESS: u8 = 0x05;

/// One decoded `:LLAAAATT<data>CC` line.
#[derive(Debug)]
struct Record {
    kind: u8,
    offset: u16,
    payload: Vec<u8>,
}

pub fn load_hex(path: &Path) -> Result<ProgramImage> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read firmware file: {:?}", path))?;
    parse_hex(&text).with_context(|| format!("Failed to parse firmware file: {:?}", path))
}

pub fn parse_hex(text: &str) -> Result<ProgramImage> {
    let mut image = ProgramImage::new();
    let mut upper: u64 = 0;
    let mut saw_eof = false;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if saw_eof {
            warn!("Ignoring records after end-of-file record (line {})", idx + 1);
            break;
        }
        let record = parse_record(line).with_context(|| format!("line {}", idx + 1))?;

        match record.kind {
            DATA => image.append(upper + record.offset as u64, &record.payload),
            END_OF_FILE => saw_eof = true,
            EXTENDED_SEGMENT_ADDRESS => {
                upper = (be_u16(&record.payload, idx)? as u64) << 4;
            }
            EXTENDED_LINEAR_ADDRESS => {
                upper = (be_u16(&record.payload, idx)? as u64) << 16;
            }
            START_SEGMENT_ADDRESS | START_LINEAR_ADDRESS => {
                let bytes: [u8; 4] = record.payload.as_slice().try_into().map_err(|_| {
                    anyhow!("line {}: start address record needs 4 bytes", idx + 1)
                })?;
                let entry = if record.kind == START_SEGMENT_ADDRESS {
                    // CS:IP
                    let cs = u16::from_be_bytes([bytes[0], bytes[1]]) as u32;
                    let ip = u16::from_be_bytes([bytes[2], bytes[3]]) as u32;
                    (cs << 4) + ip
                } else {
                    u32::from_be_bytes(bytes)
                };
                image.entry_point = Some(entry);
            }
            other => bail!("line {}: unsupported record type {:02x}", idx + 1, other),
        }
    }

    if !saw_eof {
        debug!("Firmware text has no end-of-file record");
    }
    Ok(image)
}

/// Applies every chunk of `path` to `flash` in file order and returns the
/// number of bytes written. Stops at the first chunk that does not fit;
/// chunks before it stay written.
pub fn load(path: &Path, flash: &mut FlashImage) -> Result<usize> {
    let image = load_hex(path)?;
    if image.chunks.is_empty() {
        warn!("{:?} holds no data records", path);
        return Ok(0);
    }

    let mut written = 0;
    for chunk in &image.chunks {
        flash.apply_chunk(chunk.base, &chunk.data).with_context(|| {
            format!(
                "Firmware file {:?} would exceed max size of flash ({} bytes)",
                path,
                flash.len()
            )
        })?;
        info!(
            "Loading {:?} into flash at {:04x}, size {}",
            path,
            chunk.base,
            chunk.len()
        );
        written += chunk.len();
    }
    Ok(written)
}

fn parse_record(line: &str) -> Result<Record> {
    let digits = line
        .strip_prefix(':')
        .ok_or_else(|| anyhow!("record does not start with ':'"))?;
    if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
        bail!("invalid hex digit {:?}", bad);
    }
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    let bytes = digits
        .as_bytes()
        .chunks(2)
        .map(|pair| (hex_value(pair[0]) << 4) | hex_value(pair[1]))
        .collect::<Vec<u8>>();

    if bytes.len() < 5 {
        bail!("record too short");
    }
    let count = bytes[0] as usize;
    if bytes.len() != count + 5 {
        bail!(
            "byte count {} does not match record length {}",
            count,
            bytes.len() - 5
        );
    }
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        bail!("checksum mismatch (sum {:02x})", sum);
    }

    Ok(Record {
        kind: bytes[3],
        offset: u16::from_be_bytes([bytes[1], bytes[2]]),
        payload: bytes[4..4 + count].to_vec(),
    })
}

/// Caller has checked `digit` is a hex digit.
fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

fn be_u16(payload: &[u8], idx: usize) -> Result<u16> {
    match payload {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => bail!("line {}: address record needs 2 bytes", idx + 1),
    }
}
