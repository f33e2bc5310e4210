// BoardLink - Emulated Board Host Bridge
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{BoardError, BoardResult};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{DirBuilder, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Value of an unprogrammed flash cell.
pub const ERASED: u8 = 0xFF;

/// Program memory persisted in a memory-mapped file.
///
/// Byte `i` of the file is byte `i` of the flash address space. Writes land
/// in the shared mapping and reach the file through the page cache; nothing
/// here forces them to disk.
pub struct FlashImage {
    path: PathBuf,
    map: MmapMut,
}

impl FlashImage {
    /// Opens the backing file at `path`, creating it and any missing parent
    /// directories first. A file shorter than `len` is grown and the new
    /// extent erased; a longer one keeps its tail untouched and only the
    /// first `len` bytes are mapped.
    pub fn open_or_create(path: impl AsRef<Path>, len: usize) -> BoardResult<Self> {
        let path = path.as_ref();
        if len == 0 {
            return Err(BoardError::Config(format!(
                "flash image {:?} must not be empty",
                path
            )));
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            DirBuilder::new()
                .recursive(true)
                .mode(0o750)
                .create(parent)
                .map_err(|e| {
                    BoardError::resource(format!("Failed to create directory {:?}", parent), e)
                })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o640)
            .open(path)
            .map_err(|e| BoardError::resource(format!("Unable to open or create {:?}", path), e))?;

        let existing = file
            .metadata()
            .map_err(|e| BoardError::resource(format!("Unable to get file info for {:?}", path), e))?
            .len();
        let wanted = len as u64;

        if existing < wanted {
            preallocate(&file, wanted).map_err(|e| {
                BoardError::resource(format!("Unable to size {:?} to {} bytes", path, len), e)
            })?;
        } else if existing > wanted {
            warn!(
                "Flash file {:?} holds {} bytes, more than the {} bytes of the device; \
                 the tail is left untouched",
                path, existing, len
            );
        }

        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .map_err(|e| BoardError::resource(format!("Failed to map {:?}", path), e))?;

        if existing < wanted {
            // `existing < len` here, so the cast cannot truncate.
            let fresh = existing as usize;
            map[fresh..].fill(ERASED);
            debug!("Erased {} new bytes of {:?} from {:#x}", len - fresh, path, fresh);
        }

        info!("Programmable flash storage: {:?} ({} bytes)", path, len);
        Ok(Self {
            path: path.to_path_buf(),
            map,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn read_u8(&self, addr: u64) -> Option<u8> {
        usize::try_from(addr)
            .ok()
            .and_then(|i| self.map.get(i).copied())
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) -> bool {
        match usize::try_from(addr).ok().and_then(|i| self.map.get_mut(i)) {
            Some(cell) => {
                *cell = value;
                true
            }
            None => false,
        }
    }

    /// True when the cell at `addr` is unprogrammed (or outside the device).
    pub fn is_erased_at(&self, addr: u64) -> bool {
        self.read_u8(addr).map_or(true, |b| b == ERASED)
    }

    /// Returns every cell to the erased state.
    pub fn erase(&mut self) {
        self.map.fill(ERASED);
        info!("Erased {} bytes of programmable flash", self.len());
    }

    /// Copies `data` to `base`. Nothing is written unless the whole chunk fits.
    pub fn apply_chunk(&mut self, base: u64, data: &[u8]) -> BoardResult<()> {
        let capacity = self.len();
        let out_of_range = BoardError::OutOfRange {
            base,
            len: data.len(),
            capacity,
        };
        let end = match base.checked_add(data.len() as u64) {
            Some(end) if end <= capacity as u64 => end as usize,
            _ => return Err(out_of_range),
        };
        self.map[base as usize..end].copy_from_slice(data);
        Ok(())
    }

    /// Unmaps the image. Dirty pages are handed to the OS for writeback
    /// without waiting on it.
    pub fn close(self) -> BoardResult<()> {
        self.map.flush_async().map_err(|e| {
            BoardError::resource(format!("Unable to cleanly close flash {:?}", self.path), e)
        })?;
        debug!("Closed flash image {:?}", self.path);
        Ok(())
    }
}

impl std::fmt::Debug for FlashImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashImage")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}

/// Reserves real blocks up to `len` where the filesystem supports it, so the
/// mapping cannot fault on a full disk later. Falls back to a sparse grow.
#[cfg(target_os = "linux")]
fn preallocate(file: &File, len: u64) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let len = libc::off_t::try_from(len)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) };
    match rc {
        0 => Ok(()),
        libc::EOPNOTSUPP | libc::EINVAL => file.set_len(len as u64),
        errno => Err(std::io::Error::from_raw_os_error(errno)),
    }
}

#[cfg(not(target_os = "linux"))]
fn preallocate(file: &File, len: u64) -> std::io::Result<()> {
    file.set_len(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEN: usize = 0x20000;

    #[test]
    fn test_fresh_image_is_erased() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pflash.dat");

        let flash = FlashImage::open_or_create(&path, LEN).unwrap();
        assert_eq!(flash.len(), LEN);
        assert!(flash.as_slice().iter().all(|&b| b == ERASED));
        flash.close().unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), LEN);
        assert!(on_disk.iter().all(|&b| b == ERASED));
    }

    #[test]
    fn test_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c/pflash.dat");

        let flash = FlashImage::open_or_create(&path, 4096).unwrap();
        assert_eq!(flash.path(), path.as_path());
        assert!(path.exists());
    }

    #[test]
    fn test_reopen_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pflash.dat");

        let mut flash = FlashImage::open_or_create(&path, LEN).unwrap();
        assert!(flash.write_u8(0x10, 0x42));
        assert!(flash.write_u8(LEN as u64 - 1, 0x24));
        assert!(!flash.write_u8(LEN as u64, 0x00));
        flash.close().unwrap();

        let flash = FlashImage::open_or_create(&path, LEN).unwrap();
        assert_eq!(flash.read_u8(0x10), Some(0x42));
        assert_eq!(flash.read_u8(LEN as u64 - 1), Some(0x24));
        assert_eq!(flash.read_u8(LEN as u64), None);
        assert!(flash.is_erased_at(0x11));
    }

    #[test]
    fn test_smaller_reopen_never_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pflash.dat");

        let mut flash = FlashImage::open_or_create(&path, 8192).unwrap();
        flash.write_u8(100, 0x11);
        flash.write_u8(8000, 0x22);
        flash.close().unwrap();

        let small = FlashImage::open_or_create(&path, 4096).unwrap();
        assert_eq!(small.len(), 4096);
        assert_eq!(small.read_u8(100), Some(0x11));
        small.close().unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 8192);
        assert_eq!(on_disk[100], 0x11);
        assert_eq!(on_disk[8000], 0x22);
    }

    #[test]
    fn test_grow_erases_only_new_extent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pflash.dat");
        std::fs::write(&path, [0u8; 16]).unwrap();

        let flash = FlashImage::open_or_create(&path, 64).unwrap();
        assert!(flash.as_slice()[..16].iter().all(|&b| b == 0));
        assert!(flash.as_slice()[16..].iter().all(|&b| b == ERASED));
    }

    #[test]
    fn test_erase_resets_every_cell() {
        let dir = tempfile::tempdir().unwrap();
        let mut flash = FlashImage::open_or_create(dir.path().join("f.dat"), 1024).unwrap();
        flash.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
        flash.erase();
        assert!(flash.as_slice().iter().all(|&b| b == ERASED));
    }

    #[test]
    fn test_apply_chunk_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let mut flash = FlashImage::open_or_create(dir.path().join("f.dat"), 1024).unwrap();

        // Exact fit at the end
        flash.apply_chunk(1022, &[0xAA, 0xBB]).unwrap();
        assert_eq!(&flash.as_slice()[1022..], &[0xAA, 0xBB]);

        // One byte past the end writes nothing
        let err = flash.apply_chunk(1021, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(
            err,
            BoardError::OutOfRange {
                base: 1021,
                len: 4,
                capacity: 1024
            }
        ));
        assert_eq!(flash.read_u8(1021), Some(ERASED));
        assert_eq!(flash.read_u8(1022), Some(0xAA));

        // Address overflow is out of range, not a panic
        assert!(flash.apply_chunk(u64::MAX, &[1]).is_err());
    }

    #[test]
    fn test_zero_length_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = FlashImage::open_or_create(dir.path().join("f.dat"), 0).unwrap_err();
        assert!(matches!(err, BoardError::Config(_)));
    }

    #[test]
    fn test_unwritable_location_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let err = FlashImage::open_or_create(blocker.join("pflash.dat"), 64).unwrap_err();
        assert!(matches!(err, BoardError::Resource { .. }));
    }
}
