// BoardLink - Emulated Board Host Bridge
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::ffi::{CStr, OsStr};
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::ptr;

/// Master side of a raw-mode pseudoterminal pair.
///
/// The secondary side is closed right after setup so that nothing is queued
/// for a peer that has not attached yet; the master reports hangup until one
/// opens [`Pty::secondary_path`].
#[derive(Debug)]
pub struct Pty {
    master: File,
    secondary_path: PathBuf,
}

impl Pty {
    pub fn open() -> io::Result<Self> {
        let mut master: libc::c_int = -1;
        let mut secondary: libc::c_int = -1;
        let rc = unsafe {
            libc::openpty(
                &mut master,
                &mut secondary,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // Owned from here on so every early return closes both ends.
        let master = unsafe { OwnedFd::from_raw_fd(master) };
        let secondary = unsafe { OwnedFd::from_raw_fd(secondary) };

        let secondary_path = tty_name(secondary.as_raw_fd())?;
        make_raw(master.as_raw_fd())?;
        make_raw(secondary.as_raw_fd())?;
        set_fd_flags(master.as_raw_fd())?;
        drop(secondary);

        Ok(Self {
            master: File::from(master),
            secondary_path,
        })
    }

    /// Wraps an arbitrary descriptor so the worker loop can be driven without
    /// a real terminal.
    #[cfg(test)]
    pub(crate) fn from_file(master: File, secondary_path: PathBuf) -> Self {
        Self {
            master,
            secondary_path,
        }
    }

    /// Device node of the user-facing side, e.g. `/dev/pts/7`.
    pub fn secondary_path(&self) -> &std::path::Path {
        &self.secondary_path
    }

    pub fn file(&self) -> &File {
        &self.master
    }
}

impl AsRawFd for Pty {
    fn as_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

fn tty_name(fd: RawFd) -> io::Result<PathBuf> {
    let mut buf = [0 as libc::c_char; 128];
    let rc = unsafe { libc::ttyname_r(fd, buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(PathBuf::from(OsStr::from_bytes(name.to_bytes())))
}

/// No line discipline processing: bytes pass through unchanged.
fn make_raw(fd: RawFd) -> io::Result<()> {
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut tio) } < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { libc::cfmakeraw(&mut tio) };
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Non-blocking, close-on-exec.
fn set_fd_flags(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
