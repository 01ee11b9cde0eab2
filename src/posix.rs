//! POSIX-shaped entry points
//!
//! The signatures an interposition layer forwards `open`/`read`/`write`/`close`
//! to: `-1` on failure with the reason left in a per-thread errno.

use std::cell::Cell;

use crate::error::VfsError;
use crate::fd::Fd;
use crate::vfs::Vfs;

thread_local! {
    static LAST_ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// errno left by the last failed call on this thread
pub fn last_errno() -> i32 {
    LAST_ERRNO.with(Cell::get)
}

fn set_errno(error: &VfsError) {
    LAST_ERRNO.with(|errno| errno.set(error.errno()));
}

/// `open(path, flags)`: a descriptor, or `-1`
pub fn open(vfs: &Vfs, path: &str, flags: i32) -> Fd {
    match vfs.open(path, flags) {
        Ok(fd) => fd,
        Err(e) => {
            set_errno(&e);
            -1
        }
    }
}

/// `read(fd, buf, count)`: bytes copied, or `-1`
pub fn read(vfs: &Vfs, fd: Fd, buf: &mut [u8]) -> isize {
    match vfs.read(fd, buf) {
        Ok(n) => n as isize,
        Err(e) => {
            set_errno(&e);
            -1
        }
    }
}

/// `write(fd, buf, count)`: bytes written, or `-1`
pub fn write(vfs: &Vfs, fd: Fd, buf: &[u8]) -> isize {
    match vfs.write(fd, buf) {
        Ok(n) => n as isize,
        Err(e) => {
            set_errno(&e);
            -1
        }
    }
}

/// `close(fd)`: `0`, or `-1`
pub fn close(vfs: &Vfs, fd: Fd) -> i32 {
    match vfs.close(fd) {
        Ok(()) => 0,
        Err(e) => {
            set_errno(&e);
            -1
        }
    }
}
