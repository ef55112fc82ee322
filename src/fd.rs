//! File descriptor utilities.
//!
//! Non-blocking and close-on-exec switches in both their `ioctl` and
//! `fcntl` forms, and a close wrapper that treats an interrupted close as
//! complete. All of them retry on `EINTR` where the operation itself can
//! be interrupted.

use std::io;
use std::os::fd::RawFd;

/// Sets or clears non-blocking mode with a single `ioctl`.
pub fn nonblock(fd: RawFd, set: bool) -> io::Result<()> {
    let mut on: libc::c_int = set as libc::c_int;

    loop {
        let rc = unsafe { libc::ioctl(fd, libc::FIONBIO, &mut on) };
        if rc != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Sets or clears close-on-exec with a single `ioctl`.
pub fn cloexec(fd: RawFd, set: bool) -> io::Result<()> {
    let request = if set { libc::FIOCLEX } else { libc::FIONCLEX };

    loop {
        let rc = unsafe { libc::ioctl(fd, request) };
        if rc != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// `fcntl` variant of [`nonblock`]. Skips the set step when the flag
/// already has the requested value.
pub fn nonblock_fcntl(fd: RawFd, set: bool) -> io::Result<()> {
    let flags = fcntl_retry(fd, libc::F_GETFL, 0)?;

    if ((flags & libc::O_NONBLOCK) != 0) == set {
        return Ok(());
    }

    let flags = if set {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };

    fcntl_retry(fd, libc::F_SETFL, flags)?;
    Ok(())
}

/// `fcntl` variant of [`cloexec`]. Skips the set step when the flag
/// already has the requested value.
pub fn cloexec_fcntl(fd: RawFd, set: bool) -> io::Result<()> {
    let flags = fcntl_retry(fd, libc::F_GETFD, 0)?;

    if ((flags & libc::FD_CLOEXEC) != 0) == set {
        return Ok(());
    }

    let flags = if set {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };

    fcntl_retry(fd, libc::F_SETFD, flags)?;
    Ok(())
}

fn fcntl_retry(fd: RawFd, cmd: libc::c_int, arg: libc::c_int) -> io::Result<libc::c_int> {
    loop {
        let rc = unsafe { libc::fcntl(fd, cmd, arg) };
        if rc != -1 {
            return Ok(rc);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Closes a file descriptor.
///
/// `EINTR` and `EINPROGRESS` mean the close is underway and the
/// descriptor must not be retried, so both count as success.
pub fn close_fd(fd: RawFd) -> io::Result<()> {
    debug_assert!(fd >= 0);

    if unsafe { libc::close(fd) } == -1 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EINPROGRESS) => Ok(()),
            _ => Err(err),
        }
    } else {
        Ok(())
    }
}
