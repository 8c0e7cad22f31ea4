//! Linux character-device adapter
//!
//! Talks to the kernel driver over a `/dev/npu*` node. Command codes are
//! private to this module; everything above it speaks [`DeviceCommand`].

use std::os::unix::io::RawFd;
use std::path::Path;

use tracing::debug;

use super::{DeviceCommand, DriverAdapter, IoStatus};
use crate::error::{Error, Result};
use crate::tensor::DataPtr;

/// ioctl magic shared with the kernel driver
const IOCTL_MAGIC: u64 = 0xD1;

fn request_code(cmd: DeviceCommand) -> u64 {
    (IOCTL_MAGIC << 8) | cmd as u64
}

/// One open device node
pub struct CharDevice {
    fd: RawFd,
    path: String,
}

impl CharDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let cpath = std::ffi::CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| Error::invalid_argument("device path contains NUL"))?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(Error::DeviceIo(format!(
                "open {} failed: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }
        debug!(path = %path.display(), fd, "device node opened");
        Ok(Self {
            fd,
            path: path.display().to_string(),
        })
    }
}

impl DriverAdapter for CharDevice {
    fn ioctl(&self, cmd: DeviceCommand, data: &mut [u8], sub_cmd: u32) -> Result<IoStatus> {
        let ptr = if data.is_empty() {
            std::ptr::null_mut()
        } else {
            data.as_mut_ptr() as *mut libc::c_void
        };
        let ret = unsafe {
            libc::ioctl(
                self.fd,
                request_code(cmd) as libc::c_ulong,
                ptr,
                sub_cmd as libc::c_ulong,
            )
        };
        if ret == 0 {
            return Ok(IoStatus::Done);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EBUSY) {
            return Ok(IoStatus::Busy);
        }
        Err(Error::DeviceIo(format!(
            "{}: ioctl {:?} failed: {}",
            self.path, cmd, err
        )))
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let n = unsafe { libc::write(self.fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if n as usize != bytes.len() {
            return Err(Error::DeviceIo(format!(
                "{}: short write: {}",
                self.path,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn read(&self, out: &mut [u8]) -> Result<usize> {
        let n = unsafe { libc::read(self.fd, out.as_mut_ptr() as *mut libc::c_void, out.len()) };
        if n < 0 {
            return Err(Error::DeviceIo(format!(
                "{}: read failed: {}",
                self.path,
                std::io::Error::last_os_error()
            )));
        }
        Ok(n as usize)
    }

    fn poll(&self) -> Result<()> {
        let mut fds = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut fds, 1, -1) };
        if ret < 0 {
            return Err(Error::DeviceIo(format!(
                "{}: poll failed: {}",
                self.path,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn mmap(&self, offset: u64, size: usize) -> Option<DataPtr> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            debug!(path = %self.path, "device DRAM mmap unavailable; using read/write commands");
            return None;
        }
        Some(DataPtr(ptr as *mut u8))
    }
}

impl Drop for CharDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
