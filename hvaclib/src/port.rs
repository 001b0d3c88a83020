//! Serial port lifecycle for one IO board.
//!
//! Opens the device raw (8N1, hardware flow control, no input or output
//! processing) at 19,200 baud, holding a UUCP-style lock file under
//! `/var/lock` so two daemons cannot fight over one board. The original
//! termios settings are saved on open and restored on drop.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::termios::{
    BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices, Termios, cfsetispeed, cfsetospeed, tcflush, tcgetattr, tcsetattr,
    FlushArg,
};
use tracing::{debug, error};

use crate::error::SerialError;

/// Line speed of the IO board UART.
const BAUD_RATE: BaudRate = BaudRate::B19200;

/// Directory holding UUCP lock files.
const LOCK_DIR: &str = "/var/lock";

/// An open, locked, raw-configured serial device.
#[derive(Debug)]
pub struct SerialPort {
    file: File,
    device_path: PathBuf,
    lock_path: PathBuf,
    saved: Termios,
}

/// `/dev/<tty>` for a bare name, pass-through for an absolute path.
pub fn device_path(tty: &str) -> PathBuf {
    if tty.starts_with('/') {
        PathBuf::from(tty)
    } else {
        Path::new("/dev").join(tty)
    }
}

/// `/var/lock/LCK..<tty>` for the given device.
pub fn lock_file_path(tty: &str) -> PathBuf {
    let name = Path::new(tty)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| tty.to_string());
    Path::new(LOCK_DIR).join(format!("LCK..{name}"))
}

/// Reads the PID recorded in a lock file.
fn lock_file_pid(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let pid = contents.trim();
    if pid.is_empty() { None } else { Some(pid.to_string()) }
}

/// Whether `/proc/<pid>` exists.
fn process_alive(pid: &str) -> bool {
    Path::new("/proc").join(pid).exists()
}

/// Claims the lock file, clearing a stale one left by a dead process.
fn acquire_lock(lock_path: &Path, device: &str) -> Result<(), SerialError> {
    if lock_path.exists() {
        match lock_file_pid(lock_path) {
            Some(pid) if process_alive(&pid) => {
                return Err(SerialError::PortLocked {
                    device: device.to_string(),
                    pid,
                });
            }
            _ => {
                debug!(lock = %lock_path.display(), "clearing stale port lock");
                let _ = std::fs::remove_file(lock_path);
            }
        }
    }

    let mut file = File::create(lock_path).map_err(|e| SerialError::LockFile {
        path: lock_path.display().to_string(),
        source: e,
    })?;

    // Leading tab before the PID matches the uucp/minicom convention.
    writeln!(file, "\t{}", std::process::id()).map_err(|e| SerialError::LockFile {
        path: lock_path.display().to_string(),
        source: e,
    })?;

    Ok(())
}

fn open_raw(device_path: &Path, device: &str) -> Result<(File, Termios), SerialError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
        .open(device_path)
        .map_err(|e| SerialError::Open {
            device: device.to_string(),
            source: nix::Error::from_raw(e.raw_os_error().unwrap_or(0)),
        })?;

    let saved = tcgetattr(file.as_fd()).map_err(|e| SerialError::Attributes {
        device: device.to_string(),
        source: e,
    })?;

    let mut tio = saved.clone();
    cfsetispeed(&mut tio, BAUD_RATE).map_err(|e| SerialError::Attributes {
        device: device.to_string(),
        source: e,
    })?;
    cfsetospeed(&mut tio, BAUD_RATE).map_err(|e| SerialError::Attributes {
        device: device.to_string(),
        source: e,
    })?;

    // Receiver on, modem control lines ignored.
    tio.control_flags |= ControlFlags::CREAD | ControlFlags::CLOCAL;
    // 8N1.
    tio.control_flags &= !(ControlFlags::PARENB | ControlFlags::CSTOPB | ControlFlags::CSIZE);
    tio.control_flags |= ControlFlags::CS8;
    // Hardware flow control; the board blocks on RTS/CTS.
    tio.control_flags |= ControlFlags::CRTSCTS;
    // Raw input: no canonical mode, echo, or signals.
    tio.local_flags &=
        !(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ISIG);
    // No software flow control.
    tio.input_flags &= !(InputFlags::IXON | InputFlags::IXOFF | InputFlags::IXANY);
    // No input translation; the port must not turn 0x0D into 0x0A.
    tio.input_flags &= !(InputFlags::BRKINT
        | InputFlags::INLCR
        | InputFlags::ICRNL
        | InputFlags::IMAXBEL
        | InputFlags::IGNCR);
    tio.input_flags |= InputFlags::IGNBRK;
    // No output postprocessing.
    tio.output_flags &= !OutputFlags::OPOST;
    // No minimum character counts or read timeouts.
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    tcsetattr(file.as_fd(), SetArg::TCSANOW, &tio).map_err(|e| SerialError::Attributes {
        device: device.to_string(),
        source: e,
    })?;

    Ok((file, saved))
}

impl SerialPort {
    /// Locks and opens `tty` (bare name like `ttyS0` or an absolute path).
    ///
    /// # Errors
    ///
    /// [`SerialError::PortLocked`] when another live process holds the
    /// lock, [`SerialError::Open`]/[`SerialError::Attributes`] for device
    /// failures.
    pub fn open(tty: &str) -> Result<Self, SerialError> {
        let device_path = device_path(tty);
        let lock_path = lock_file_path(tty);

        acquire_lock(&lock_path, tty)?;

        match open_raw(&device_path, tty) {
            Ok((file, saved)) => Ok(Self {
                file,
                device_path,
                lock_path,
                saved,
            }),
            Err(e) => {
                let _ = std::fs::remove_file(&lock_path);
                Err(e)
            }
        }
    }

    /// The device path this port is bound to.
    pub fn device(&self) -> &Path {
        &self.device_path
    }

    /// Waits up to `timeout_ms` for the port to become readable.
    ///
    /// # Errors
    ///
    /// [`SerialError::Io`] when poll itself fails.
    pub fn wait_readable(&self, timeout_ms: u16) -> Result<bool, SerialError> {
        let mut fds = [PollFd::new(
            self.file.as_fd(),
            PollFlags::POLLIN | PollFlags::POLLPRI | PollFlags::POLLERR | PollFlags::POLLHUP,
        )];

        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(nix::Error::EINTR) => Ok(false),
            Err(e) => Err(SerialError::Io { source: e }),
        }
    }

    /// Non-blocking read into `buf`; returns 0 when nothing is pending.
    ///
    /// # Errors
    ///
    /// [`SerialError::Io`] for read failures other than empty.
    pub fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, SerialError> {
        match self.file.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(e) => Err(SerialError::Io {
                source: nix::Error::from_raw(e.raw_os_error().unwrap_or(0)),
            }),
        }
    }

    /// Writes the whole buffer, retrying partial writes with a bounded
    /// number of attempts (the port is non-blocking and a flow-controlled
    /// board can stall the line indefinitely).
    ///
    /// # Errors
    ///
    /// [`SerialError::Io`] on write failure, exhausted retries, or an
    /// abort mid-write; a partial board command is unusable either way.
    pub fn write_all_bounded(
        &mut self,
        bytes: &[u8],
        abort: &AtomicBool,
    ) -> Result<(), SerialError> {
        const ATTEMPTS: u32 = 100;

        let mut written = 0usize;
        let mut attempts = 0u32;

        while written < bytes.len() {
            if abort.load(Ordering::Relaxed) {
                error!("write loop aborted before writing full buffer");
                return Err(SerialError::Io {
                    source: nix::Error::ECANCELED,
                });
            }

            attempts += 1;
            if attempts > ATTEMPTS {
                error!("giving up on serial write; line stalled");
                return Err(SerialError::Io {
                    source: nix::Error::ETIMEDOUT,
                });
            }

            match self.file.write(&bytes[written..]) {
                Ok(n) => written += n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => {
                    return Err(SerialError::Io {
                        source: nix::Error::from_raw(e.raw_os_error().unwrap_or(0)),
                    });
                }
            }
        }

        Ok(())
    }

    /// Closes and reopens the device, keeping the lock file. Used when the
    /// board stops talking and needs a fresh line.
    ///
    /// # Errors
    ///
    /// [`SerialError`] when the reopen fails.
    pub fn reopen(&mut self) -> Result<(), SerialError> {
        let device = self.device_path.display().to_string();
        let _ = tcflush(self.file.as_fd(), FlushArg::TCIOFLUSH);
        let _ = tcsetattr(self.file.as_fd(), SetArg::TCSANOW, &self.saved);

        let (file, saved) = open_raw(&self.device_path, &device)?;
        self.file = file;
        self.saved = saved;
        Ok(())
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        let _ = tcflush(self.file.as_fd(), FlushArg::TCIOFLUSH);
        let _ = tcsetattr(self.file.as_fd(), SetArg::TCSANOW, &self.saved);
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_and_lock_naming() {
        assert_eq!(device_path("ttyS4"), PathBuf::from("/dev/ttyS4"));
        assert_eq!(device_path("/dev/ttyUSB0"), PathBuf::from("/dev/ttyUSB0"));
        assert_eq!(
            lock_file_path("ttyS4"),
            PathBuf::from("/var/lock/LCK..ttyS4")
        );
        assert_eq!(
            lock_file_path("/dev/ttyUSB0"),
            PathBuf::from("/var/lock/LCK..ttyUSB0")
        );
    }

    #[test]
    fn test_lock_pid_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LCK..ttyX");
        std::fs::write(&path, "\t12345\n").unwrap();
        assert_eq!(lock_file_pid(&path), Some("12345".to_string()));

        std::fs::write(&path, "").unwrap();
        assert_eq!(lock_file_pid(&path), None);
    }

    #[test]
    fn test_our_own_pid_is_alive() {
        assert!(process_alive(&std::process::id().to_string()));
        // A PID beyond the default pid_max cannot exist.
        assert!(!process_alive("99999999"));
    }

    #[test]
    fn test_stale_lock_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("LCK..ttyY");
        std::fs::write(&lock, "\t99999999\n").unwrap();

        acquire_lock(&lock, "ttyY").unwrap();
        let pid = lock_file_pid(&lock).unwrap();
        assert_eq!(pid, std::process::id().to_string());
    }

    #[test]
    fn test_live_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("LCK..ttyZ");
        std::fs::write(&lock, format!("\t{}\n", std::process::id())).unwrap();

        let err = acquire_lock(&lock, "ttyZ").unwrap_err();
        assert!(matches!(err, SerialError::PortLocked { .. }));
    }
}
