use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::debug;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};

use super::{GpioBackend, ReadinessSet, ValueStream};
use crate::config::{Direction, EdgeDetect};

const SYSFS_EVENT_BUFFER_CAPACITY: usize = 16;
const WAKE_TOKEN: u64 = u64::MAX;

/// GPIO access through the legacy `/sys/class/gpio` ABI.
pub struct SysfsBackend {
    root: PathBuf,
}

impl SysfsBackend {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pin_dir(&self, gpio: u32) -> PathBuf {
        self.root.join(format!("gpio{gpio}"))
    }

    fn write_control(&self, path: &Path, contents: &str) -> io::Result<()> {
        debug!("write {} <- {contents}", path.display());
        fs::write(path, contents)
    }
}

impl GpioBackend for SysfsBackend {
    type Stream = SysfsValueStream;
    type Readiness = EpollReadinessSet;

    fn is_exported(&self, gpio: u32) -> bool {
        self.pin_dir(gpio).exists()
    }

    fn export(&self, gpio: u32) -> io::Result<()> {
        self.write_control(&self.root.join("export"), &gpio.to_string())
    }

    fn unexport(&self, gpio: u32) -> io::Result<()> {
        self.write_control(&self.root.join("unexport"), &gpio.to_string())
    }

    fn write_direction(&self, gpio: u32, direction: Direction) -> io::Result<()> {
        self.write_control(&self.pin_dir(gpio).join("direction"), direction.as_sysfs())
    }

    fn write_edge(&self, gpio: u32, edge: EdgeDetect) -> io::Result<()> {
        self.write_control(&self.pin_dir(gpio).join("edge"), edge.as_sysfs())
    }

    fn open_value(&self, gpio: u32) -> io::Result<SysfsValueStream> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(self.pin_dir(gpio).join("value"))?;
        Ok(SysfsValueStream { file })
    }

    fn readiness_set(&self) -> io::Result<EpollReadinessSet> {
        EpollReadinessSet::new()
    }
}

pub struct SysfsValueStream {
    file: File,
}

impl ValueStream for SysfsValueStream {
    fn read_value(&mut self) -> io::Result<u8> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 2];
        let n = self.file.read(&mut buf)?;
        match buf[..n].first() {
            Some(b'0') => Ok(0),
            Some(b'1') => Ok(1),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected contents in gpio value file",
            )),
        }
    }
}

/// epoll set watching value files for `POLLPRI`, with an eventfd to break
/// out of a blocking wait.
pub struct EpollReadinessSet {
    epoll: Epoll,
    wake: EventFd,
}

impl EpollReadinessSet {
    pub fn new() -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let wake = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        epoll.add(&wake, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))?;
        Ok(Self { epoll, wake })
    }

    fn drain_wake(&self) {
        // nonblocking, EAGAIN just means no pending wake
        let _ = self.wake.read();
    }
}

fn epoll_timeout(remaining: Duration) -> EpollTimeout {
    let mut ms = remaining.as_millis();
    if remaining.subsec_nanos() % 1_000_000 != 0 {
        ms += 1;
    }
    EpollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
}

impl ReadinessSet for EpollReadinessSet {
    type Stream = SysfsValueStream;

    fn add(&self, gpio: u32, stream: &SysfsValueStream) -> io::Result<()> {
        let flags = EpollFlags::EPOLLPRI | EpollFlags::EPOLLERR | EpollFlags::EPOLLET;
        self.epoll
            .add(&stream.file, EpollEvent::new(flags, u64::from(gpio)))?;
        Ok(())
    }

    fn remove(&self, _gpio: u32, stream: &SysfsValueStream) -> io::Result<()> {
        match self.epoll.delete(&stream.file) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<Vec<u32>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut events = [EpollEvent::empty(); SYSFS_EVENT_BUFFER_CAPACITY];

        loop {
            let epoll_timeout = match deadline {
                None => EpollTimeout::NONE,
                Some(deadline) => epoll_timeout(deadline.saturating_duration_since(Instant::now())),
            };
            let n = match self.epoll.wait(&mut events, epoll_timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };

            let mut ready = Vec::with_capacity(n);
            let mut woken = false;
            for event in &events[..n] {
                match event.data() {
                    WAKE_TOKEN => woken = true,
                    gpio => ready.push(gpio as u32),
                }
            }
            if woken {
                self.drain_wake();
            }
            if !ready.is_empty() || woken {
                return Ok(ready);
            }
            // epoll timeouts are capped, keep going until the caller's deadline
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return Ok(ready),
                _ => continue,
            }
        }
    }

    fn wake(&self) -> io::Result<()> {
        self.wake.write(1)?;
        Ok(())
    }
}
