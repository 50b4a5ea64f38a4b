use std::io;
use std::time::Duration;

use crate::config::{Direction, EdgeDetect};

pub mod mock;
pub mod sysfs;

pub use mock::{MockGpioBackend, MockOp};
pub use sysfs::SysfsBackend;

/// Raw kernel GPIO operations, one attempt each. Retry and rollback live in
/// [`crate::kernel::Kernel`].
pub trait GpioBackend: Send + Sync + 'static {
    type Stream: ValueStream;
    type Readiness: ReadinessSet<Stream = Self::Stream>;

    fn is_exported(&self, gpio: u32) -> bool;
    fn export(&self, gpio: u32) -> io::Result<()>;
    fn unexport(&self, gpio: u32) -> io::Result<()>;
    fn write_direction(&self, gpio: u32, direction: Direction) -> io::Result<()>;
    fn write_edge(&self, gpio: u32, edge: EdgeDetect) -> io::Result<()>;
    fn open_value(&self, gpio: u32) -> io::Result<Self::Stream>;
    fn readiness_set(&self) -> io::Result<Self::Readiness>;
}

/// An open pin value file that can be re-read after every notification.
pub trait ValueStream: Send + 'static {
    fn read_value(&mut self) -> io::Result<u8>;
}

/// A set of value streams waited on together.
pub trait ReadinessSet: Send + Sync + 'static {
    type Stream;

    fn add(&self, gpio: u32, stream: &Self::Stream) -> io::Result<()>;
    fn remove(&self, gpio: u32, stream: &Self::Stream) -> io::Result<()>;

    /// Blocks until members are ready, [`ReadinessSet::wake`] is called, or
    /// the timeout passes. `None` blocks indefinitely; an empty result means
    /// woken or timed out.
    fn wait(&self, timeout: Option<Duration>) -> io::Result<Vec<u32>>;

    /// Interrupts a current or the next `wait`.
    fn wake(&self) -> io::Result<()>;
}
