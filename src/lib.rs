pub mod backend;
mod config;
mod debounce;
mod error;
mod gpio;
mod kernel;
mod pins;
mod poller;
mod registry;
pub mod retry;
mod routes;
mod wait;

pub use backend::{GpioBackend, MockGpioBackend, MockOp, SysfsBackend};
pub use config::{AppConfig, Direction, EdgeDetect, HttpConfig, Pull};
pub use debounce::Debouncer;
pub use error::AppError;
pub use gpio::{EdgeEvent, EventCallbackHandler, EventHandler, GpioManager};
pub use pins::{BoardRevision, NumberingMode, PinResolver};
pub use poller::PollerState;
pub use registry::ChannelSnapshot;
pub use retry::{Clock, RetryPolicy, SystemClock};
pub use routes::{AppState, api_scope};
