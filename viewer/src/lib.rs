//! Control channel for an external waveform viewer (GTKWave) driven over
//! its stdio streams.

pub mod codec;
pub mod types;

pub(crate) mod channel;
pub(crate) mod events;
pub(crate) mod process;
pub(crate) mod protocol;
pub(crate) mod scheduler;

mod controller;
mod error;

pub use controller::ViewerController;
pub use error::{Result, ViewerError};
pub use events::{EventHandler, ViewerEvent};
pub use protocol::SELECT_EVENT;
pub use types::{SignalQuery, SignalValue, ViewerConfig, ViewerState};
