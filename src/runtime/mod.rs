//! Metrics channels: option validation, sampling plan and the tick loop.

mod channel;
mod compiler;
mod config;
mod error;
mod instances;
mod metronome;
mod options;

pub use channel::{open, prepare, sample_blocking, ChannelHandle, Event, Settings, State};
pub use compiler::{compile, resolve, MetricRequest, Plan, Request, ResolvedMetric};
pub use config::{BuildError, Config};
pub use error::{ChannelError, Problem};
pub use instances::select as select_instances;
pub use metronome::Metronome;
pub use options::{ChannelConfig, DEFAULT_INTERVAL_MS, MAX_INTERVAL_MS};
