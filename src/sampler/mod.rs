use std::error::Error;
use std::fmt;
use std::io;
use std::time::Duration;

use smartstring::alias::{String as SmartString};

use crate::metric::Reading;

mod registry;
pub mod memory;
pub mod cpu;

pub use registry::{Backend, Registry, RegisterError, builtin};

/// Handle of a backend inside a [`Registry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerId(u8);

impl SamplerId {
	pub const MAX: usize = 32;

	pub(crate) fn new(index: usize) -> Option<Self> {
		if index < Self::MAX {
			Some(Self(index as u8))
		} else {
			None
		}
	}

	pub fn index(&self) -> usize {
		self.0 as usize
	}
}

impl fmt::Display for SamplerId {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// Set of backends a channel has to poll on each tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SamplerSet(u32);

impl SamplerSet {
	pub fn new() -> Self {
		Self(0)
	}

	pub fn insert(&mut self, id: SamplerId) {
		self.0 |= 1 << id.0;
	}

	pub fn contains(&self, id: SamplerId) -> bool {
		self.0 & (1 << id.0) != 0
	}

	pub fn is_empty(&self) -> bool {
		self.0 == 0
	}

	pub fn iter(&self) -> impl Iterator<Item = SamplerId> + '_ {
		(0..SamplerId::MAX as u8).map(SamplerId).filter(move |id| self.contains(*id))
	}
}

/// A metric as declared by a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricInfo {
	pub name: SmartString,
	pub has_instance_domain: bool,
}

impl MetricInfo {
	pub fn scalar(name: &str) -> Self {
		Self{name: name.into(), has_instance_domain: false}
	}

	pub fn with_instances(name: &str) -> Self {
		Self{name: name.into(), has_instance_domain: true}
	}
}

/// Registry entry: which backend provides a metric.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capability {
	pub name: SmartString,
	pub sampler: SamplerId,
	pub has_instance_domain: bool,
}

/// Which instances of a multi-instance metric to sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceSet {
	/// Whatever the domain contains at sampling time.
	All,
	/// Exactly these instances (may be empty).
	Only(Vec<SmartString>),
	/// Whatever the domain contains, except these.
	Except(Vec<SmartString>),
}

impl InstanceSet {
	pub fn contains(&self, instance: &str) -> bool {
		match self {
			Self::All => true,
			Self::Only(names) => names.iter().any(|n| **n == *instance),
			Self::Except(names) => !names.iter().any(|n| **n == *instance),
		}
	}

	/// Expand against a concrete domain listing, keeping domain order.
	pub fn materialize(&self, domain: &[SmartString]) -> Vec<SmartString> {
		domain.iter().filter(|name| self.contains(name)).cloned().collect()
	}
}

#[derive(Debug)]
pub enum SampleError {
	BackendUnavailable(io::Error),
	InvalidHandle(SmartString),
	Timeout(Duration),
}

impl fmt::Display for SampleError {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::BackendUnavailable(e) => write!(f, "backend unavailable: {}", e),
			Self::InvalidHandle(metric) => write!(f, "backend does not provide metric {:?}", metric),
			Self::Timeout(limit) => write!(f, "backend did not answer within {:?}", limit),
		}
	}
}

impl Error for SampleError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			Self::BackendUnavailable(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for SampleError {
	fn from(other: io::Error) -> Self {
		Self::BackendUnavailable(other)
	}
}

/// A sampling backend.
///
/// A backend provides a fixed set of metrics. On each tick the channel
/// calls `refresh` once and then `sample` for every metric it wants from
/// this backend; the registry guarantees those calls are not interleaved
/// with another channel's.
pub trait Sampler: Send {
	fn name(&self) -> &str;

	fn metrics(&self) -> Vec<MetricInfo>;

	/// Take a fresh snapshot of the backend's data.
	fn refresh(&mut self) -> Result<(), SampleError>;

	/// List the current instance domain of a metric, in domain order.
	///
	/// Metrics without an instance domain return an empty list.
	fn list_instances(&mut self, metric: &str) -> Result<Vec<SmartString>, SampleError>;

	/// Read a metric from the last snapshot.
	fn sample(&mut self, metric: &str, instances: &InstanceSet) -> Result<Reading, SampleError>;
}
