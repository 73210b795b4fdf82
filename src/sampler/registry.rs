use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};

use lazy_static::lazy_static;

use smartstring::alias::{String as SmartString};

use super::{Capability, SampleError, Sampler, SamplerId};
use super::cpu::CpuSampler;
use super::memory::MemorySampler;

lazy_static! {
	static ref BUILTIN: Arc<Registry> = Arc::new(
		Registry::with_proc_root("/proc").expect("builtin samplers have distinct metric names")
	);
}

/// The process-wide registry of the samplers shipped with this crate.
pub fn builtin() -> Arc<Registry> {
	BUILTIN.clone()
}

#[derive(Debug)]
pub enum RegisterError {
	TooManyBackends,
	DuplicateMetric{name: SmartString, backend: SmartString},
}

impl fmt::Display for RegisterError {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::TooManyBackends => write!(f, "no more than {} sampler backends can be registered", SamplerId::MAX),
			Self::DuplicateMetric{name, backend} => write!(f, "metric {:?} of backend {:?} is already provided by another backend", name, backend),
		}
	}
}

impl Error for RegisterError {
}

/// A registered backend; the mutex serializes all reads from it.
pub struct Backend {
	name: SmartString,
	sampler: Mutex<Box<dyn Sampler>>,
}

impl Backend {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn lock(&self) -> Result<MutexGuard<'_, Box<dyn Sampler>>, SampleError> {
		match self.sampler.lock() {
			Ok(guard) => Ok(guard),
			Err(_) => Err(SampleError::BackendUnavailable(io::Error::new(
				io::ErrorKind::Other,
				format!("sampler {} was poisoned by an earlier panic", self.name),
			))),
		}
	}
}

/// Maps metric names to the backend providing them.
///
/// A registry is assembled once and then shared read-only (behind an
/// `Arc`) between all channels.
pub struct Registry {
	capabilities: HashMap<SmartString, Capability>,
	backends: Vec<Arc<Backend>>,
}

impl Registry {
	pub fn new() -> Self {
		Self{
			capabilities: HashMap::new(),
			backends: Vec::new(),
		}
	}

	/// Registry with the memory and CPU samplers reading from `root`.
	pub fn with_proc_root<P: AsRef<Path>>(root: P) -> Result<Self, RegisterError> {
		let root = root.as_ref();
		let mut result = Self::new();
		result.register(Box::new(MemorySampler::new(root.join("meminfo"))))?;
		result.register(Box::new(CpuSampler::new(root.join("stat"))))?;
		info!("registered builtin samplers reading from {:?}", root);
		Ok(result)
	}

	pub fn register(&mut self, sampler: Box<dyn Sampler>) -> Result<SamplerId, RegisterError> {
		let id = match SamplerId::new(self.backends.len()) {
			Some(id) => id,
			None => return Err(RegisterError::TooManyBackends),
		};
		let backend_name: SmartString = sampler.name().into();
		let metrics = sampler.metrics();
		for metric in metrics.iter() {
			if self.capabilities.contains_key(&metric.name) {
				return Err(RegisterError::DuplicateMetric{
					name: metric.name.clone(),
					backend: backend_name,
				});
			}
		}
		for metric in metrics.into_iter() {
			debug!("metric {} provided by sampler {} ({})", metric.name, backend_name, id);
			self.capabilities.insert(metric.name.clone(), Capability{
				name: metric.name,
				sampler: id,
				has_instance_domain: metric.has_instance_domain,
			});
		}
		self.backends.push(Arc::new(Backend{
			name: backend_name,
			sampler: Mutex::new(sampler),
		}));
		Ok(id)
	}

	pub fn lookup(&self, name: &str) -> Option<&Capability> {
		self.capabilities.get(name)
	}

	pub fn backend(&self, id: SamplerId) -> Option<&Arc<Backend>> {
		self.backends.get(id.index())
	}

	/// All known metrics, sorted by name.
	pub fn capabilities(&self) -> Vec<&Capability> {
		let mut result: Vec<_> = self.capabilities.values().collect();
		result.sort_by(|a, b| a.name.cmp(&b.name));
		result
	}
}

impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}
