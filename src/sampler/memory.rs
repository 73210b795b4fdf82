use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use log::trace;

use smartstring::alias::{String as SmartString};

use crate::metric::Reading;

use super::{InstanceSet, MetricInfo, SampleError, Sampler};

const METRICS: &[&str] = &["memory.free", "memory.used", "memory.cached", "memory.swap-used"];

/// Parsed subset of `/proc/meminfo`, in bytes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemInfo {
	pub total: u64,
	pub free: u64,
	pub available: Option<u64>,
	pub buffers: u64,
	pub cached: u64,
	pub swap_total: u64,
	pub swap_free: u64,
}

impl MemInfo {
	pub fn used(&self) -> u64 {
		match self.available {
			Some(available) => self.total.saturating_sub(available),
			None => self.total
				.saturating_sub(self.free)
				.saturating_sub(self.buffers)
				.saturating_sub(self.cached),
		}
	}

	pub fn swap_used(&self) -> u64 {
		self.swap_total.saturating_sub(self.swap_free)
	}

	fn get(&self, metric: &str) -> Option<u64> {
		match metric {
			"memory.free" => Some(self.free),
			"memory.used" => Some(self.used()),
			"memory.cached" => Some(self.buffers + self.cached),
			"memory.swap-used" => Some(self.swap_used()),
			_ => None,
		}
	}
}

impl FromStr for MemInfo {
	type Err = io::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut result = MemInfo::default();
		let mut have_total = false;
		for line in s.lines() {
			let (key, rest) = match line.split_once(':') {
				Some(v) => v,
				None => continue,
			};
			let mut fields = rest.split_whitespace();
			let value = match fields.next().map(u64::from_str) {
				Some(Ok(v)) => v,
				Some(Err(e)) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
				None => continue,
			};
			let value = match fields.next() {
				Some("kB") => value * 1024,
				_ => value,
			};
			match key {
				"MemTotal" => {
					result.total = value;
					have_total = true;
				},
				"MemFree" => result.free = value,
				"MemAvailable" => result.available = Some(value),
				"Buffers" => result.buffers = value,
				"Cached" => result.cached = value,
				"SwapTotal" => result.swap_total = value,
				"SwapFree" => result.swap_free = value,
				_ => (),
			}
		}
		if !have_total {
			return Err(io::Error::new(io::ErrorKind::InvalidData, "meminfo without MemTotal"));
		}
		Ok(result)
	}
}

/// Memory usage from a meminfo file.
pub struct MemorySampler {
	path: PathBuf,
	current: Option<MemInfo>,
}

impl MemorySampler {
	pub fn new(path: PathBuf) -> Self {
		Self{path, current: None}
	}

	fn snapshot(&mut self) -> Result<&MemInfo, SampleError> {
		if self.current.is_none() {
			self.refresh()?;
		}
		match self.current.as_ref() {
			Some(v) => Ok(v),
			None => Err(io::Error::new(io::ErrorKind::Other, "no meminfo snapshot").into()),
		}
	}
}

impl Sampler for MemorySampler {
	fn name(&self) -> &str {
		"memory"
	}

	fn metrics(&self) -> Vec<MetricInfo> {
		METRICS.iter().map(|name| MetricInfo::scalar(name)).collect()
	}

	fn refresh(&mut self) -> Result<(), SampleError> {
		let info: MemInfo = fs::read_to_string(&self.path)?.parse()?;
		trace!("read {:?}: {:?}", self.path, info);
		self.current = Some(info);
		Ok(())
	}

	fn list_instances(&mut self, metric: &str) -> Result<Vec<SmartString>, SampleError> {
		if METRICS.iter().any(|m| *m == metric) {
			Ok(Vec::new())
		} else {
			Err(SampleError::InvalidHandle(metric.into()))
		}
	}

	fn sample(&mut self, metric: &str, _instances: &InstanceSet) -> Result<Reading, SampleError> {
		match self.snapshot()?.get(metric) {
			Some(v) => Ok(Reading::Scalar(v as f64)),
			None => Err(SampleError::InvalidHandle(metric.into())),
		}
	}
}
