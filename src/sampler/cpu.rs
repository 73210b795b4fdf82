use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use log::trace;

use smartstring::alias::{String as SmartString};

use crate::metric::{OrderedVec, Reading};

use super::{InstanceSet, MetricInfo, SampleError, Sampler};

// USER_HZ is 100 on every Linux architecture we care about.
const MILLIS_PER_TICK: u64 = 10;

const FIELDS: &[&str] = &["user", "nice", "system", "iowait"];

/// Cumulative CPU time counters, in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuTimes {
	pub user: u64,
	pub nice: u64,
	pub system: u64,
	pub iowait: u64,
}

impl CpuTimes {
	fn parse_fields<'x, I: Iterator<Item = &'x str>>(fields: I) -> io::Result<Self> {
		let mut values = [0u64; 5];
		let mut n = 0;
		for (slot, field) in values.iter_mut().zip(fields) {
			*slot = match u64::from_str(field) {
				Ok(v) => v * MILLIS_PER_TICK,
				Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
			};
			n += 1;
		}
		if n < values.len() {
			return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated cpu line"));
		}
		// user nice system idle iowait
		Ok(Self{
			user: values[0],
			nice: values[1],
			system: values[2],
			iowait: values[4],
		})
	}

	fn get(&self, field: &str) -> Option<u64> {
		match field {
			"user" => Some(self.user),
			"nice" => Some(self.nice),
			"system" => Some(self.system),
			"iowait" => Some(self.iowait),
			_ => None,
		}
	}
}

/// Parsed cpu lines of `/proc/stat`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CpuStat {
	pub total: CpuTimes,
	/// Per-CPU counters in file order.
	pub cores: Vec<(SmartString, CpuTimes)>,
}

impl FromStr for CpuStat {
	type Err = io::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut result = CpuStat::default();
		let mut have_total = false;
		for line in s.lines() {
			let mut fields = line.split_whitespace();
			let label = match fields.next() {
				Some(v) if v.starts_with("cpu") => v,
				_ => continue,
			};
			let times = CpuTimes::parse_fields(fields)?;
			if label == "cpu" {
				result.total = times;
				have_total = true;
			} else {
				result.cores.push((label.into(), times));
			}
		}
		if !have_total {
			return Err(io::Error::new(io::ErrorKind::InvalidData, "stat without aggregate cpu line"));
		}
		Ok(result)
	}
}

enum Target<'x> {
	Basic(&'x str),
	Core(&'x str),
}

fn parse_metric(metric: &str) -> Option<Target<'_>> {
	if let Some(field) = metric.strip_prefix("cpu.basic.") {
		if FIELDS.iter().any(|f| *f == field) {
			return Some(Target::Basic(field));
		}
	} else if let Some(field) = metric.strip_prefix("cpu.core.") {
		if FIELDS.iter().any(|f| *f == field) {
			return Some(Target::Core(field));
		}
	}
	None
}

/// CPU time counters from a stat file.
///
/// `cpu.basic.*` are machine-wide, `cpu.core.*` are per CPU with the CPU
/// label (`cpu0`, `cpu1`, ...) as instance name. All of them are counters,
/// so consumers usually want `derive: "rate"`.
pub struct CpuSampler {
	path: PathBuf,
	current: Option<CpuStat>,
}

impl CpuSampler {
	pub fn new(path: PathBuf) -> Self {
		Self{path, current: None}
	}

	fn snapshot(&mut self) -> Result<&CpuStat, SampleError> {
		if self.current.is_none() {
			self.refresh()?;
		}
		match self.current.as_ref() {
			Some(v) => Ok(v),
			None => Err(io::Error::new(io::ErrorKind::Other, "no stat snapshot").into()),
		}
	}
}

impl Sampler for CpuSampler {
	fn name(&self) -> &str {
		"cpu"
	}

	fn metrics(&self) -> Vec<MetricInfo> {
		let mut result = Vec::with_capacity(FIELDS.len() * 2);
		for field in FIELDS.iter() {
			result.push(MetricInfo::scalar(&format!("cpu.basic.{}", field)));
		}
		for field in FIELDS.iter() {
			result.push(MetricInfo::with_instances(&format!("cpu.core.{}", field)));
		}
		result
	}

	fn refresh(&mut self) -> Result<(), SampleError> {
		let stat: CpuStat = fs::read_to_string(&self.path)?.parse()?;
		trace!("read {:?}: {} cores", self.path, stat.cores.len());
		self.current = Some(stat);
		Ok(())
	}

	fn list_instances(&mut self, metric: &str) -> Result<Vec<SmartString>, SampleError> {
		match parse_metric(metric) {
			Some(Target::Basic(_)) => Ok(Vec::new()),
			Some(Target::Core(_)) => {
				let stat = self.snapshot()?;
				Ok(stat.cores.iter().map(|(name, _)| name.clone()).collect())
			},
			None => Err(SampleError::InvalidHandle(metric.into())),
		}
	}

	fn sample(&mut self, metric: &str, instances: &InstanceSet) -> Result<Reading, SampleError> {
		let target = match parse_metric(metric) {
			Some(v) => v,
			None => return Err(SampleError::InvalidHandle(metric.into())),
		};
		let stat = self.snapshot()?;
		match target {
			Target::Basic(field) => match stat.total.get(field) {
				Some(v) => Ok(Reading::Scalar(v as f64)),
				None => Err(SampleError::InvalidHandle(metric.into())),
			},
			Target::Core(field) => {
				let mut values = OrderedVec::with_capacity(stat.cores.len());
				for (name, times) in stat.cores.iter() {
					if !instances.contains(name) {
						continue;
					}
					if let Some(v) = times.get(field) {
						values.insert(name.clone(), v as f64);
					}
				}
				Ok(Reading::Instances(values))
			},
		}
	}
}
