use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use smartstring::alias::{String as SmartString};

use serde_derive::Serialize;

mod orderedvec;

pub use orderedvec::OrderedVec;

/// Transformation applied to successive raw samples of a metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Derive {
	/// Emit the raw value as sampled.
	None,
	/// Emit the difference to the previous raw value.
	Delta,
	/// Emit the difference to the previous raw value per second.
	Rate,
}

impl Derive {
	fn as_str(&self) -> &'static str {
		match self {
			Self::None => "none",
			Self::Delta => "delta",
			Self::Rate => "rate",
		}
	}

	/// Whether this mode needs the previous raw value to produce output.
	pub fn is_stateful(&self) -> bool {
		!matches!(self, Self::None)
	}

	fn derive_one(&self, current: f64, previous: Option<f64>, elapsed: Option<Duration>) -> Option<f64> {
		match self {
			Self::None => Some(current),
			Self::Delta => previous.map(|prev| current - prev),
			Self::Rate => {
				let prev = previous?;
				let secs = elapsed?.as_secs_f64();
				if secs <= 0. {
					return None;
				}
				Some((current - prev) / secs)
			},
		}
	}

	/// Derive the output value for one tick.
	///
	/// `previous` is the raw reading of the previous tick (if any) and
	/// `elapsed` the time between the two ticks. Instances which did not
	/// exist in the previous reading yield `None` for stateful modes.
	pub fn apply(&self, current: &Reading, previous: Option<&Reading>, elapsed: Option<Duration>) -> Value {
		match current {
			Reading::Scalar(v) => {
				let prev = match previous {
					Some(Reading::Scalar(p)) => Some(*p),
					_ => None,
				};
				Value::Scalar(self.derive_one(*v, prev, elapsed))
			},
			Reading::Instances(values) => {
				let prev = match previous {
					Some(Reading::Instances(p)) => Some(p),
					_ => None,
				};
				Value::Instances(values.map_values(|instance, v| {
					let p = prev.and_then(|p| p.get(instance)).copied();
					self.derive_one(*v, p, elapsed)
				}))
			},
		}
	}
}

impl Default for Derive {
	fn default() -> Self {
		Self::None
	}
}

impl FromStr for Derive {
	type Err = &'static str;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"none" => Ok(Self::None),
			"delta" => Ok(Self::Delta),
			"rate" => Ok(Self::Rate),
			_ => Err("unknown derivation mode"),
		}
	}
}

impl fmt::Display for Derive {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Raw numbers as returned by a sampler backend.
#[derive(Clone, Debug, PartialEq)]
pub enum Reading {
	Scalar(f64),
	Instances(OrderedVec<SmartString, f64>),
}

/// One metric's entry in a batch.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
	Scalar(Option<f64>),
	Instances(OrderedVec<SmartString, Option<f64>>),
}

/// Everything sampled during one tick, in the order the metrics were
/// requested.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Batch {
	pub timestamp: DateTime<Utc>,
	pub values: Vec<Value>,
}
