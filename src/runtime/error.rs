use std::error::Error;
use std::fmt;

use smartstring::alias::{String as SmartString};

use serde::ser::{Serialize, Serializer};

use crate::sampler::SampleError;

/// Reason code a channel closes with.
///
/// A normal close carries no problem at all (`None`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Problem {
	ProtocolError,
	NotSupported,
	InternalError,
	Disconnected,
}

impl Problem {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::ProtocolError => "protocol-error",
			Self::NotSupported => "not-supported",
			Self::InternalError => "internal-error",
			Self::Disconnected => "disconnected",
		}
	}
}

impl fmt::Display for Problem {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl Serialize for Problem {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

#[derive(Debug)]
pub enum ChannelError {
	/// A `metrics` entry is not an object or has no usable name.
	InvalidMetricDescriptor{index: usize},
	/// A `metrics` entry has a field of the wrong type or value.
	InvalidField{index: usize, field: &'static str},
	UnknownMetric{name: SmartString},
	/// A `source` other than the internal one was requested.
	NotSupported{source: String},
	/// Any other malformed option.
	InvalidOption{option: &'static str, reason: String},
	/// Listing an instance domain failed while preparing.
	InstanceDomain{metric: SmartString, error: SampleError},
	/// Sampling failed while streaming.
	Backend(SampleError),
}

impl ChannelError {
	pub fn problem(&self) -> Problem {
		match self {
			Self::NotSupported{..} => Problem::NotSupported,
			Self::Backend(_) => Problem::InternalError,
			_ => Problem::ProtocolError,
		}
	}
}

impl fmt::Display for ChannelError {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::InvalidMetricDescriptor{index} => write!(f, "invalid \"metrics\" option was specified (bad descriptor for metric {})", index),
			Self::InvalidField{index, field} => write!(f, "invalid {:?} field for metric {}", field, index),
			Self::UnknownMetric{name} => write!(f, "unknown internal metric {}", name),
			Self::NotSupported{source} => write!(f, "unsupported \"source\" option specified for metrics: {}", source),
			Self::InvalidOption{option, reason} => write!(f, "invalid {:?} option ({})", option, reason),
			Self::InstanceDomain{metric, error} => write!(f, "failed to list instances of {}: {}", metric, error),
			Self::Backend(e) => write!(f, "sampling failed: {}", e),
		}
	}
}

impl Error for ChannelError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			Self::InstanceDomain{error, ..} => Some(error),
			Self::Backend(e) => Some(e),
			_ => None,
		}
	}
}

impl From<SampleError> for ChannelError {
	fn from(other: SampleError) -> Self {
		Self::Backend(other)
	}
}
