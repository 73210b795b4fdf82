use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_derive::Deserialize;

use crate::sampler::{self, Registry, RegisterError};

use super::channel::Settings;

#[derive(Debug)]
pub enum BuildError {
	Parse(toml::de::Error),
	Register(RegisterError),
	Invalid{what: &'static str, reason: String},
}

impl fmt::Display for BuildError {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Parse(e) => write!(f, "failed to parse config: {}", e),
			Self::Register(e) => write!(f, "failed to set up samplers: {}", e),
			Self::Invalid{what, reason} => write!(f, "invalid {}: {}", what, reason),
		}
	}
}

impl Error for BuildError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			Self::Parse(e) => Some(e),
			Self::Register(e) => Some(e),
			Self::Invalid{..} => None,
		}
	}
}

impl From<toml::de::Error> for BuildError {
	fn from(other: toml::de::Error) -> Self {
		Self::Parse(other)
	}
}

impl From<RegisterError> for BuildError {
	fn from(other: RegisterError) -> Self {
		Self::Register(other)
	}
}

fn default_queue_depth() -> usize {
	16
}

fn default_sample_timeout_ms() -> u64 {
	5000
}

/// Process-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	/// Where the builtin samplers read from; the real `/proc` if unset.
	#[serde(default)]
	pub proc_root: Option<PathBuf>,
	#[serde(default = "default_queue_depth")]
	pub queue_depth: usize,
	#[serde(default = "default_sample_timeout_ms")]
	pub sample_timeout_ms: u64,
}

impl Default for Config {
	fn default() -> Self {
		Self{
			proc_root: None,
			queue_depth: default_queue_depth(),
			sample_timeout_ms: default_sample_timeout_ms(),
		}
	}
}

impl Config {
	pub fn from_toml(s: &str) -> Result<Self, BuildError> {
		let config: Config = toml::from_str(s)?;
		config.check()?;
		Ok(config)
	}

	pub fn check(&self) -> Result<(), BuildError> {
		if self.queue_depth == 0 {
			return Err(BuildError::Invalid{what: "queue_depth", reason: "must be at least 1".into()});
		}
		if self.sample_timeout_ms == 0 {
			return Err(BuildError::Invalid{what: "sample_timeout_ms", reason: "must be at least 1".into()});
		}
		Ok(())
	}

	pub fn settings(&self) -> Settings {
		Settings{
			queue_depth: self.queue_depth,
			sample_timeout: Duration::from_millis(self.sample_timeout_ms),
		}
	}

	pub fn build_registry(&self) -> Result<Arc<Registry>, BuildError> {
		match self.proc_root.as_ref() {
			None => Ok(sampler::builtin()),
			Some(root) => Ok(Arc::new(Registry::with_proc_root(root)?)),
		}
	}
}
