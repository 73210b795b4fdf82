use std::time::Duration;

use serde_json::{Map, Value};

use smartstring::alias::{String as SmartString};

use super::error::ChannelError;

pub const DEFAULT_INTERVAL_MS: i64 = 1000;
pub const MAX_INTERVAL_MS: i64 = i32::MAX as i64;

pub type Options = Map<String, Value>;

// A present-but-null option counts as absent everywhere.
fn present<'x>(options: &'x Options, key: &str) -> Option<&'x Value> {
	match options.get(key) {
		None | Some(Value::Null) => None,
		Some(v) => Some(v),
	}
}

fn invalid(option: &'static str, reason: &str) -> ChannelError {
	ChannelError::InvalidOption{option, reason: reason.into()}
}

pub fn as_object(options: &Value) -> Result<&Options, ChannelError> {
	match options {
		Value::Object(map) => Ok(map),
		_ => Err(invalid("options", "not an object")),
	}
}

pub fn get_string<'x>(options: &'x Options, key: &'static str) -> Result<Option<&'x str>, ChannelError> {
	match present(options, key) {
		None => Ok(None),
		Some(Value::String(s)) => Ok(Some(s.as_str())),
		Some(_) => Err(invalid(key, "not a string")),
	}
}

pub fn get_strv(options: &Options, key: &'static str) -> Result<Option<Vec<SmartString>>, ChannelError> {
	let items = match present(options, key) {
		None => return Ok(None),
		Some(Value::Array(items)) => items,
		Some(_) => return Err(invalid(key, "not an array of strings")),
	};
	let mut result = Vec::with_capacity(items.len());
	for item in items.iter() {
		match item {
			Value::String(s) => result.push(s.as_str().into()),
			_ => return Err(invalid(key, "not an array of strings")),
		}
	}
	Ok(Some(result))
}

pub fn get_array<'x>(options: &'x Options, key: &'static str) -> Result<&'x [Value], ChannelError> {
	match present(options, key) {
		None => Ok(&[][..]),
		Some(Value::Array(items)) => Ok(&items[..]),
		Some(_) => Err(invalid(key, "not an array")),
	}
}

pub fn get_int(options: &Options, key: &'static str, default: i64) -> Result<i64, ChannelError> {
	match present(options, key) {
		None => Ok(default),
		Some(Value::Number(n)) => match n.as_i64() {
			Some(v) => Ok(v),
			None => Err(invalid(key, &format!("{} is not a representable integer", n))),
		},
		Some(_) => Err(invalid(key, "not a number")),
	}
}

/// Validated channel-wide options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
	pub interval: Duration,
	pub instances: Option<Vec<SmartString>>,
	pub omit_instances: Option<Vec<SmartString>>,
}

impl Default for ChannelConfig {
	fn default() -> Self {
		Self{
			interval: Duration::from_millis(DEFAULT_INTERVAL_MS as u64),
			instances: None,
			omit_instances: None,
		}
	}
}

/// Check `source`: only the internal source (absent or empty) is served here.
pub fn check_source(options: &Options) -> Result<(), ChannelError> {
	match get_string(options, "source")? {
		None | Some("") => Ok(()),
		Some(other) => Err(ChannelError::NotSupported{source: other.into()}),
	}
}

pub fn parse_interval(options: &Options) -> Result<Duration, ChannelError> {
	let interval = get_int(options, "interval", DEFAULT_INTERVAL_MS)?;
	if interval <= 0 || interval > MAX_INTERVAL_MS {
		return Err(invalid("interval", &format!("{} is out of range", interval)));
	}
	Ok(Duration::from_millis(interval as u64))
}
