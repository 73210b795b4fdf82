use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use serde_json::Value;

use smartstring::alias::{String as SmartString};

use crate::metric::{Derive, Reading};
use crate::sampler::{InstanceSet, Registry, SamplerId, SamplerSet};

use super::error::ChannelError;

/// One entry of the `metrics` option.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricRequest {
	pub name: SmartString,
	pub units: Option<SmartString>,
	pub derive: Derive,
}

fn optional_string<'x>(obj: &'x serde_json::Map<String, Value>, key: &str) -> Result<Option<&'x str>, ()> {
	match obj.get(key) {
		None | Some(Value::Null) => Ok(None),
		Some(Value::String(s)) => Ok(Some(s.as_str())),
		Some(_) => Err(()),
	}
}

impl MetricRequest {
	/// Validate the shape of a single `metrics` entry.
	pub fn from_json(index: usize, node: &Value) -> Result<Self, ChannelError> {
		let obj = match node {
			Value::Object(obj) => obj,
			_ => return Err(ChannelError::InvalidMetricDescriptor{index}),
		};
		let name = match optional_string(obj, "name") {
			Ok(Some(name)) if !name.is_empty() => name,
			_ => return Err(ChannelError::InvalidMetricDescriptor{index}),
		};
		let units = match optional_string(obj, "units") {
			Ok(v) => v.map(|u| u.into()),
			Err(()) => return Err(ChannelError::InvalidField{index, field: "units"}),
		};
		let derive = match optional_string(obj, "derive") {
			Ok(None) => Derive::default(),
			Ok(Some(s)) => match s.parse::<Derive>() {
				Ok(v) => v,
				Err(_) => return Err(ChannelError::InvalidField{index, field: "derive"}),
			},
			Err(()) => return Err(ChannelError::InvalidField{index, field: "derive"}),
		};
		Ok(Self{
			name: name.into(),
			units,
			derive,
		})
	}
}

/// A validated metric, ready for sampling.
#[derive(Clone, Debug)]
pub struct ResolvedMetric {
	pub name: SmartString,
	pub sampler: SamplerId,
	pub derive: Derive,
	pub units: Option<SmartString>,
	pub has_instance_domain: bool,
	pub instances: InstanceSet,
	previous: Option<Reading>,
}

impl ResolvedMetric {
	/// Turn this tick's raw reading into the emitted value.
	///
	/// `elapsed` is the time since the previous tick, `None` on the first.
	pub fn derive(&mut self, current: Reading, elapsed: Option<Duration>) -> crate::metric::Value {
		let value = self.derive.apply(&current, self.previous.as_ref(), elapsed);
		if self.derive.is_stateful() {
			self.previous = Some(current);
		}
		value
	}
}

/// What a single tick asks of the backends.
#[derive(Clone, Debug)]
pub struct Request {
	pub sampler: SamplerId,
	pub metric: SmartString,
	pub instances: InstanceSet,
}

/// The compiled form of the `metrics` option.
#[derive(Clone, Debug, Default)]
pub struct Plan {
	pub metrics: Vec<ResolvedMetric>,
	pub samplers: SamplerSet,
}

impl Plan {
	/// Snapshot the per-tick requests, in metric order.
	pub fn requests(&self) -> Arc<[Request]> {
		self.metrics.iter().map(|m| Request{
			sampler: m.sampler,
			metric: m.name.clone(),
			instances: m.instances.clone(),
		}).collect::<Vec<_>>().into()
	}
}

/// Resolve a validated request against the registry.
pub fn resolve(request: MetricRequest, registry: &Registry) -> Result<ResolvedMetric, ChannelError> {
	let capability = match registry.lookup(&request.name) {
		Some(v) => v,
		None => return Err(ChannelError::UnknownMetric{name: request.name}),
	};
	Ok(ResolvedMetric{
		name: request.name,
		sampler: capability.sampler,
		derive: request.derive,
		units: request.units,
		has_instance_domain: capability.has_instance_domain,
		instances: InstanceSet::All,
		previous: None,
	})
}

/// Compile the `metrics` option into a plan.
///
/// Entries are checked in order and the first bad one aborts; the plan
/// keeps the request order, which is the order of values in each batch.
pub fn compile(channel: &str, nodes: &[Value], registry: &Registry) -> Result<Plan, ChannelError> {
	let mut plan = Plan{
		metrics: Vec::with_capacity(nodes.len()),
		samplers: SamplerSet::new(),
	};
	for (index, node) in nodes.iter().enumerate() {
		let request = match MetricRequest::from_json(index, node) {
			Ok(v) => v,
			Err(e) => {
				warn!("{}: {}", channel, e);
				return Err(e);
			},
		};
		let resolved = match resolve(request, registry) {
			Ok(v) => v,
			Err(e) => {
				warn!("{}: {}", channel, e);
				return Err(e);
			},
		};
		debug!("{}: metric {} resolved to sampler {} (derive {})", channel, resolved.name, resolved.sampler, resolved.derive);
		plan.samplers.insert(resolved.sampler);
		plan.metrics.push(resolved);
	}
	Ok(plan)
}
