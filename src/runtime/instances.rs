use log::{debug, warn};

use smartstring::alias::{String as SmartString};

use crate::sampler::{InstanceSet, Registry, SampleError};

use super::compiler::Plan;
use super::error::ChannelError;

/// Effective instance set from a domain listing and the caller's lists.
///
/// A non-empty include list wins over the omit list. Names which are not
/// part of the domain are dropped; the returned set only refers to
/// instances which existed when it was built.
pub fn select(
		domain: &[SmartString],
		instances: Option<&[SmartString]>,
		omit_instances: Option<&[SmartString]>) -> InstanceSet
{
	let resolve = |names: &[SmartString]| -> Vec<SmartString> {
		let mut result = Vec::with_capacity(names.len());
		for name in names.iter() {
			if domain.contains(name) {
				if !result.contains(name) {
					result.push(name.clone());
				}
			} else {
				debug!("instance {:?} is not part of the domain, ignoring", name);
			}
		}
		result
	};

	match (instances, omit_instances) {
		(Some(names), _) if !names.is_empty() => {
			let wanted = resolve(names);
			// keep domain order
			InstanceSet::Only(domain.iter().filter(|d| wanted.contains(d)).cloned().collect())
		},
		(_, Some(names)) => InstanceSet::Except(resolve(names)),
		_ => InstanceSet::All,
	}
}

/// Apply the instance options to every multi-instance metric of the plan.
pub fn apply(
		channel: &str,
		plan: &mut Plan,
		registry: &Registry,
		instances: Option<&[SmartString]>,
		omit_instances: Option<&[SmartString]>) -> Result<(), ChannelError>
{
	let filtered = matches!(instances, Some(names) if !names.is_empty()) || omit_instances.is_some();
	if !filtered {
		return Ok(());
	}
	for metric in plan.metrics.iter_mut() {
		if !metric.has_instance_domain {
			continue;
		}
		let domain = match list_domain(registry, metric.sampler, &metric.name) {
			Ok(v) => v,
			Err(error) => {
				let e = ChannelError::InstanceDomain{metric: metric.name.clone(), error};
				warn!("{}: {}", channel, e);
				return Err(e);
			},
		};
		metric.instances = select(&domain, instances, omit_instances);
		debug!("{}: sampling {:?} of {}", channel, metric.instances, metric.name);
	}
	Ok(())
}

fn list_domain(registry: &Registry, sampler: crate::sampler::SamplerId, metric: &str) -> Result<Vec<SmartString>, SampleError> {
	let backend = match registry.backend(sampler) {
		Some(v) => v,
		None => return Err(SampleError::InvalidHandle(metric.into())),
	};
	let mut guard = backend.lock()?;
	guard.list_instances(metric)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	use crate::runtime::compiler;
	use crate::sampler::testutil::Scripted;

	fn names(vs: &[&str]) -> Vec<SmartString> {
		vs.iter().map(|v| (*v).into()).collect()
	}

	fn domains() -> Vec<Vec<SmartString>> {
		vec![names(&[]), names(&["cpu0"]), names(&["cpu0", "cpu1", "cpu2"])]
	}

	#[test]
	fn test_no_lists_selects_everything() {
		for domain in domains() {
			let set = select(&domain, None, None);
			assert_eq!(set, InstanceSet::All);
			assert_eq!(set.materialize(&domain), domain);
		}
	}

	#[test]
	fn test_include_list_is_intersection() {
		let wanted = names(&["cpu2", "cpu0", "cpu9"]);
		for domain in domains() {
			let set = select(&domain, Some(&wanted[..]), None);
			let effective = set.materialize(&domain);
			let expected: Vec<_> = domain.iter().filter(|d| wanted.contains(d)).cloned().collect();
			assert_eq!(effective, expected);
			for i in effective.iter() {
				assert!(domain.contains(i));
			}
		}
	}

	#[test]
	fn test_include_list_with_no_match_selects_nothing() {
		let domain = names(&["cpu0", "cpu1"]);
		let set = select(&domain, Some(&names(&["cpu7"])[..]), None);
		assert_eq!(set, InstanceSet::Only(Vec::new()));
		assert!(set.materialize(&domain).is_empty());
	}

	#[test]
	fn test_omit_list_is_difference() {
		let omit = names(&["cpu1", "cpu9"]);
		for domain in domains() {
			let set = select(&domain, None, Some(&omit[..]));
			let expected: Vec<_> = domain.iter().filter(|d| !omit.contains(d)).cloned().collect();
			assert_eq!(set.materialize(&domain), expected);
		}
	}

	#[test]
	fn test_unresolvable_omit_names_are_dropped() {
		let domain = names(&["cpu0"]);
		assert_eq!(select(&domain, None, Some(&names(&["cpu5"])[..])), InstanceSet::Except(Vec::new()));
	}

	#[test]
	fn test_include_beats_omit() {
		let domain = names(&["cpu0", "cpu1", "cpu2"]);
		let set = select(&domain, Some(&names(&["cpu1"])[..]), Some(&names(&["cpu1"])[..]));
		assert_eq!(set.materialize(&domain), names(&["cpu1"]));
	}

	#[test]
	fn test_empty_include_falls_back_to_omit() {
		let domain = names(&["cpu0", "cpu1"]);
		let set = select(&domain, Some(&[][..]), Some(&names(&["cpu0"])[..]));
		assert_eq!(set.materialize(&domain), names(&["cpu1"]));
	}

	#[test]
	fn test_apply_only_touches_multi_instance_metrics() {
		let mut registry = Registry::new();
		registry.register(Box::new(Scripted::new("s").scalar("one").multi("many", vec!["a", "b"]))).unwrap();
		let nodes = vec![json!({"name": "one"}), json!({"name": "many"})];
		let mut plan = compiler::compile("test", &nodes, &registry).unwrap();
		let include = names(&["b", "zzz"]);
		apply("test", &mut plan, &registry, Some(&include[..]), None).unwrap();
		assert_eq!(plan.metrics[0].instances, InstanceSet::All);
		assert_eq!(plan.metrics[1].instances, InstanceSet::Only(names(&["b"])));
	}

	#[test]
	fn test_apply_fails_when_domain_cannot_be_listed() {
		let mut registry = Registry::new();
		registry.register(Box::new(Scripted::new("s").multi("many", vec!["a"]))).unwrap();
		let nodes = vec![json!({"name": "many"})];
		let mut plan = compiler::compile("test", &nodes, &registry).unwrap();
		// point the metric at a name the backend does not know
		plan.metrics[0].name = "gone".into();
		match apply("test", &mut plan, &registry, None, Some(&names(&["a"])[..])) {
			Err(ChannelError::InstanceDomain{..}) => (),
			other => panic!("unexpected result {:?}", other),
		}
	}
}
