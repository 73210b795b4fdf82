use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use chrono::{DateTime, Utc};

use serde_json::Value;

use smartstring::alias::{String as SmartString};

use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::metric::{Batch, Reading};
use crate::sampler::{Registry, SampleError, SamplerSet};

use super::compiler::{self, Plan, Request};
use super::error::{ChannelError, Problem};
use super::instances;
use super::metronome::Metronome;
use super::options::{self, ChannelConfig};

/// Lifecycle of a channel. `Closed` is terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State {
	Created,
	Preparing,
	Ready,
	Streaming,
	Closed(Option<Problem>),
}

impl State {
	pub fn is_closed(&self) -> bool {
		matches!(self, Self::Closed(_))
	}
}

/// What the consumer of a channel receives.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
	Ready,
	Batch(Batch),
	Closed(Option<Problem>),
}

/// Knobs which are not part of the per-channel options.
#[derive(Clone, Debug)]
pub struct Settings {
	/// Depth of the event queue towards the consumer.
	pub queue_depth: usize,
	/// Upper bound for one tick's backend reads.
	pub sample_timeout: Duration,
}

impl Default for Settings {
	fn default() -> Self {
		Self{
			queue_depth: 16,
			sample_timeout: Duration::from_secs(5),
		}
	}
}

/// Control side of an open channel.
///
/// Dropping the handle closes the channel.
pub struct ChannelHandle {
	name: SmartString,
	close: watch::Sender<bool>,
	state: watch::Receiver<State>,
}

impl ChannelHandle {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn state(&self) -> State {
		self.state.borrow().clone()
	}

	/// Ask the channel to close. Closing twice does nothing.
	pub fn close(&self) {
		if *self.close.borrow() {
			return;
		}
		debug!("{}: close requested", self.name);
		// the channel task may already be gone, which is fine
		let _ = self.close.send(true);
	}

	/// Wait until the channel has reached `Closed` and return its reason.
	pub async fn closed(&mut self) -> Option<Problem> {
		loop {
			if let State::Closed(problem) = *self.state.borrow() {
				return problem;
			}
			if self.state.changed().await.is_err() {
				// task ended; the last published state is final
				return match *self.state.borrow() {
					State::Closed(problem) => problem,
					_ => Some(Problem::InternalError),
				};
			}
		}
	}
}

/// Validate the options and compile them into a sampling plan.
///
/// Checks happen in a fixed order: source, instance lists, metrics,
/// instance domains, interval. The first failure wins.
pub fn prepare(name: &str, options: &Value, registry: &Registry) -> Result<(ChannelConfig, Plan), ChannelError> {
	let options = options::as_object(options)?;
	options::check_source(options)?;
	let instances = options::get_strv(options, "instances")?;
	let omit_instances = options::get_strv(options, "omit-instances")?;
	let metrics = options::get_array(options, "metrics")?;
	let mut plan = compiler::compile(name, metrics, registry)?;
	instances::apply(
		name,
		&mut plan,
		registry,
		instances.as_deref(),
		omit_instances.as_deref(),
	)?;
	let interval = options::parse_interval(options)?;
	Ok((ChannelConfig{interval, instances, omit_instances}, plan))
}

/// Read one tick's worth of raw values. Blocking.
///
/// Every backend in `samplers` is locked once, refreshed and then asked
/// for all of its metrics, so another channel cannot interleave with it.
pub fn sample_blocking(registry: &Registry, samplers: SamplerSet, requests: &[Request]) -> Result<Vec<Reading>, SampleError> {
	let mut readings: Vec<Option<Reading>> = vec![None; requests.len()];
	for id in samplers.iter() {
		let backend = match registry.backend(id) {
			Some(v) => v,
			None => return Err(SampleError::InvalidHandle(format!("sampler {}", id).into())),
		};
		let mut sampler = backend.lock()?;
		sampler.refresh()?;
		for (slot, request) in readings.iter_mut().zip(requests.iter()) {
			if request.sampler == id {
				*slot = Some(sampler.sample(&request.metric, &request.instances)?);
			}
		}
	}
	let mut result = Vec::with_capacity(readings.len());
	for (reading, request) in readings.into_iter().zip(requests.iter()) {
		match reading {
			Some(v) => result.push(v),
			None => return Err(SampleError::InvalidHandle(request.metric.clone())),
		}
	}
	Ok(result)
}

/// Run blocking backend work with an upper bound on its duration.
async fn bounded<T, F>(limit: Duration, work: F) -> Result<T, SampleError>
	where
		T: Send + 'static,
		F: FnOnce() -> Result<T, SampleError> + Send + 'static
{
	match tokio::time::timeout(limit, tokio::task::spawn_blocking(work)).await {
		Err(_) => Err(SampleError::Timeout(limit)),
		Ok(Err(e)) => Err(SampleError::BackendUnavailable(io::Error::new(io::ErrorKind::Other, e.to_string()))),
		Ok(Ok(result)) => result,
	}
}

async fn wait_for_close(close: &mut watch::Receiver<bool>) {
	loop {
		if *close.borrow() {
			return;
		}
		// handle dropped counts as close
		if close.changed().await.is_err() {
			return;
		}
	}
}

/// Place a tick deadline on the wall clock, relative to `anchor`.
///
/// Batch timestamps are spaced exactly like the deadlines the rates are
/// computed from.
fn wall_clock(anchor: (Instant, DateTime<Utc>), at: Instant) -> DateTime<Utc> {
	match chrono::Duration::from_std(at.saturating_duration_since(anchor.0)) {
		Ok(offset) => anchor.1 + offset,
		Err(_) => Utc::now(),
	}
}

struct Channel {
	name: SmartString,
	registry: Arc<Registry>,
	settings: Settings,
	events: mpsc::Sender<Event>,
	close: watch::Receiver<bool>,
	state: watch::Sender<State>,
}

impl Channel {
	fn set_state(&self, state: State) {
		trace!("{}: state {:?}", self.name, state);
		// the handle may be gone; the task still runs to its end
		let _ = self.state.send(state);
	}

	fn close_requested(&self) -> bool {
		match self.close.has_changed() {
			Err(_) => true,
			Ok(_) => *self.close.borrow(),
		}
	}

	/// Hand an event to the consumer. Fails if the consumer is gone.
	///
	/// The last free slot of the queue is kept for the final `Closed`.
	fn deliver(&self, event: Event) -> Result<(), Problem> {
		let permit = match self.events.try_reserve() {
			Ok(v) => v,
			Err(mpsc::error::TrySendError::Full(())) => {
				warn!("{}: consumer too slow, dropping batch", self.name);
				return Ok(())
			},
			Err(mpsc::error::TrySendError::Closed(())) => {
				info!("{}: consumer went away", self.name);
				return Err(Problem::Disconnected)
			},
		};
		if self.events.capacity() == 0 {
			warn!("{}: consumer too slow, dropping batch", self.name);
			return Ok(())
		}
		permit.send(event);
		Ok(())
	}

	async fn finish(&self, problem: Option<Problem>) {
		match problem {
			Some(p) => info!("{}: closing: {}", self.name, p),
			None => debug!("{}: closing", self.name),
		}
		self.set_state(State::Closed(problem));
		let event = match self.events.try_send(Event::Closed(problem)) {
			Ok(()) => return,
			Err(mpsc::error::TrySendError::Closed(_)) => {
				debug!("{}: consumer gone, close not delivered", self.name);
				return
			},
			Err(mpsc::error::TrySendError::Full(event)) => event,
		};
		match tokio::time::timeout(self.settings.sample_timeout, self.events.send(event)).await {
			Ok(Ok(())) => (),
			_ => warn!("{}: close reason ({:?}) could not be delivered to the consumer", self.name, problem),
		}
	}

	async fn run(mut self, options: Value) {
		self.set_state(State::Preparing);
		let name = self.name.clone();
		let registry = self.registry.clone();
		let prepared = select! {
			r = bounded(self.settings.sample_timeout, move || {
				Ok(prepare(&name, &options, &registry))
			}) => r,
			_ = wait_for_close(&mut self.close) => {
				self.finish(None).await;
				return
			},
		};
		let (config, plan) = match prepared {
			Ok(Ok(v)) => v,
			Ok(Err(e)) => {
				warn!("{}: {}", self.name, e);
				self.finish(Some(e.problem())).await;
				return
			},
			Err(e) => {
				error!("{}: preparation did not complete: {}", self.name, e);
				self.finish(Some(Problem::ProtocolError)).await;
				return
			},
		};

		self.set_state(State::Ready);
		if let Err(p) = self.deliver(Event::Ready) {
			self.finish(Some(p)).await;
			return
		}
		info!("{}: streaming {} metric(s) every {:?}", self.name, plan.metrics.len(), config.interval);
		self.set_state(State::Streaming);
		let problem = self.stream(config, plan).await;
		self.finish(problem).await;
	}

	async fn stream(&mut self, config: ChannelConfig, mut plan: Plan) -> Option<Problem> {
		let mut metronome = Metronome::new(config.interval);
		let requests = plan.requests();
		let mut last_tick: Option<Instant> = None;
		let anchor = (Instant::now(), Utc::now());
		loop {
			let deadline = select! {
				at = metronome.tick() => at,
				_ = wait_for_close(&mut self.close) => return None,
				_ = self.events.closed() => {
					info!("{}: consumer went away", self.name);
					return Some(Problem::Disconnected)
				},
			};
			let timestamp = wall_clock(anchor, deadline);

			let registry = self.registry.clone();
			let samplers = plan.samplers;
			let tick_requests = requests.clone();
			let readings = select! {
				r = bounded(self.settings.sample_timeout, move || {
					sample_blocking(&registry, samplers, &tick_requests)
				}) => r,
				_ = wait_for_close(&mut self.close) => return None,
			};
			let readings = match readings {
				Ok(v) => v,
				Err(e) => {
					error!("{}: {}", self.name, ChannelError::Backend(e));
					return Some(Problem::InternalError);
				},
			};
			if self.close_requested() {
				return None;
			}

			let elapsed = last_tick.map(|prev| deadline - prev);
			last_tick = Some(deadline);
			let values = plan.metrics.iter_mut()
				.zip(readings.into_iter())
				.map(|(metric, reading)| metric.derive(reading, elapsed))
				.collect();
			if let Err(p) = self.deliver(Event::Batch(Batch{timestamp, values})) {
				return Some(p);
			}
			if metronome.skipped() > 0 {
				trace!("{}: {} tick(s) skipped so far", self.name, metronome.skipped());
			}
		}
	}
}

/// Open a channel and start preparing it in the background.
///
/// `options` is the options payload the consumer sent. The returned
/// receiver yields `Ready` once preparation succeeded, then one `Batch`
/// per tick, and finally `Closed`. Dropping the receiver is treated as the
/// consumer going away. Must be called from within a tokio runtime.
pub fn open(name: &str, options: Value, registry: Arc<Registry>, settings: Settings) -> (ChannelHandle, mpsc::Receiver<Event>) {
	// one extra slot for the final Closed
	let (events_tx, events_rx) = mpsc::channel(settings.queue_depth.max(1) + 1);
	let (close_tx, close_rx) = watch::channel(false);
	let (state_tx, state_rx) = watch::channel(State::Created);
	let channel = Channel{
		name: name.into(),
		registry,
		settings,
		events: events_tx,
		close: close_rx,
		state: state_tx,
	};
	tokio::spawn(async move {
		channel.run(options).await;
	});
	(
		ChannelHandle{
			name: name.into(),
			close: close_tx,
			state: state_rx,
		},
		events_rx,
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	use crate::metric::Value as MetricValue;
	use crate::sampler::testutil::Scripted;
	use crate::sampler::InstanceSet;

	fn registry() -> Arc<Registry> {
		let mut registry = Registry::new();
		registry.register(Box::new(Scripted::new("mem").scalar("memory.used").scalar("memory.free"))).unwrap();
		registry.register(Box::new(Scripted::new("cpu").multi("cpu.core.user", vec!["cpu0", "cpu1", "cpu2"]))).unwrap();
		Arc::new(registry)
	}

	fn counting_registry(step: f64, fail_after: Option<u32>) -> Arc<Registry> {
		let mut sampler = Scripted::new("counter").scalar("counter").step(step);
		if let Some(n) = fail_after {
			sampler = sampler.fail_after(n);
		}
		let mut registry = Registry::new();
		registry.register(Box::new(sampler)).unwrap();
		Arc::new(registry)
	}

	fn problem_of(options: Value) -> Option<Problem> {
		match prepare("test", &options, &registry()) {
			Ok(_) => None,
			Err(e) => Some(e.problem()),
		}
	}

	fn fast() -> Settings {
		Settings{queue_depth: 16, sample_timeout: Duration::from_secs(5)}
	}

	async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
		match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
			Ok(Some(ev)) => ev,
			Ok(None) => panic!("event stream ended"),
			Err(_) => panic!("no event within 10s"),
		}
	}

	async fn next_batch(rx: &mut mpsc::Receiver<Event>) -> Batch {
		match next_event(rx).await {
			Event::Batch(b) => b,
			other => panic!("expected batch, got {:?}", other),
		}
	}

	#[test]
	fn test_prepare_defaults() {
		let (config, plan) = prepare("test", &json!({"metrics": [{"name": "memory.used"}]}), &registry()).unwrap();
		assert_eq!(config.interval, Duration::from_millis(1000));
		assert_eq!(plan.metrics.len(), 1);
	}

	#[test]
	fn test_prepare_unknown_metric_is_protocol_error() {
		assert_eq!(
			problem_of(json!({"metrics": [{"name": "memory.used"}, {"name": "nope"}]})),
			Some(Problem::ProtocolError),
		);
	}

	#[test]
	fn test_prepare_bad_interval_is_protocol_error() {
		for bad in vec![json!(0), json!(-1), json!(i32::MAX as i64 + 1)] {
			assert_eq!(
				problem_of(json!({"metrics": [{"name": "memory.used"}], "interval": bad})),
				Some(Problem::ProtocolError),
			);
		}
		assert_eq!(problem_of(json!({"metrics": [{"name": "memory.used"}], "interval": 1000})), None);
	}

	#[test]
	fn test_prepare_source_is_not_supported() {
		// even with otherwise broken options, source is checked first
		assert_eq!(
			problem_of(json!({"source": "pcp-direct", "metrics": "broken", "interval": 0})),
			Some(Problem::NotSupported),
		);
		assert_eq!(problem_of(json!({"source": "", "metrics": []})), None);
	}

	#[test]
	fn test_prepare_bad_instance_lists() {
		assert_eq!(problem_of(json!({"instances": "cpu0"})), Some(Problem::ProtocolError));
		assert_eq!(problem_of(json!({"omit-instances": [1]})), Some(Problem::ProtocolError));
		assert_eq!(problem_of(json!({"metrics": {}})), Some(Problem::ProtocolError));
		assert_eq!(problem_of(json!(["not", "an", "object"])), Some(Problem::ProtocolError));
	}

	#[test]
	fn test_prepare_applies_instance_filter() {
		let (config, plan) = prepare("test", &json!({
			"metrics": [{"name": "cpu.core.user"}, {"name": "memory.used"}],
			"omit-instances": ["cpu1", "cpu5"],
		}), &registry()).unwrap();
		assert_eq!(config.omit_instances.as_ref().map(|v| v.len()), Some(2));
		assert_eq!(plan.metrics[0].instances, InstanceSet::Except(vec!["cpu1".into()]));
		assert_eq!(plan.metrics[1].instances, InstanceSet::All);
	}

	#[test]
	fn test_sample_blocking_in_metric_order() {
		let registry = registry();
		let (_, plan) = prepare("test", &json!({
			"metrics": [{"name": "cpu.core.user"}, {"name": "memory.used"}],
			"instances": ["cpu2"],
		}), &registry).unwrap();
		let readings = sample_blocking(&registry, plan.samplers, &plan.requests()).unwrap();
		assert_eq!(readings.len(), 2);
		match &readings[0] {
			Reading::Instances(v) => {
				assert_eq!(v.len(), 1);
				assert_eq!(v.get("cpu2"), Some(&2.));
			},
			other => panic!("unexpected reading {:?}", other),
		}
		assert_eq!(readings[1], Reading::Scalar(100.));
	}

	#[test]
	fn test_wall_clock_keeps_deadline_spacing() {
		let now = Instant::now();
		let start = Utc::now();
		let at = wall_clock((now, start), now + Duration::from_millis(1500));
		assert_eq!((at - start).num_milliseconds(), 1500);
		// deadlines before the anchor are clamped to it
		assert_eq!(wall_clock((now + Duration::from_secs(1), start), now), start);
	}

	#[tokio::test(start_paused = true)]
	async fn test_end_to_end_single_scalar() {
		let options = json!({"metrics": [{"name": "memory.used"}], "interval": 500});
		let (handle, mut rx) = open("e2e", options, registry(), fast());
		assert_eq!(next_event(&mut rx).await, Event::Ready);
		let mut stamps = Vec::new();
		for _ in 0..3 {
			let batch = next_batch(&mut rx).await;
			assert_eq!(batch.values, vec![MetricValue::Scalar(Some(100.))]);
			stamps.push(batch.timestamp);
		}
		for pair in stamps.windows(2) {
			assert_eq!((pair[1] - pair[0]).num_milliseconds(), 500);
		}
		assert_eq!(handle.state(), State::Streaming);
		handle.close();
		loop {
			match next_event(&mut rx).await {
				Event::Closed(problem) => {
					assert_eq!(problem, None);
					break;
				},
				Event::Batch(_) => (),
				Event::Ready => panic!("ready twice"),
			}
		}
		assert!(rx.recv().await.is_none());
	}

	#[tokio::test]
	async fn test_unknown_metric_never_ready() {
		let options = json!({"metrics": [{"name": "nope"}]});
		let (mut handle, mut rx) = open("bad", options, registry(), fast());
		assert_eq!(next_event(&mut rx).await, Event::Closed(Some(Problem::ProtocolError)));
		assert_eq!(handle.closed().await, Some(Problem::ProtocolError));
	}

	#[tokio::test]
	async fn test_source_closes_not_supported() {
		let options = json!({"source": "pcp-archive", "metrics": [{"name": "memory.used"}]});
		let (_handle, mut rx) = open("src", options, registry(), fast());
		assert_eq!(next_event(&mut rx).await, Event::Closed(Some(Problem::NotSupported)));
	}

	#[tokio::test(start_paused = true)]
	async fn test_rate_first_tick_is_none() {
		let options = json!({"metrics": [{"name": "counter", "derive": "rate"}, {"name": "counter"}], "interval": 50});
		let (handle, mut rx) = open("rate", options, counting_registry(10., None), fast());
		assert_eq!(next_event(&mut rx).await, Event::Ready);
		let first = next_batch(&mut rx).await;
		assert_eq!(first.values[0], MetricValue::Scalar(None));
		assert_eq!(first.values[1], MetricValue::Scalar(Some(100.)));
		for i in 1..4 {
			let batch = next_batch(&mut rx).await;
			// +10 per 50ms tick
			match batch.values[0] {
				MetricValue::Scalar(Some(rate)) => assert!((rate - 200.).abs() < 1e-9, "rate {}", rate),
				ref other => panic!("unexpected value {:?}", other),
			}
			assert_eq!(batch.values[1], MetricValue::Scalar(Some(100. + 10. * i as f64)));
			assert_eq!((batch.timestamp - first.timestamp).num_milliseconds(), 50 * i);
		}
		handle.close();
	}

	#[tokio::test]
	async fn test_backend_error_closes_internal_error() {
		let options = json!({"metrics": [{"name": "counter"}], "interval": 20});
		let (mut handle, mut rx) = open("fail", options, counting_registry(1., Some(2)), fast());
		assert_eq!(next_event(&mut rx).await, Event::Ready);
		next_batch(&mut rx).await;
		next_batch(&mut rx).await;
		assert_eq!(next_event(&mut rx).await, Event::Closed(Some(Problem::InternalError)));
		assert_eq!(handle.closed().await, Some(Problem::InternalError));
	}

	#[tokio::test]
	async fn test_close_reason_survives_full_queue() {
		let options = json!({"metrics": [{"name": "counter"}], "interval": 20});
		let settings = Settings{queue_depth: 1, sample_timeout: Duration::from_secs(5)};
		let (mut handle, mut rx) = open("full", options, counting_registry(1., Some(2)), settings);
		// nobody reads until the channel is done
		assert_eq!(handle.closed().await, Some(Problem::InternalError));
		let mut events = Vec::new();
		while let Some(ev) = rx.recv().await {
			events.push(ev);
		}
		assert_eq!(events.first(), Some(&Event::Ready));
		assert_eq!(events.last(), Some(&Event::Closed(Some(Problem::InternalError))));
		assert!(events[1..events.len() - 1].iter().all(|ev| matches!(ev, Event::Batch(_))));
	}

	#[tokio::test]
	async fn test_close_twice_is_noop() {
		let options = json!({"metrics": [{"name": "memory.used"}], "interval": 20});
		let (mut handle, mut rx) = open("twice", options, registry(), fast());
		assert_eq!(next_event(&mut rx).await, Event::Ready);
		handle.close();
		assert_eq!(handle.closed().await, None);
		handle.close();
		assert_eq!(handle.state(), State::Closed(None));
		let mut saw_closed = false;
		while let Some(ev) = rx.recv().await {
			match ev {
				Event::Closed(None) => {
					assert!(!saw_closed, "closed twice");
					saw_closed = true;
				},
				Event::Batch(_) => assert!(!saw_closed, "batch after close"),
				other => panic!("unexpected event {:?}", other),
			}
		}
		assert!(saw_closed);
	}

	#[tokio::test]
	async fn test_dropped_consumer_disconnects() {
		let options = json!({"metrics": [{"name": "memory.used"}], "interval": 20});
		let (mut handle, rx) = open("gone", options, registry(), fast());
		drop(rx);
		assert_eq!(handle.closed().await, Some(Problem::Disconnected));
	}

	#[tokio::test]
	async fn test_dropped_handle_closes() {
		let options = json!({"metrics": [{"name": "memory.used"}], "interval": 20});
		let (handle, mut rx) = open("orphan", options, registry(), fast());
		assert_eq!(next_event(&mut rx).await, Event::Ready);
		drop(handle);
		loop {
			match next_event(&mut rx).await {
				Event::Closed(problem) => {
					assert_eq!(problem, None);
					break;
				},
				_ => (),
			}
		}
	}
}
