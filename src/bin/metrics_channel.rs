/*!
Open one metrics channel against the builtin samplers and print each batch
as a line of JSON on stdout.
*/
use std::path::PathBuf;

use env_logger;
use log::info;

use serde_json::{json, Value};

use structopt::StructOpt;

use internal_metrics::runtime::{self, Config, Event, Problem, State};

#[derive(StructOpt, Debug)]
#[structopt(name = "metrics-channel")]
struct Opt {
	/// TOML configuration file
	#[structopt(short, long, parse(from_os_str))]
	config: Option<PathBuf>,
	/// Metric to stream, as NAME or NAME:DERIVE (repeatable)
	#[structopt(short, long = "metric", number_of_values = 1)]
	metrics: Vec<String>,
	/// Sampling interval in milliseconds
	#[structopt(short, long)]
	interval: Option<i64>,
	/// Only sample these instances (repeatable)
	#[structopt(long = "instance", number_of_values = 1)]
	instances: Vec<String>,
	/// Do not sample these instances (repeatable)
	#[structopt(long = "omit-instance", number_of_values = 1)]
	omit_instances: Vec<String>,
	/// Raw JSON options; replaces all of the flags above
	#[structopt(long)]
	options: Option<String>,
	/// Close the channel after this many batches
	#[structopt(short = "n", long)]
	count: Option<u64>,
	/// List the available metrics and exit
	#[structopt(long)]
	list: bool,
}

fn metric_descriptor(arg: &str) -> Value {
	match arg.split_once(':') {
		Some((name, derive)) => json!({"name": name, "derive": derive}),
		None => json!({"name": arg}),
	}
}

impl Opt {
	fn channel_options(&self) -> Result<Value, serde_json::Error> {
		if let Some(raw) = self.options.as_ref() {
			return serde_json::from_str(raw);
		}
		let mut options = json!({
			"metrics": self.metrics.iter().map(|m| metric_descriptor(m)).collect::<Vec<_>>(),
		});
		if let Some(interval) = self.interval {
			options["interval"] = json!(interval);
		}
		if !self.instances.is_empty() {
			options["instances"] = json!(self.instances);
		}
		if !self.omit_instances.is_empty() {
			options["omit-instances"] = json!(self.omit_instances);
		}
		Ok(options)
	}
}

fn close_result(problem: Option<Problem>) -> Result<(), Box<dyn std::error::Error>> {
	match problem {
		None => Ok(()),
		Some(problem) => Err(format!("channel closed: {}", problem).into()),
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	env_logger::init();
	let opt = Opt::from_args();

	let config = match opt.config.as_ref() {
		Some(path) => Config::from_toml(&std::fs::read_to_string(path)?)?,
		None => Config::default(),
	};
	let registry = config.build_registry()?;

	if opt.list {
		for capability in registry.capabilities() {
			let kind = if capability.has_instance_domain { "instances" } else { "scalar" };
			println!("{}\t{}", capability.name, kind);
		}
		return Ok(());
	}

	let options = opt.channel_options()?;
	let (handle, mut events) = runtime::open("metrics1", options, registry, config.settings());
	let mut emitted = 0u64;
	loop {
		let event = tokio::select! {
			ev = events.recv() => ev,
			_ = tokio::signal::ctrl_c() => {
				info!("interrupted, closing channel");
				handle.close();
				continue;
			},
		};
		match event {
			Some(Event::Ready) => info!("channel {} is ready", handle.name()),
			Some(Event::Batch(batch)) => {
				println!("{}", serde_json::to_string(&batch)?);
				emitted += 1;
				if opt.count.map(|n| emitted >= n).unwrap_or(false) {
					handle.close();
				}
			},
			Some(Event::Closed(problem)) => return close_result(problem),
			// stream ended without a Closed event; the state has the reason
			None => return match handle.state() {
				State::Closed(problem) => close_result(problem),
				_ => close_result(Some(Problem::InternalError)),
			},
		}
	}
}
