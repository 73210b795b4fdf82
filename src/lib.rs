pub mod metric;
pub mod runtime;
pub mod sampler;
