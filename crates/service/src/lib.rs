pub mod service;

pub use service::{load_results, write_results, Pipeline, PipelineBuilder};
