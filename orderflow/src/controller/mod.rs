//! The pipeline controller: the only component that moves an order between
//! stages.

mod pipeline;

#[cfg(test)]
mod integration_tests;

pub use pipeline::PipelineController;
