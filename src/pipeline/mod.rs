pub mod controller;
pub mod distributor;
pub mod preflight;
pub mod queue;

pub use controller::{BackendFactory, Pipeline, PipelineBuilder};
pub use distributor::{encode_live_frame, FrameDistributor};
pub use preflight::{run_preflight, PreflightReport, PreflightStatus};
pub use queue::{FrameQueue, QueueStats};
