pub mod detector;
pub mod mask;

pub use detector::{MotionDetector, MotionParams};
