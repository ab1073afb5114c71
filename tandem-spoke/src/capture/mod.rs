//! Capture resource boundary.
//!
//! Sensor pipelines live outside this crate. They plug into the recorder
//! through [`CaptureResource`]: the recorder calls `prepare` for every
//! resource when a recording starts and `finish` when it stops, and turns
//! the outcome into the state machine's readiness signals.

mod sampled;

pub use sampled::{SampledStream, ScalarSource, SyntheticGsr, DEFAULT_RING_CAPACITY};

use async_trait::async_trait;
use std::path::Path;

use crate::error::CaptureError;

/// One local capture pipeline (camera, thermal imager, GSR sensor...).
#[async_trait]
pub trait CaptureResource: Send {
    /// Short name used in logs and as the data subdirectory.
    fn name(&self) -> &str;

    /// Open the resource and start writing into `session_dir`.
    async fn prepare(&mut self, session_dir: &Path) -> Result<(), CaptureError>;

    /// Flush and close the resource.
    ///
    /// Called for every resource whose `prepare` succeeded, even if a later
    /// resource failed to open.
    async fn finish(&mut self) -> Result<(), CaptureError>;
}
