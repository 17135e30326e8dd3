use anyhow::Result;

use crate::frame::Frame;

/// Compute backend a detector runs on.
///
/// This is the single acceleration flag exposed to the rest of the crate. It is reported
/// for diagnostics only; the pipeline's control flow is identical for every value.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acceleration {
    Cpu,
    Gpu,
}

impl std::fmt::Display for Acceleration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acceleration::Cpu => f.write_str("cpu"),
            Acceleration::Gpu => f.write_str("gpu"),
        }
    }
}

/// Object detector collaborator.
///
/// Implementations return every detection they produce; class filtering and the
/// per-frame cap are applied by the pipeline.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn acceleration(&self) -> Acceleration {
        Acceleration::Cpu
    }

    /// Run inference on a frame. Boxes are in frame pixel coordinates.
    fn infer(&mut self, frame: &Frame) -> Result<Vec<super::Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
