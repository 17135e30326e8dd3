pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

use anyhow::{anyhow, Result};

use crate::config::DetectorSettings;
use crate::detect::backend::Detector;

pub use stub::StubDetector;

#[cfg(feature = "backend-tract")]
pub use tract::TractDetector;

/// Build the detector named by `settings.backend`.
pub fn build_detector(settings: &DetectorSettings) -> Result<Box<dyn Detector>> {
    let mut detector: Box<dyn Detector> = match settings.backend.as_str() {
        "stub" => Box::new(StubDetector::new()),
        #[cfg(feature = "backend-tract")]
        "tract" => {
            let model_path = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("detector backend 'tract' requires a model_path"))?;
            Box::new(
                TractDetector::new(model_path, settings.input_width, settings.input_height)?
                    .with_threshold(settings.confidence),
            )
        }
        other => return Err(anyhow!("detector backend '{}' is not available", other)),
    };
    detector.warm_up()?;
    Ok(detector)
}
