mod backend;
mod backends;
mod result;

pub use backend::{Acceleration, Detector};
#[cfg(feature = "backend-tract")]
pub use backends::TractDetector;
pub use backends::{build_detector, StubDetector};
pub use result::{select_people, BBox, Detection, PERSON_CLASS_ID};
