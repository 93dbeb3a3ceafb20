mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{MotionBackend, ScriptStep, ScriptedBackend, StubBackend};
pub use registry::{BackendFactory, BackendRegistry};
pub use result::{Detection, DetectionFilter, ObjectClass};
