//! Scan orchestration: dispatch loop, per-target gates and the control plane

pub mod dispatcher;
pub mod gate;
pub mod hybrid;
pub mod registry;

pub use dispatcher::{Checkpoint, DispatchOptions, DispatchOutcome, Dispatcher, ResumePlan};
pub use gate::{fingerprint_gate, Fingerprint, FingerprintGate, FingerprintSignal};
pub use hybrid::HybridScanner;
pub use registry::{Registration, RunningTasks};
