pub mod command;
pub mod driver;
pub mod progress;

pub use command::{CommandSpec, DeviceBackend, FrameRange, OutputFormat, RenderParams};
pub use driver::{
    CancelToken, ProgressObservation, RenderDiagnostic, RenderDriver, TerminalOutcome,
};
pub use progress::{DiagnosticKind, ProgressMarker};
