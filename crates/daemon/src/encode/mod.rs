//! Transcoder invocation: command building, stream inspection, process supervision

pub mod command;
pub mod probe;
pub mod supervisor;

pub use command::{CommandBuilder, EncoderBackend, TranscodeCommand};
pub use probe::{inspect_streams, parse_stream_layout, probe_streams, ProbeError, StreamLayout};
pub use supervisor::{ProcessSupervisor, RunOutcome, SupervisorError, TERMINATE_TIMEOUT};
