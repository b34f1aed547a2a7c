/// Named failure conditions raised by a concrete [`crate::midi_engine::MidiEngine`]
/// during setup. Scheduling-time problems (dropped notes, channel
/// exhaustion) are not represented here -- they are warn-and-continue by
/// design, not `Result`-carrying errors. See the crate's top-level docs for
/// the split.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no MIDI output ports are available on this system")]
    NoOutputPorts,

    #[error("no MIDI output port matching {0:?} was found")]
    PortNotFound(String),

    #[error("failed to connect to MIDI output port: {0}")]
    ConnectFailed(String),
}
