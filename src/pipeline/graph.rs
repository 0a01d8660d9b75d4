// SPDX-License-Identifier: MPL-2.0

//! Media graph capability interface
//!
//! The pipeline engine never touches the native media library directly. It
//! drives a [`MediaGraph`] by stage name: stages are built outside the graph
//! (floating), added, linked, moved between states, and receive control
//! signals. The native backend lives in `gst.rs`, and an in-process
//! implementation lives in `simulated.rs`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::GraphError;

pub type GraphResult<T> = Result<T, GraphError>;

/// Names of the stages the engine builds
pub mod names {
    pub const PIPELINE: &str = "main-pipeline";
    pub const CAPTURE: &str = "video-source";
    pub const FAN_OUT: &str = "subpipes_tee";
    pub const RECORDING: &str = "recording-branch";
    pub const EGRESS: &str = "rtp-branch";
}

/// Video framerate as a fraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framerate {
    pub numerator: i32,
    pub denominator: i32,
}

impl Framerate {
    pub const fn new(numerator: i32, denominator: i32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }
}

impl fmt::Display for Framerate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Called by the segmenting sink whenever it opens fragment `index`.
/// Returning `None` leaves the sink on its default location.
pub type FragmentLocator = Box<dyn FnMut(u32) -> Option<PathBuf> + Send + 'static>;

/// What a stage does
pub enum StageKind {
    /// Camera source, raw caps, H.264 encoder and parser output caps
    Capture {
        width: u32,
        height: u32,
        framerate: Framerate,
        /// Overrides the source element factory
        source: Option<String>,
    },
    /// Duplicates the encoded stream to every linked branch
    FanOut,
    /// Queue, parser and time-segmented MP4 sink
    Recording {
        segment_duration: Duration,
        locator: FragmentLocator,
    },
    /// RTP payloader feeding a multi-destination UDP sink
    Egress,
}

impl StageKind {
    pub fn label(&self) -> &'static str {
        match self {
            StageKind::Capture { .. } => "capture",
            StageKind::FanOut => "fan-out",
            StageKind::Recording { .. } => "recording",
            StageKind::Egress => "egress",
        }
    }
}

/// A named stage blueprint handed to [`MediaGraph::build_stage`]
pub struct StageSpec {
    pub name: String,
    pub kind: StageKind,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn egress() -> Self {
        Self::new(names::EGRESS, StageKind::Egress)
    }
}

impl fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSpec")
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .finish()
    }
}

/// Graph and stage states, in transition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GraphState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl GraphState {
    pub fn name(&self) -> &'static str {
        match self {
            GraphState::Null => "NULL",
            GraphState::Ready => "READY",
            GraphState::Paused => "PAUSED",
            GraphState::Playing => "PLAYING",
        }
    }
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receiver of a state change or control signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Graph,
    Stage(&'a str),
}

impl fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Graph => f.write_str(names::PIPELINE),
            Target::Stage(name) => f.write_str(name),
        }
    }
}

/// Runtime controls understood by the stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// Add a UDP destination to the egress sink
    AddDestination { host: String, port: u16 },
    /// Remove one occurrence of a UDP destination
    RemoveDestination { host: String, port: u16 },
    /// Close the current recording fragment after the next keyframe
    SplitAfter,
    /// Inject end-of-stream so sinks can finalize
    EndOfStream,
}

impl ControlSignal {
    pub fn name(&self) -> &'static str {
        match self {
            ControlSignal::AddDestination { .. } => "add",
            ControlSignal::RemoveDestination { .. } => "remove",
            ControlSignal::SplitAfter => "split-after",
            ControlSignal::EndOfStream => "eos",
        }
    }
}

/// Message popped from the graph's event bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    Info {
        source: String,
        message: String,
        debug: Option<String>,
    },
    Warning {
        source: String,
        message: String,
        debug: Option<String>,
    },
    Error {
        source: String,
        message: String,
        debug: Option<String>,
    },
    EndOfStream,
    StateChanged {
        source: String,
        old: GraphState,
        new: GraphState,
        top_level: bool,
    },
}

/// Current and pending state of one element, used for debug listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub name: String,
    pub current: GraphState,
    pub pending: Option<GraphState>,
}

/// Operations the pipeline engine needs from a media graph library
///
/// Implementations are driven from a single thread at a time (the engine sits
/// behind a mutex) but must be movable between threads.
pub trait MediaGraph: Send {
    // ===== Stage lifecycle =====

    /// Build a stage outside of the graph. It has no parent until added.
    fn build_stage(&mut self, spec: StageSpec) -> GraphResult<()>;

    /// Whether a stage with this name exists, floating or added
    fn has_stage(&self, name: &str) -> bool;

    /// Whether the stage currently belongs to the graph
    fn has_parent(&self, name: &str) -> bool;

    /// Move a floating stage into the graph
    fn add_stage(&mut self, name: &str) -> GraphResult<()>;

    /// Take a stage out of the graph; it becomes floating again
    fn remove_stage(&mut self, name: &str) -> GraphResult<()>;

    /// Free a floating stage
    fn release_stage(&mut self, name: &str) -> GraphResult<()>;

    /// Drop every stage and start from an empty graph
    fn reset(&mut self) -> GraphResult<()>;

    // ===== Topology =====

    fn link(&mut self, upstream: &str, downstream: &str) -> GraphResult<()>;

    /// Unlink two stages, releasing any per-branch output requested on the upstream side
    fn unlink(&mut self, upstream: &str, downstream: &str) -> GraphResult<()>;

    // ===== State =====

    fn set_state(&mut self, target: Target<'_>, state: GraphState) -> GraphResult<()>;

    /// Bring a stage to the state of the graph that contains it
    fn sync_state_with_parent(&mut self, name: &str) -> GraphResult<()>;

    /// Settled state of the whole graph, waiting at most `timeout`
    fn query_state(&self, timeout: Duration) -> GraphResult<GraphState>;

    // ===== Control and events =====

    fn emit_control_signal(&mut self, target: Target<'_>, signal: ControlSignal)
    -> GraphResult<()>;

    /// Next bus event, waiting at most `timeout`
    fn pop_event(&mut self, timeout: Duration) -> Option<GraphEvent>;

    // ===== Diagnostics =====

    /// Current and pending state of every element, recursively
    fn describe(&self) -> Vec<StageStatus>;

    /// Write a topology snapshot tagged with `name` (best effort)
    fn dump_diagnostic(&self, name: &str);
}
