// SPDX-License-Identifier: MPL-2.0

//! Live media pipeline engine
//!
//! ```text
//! ┌─────────┐    ┌─────────────┐    ┌──────────────────────────────┐
//! │ capture │───▶│   fan-out   │───▶│ recording (time-split .mp4)  │
//! └─────────┘    │   (tee)     │    └──────────────────────────────┘
//!                │             │    ┌──────────────────────────────┐
//!                │             │───▶│ egress (RTP over UDP, N dst) │  attached on demand
//!                └─────────────┘    └──────────────────────────────┘
//! ```
//!
//! The capture, fan-out and recording stages live for the whole life of the
//! pipeline. The egress branch is attached when the first destination is
//! added and detached when the last one is removed.

pub mod graph;
#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod recording;
pub mod simulated;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::constants::timing::{EOS_TIMEOUT, SHUTDOWN_TIMEOUT, STATE_QUERY_TIMEOUT};
use crate::errors::{GraphError, PipelineError};
use crate::net::Endpoint;
use graph::{
    ControlSignal, GraphEvent, GraphState, MediaGraph, StageKind, StageSpec, Target, names,
};
use recording::RecordingStore;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Engine shared between the driver loop, the lease manager and request handlers
pub type SharedPipeline = Arc<Mutex<Pipeline>>;

/// Externally visible lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Unconstructed,
    Stopped,
    Paused,
    Playing,
}

impl From<GraphState> for PipelineState {
    fn from(state: GraphState) -> Self {
        match state {
            GraphState::Null | GraphState::Ready => PipelineState::Stopped,
            GraphState::Paused => PipelineState::Paused,
            GraphState::Playing => PipelineState::Playing,
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    graph: Box<dyn MediaGraph>,
    recording: Arc<Mutex<RecordingStore>>,
    constructed: bool,
    playing: bool,
    /// Multiset of destinations currently configured on the egress sink
    destinations: Vec<Endpoint>,
    /// Destinations left on the sink by a failed move, removed on the next mutation
    orphans: Vec<Endpoint>,
    /// Set after a failed rebuild: whether to resume playing once rebuilt
    pending_rebuild: Option<bool>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, graph: Box<dyn MediaGraph>) -> Self {
        let recording = Arc::new(Mutex::new(RecordingStore::new(&config)));
        Self {
            config,
            graph,
            recording,
            constructed: false,
            playing: false,
            destinations: Vec::new(),
            orphans: Vec::new(),
            pending_rebuild: None,
        }
    }

    pub fn into_shared(self) -> SharedPipeline {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_constructed(&self) -> bool {
        self.constructed
    }

    /// Playing flag maintained from top-level state change events
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn destinations(&self) -> &[Endpoint] {
        &self.destinations
    }

    /// Destinations still on the sink although no caller owns them
    pub fn orphans(&self) -> &[Endpoint] {
        &self.orphans
    }

    /// Whether a failed rebuild is waiting for the next `set_config`
    pub fn rebuild_pending(&self) -> bool {
        self.pending_rebuild.is_some()
    }

    pub fn recording_store(&self) -> Arc<Mutex<RecordingStore>> {
        Arc::clone(&self.recording)
    }

    fn ensure_constructed(&self, operation: &'static str) -> PipelineResult<()> {
        if self.constructed {
            Ok(())
        } else {
            error!(operation, "Pipeline is not constructed");
            Err(PipelineError::NotConstructed(operation))
        }
    }

    // ===== Lifecycle =====

    /// Build capture, fan-out and recording stages and move the graph to READY
    ///
    /// Idempotent once constructed. On failure the partial graph is torn down.
    pub fn construct(&mut self) -> PipelineResult<()> {
        if self.constructed {
            debug!("Pipeline already constructed");
            return Ok(());
        }

        info!(
            width = self.config.width,
            height = self.config.height,
            framerate = %self.config.framerate,
            source = ?self.config.video_source,
            segment_secs = self.config.segment_duration.as_secs(),
            "Constructing pipeline"
        );

        if let Err(e) = self.build_fixed_stages() {
            error!(error = %e, "Pipeline construction failed");
            if let Err(reset) = self.graph.reset() {
                error!(error = %reset, "Failed to tear down partial pipeline");
            }
            return Err(e.into());
        }

        self.constructed = true;
        self.graph.dump_diagnostic("pipeline-start");
        info!("Pipeline constructed");
        Ok(())
    }

    fn build_fixed_stages(&mut self) -> Result<(), GraphError> {
        self.graph.build_stage(StageSpec::new(
            names::CAPTURE,
            StageKind::Capture {
                width: self.config.width,
                height: self.config.height,
                framerate: self.config.framerate,
                source: self.config.video_source.clone(),
            },
        ))?;
        self.graph.add_stage(names::CAPTURE)?;

        self.graph
            .build_stage(StageSpec::new(names::FAN_OUT, StageKind::FanOut))?;
        self.graph.add_stage(names::FAN_OUT)?;

        let store = Arc::clone(&self.recording);
        self.graph.build_stage(StageSpec::new(
            names::RECORDING,
            StageKind::Recording {
                segment_duration: self.config.segment_duration,
                locator: Box::new(move |index| store.lock().next_fragment(index)),
            },
        ))?;
        self.graph.add_stage(names::RECORDING)?;

        self.graph.link(names::CAPTURE, names::FAN_OUT)?;
        self.graph.link(names::FAN_OUT, names::RECORDING)?;

        self.graph.set_state(Target::Graph, GraphState::Ready)
    }

    /// Start streaming. Starting a running pipeline is a no-op.
    pub fn start(&mut self) -> PipelineResult<()> {
        self.ensure_constructed("start")?;
        if let Err(e) = self.recording.lock().resolve_dir() {
            error!(error = %e, "Cannot start pipeline without a recording directory");
            return Err(e.into());
        }

        if matches!(
            self.graph.query_state(STATE_QUERY_TIMEOUT),
            Ok(GraphState::Playing)
        ) {
            warn!("Pipeline already playing");
            return Ok(());
        }

        info!("Starting pipeline");
        self.graph
            .set_state(Target::Graph, GraphState::Playing)
            .inspect_err(|e| error!(error = %e, "Failed to start pipeline"))?;
        Ok(())
    }

    /// Pause streaming. Pausing a paused pipeline is a no-op.
    pub fn pause(&mut self) -> PipelineResult<()> {
        self.ensure_constructed("pause")?;

        if matches!(
            self.graph.query_state(STATE_QUERY_TIMEOUT),
            Ok(GraphState::Paused)
        ) {
            warn!("Pipeline already paused");
            return Ok(());
        }

        info!("Pausing pipeline");
        self.graph
            .set_state(Target::Graph, GraphState::Paused)
            .inspect_err(|e| error!(error = %e, "Failed to pause pipeline"))?;
        Ok(())
    }

    /// Tear the graph down to the stopped state
    pub fn stop(&mut self) -> PipelineResult<()> {
        self.ensure_constructed("stop")?;
        info!("Stopping pipeline");
        self.graph
            .set_state(Target::Graph, GraphState::Null)
            .inspect_err(|e| error!(error = %e, "Failed to stop pipeline"))?;
        self.playing = false;
        Ok(())
    }

    /// Whether the graph is settled in PLAYING, waiting at most a few seconds
    pub fn is_running(&self) -> PipelineResult<bool> {
        if !self.constructed {
            return Ok(false);
        }
        match self.graph.query_state(STATE_QUERY_TIMEOUT) {
            Ok(state) => Ok(state == GraphState::Playing),
            Err(e) => {
                error!(error = %e, "Failed to query pipeline state");
                Err(e.into())
            }
        }
    }

    pub fn state(&self) -> PipelineResult<PipelineState> {
        if !self.constructed {
            return Ok(PipelineState::Unconstructed);
        }
        Ok(self.graph.query_state(STATE_QUERY_TIMEOUT)?.into())
    }

    /// Close the current recording fragment and start a new one
    pub fn split_now(&mut self) -> PipelineResult<()> {
        self.ensure_constructed("split recording")?;
        info!("Splitting recording fragment");
        self.graph
            .emit_control_signal(Target::Stage(names::RECORDING), ControlSignal::SplitAfter)
            .inspect_err(|e| error!(error = %e, "Failed to split recording"))?;
        Ok(())
    }

    /// Finalize the recording and bring the graph down
    ///
    /// Splits the running fragment, sends end-of-stream, waits for it to
    /// reach the sinks, then moves to NULL and waits for the graph to settle.
    pub fn shutdown(&mut self, timeout: Duration) -> PipelineResult<()> {
        if !self.constructed {
            return Ok(());
        }
        info!("Shutting down pipeline");
        let deadline = Instant::now() + timeout;

        if self.is_running().unwrap_or(false) {
            if let Err(e) = self.split_now() {
                warn!(error = %e, "Continuing shutdown without final split");
            }
            match self
                .graph
                .emit_control_signal(Target::Graph, ControlSignal::EndOfStream)
            {
                Ok(()) => self.wait_for_eos(deadline.min(Instant::now() + EOS_TIMEOUT)),
                Err(e) => warn!(error = %e, "Failed to send end-of-stream"),
            }
        }

        self.graph
            .set_state(Target::Graph, GraphState::Null)
            .inspect_err(|e| error!(error = %e, "Failed to stop pipeline"))?;
        self.playing = false;

        loop {
            match self.graph.query_state(Duration::from_millis(100)) {
                Ok(GraphState::Null) => break,
                Ok(state) => debug!(state = %state, "Waiting for pipeline to stop"),
                Err(e) => debug!(error = %e, "Waiting for pipeline to stop"),
            }
            if Instant::now() >= deadline {
                warn!("Pipeline did not reach the stopped state in time");
                break;
            }
            self.poll(Duration::from_millis(50));
        }

        info!("Pipeline shut down");
        Ok(())
    }

    fn wait_for_eos(&mut self, deadline: Instant) {
        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.poll(remaining.min(Duration::from_millis(100))) {
                Some(GraphEvent::EndOfStream) => return,
                Some(_) | None => {}
            }
        }
        warn!("End-of-stream did not reach the sinks in time");
    }

    /// Apply a new configuration, rebuilding the graph when the capture or
    /// recording layout changed
    ///
    /// Destinations configured before the rebuild are added back afterwards.
    /// When the rebuild fails the previous configuration is kept, the engine
    /// stays unconstructed and the next call retries the rebuild.
    pub fn set_config(&mut self, config: PipelineConfig) -> PipelineResult<()> {
        let rebuild = self.pending_rebuild.is_some()
            || (self.constructed && self.config.requires_rebuild(&config));
        if !rebuild {
            self.recording.lock().apply(&config);
            self.config = config;
            return Ok(());
        }

        let resume = match self.pending_rebuild {
            Some(resume) => resume,
            None => self.is_running().unwrap_or(false),
        };
        if self.constructed {
            info!("Pipeline configuration changed, rebuilding");
            self.shutdown(SHUTDOWN_TIMEOUT)?;
            self.teardown();
        } else {
            info!("Retrying pipeline rebuild");
        }
        self.pending_rebuild = Some(resume);

        let previous = std::mem::replace(&mut self.config, config);
        self.recording.lock().apply(&self.config);
        if let Err(e) = self.rebuild(resume) {
            error!(error = %e, "Pipeline rebuild failed, keeping previous configuration");
            self.config = previous;
            self.recording.lock().apply(&self.config);
            return Err(e);
        }

        self.pending_rebuild = None;
        Ok(())
    }

    fn rebuild(&mut self, resume: bool) -> PipelineResult<()> {
        self.construct()?;

        let destinations = std::mem::take(&mut self.destinations);
        for endpoint in &destinations {
            if let Err(e) = self.add_endpoint(endpoint) {
                error!(endpoint = %endpoint, error = %e, "Failed to restore destination");
            }
        }

        if resume && let Err(e) = self.start() {
            self.teardown();
            self.destinations = destinations;
            return Err(e);
        }
        Ok(())
    }

    /// Drop the whole graph without touching the destination list
    fn teardown(&mut self) {
        if let Err(e) = self.graph.reset() {
            error!(error = %e, "Failed to tear down pipeline");
        }
        self.constructed = false;
        self.playing = false;
        self.orphans.clear();
    }

    // ===== Egress destinations =====

    /// Add a UDP destination, attaching the egress branch if it is the first
    pub fn add_endpoint(&mut self, endpoint: &Endpoint) -> PipelineResult<()> {
        self.ensure_constructed("add endpoint")?;
        self.reap_orphans();

        let attached_here = !self.graph.has_parent(names::EGRESS);
        if attached_here {
            self.attach_branch(StageSpec::egress())?;
        }

        let signal = ControlSignal::AddDestination {
            host: endpoint.host.clone(),
            port: endpoint.port,
        };
        if let Err(e) = self
            .graph
            .emit_control_signal(Target::Stage(names::EGRESS), signal)
        {
            error!(endpoint = %endpoint, error = %e, "Failed to add destination");
            if attached_here
                && let Err(detach) = self.detach_branch(names::EGRESS)
            {
                error!(error = %detach, "Failed to detach unused egress branch");
            }
            return Err(e.into());
        }

        self.destinations.push(endpoint.clone());
        info!(endpoint = %endpoint, destinations = self.destinations.len(), "Destination added");
        Ok(())
    }

    /// Remove one occurrence of a destination; detaches egress when it was the last
    ///
    /// Without a graph there is no sink to update, so the destination is only
    /// dropped from the list that a later rebuild would restore.
    pub fn remove_endpoint(&mut self, endpoint: &Endpoint) -> PipelineResult<()> {
        let Some(pos) = self.destinations.iter().position(|d| d == endpoint) else {
            debug!(endpoint = %endpoint, "Destination not configured, nothing to remove");
            return Ok(());
        };

        if !self.constructed {
            self.destinations.remove(pos);
            warn!(endpoint = %endpoint, "Pipeline not constructed, destination forgotten");
            return Ok(());
        }
        self.reap_orphans();

        let signal = ControlSignal::RemoveDestination {
            host: endpoint.host.clone(),
            port: endpoint.port,
        };
        self.graph
            .emit_control_signal(Target::Stage(names::EGRESS), signal)
            .inspect_err(|e| error!(endpoint = %endpoint, error = %e, "Failed to remove destination"))?;

        self.destinations.remove(pos);
        info!(endpoint = %endpoint, destinations = self.destinations.len(), "Destination removed");

        self.detach_egress_if_idle();
        Ok(())
    }

    fn detach_egress_if_idle(&mut self) {
        if self.destinations.is_empty()
            && self.orphans.is_empty()
            && self.graph.has_parent(names::EGRESS)
            && let Err(e) = self.detach_branch(names::EGRESS)
        {
            error!(error = %e, "Failed to detach egress branch");
        }
    }

    /// Retry removing destinations left behind by a failed move
    pub fn reap_orphans(&mut self) {
        if self.orphans.is_empty() || !self.constructed {
            return;
        }
        let orphans = std::mem::take(&mut self.orphans);
        for endpoint in orphans {
            let signal = ControlSignal::RemoveDestination {
                host: endpoint.host.clone(),
                port: endpoint.port,
            };
            match self
                .graph
                .emit_control_signal(Target::Stage(names::EGRESS), signal)
            {
                Ok(()) => info!(endpoint = %endpoint, "Stale destination removed"),
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "Stale destination still present");
                    self.orphans.push(endpoint);
                }
            }
        }
        self.detach_egress_if_idle();
    }

    /// Move a destination. The new one is added before the old one is
    /// removed, so at least one of them is always receiving.
    ///
    /// If the old destination cannot be removed the new one is withdrawn
    /// again and the old one stays live. A new destination that cannot be
    /// withdrawn either is kept as an orphan and removed on a later mutation.
    pub fn change_endpoint(&mut self, old: &Endpoint, new: &Endpoint) -> PipelineResult<()> {
        if old == new {
            return Ok(());
        }
        info!(old = %old, new = %new, "Changing destination");

        self.add_endpoint(new)?;
        if let Err(e) = self.remove_endpoint(old) {
            error!(old = %old, error = %e, "Failed to remove previous destination, rolling back");
            if let Err(rollback) = self.remove_endpoint(new) {
                error!(new = %new, error = %rollback, "Failed to withdraw new destination");
                if let Some(pos) = self.destinations.iter().rposition(|d| d == new) {
                    self.destinations.remove(pos);
                    self.orphans.push(new.clone());
                }
            }
            return Err(e);
        }
        Ok(())
    }

    // ===== Branches =====

    /// Add a branch to the graph, link it behind the fan-out and bring it to
    /// the graph's state
    pub fn attach_branch(&mut self, spec: StageSpec) -> PipelineResult<()> {
        self.ensure_constructed("attach branch")?;
        let name = spec.name.clone();

        if self.graph.has_parent(&name) {
            error!(branch = %name, "Branch already has a parent");
            return Err(PipelineError::BranchHasParent(name));
        }
        if !self.graph.has_parent(names::FAN_OUT) {
            error!(branch = %name, "Fan-out stage missing");
            return Err(PipelineError::FanOutMissing);
        }

        if self.graph.has_stage(&name) {
            self.graph.release_stage(&name)?;
        }
        self.graph.build_stage(spec)?;

        if let Err(e) = self.graph.add_stage(&name) {
            error!(branch = %name, error = %e, "Failed to add branch");
            self.discard_floating(&name);
            return Err(e.into());
        }

        if let Err(e) = self.graph.link(names::FAN_OUT, &name) {
            error!(branch = %name, error = %e, "Failed to link branch");
            self.discard_parented(&name);
            return Err(e.into());
        }

        if let Err(e) = self.graph.sync_state_with_parent(&name) {
            error!(branch = %name, error = %e, "Failed to sync branch state");
            if let Err(unlink) = self.graph.unlink(names::FAN_OUT, &name) {
                error!(branch = %name, error = %unlink, "Failed to unlink branch");
            }
            self.discard_parented(&name);
            return Err(e.into());
        }

        info!(branch = %name, "Branch attached");
        self.graph.dump_diagnostic("pipeline-attached");
        Ok(())
    }

    /// Unlink a branch from the fan-out, stop it and release it
    ///
    /// When unlinking or removal fails the graph is left as it was.
    pub fn detach_branch(&mut self, name: &str) -> PipelineResult<()> {
        self.ensure_constructed("detach branch")?;

        if !self.graph.has_parent(name) {
            error!(branch = %name, "Branch is not attached");
            return Err(PipelineError::BranchNotAttached(name.to_string()));
        }

        self.graph
            .unlink(names::FAN_OUT, name)
            .inspect_err(|e| error!(branch = %name, error = %e, "Failed to unlink branch"))?;

        if let Err(e) = self.graph.remove_stage(name) {
            error!(branch = %name, error = %e, "Failed to remove branch, relinking");
            if let Err(relink) = self.graph.link(names::FAN_OUT, name) {
                error!(branch = %name, error = %relink, "Failed to relink branch");
            }
            return Err(e.into());
        }

        if let Err(e) = self.graph.set_state(Target::Stage(name), GraphState::Null) {
            error!(branch = %name, error = %e, "Failed to stop detached branch");
        }
        if let Err(e) = self.graph.release_stage(name) {
            warn!(branch = %name, error = %e, "Failed to release detached branch");
        }

        info!(branch = %name, "Branch detached");
        self.graph.dump_diagnostic("pipeline-detached");
        Ok(())
    }

    fn discard_floating(&mut self, name: &str) {
        if let Err(e) = self.graph.release_stage(name) {
            warn!(branch = %name, error = %e, "Failed to release branch");
        }
    }

    fn discard_parented(&mut self, name: &str) {
        match self.graph.remove_stage(name) {
            Ok(()) => self.discard_floating(name),
            Err(e) => warn!(branch = %name, error = %e, "Failed to remove branch"),
        }
    }

    // ===== Events and diagnostics =====

    /// Handle at most one graph event, waiting at most `timeout`
    pub fn poll(&mut self, timeout: Duration) -> Option<GraphEvent> {
        if !self.constructed {
            error!("Cannot poll events of a pipeline that is not constructed");
            return None;
        }
        let event = self.graph.pop_event(timeout)?;
        self.handle_event(&event);
        Some(event)
    }

    fn handle_event(&mut self, event: &GraphEvent) {
        match event {
            GraphEvent::Info {
                source,
                message,
                debug: details,
            } => info!(source = %source, details = ?details, "{}", message),
            GraphEvent::Warning {
                source,
                message,
                debug: details,
            } => warn!(source = %source, details = ?details, "{}", message),
            GraphEvent::Error {
                source,
                message,
                debug: details,
            } => error!(source = %source, details = ?details, "{}", message),
            GraphEvent::EndOfStream => error!("End of stream reached"),
            GraphEvent::StateChanged {
                source,
                old,
                new,
                top_level,
            } => {
                if !*top_level {
                    debug!(element = %source, old = %old, new = %new, "Element state changed");
                    return;
                }

                info!(old = %old, new = %new, "Pipeline state changed");
                self.playing = *new == GraphState::Playing;
                match new {
                    GraphState::Ready => self.graph.dump_diagnostic("pipeline-ready"),
                    GraphState::Paused => self.graph.dump_diagnostic("pipeline-paused"),
                    GraphState::Playing => self.graph.dump_diagnostic("pipeline-playing"),
                    GraphState::Null => {}
                }

                if tracing::enabled!(tracing::Level::DEBUG) {
                    for stage in self.graph.describe() {
                        debug!(
                            element = %stage.name,
                            current = %stage.current,
                            pending = ?stage.pending,
                            "Element state"
                        );
                    }
                }
            }
        }
    }

    /// Write a topology snapshot tagged with `name`
    pub fn dump_diagnostic(&self, name: &str) {
        self.graph.dump_diagnostic(name);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.constructed
            && let Err(e) = self.graph.set_state(Target::Graph, GraphState::Null)
        {
            warn!(error = %e, "Failed to stop pipeline on drop");
        }
    }
}
