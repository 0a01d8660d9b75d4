// SPDX-License-Identifier: MPL-2.0

//! In-process media graph
//!
//! Keeps the topology, states, and destination list in memory so the engine,
//! lease manager, and control endpoint can run without camera hardware. The
//! handle is cheap to clone: tests keep one clone to inspect the graph and to
//! inject failures while the engine owns another.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::graph::{
    ControlSignal, FragmentLocator, GraphEvent, GraphResult, GraphState, MediaGraph, StageKind,
    StageSpec, StageStatus, Target, names,
};
use crate::errors::GraphError;
use crate::net::Endpoint;

/// Operation that should fail on the simulated graph
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailPoint {
    BuildStage(String),
    AddStage(String),
    RemoveStage(String),
    /// Linking anything into the named downstream stage
    Link(String),
    /// Unlinking anything from the named downstream stage
    Unlink(String),
    SyncState(String),
    /// Moving the whole graph to this state
    SetState(GraphState),
    /// Control signal by name ("add", "remove", "split-after", "eos")
    Signal(&'static str),
    StateQuery,
}

struct SimStage {
    kind: &'static str,
    parented: bool,
    state: GraphState,
    destinations: Vec<Endpoint>,
    locator: Option<FragmentLocator>,
    next_fragment: u32,
}

struct SimState {
    stages: BTreeMap<String, SimStage>,
    links: Vec<(String, String)>,
    state: GraphState,
    events: VecDeque<GraphEvent>,
    signals: Vec<(String, ControlSignal)>,
    destination_history: Vec<Vec<Endpoint>>,
    diagnostics: Vec<String>,
    fragments: Vec<PathBuf>,
    failures: HashSet<FailPoint>,
    /// Failures that fire once and are then forgotten
    one_shot: HashSet<FailPoint>,
}

impl SimState {
    fn check(&mut self, point: FailPoint) -> Result<(), FailPoint> {
        if self.failures.contains(&point) || self.one_shot.remove(&point) {
            Err(point)
        } else {
            Ok(())
        }
    }

    fn stage(&self, name: &str) -> GraphResult<&SimStage> {
        self.stages
            .get(name)
            .ok_or_else(|| GraphError::StageNotFound(name.to_string()))
    }

    fn stage_mut(&mut self, name: &str) -> GraphResult<&mut SimStage> {
        self.stages
            .get_mut(name)
            .ok_or_else(|| GraphError::StageNotFound(name.to_string()))
    }

    fn open_fragment(&mut self, name: &str) {
        let Some(stage) = self.stages.get_mut(name) else {
            return;
        };
        let Some(locator) = stage.locator.as_mut() else {
            return;
        };
        let index = stage.next_fragment;
        stage.next_fragment += 1;

        let Some(path) = locator(index) else {
            debug!(index, "No fragment location, keeping sink default");
            return;
        };
        if let Err(e) = OpenOptions::new().create(true).append(true).open(&path) {
            warn!(path = %path.display(), error = %e, "Failed to open simulated fragment");
        }
        self.fragments.push(path);
    }

    fn recording_stages(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|(_, stage)| stage.parented && stage.locator.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Shared handle to an in-memory media graph
#[derive(Clone)]
pub struct SimulatedGraph {
    inner: Arc<Mutex<SimState>>,
}

impl Default for SimulatedGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedGraph {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                stages: BTreeMap::new(),
                links: Vec::new(),
                state: GraphState::Null,
                events: VecDeque::new(),
                signals: Vec::new(),
                destination_history: Vec::new(),
                diagnostics: Vec::new(),
                fragments: Vec::new(),
                failures: HashSet::new(),
                one_shot: HashSet::new(),
            })),
        }
    }

    // ===== Failure injection =====

    pub fn fail_on(&self, point: FailPoint) {
        self.inner.lock().failures.insert(point);
    }

    /// Fail only the next matching operation
    pub fn fail_once(&self, point: FailPoint) {
        self.inner.lock().one_shot.insert(point);
    }

    pub fn clear_failure(&self, point: &FailPoint) {
        self.inner.lock().failures.remove(point);
    }

    pub fn clear_failures(&self) {
        let mut sim = self.inner.lock();
        sim.failures.clear();
        sim.one_shot.clear();
    }

    /// Queue a bus event as if a stage had posted it
    pub fn push_event(&self, event: GraphEvent) {
        self.inner.lock().events.push_back(event);
    }

    // ===== Inspection =====

    pub fn state(&self) -> GraphState {
        self.inner.lock().state
    }

    pub fn stage_state(&self, name: &str) -> Option<GraphState> {
        self.inner.lock().stages.get(name).map(|stage| stage.state)
    }

    pub fn is_linked(&self, upstream: &str, downstream: &str) -> bool {
        self.inner
            .lock()
            .links
            .iter()
            .any(|(u, d)| u == upstream && d == downstream)
    }

    /// Current destination list of the egress sink
    pub fn destinations(&self) -> Vec<Endpoint> {
        self.inner
            .lock()
            .stages
            .get(names::EGRESS)
            .map(|stage| stage.destinations.clone())
            .unwrap_or_default()
    }

    /// Destination list as observed after every add/remove signal
    pub fn destination_history(&self) -> Vec<Vec<Endpoint>> {
        self.inner.lock().destination_history.clone()
    }

    pub fn signals(&self) -> Vec<(String, ControlSignal)> {
        self.inner.lock().signals.clone()
    }

    pub fn diagnostics(&self) -> Vec<String> {
        self.inner.lock().diagnostics.clone()
    }

    /// Every fragment path the recording sink has opened, in order
    pub fn fragments(&self) -> Vec<PathBuf> {
        self.inner.lock().fragments.clone()
    }

    /// Append bytes to the fragment currently being written
    pub fn write_to_fragment(&self, len: usize) -> std::io::Result<()> {
        let Some(path) = self.inner.lock().fragments.last().cloned() else {
            return Ok(());
        };
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(&vec![0u8; len])
    }
}

fn injected(point: FailPoint) -> GraphError {
    GraphError::Backend(format!("injected failure: {point:?}"))
}

impl MediaGraph for SimulatedGraph {
    fn build_stage(&mut self, spec: StageSpec) -> GraphResult<()> {
        let mut sim = self.inner.lock();
        if let Err(point) = sim.check(FailPoint::BuildStage(spec.name.clone())) {
            return Err(GraphError::BuildFailed {
                stage: spec.name,
                reason: format!("{:?}", point),
            });
        }
        if sim.stages.contains_key(&spec.name) {
            return Err(GraphError::StageExists(spec.name));
        }

        let kind = spec.kind.label();
        let locator = match spec.kind {
            StageKind::Recording { locator, .. } => Some(locator),
            _ => None,
        };
        sim.stages.insert(
            spec.name,
            SimStage {
                kind,
                parented: false,
                state: GraphState::Null,
                destinations: Vec::new(),
                locator,
                next_fragment: 0,
            },
        );
        Ok(())
    }

    fn has_stage(&self, name: &str) -> bool {
        self.inner.lock().stages.contains_key(name)
    }

    fn has_parent(&self, name: &str) -> bool {
        self.inner
            .lock()
            .stages
            .get(name)
            .is_some_and(|stage| stage.parented)
    }

    fn add_stage(&mut self, name: &str) -> GraphResult<()> {
        let mut sim = self.inner.lock();
        sim.check(FailPoint::AddStage(name.to_string()))
            .map_err(injected)?;
        let stage = sim.stage_mut(name)?;
        if stage.parented {
            return Err(GraphError::AddFailed {
                stage: name.to_string(),
                reason: "already has a parent".into(),
            });
        }
        stage.parented = true;
        Ok(())
    }

    fn remove_stage(&mut self, name: &str) -> GraphResult<()> {
        let mut sim = self.inner.lock();
        sim.check(FailPoint::RemoveStage(name.to_string()))
            .map_err(injected)?;
        let stage = sim.stage_mut(name)?;
        if !stage.parented {
            return Err(GraphError::RemoveFailed {
                stage: name.to_string(),
                reason: "not in the graph".into(),
            });
        }
        stage.parented = false;
        sim.links.retain(|(u, d)| u != name && d != name);
        Ok(())
    }

    fn release_stage(&mut self, name: &str) -> GraphResult<()> {
        let mut sim = self.inner.lock();
        if sim.stage(name)?.parented {
            return Err(GraphError::RemoveFailed {
                stage: name.to_string(),
                reason: "still in the graph".into(),
            });
        }
        sim.stages.remove(name);
        Ok(())
    }

    fn reset(&mut self) -> GraphResult<()> {
        let mut sim = self.inner.lock();
        sim.stages.clear();
        sim.links.clear();
        sim.events.clear();
        sim.state = GraphState::Null;
        Ok(())
    }

    fn link(&mut self, upstream: &str, downstream: &str) -> GraphResult<()> {
        let mut sim = self.inner.lock();
        let failed = || GraphError::LinkFailed {
            upstream: upstream.to_string(),
            downstream: downstream.to_string(),
        };
        if sim.check(FailPoint::Link(downstream.to_string())).is_err() {
            return Err(failed());
        }
        if !sim.stage(upstream)?.parented || !sim.stage(downstream)?.parented {
            return Err(failed());
        }
        if sim
            .links
            .iter()
            .any(|(u, d)| u == upstream && d == downstream)
        {
            return Err(failed());
        }
        sim.links
            .push((upstream.to_string(), downstream.to_string()));
        Ok(())
    }

    fn unlink(&mut self, upstream: &str, downstream: &str) -> GraphResult<()> {
        let mut sim = self.inner.lock();
        let failed = || GraphError::UnlinkFailed {
            upstream: upstream.to_string(),
            downstream: downstream.to_string(),
        };
        if sim.check(FailPoint::Unlink(downstream.to_string())).is_err() {
            return Err(failed());
        }
        let before = sim.links.len();
        sim.links
            .retain(|(u, d)| !(u == upstream && d == downstream));
        if sim.links.len() == before {
            return Err(failed());
        }
        Ok(())
    }

    fn set_state(&mut self, target: Target<'_>, state: GraphState) -> GraphResult<()> {
        let mut sim = self.inner.lock();
        match target {
            Target::Graph => {
                if sim.check(FailPoint::SetState(state)).is_err() {
                    return Err(GraphError::StateChange {
                        target: target.to_string(),
                        state,
                    });
                }
                let old = sim.state;
                sim.state = state;
                for stage in sim.stages.values_mut().filter(|stage| stage.parented) {
                    stage.state = state;
                }
                if old != state {
                    sim.events.push_back(GraphEvent::StateChanged {
                        source: names::PIPELINE.to_string(),
                        old,
                        new: state,
                        top_level: true,
                    });
                }
                if old != GraphState::Playing && state == GraphState::Playing {
                    for name in sim.recording_stages() {
                        if sim.stages.get(&name).is_some_and(|s| s.next_fragment == 0) {
                            sim.open_fragment(&name);
                        }
                    }
                }
            }
            Target::Stage(name) => {
                sim.stage_mut(name)?.state = state;
            }
        }
        Ok(())
    }

    fn sync_state_with_parent(&mut self, name: &str) -> GraphResult<()> {
        let mut sim = self.inner.lock();
        sim.check(FailPoint::SyncState(name.to_string()))
            .map_err(injected)?;
        let graph_state = sim.state;
        let stage = sim.stage_mut(name)?;
        if !stage.parented {
            return Err(GraphError::StateChange {
                target: name.to_string(),
                state: graph_state,
            });
        }
        stage.state = graph_state;
        let opens_fragment = graph_state == GraphState::Playing
            && stage.locator.is_some()
            && stage.next_fragment == 0;
        if opens_fragment {
            sim.open_fragment(name);
        }
        Ok(())
    }

    fn query_state(&self, _timeout: Duration) -> GraphResult<GraphState> {
        let mut sim = self.inner.lock();
        if sim.check(FailPoint::StateQuery).is_err() {
            return Err(GraphError::StateQuery(
                "state change did not settle in time".into(),
            ));
        }
        Ok(sim.state)
    }

    fn emit_control_signal(
        &mut self,
        target: Target<'_>,
        signal: ControlSignal,
    ) -> GraphResult<()> {
        let mut sim = self.inner.lock();
        if sim.check(FailPoint::Signal(signal.name())).is_err() {
            return Err(GraphError::Signal {
                target: target.to_string(),
                signal: signal.name().to_string(),
                reason: "injected failure".into(),
            });
        }

        match (&signal, target) {
            (ControlSignal::AddDestination { host, port }, Target::Stage(name)) => {
                let stage = sim.stage_mut(name)?;
                stage.destinations.push(Endpoint::new(host.clone(), *port));
                let snapshot = stage.destinations.clone();
                sim.destination_history.push(snapshot);
            }
            (ControlSignal::RemoveDestination { host, port }, Target::Stage(name)) => {
                let stage = sim.stage_mut(name)?;
                if let Some(pos) = stage
                    .destinations
                    .iter()
                    .position(|d| d.host == *host && d.port == *port)
                {
                    stage.destinations.remove(pos);
                }
                let snapshot = stage.destinations.clone();
                sim.destination_history.push(snapshot);
            }
            (ControlSignal::SplitAfter, Target::Stage(name)) => {
                sim.stage(name)?;
                sim.open_fragment(name);
            }
            (ControlSignal::EndOfStream, _) => {
                sim.events.push_back(GraphEvent::EndOfStream);
            }
            (_, Target::Graph) => {
                return Err(GraphError::Signal {
                    target: target.to_string(),
                    signal: signal.name().to_string(),
                    reason: "signal needs a stage".into(),
                });
            }
        }

        sim.signals.push((target.to_string(), signal));
        Ok(())
    }

    fn pop_event(&mut self, _timeout: Duration) -> Option<GraphEvent> {
        self.inner.lock().events.pop_front()
    }

    fn describe(&self) -> Vec<StageStatus> {
        self.inner
            .lock()
            .stages
            .iter()
            .filter(|(_, stage)| stage.parented)
            .map(|(name, stage)| StageStatus {
                name: format!("{} ({})", name, stage.kind),
                current: stage.state,
                pending: None,
            })
            .collect()
    }

    fn dump_diagnostic(&self, name: &str) {
        self.inner.lock().diagnostics.push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built(graph: &mut SimulatedGraph, name: &str) {
        graph
            .build_stage(StageSpec::new(name, StageKind::FanOut))
            .unwrap();
    }

    #[test]
    fn built_stages_float_until_added() {
        let mut graph = SimulatedGraph::new();
        built(&mut graph, "a");
        assert!(graph.has_stage("a"));
        assert!(!graph.has_parent("a"));

        graph.add_stage("a").unwrap();
        assert!(graph.has_parent("a"));
        assert!(graph.add_stage("a").is_err());
        assert!(graph.release_stage("a").is_err());
    }

    #[test]
    fn remove_destination_drops_one_occurrence() {
        let mut graph = SimulatedGraph::new();
        graph.build_stage(StageSpec::egress()).unwrap();
        let add = || ControlSignal::AddDestination {
            host: "10.0.0.1".into(),
            port: 5000,
        };
        graph
            .emit_control_signal(Target::Stage(names::EGRESS), add())
            .unwrap();
        graph
            .emit_control_signal(Target::Stage(names::EGRESS), add())
            .unwrap();
        graph
            .emit_control_signal(
                Target::Stage(names::EGRESS),
                ControlSignal::RemoveDestination {
                    host: "10.0.0.1".into(),
                    port: 5000,
                },
            )
            .unwrap();
        assert_eq!(graph.destinations(), vec![Endpoint::new("10.0.0.1", 5000)]);
    }

    #[test]
    fn injected_failures_surface_as_errors() {
        let graph = SimulatedGraph::new();
        graph.fail_on(FailPoint::StateQuery);
        assert!(graph.query_state(Duration::from_millis(10)).is_err());
        graph.clear_failures();
        assert_eq!(
            graph.query_state(Duration::from_millis(10)).unwrap(),
            GraphState::Null
        );
    }

    #[test]
    fn one_shot_failures_fire_once() {
        let graph = SimulatedGraph::new();
        graph.fail_once(FailPoint::StateQuery);
        assert!(graph.query_state(Duration::from_millis(10)).is_err());
        assert!(graph.query_state(Duration::from_millis(10)).is_ok());
    }
}
