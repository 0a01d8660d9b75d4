// SPDX-License-Identifier: MPL-2.0

//! GStreamer implementation of [`MediaGraph`]
//!
//! Every stage is a bin with ghost pads, except the fan-out which is a plain
//! `tee`. Elements inside a bin are named `<stage>-<role>` so control signals
//! can find them with a recursive lookup.

use std::collections::HashMap;
use std::sync::mpsc;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::graph::{
    ControlSignal, FragmentLocator, Framerate, GraphEvent, GraphResult, GraphState, MediaGraph,
    StageKind, StageSpec, StageStatus, Target, names,
};
use crate::constants::timing::UNLINK_TIMEOUT;
use crate::errors::GraphError;

const HARDWARE_ENCODER: &str = "v4l2h264enc";
const SOFTWARE_ENCODER: &str = "x264enc";
const DEFAULT_SOURCE: &str = "libcamerasrc";
const H264_LEVEL: &str = "3.1";
const RTP_PAYLOAD_TYPE: u32 = 96;

impl From<gst::State> for GraphState {
    fn from(state: gst::State) -> Self {
        match state {
            gst::State::Playing => GraphState::Playing,
            gst::State::Paused => GraphState::Paused,
            gst::State::Ready => GraphState::Ready,
            _ => GraphState::Null,
        }
    }
}

impl From<GraphState> for gst::State {
    fn from(state: GraphState) -> Self {
        match state {
            GraphState::Null => gst::State::Null,
            GraphState::Ready => gst::State::Ready,
            GraphState::Paused => gst::State::Paused,
            GraphState::Playing => gst::State::Playing,
        }
    }
}

fn make(factory: &str, name: &str) -> GraphResult<gst::Element> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .map_err(|e| GraphError::BuildFailed {
            stage: name.to_string(),
            reason: format!("failed to create {factory}: {e}"),
        })
}

fn build_error(stage: &str, reason: impl std::fmt::Display) -> GraphError {
    GraphError::BuildFailed {
        stage: stage.to_string(),
        reason: reason.to_string(),
    }
}

fn ghost(bin: &gst::Bin, element: &gst::Element, pad: &str) -> GraphResult<()> {
    let target = element
        .static_pad(pad)
        .ok_or_else(|| build_error(&bin.name(), format!("{} has no {pad} pad", element.name())))?;
    let ghost = gst::GhostPad::with_target(&target).map_err(|e| build_error(&bin.name(), e))?;
    bin.add_pad(&ghost).map_err(|e| build_error(&bin.name(), e))
}

/// Hardware encoder first, software encoder as fallback
fn select_encoder(stage: &str) -> GraphResult<gst::Element> {
    let name = format!("{stage}-encoder");

    if let Ok(encoder) = gst::ElementFactory::make(HARDWARE_ENCODER).name(&name).build() {
        let controls = gst::Structure::builder("controls")
            .field("repeat_sequence_header", 1i32)
            .build();
        encoder.set_property("extra-controls", &controls);
        info!(encoder = HARDWARE_ENCODER, "Using hardware H.264 encoder");
        return Ok(encoder);
    }

    let encoder = gst::ElementFactory::make(SOFTWARE_ENCODER)
        .name(&name)
        .property_from_str("tune", "zerolatency")
        .property_from_str("speed-preset", "ultrafast")
        .build()
        .map_err(|e| build_error(stage, format!("no H.264 encoder available: {e}")))?;
    warn!(
        encoder = SOFTWARE_ENCODER,
        "Hardware H.264 encoder unavailable, using software encoder"
    );
    Ok(encoder)
}

fn build_capture(
    name: &str,
    width: u32,
    height: u32,
    framerate: Framerate,
    source: Option<&str>,
) -> GraphResult<gst::Element> {
    let bin = gst::Bin::with_name(name);
    let source_factory = source.unwrap_or(DEFAULT_SOURCE);

    let src = make(source_factory, &format!("{name}-src"))?;
    let convert = make("videoconvert", &format!("{name}-convert"))?;
    let raw_caps = gst::Caps::builder("video/x-raw")
        .field("width", width as i32)
        .field("height", height as i32)
        .field(
            "framerate",
            gst::Fraction::new(framerate.numerator, framerate.denominator),
        )
        .build();
    let raw_filter = gst::ElementFactory::make("capsfilter")
        .name(format!("{name}-raw-caps"))
        .property("caps", &raw_caps)
        .build()
        .map_err(|e| build_error(name, e))?;
    let encoder = select_encoder(name)?;
    let h264_caps = gst::Caps::builder("video/x-h264")
        .field("level", H264_LEVEL)
        .build();
    let h264_filter = gst::ElementFactory::make("capsfilter")
        .name(format!("{name}-h264-caps"))
        .property("caps", &h264_caps)
        .build()
        .map_err(|e| build_error(name, e))?;

    let chain = [&src, &convert, &raw_filter, &encoder, &h264_filter];
    bin.add_many(chain).map_err(|e| build_error(name, e))?;
    gst::Element::link_many(chain).map_err(|e| build_error(name, e))?;
    ghost(&bin, &h264_filter, "src")?;

    debug!(
        stage = name,
        source = source_factory,
        width,
        height,
        %framerate,
        "Capture stage built"
    );
    Ok(bin.upcast())
}

fn build_fan_out(name: &str) -> GraphResult<gst::Element> {
    gst::ElementFactory::make("tee")
        .name(name)
        .property("allow-not-linked", true)
        .build()
        .map_err(|e| build_error(name, e))
}

fn build_recording(
    name: &str,
    segment_duration: Duration,
    locator: FragmentLocator,
) -> GraphResult<gst::Element> {
    let bin = gst::Bin::with_name(name);

    let queue = make("queue", &format!("{name}-queue"))?;
    let parse = make("h264parse", &format!("{name}-parse"))?;
    let max_size_time = u64::try_from(segment_duration.as_nanos()).unwrap_or(u64::MAX);
    let sink = gst::ElementFactory::make("splitmuxsink")
        .name(format!("{name}-sink"))
        .property("max-size-time", max_size_time)
        .property("async-finalize", false)
        .property("send-keyframe-requests", true)
        .build()
        .map_err(|e| build_error(name, e))?;

    let locator = Mutex::new(locator);
    sink.connect("format-location", false, move |args| {
        let index = args.get(1).and_then(|v| v.get::<u32>().ok()).unwrap_or(0);
        let mut locate = locator.lock();
        let location = (*locate)(index).map(|path| path.to_string_lossy().into_owned());
        match &location {
            Some(path) => info!(fragment = index, path = %path, "Opening recording fragment"),
            None => warn!(fragment = index, "No location for recording fragment"),
        }
        Some(location.to_value())
    });

    bin.add_many([&queue, &parse, &sink])
        .map_err(|e| build_error(name, e))?;
    queue.link(&parse).map_err(|e| build_error(name, e))?;
    parse
        .link_pads(Some("src"), &sink, Some("video"))
        .map_err(|e| build_error(name, e))?;
    ghost(&bin, &queue, "sink")?;

    debug!(stage = name, segment_secs = segment_duration.as_secs(), "Recording stage built");
    Ok(bin.upcast())
}

fn build_egress(name: &str) -> GraphResult<gst::Element> {
    let bin = gst::Bin::with_name(name);

    let queue = make("queue", &format!("{name}-queue"))?;
    let pay = gst::ElementFactory::make("rtph264pay")
        .name(format!("{name}-pay"))
        .property("config-interval", 1i32)
        .property("pt", RTP_PAYLOAD_TYPE)
        .build()
        .map_err(|e| build_error(name, e))?;
    let sink = gst::ElementFactory::make("multiudpsink")
        .name(format!("{name}-udpsink"))
        .property("sync", false)
        .property("async", false)
        .build()
        .map_err(|e| build_error(name, e))?;

    let chain = [&queue, &pay, &sink];
    bin.add_many(chain).map_err(|e| build_error(name, e))?;
    gst::Element::link_many(chain).map_err(|e| build_error(name, e))?;
    ghost(&bin, &queue, "sink")?;

    debug!(stage = name, "Egress stage built");
    Ok(bin.upcast())
}

/// Unlink `pad` from `peer` once the pad is idle, so no buffer is mid-push
///
/// The callback runs at once on an idle pad, otherwise from the streaming
/// thread between buffers.
fn unlink_when_idle(pad: &gst::Pad, peer: &gst::Pad) -> bool {
    let (tx, rx) = mpsc::channel();
    let target = peer.clone();
    let watch = pad.add_probe(gst::PadProbeType::IDLE, move |pad, _| {
        let _ = tx.send(pad.unlink(&target).is_ok());
        gst::PadProbeReturn::Remove
    });

    match rx.recv_timeout(UNLINK_TIMEOUT) {
        Ok(unlinked) => unlinked,
        Err(_) => {
            if let Some(watch) = watch {
                pad.remove_probe(watch);
            }
            warn!(pad = %pad.name(), "Pad did not go idle in time");
            false
        }
    }
}

/// Native media graph backed by a `gst::Pipeline`
pub struct GstGraph {
    pipeline: gst::Pipeline,
    bus: gst::Bus,
    /// Stages built but not currently inside the pipeline
    floating: HashMap<String, gst::Element>,
}

impl GstGraph {
    pub fn new() -> GraphResult<Self> {
        gst::init().map_err(|e| GraphError::Backend(format!("failed to initialize GStreamer: {e}")))?;
        let (pipeline, bus) = Self::new_pipeline()?;
        Ok(Self {
            pipeline,
            bus,
            floating: HashMap::new(),
        })
    }

    fn new_pipeline() -> GraphResult<(gst::Pipeline, gst::Bus)> {
        let pipeline = gst::Pipeline::with_name(names::PIPELINE);
        let bus = pipeline
            .bus()
            .ok_or_else(|| GraphError::Backend("pipeline has no bus".into()))?;
        Ok((pipeline, bus))
    }

    /// Direct child of the pipeline
    fn child(&self, name: &str) -> Option<gst::Element> {
        self.pipeline
            .by_name(name)
            .filter(|e| e.parent().as_ref() == Some(self.pipeline.upcast_ref::<gst::Object>()))
    }

    fn stage(&self, name: &str) -> GraphResult<gst::Element> {
        self.floating
            .get(name)
            .cloned()
            .or_else(|| self.child(name))
            .ok_or_else(|| GraphError::StageNotFound(name.to_string()))
    }

    fn inner(&self, stage: &str, role: &str) -> GraphResult<gst::Element> {
        let name = format!("{stage}-{role}");
        self.stage(stage)?
            .downcast::<gst::Bin>()
            .ok()
            .and_then(|bin| bin.by_name(&name))
            .ok_or(GraphError::StageNotFound(name))
    }

    fn signal_error(target: Target<'_>, signal: &ControlSignal, reason: impl Into<String>) -> GraphError {
        GraphError::Signal {
            target: target.to_string(),
            signal: signal.name().to_string(),
            reason: reason.into(),
        }
    }
}

impl MediaGraph for GstGraph {
    fn build_stage(&mut self, spec: StageSpec) -> GraphResult<()> {
        if self.has_stage(&spec.name) {
            return Err(GraphError::StageExists(spec.name));
        }
        let element = match spec.kind {
            StageKind::Capture {
                width,
                height,
                framerate,
                source,
            } => build_capture(&spec.name, width, height, framerate, source.as_deref())?,
            StageKind::FanOut => build_fan_out(&spec.name)?,
            StageKind::Recording {
                segment_duration,
                locator,
            } => build_recording(&spec.name, segment_duration, locator)?,
            StageKind::Egress => build_egress(&spec.name)?,
        };
        self.floating.insert(spec.name, element);
        Ok(())
    }

    fn has_stage(&self, name: &str) -> bool {
        self.floating.contains_key(name) || self.child(name).is_some()
    }

    fn has_parent(&self, name: &str) -> bool {
        self.child(name).is_some()
    }

    fn add_stage(&mut self, name: &str) -> GraphResult<()> {
        let element = self
            .floating
            .remove(name)
            .ok_or_else(|| GraphError::StageNotFound(name.to_string()))?;
        if let Err(e) = self.pipeline.add(&element) {
            self.floating.insert(name.to_string(), element);
            return Err(GraphError::AddFailed {
                stage: name.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    fn remove_stage(&mut self, name: &str) -> GraphResult<()> {
        let element = self
            .child(name)
            .ok_or_else(|| GraphError::StageNotFound(name.to_string()))?;
        self.pipeline
            .remove(&element)
            .map_err(|e| GraphError::RemoveFailed {
                stage: name.to_string(),
                reason: e.to_string(),
            })?;
        self.floating.insert(name.to_string(), element);
        Ok(())
    }

    fn release_stage(&mut self, name: &str) -> GraphResult<()> {
        let element = self
            .floating
            .remove(name)
            .ok_or_else(|| GraphError::StageNotFound(name.to_string()))?;
        let _ = element.set_state(gst::State::Null);
        Ok(())
    }

    fn reset(&mut self) -> GraphResult<()> {
        let _ = self.pipeline.set_state(gst::State::Null);
        for element in self.floating.values() {
            let _ = element.set_state(gst::State::Null);
        }
        self.floating.clear();
        let (pipeline, bus) = Self::new_pipeline()?;
        self.pipeline = pipeline;
        self.bus = bus;
        Ok(())
    }

    fn link(&mut self, upstream: &str, downstream: &str) -> GraphResult<()> {
        let up = self.stage(upstream)?;
        let down = self.stage(downstream)?;
        up.link(&down).map_err(|_| GraphError::LinkFailed {
            upstream: upstream.to_string(),
            downstream: downstream.to_string(),
        })
    }

    fn unlink(&mut self, upstream: &str, downstream: &str) -> GraphResult<()> {
        let up = self.stage(upstream)?;
        let down = self.stage(downstream)?;
        let failed = || GraphError::UnlinkFailed {
            upstream: upstream.to_string(),
            downstream: downstream.to_string(),
        };

        let mut unlinked = false;
        for pad in up.src_pads() {
            let Some(peer) = pad.peer() else { continue };
            if peer.parent_element().as_ref() != Some(&down) {
                continue;
            }
            if !unlink_when_idle(&pad, &peer) {
                return Err(failed());
            }
            let requested = pad
                .pad_template()
                .is_some_and(|t| t.presence() == gst::PadPresence::Request);
            if requested {
                up.release_request_pad(&pad);
            }
            unlinked = true;
        }

        if unlinked { Ok(()) } else { Err(failed()) }
    }

    fn set_state(&mut self, target: Target<'_>, state: GraphState) -> GraphResult<()> {
        let element = match target {
            Target::Graph => self.pipeline.clone().upcast::<gst::Element>(),
            Target::Stage(name) => self.stage(name)?,
        };
        element
            .set_state(state.into())
            .map(|_| ())
            .map_err(|_| GraphError::StateChange {
                target: target.to_string(),
                state,
            })
    }

    fn sync_state_with_parent(&mut self, name: &str) -> GraphResult<()> {
        let element = self.stage(name)?;
        let failed = || GraphError::StateChange {
            target: name.to_string(),
            state: self
                .query_state(Duration::ZERO)
                .unwrap_or(GraphState::Null),
        };
        element.sync_state_with_parent().map_err(|_| failed())?;
        if let Some(bin) = element.downcast_ref::<gst::Bin>() {
            bin.sync_children_states().map_err(|_| failed())?;
        }
        Ok(())
    }

    fn query_state(&self, timeout: Duration) -> GraphResult<GraphState> {
        let timeout = gst::ClockTime::from_nseconds(
            u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX),
        );
        let (result, current, pending) = self.pipeline.state(timeout);
        match result {
            Ok(gst::StateChangeSuccess::Async) => Err(GraphError::StateQuery(format!(
                "still changing from {current:?} to {pending:?}"
            ))),
            Ok(_) => Ok(current.into()),
            Err(_) => Err(GraphError::StateQuery(format!(
                "state change failed in {current:?}"
            ))),
        }
    }

    fn emit_control_signal(
        &mut self,
        target: Target<'_>,
        signal: ControlSignal,
    ) -> GraphResult<()> {
        match (&signal, target) {
            (ControlSignal::EndOfStream, Target::Graph) => {
                if self.pipeline.send_event(gst::event::Eos::new()) {
                    Ok(())
                } else {
                    Err(Self::signal_error(target, &signal, "event not handled"))
                }
            }
            (ControlSignal::EndOfStream, Target::Stage(name)) => {
                if self.stage(name)?.send_event(gst::event::Eos::new()) {
                    Ok(())
                } else {
                    Err(Self::signal_error(target, &signal, "event not handled"))
                }
            }
            (ControlSignal::SplitAfter, Target::Stage(name)) => {
                self.inner(name, "sink")?
                    .emit_by_name::<()>("split-after", &[]);
                Ok(())
            }
            (
                ControlSignal::AddDestination { host, port }
                | ControlSignal::RemoveDestination { host, port },
                Target::Stage(name),
            ) => {
                let sink = self.inner(name, "udpsink")?;
                sink.emit_by_name::<()>(signal.name(), &[host, &i32::from(*port)]);
                Ok(())
            }
            (_, Target::Graph) => Err(Self::signal_error(
                target,
                &signal,
                "signal must target a stage",
            )),
        }
    }

    fn pop_event(&mut self, timeout: Duration) -> Option<GraphEvent> {
        let timeout = gst::ClockTime::from_mseconds(
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        );
        let msg = self.bus.timed_pop_filtered(
            timeout,
            &[
                gst::MessageType::Info,
                gst::MessageType::Warning,
                gst::MessageType::Error,
                gst::MessageType::Eos,
                gst::MessageType::StateChanged,
            ],
        )?;

        let source = msg
            .src()
            .map(|s| s.path_string().to_string())
            .unwrap_or_default();

        use gst::MessageView;
        let event = match msg.view() {
            MessageView::Info(m) => GraphEvent::Info {
                source,
                message: m.error().to_string(),
                debug: m.debug().map(|d| d.to_string()),
            },
            MessageView::Warning(m) => GraphEvent::Warning {
                source,
                message: m.error().to_string(),
                debug: m.debug().map(|d| d.to_string()),
            },
            MessageView::Error(m) => GraphEvent::Error {
                source,
                message: m.error().to_string(),
                debug: m.debug().map(|d| d.to_string()),
            },
            MessageView::Eos(_) => GraphEvent::EndOfStream,
            MessageView::StateChanged(s) => GraphEvent::StateChanged {
                source,
                old: s.old().into(),
                new: s.current().into(),
                top_level: msg.src() == Some(self.pipeline.upcast_ref::<gst::Object>()),
            },
            _ => return None,
        };
        Some(event)
    }

    fn describe(&self) -> Vec<StageStatus> {
        let mut statuses = Vec::new();
        let mut elements = self.pipeline.iterate_recurse();
        while let Ok(Some(element)) = elements.next() {
            let (_, current, pending) = element.state(gst::ClockTime::ZERO);
            statuses.push(StageStatus {
                name: element.name().to_string(),
                current: current.into(),
                pending: (pending != gst::State::VoidPending).then(|| pending.into()),
            });
        }
        statuses
    }

    fn dump_diagnostic(&self, name: &str) {
        self.pipeline
            .debug_to_dot_file(gst::DebugGraphDetails::all(), name);
    }
}

impl Drop for GstGraph {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_fan_out_pad_is_unlinked_at_once() {
        gst::init().unwrap();
        let pipeline = gst::Pipeline::new();
        let tee = gst::ElementFactory::make("tee").build().unwrap();
        let sink = gst::ElementFactory::make("fakesink").build().unwrap();
        pipeline.add_many([&tee, &sink]).unwrap();
        tee.link(&sink).unwrap();

        let pad = tee.src_pads().into_iter().next().unwrap();
        let peer = pad.peer().unwrap();

        assert!(unlink_when_idle(&pad, &peer));
        assert!(pad.peer().is_none());
    }
}
