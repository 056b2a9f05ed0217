//! The per-sensor pipeline.
//!
//! A [`SonoTraceSession`] owns everything one simulated sensor needs: the
//! generated inputs, the scene registry, a trace backend and the dispatcher
//! that schedules cycles on it. The host drives it by calling
//! [`tick`](SonoTraceSession::tick) once per frame; finished cycles show up as
//! [`SimulationOutput`]s and as [`SonoTraceEvent`]s.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use rand::SeedableRng;
use rand_pcg::Pcg32;

use crate::config::{FieldOfView, GeneratedInputs, SonoTraceDesc};
use crate::error::{Result, SonoTraceError};
use crate::events::SonoTraceEvent;
use crate::math::{Pose, Vec3};
use crate::output::{CaptureFrame, OutputAssembler, SimulationOutput};
use crate::parser::{HitParser, ParseContext, ParsedHits};
use crate::propagation::{
    DiffractionSettings, PropagationInputs, SpecularSettings, select_diffraction_objects,
    simulate_diffraction, simulate_direct_path, simulate_specular,
};
use crate::sampling::{RaySet, direct_path_angles};
use crate::scene::{
    MeshDataSettings, MeshInstanceDesc, Mobility, PersistentPrimitiveId, Registration,
    SceneGeometry, SceneRegistry, TriangleMesh,
};
use crate::trace::{
    CycleHandle, RunMode, RunState, SensorConfig, TraceBackend, TraceDispatcher, TraceRequest,
};

const PARSE_RATE_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Frame a position handed to the emitter and receiver setters is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateSpace {
    /// Relative to the sensor (or to the static receiver anchor)
    SensorLocal,
    World,
}

/// Body the sensor is mounted on.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Mount {
    pose: Pose,
    /// Sensor pose in the owner's frame
    sensor_offset: Pose,
}

/// State captured when a cycle is dispatched, consumed when it is parsed.
struct PendingCycle {
    handle: CycleHandle,
    frame: CaptureFrame,
    geometry: Arc<SceneGeometry>,
    num_distribution_rays: usize,
    num_direct_path_rays: usize,
}

struct ParseRate {
    window_start: Option<Instant>,
    parses: u32,
}

pub struct SonoTraceSession<B: TraceBackend> {
    desc: SonoTraceDesc,
    inputs: GeneratedInputs,
    backend: B,
    dispatcher: TraceDispatcher,
    registry: SceneRegistry,
    geometry: Arc<SceneGeometry>,
    assembler: OutputAssembler,
    specular: SpecularSettings,
    diffraction: DiffractionSettings,
    rng: Pcg32,
    started: Instant,

    sensor_pose: Pose,
    mount: Option<Mount>,
    /// Sensor-relative, offsets applied
    emitter_positions: Vec<Vec3>,
    /// Relative to the receiver frame, offsets and array pattern applied
    receiver_positions: Vec<Vec3>,
    /// Frame static receivers are expressed in, fixed on the first tick
    receiver_anchor: Option<Pose>,

    signal_indexes: Vec<usize>,
    signal_override: Option<Vec<usize>>,
    /// Trigger waiting for the next tick when ray tracing is off
    simulation_requested: bool,

    pending: Option<PendingCycle>,
    latest_output: Option<SimulationOutput>,
    outputs_produced: u64,
    parse_rate: ParseRate,

    event_sender: Sender<SonoTraceEvent>,
    event_receiver: Receiver<SonoTraceEvent>,
}

impl<B: TraceBackend> SonoTraceSession<B> {
    /// Creates a session that traces on `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if `desc` fails validation or one of its profiles cannot
    /// be resolved
    pub fn new(desc: SonoTraceDesc, mut backend: B) -> Result<Self> {
        let inputs = GeneratedInputs::from_desc(&desc)?;

        let mode = if desc.trigger_only {
            RunMode::TriggerOnly
        } else {
            RunMode::Continuous {
                rate_hz: desc.simulation_rate_hz,
            }
        };
        let mut registry = SceneRegistry::new(
            inputs.profiles.clone(),
            MeshDataSettings {
                curvature: desc.curvature,
                diffraction_size_threshold: desc.diffraction_triangle_size_threshold,
                generation_attempts: desc.mesh_generation_attempts,
            },
        );
        let geometry = registry.geometry();
        backend.update_scene(Arc::clone(&geometry));

        let rng = match desc.random_seed {
            Some(seed) => Pcg32::seed_from_u64(seed),
            None => Pcg32::seed_from_u64(rand::random()),
        };
        let receiver_anchor = desc
            .static_receivers
            .filter(|statics| statics.world_coordinates)
            .map(|_| Pose::identity());

        if !desc.enable_ray_tracing && desc.ray_tracing_required() {
            log::info!("Ray tracing enabled because specular or direct path output is requested");
        }
        log::info!(
            "SonoTrace session created: {} rays, {} emitters, {} receivers, {} frequencies, {:?}",
            inputs.rays.len(),
            inputs.emitter_positions.len(),
            inputs.receiver_positions.len(),
            inputs.frequencies.len(),
            mode
        );

        let (event_sender, event_receiver) = unbounded();
        Ok(Self {
            specular: SpecularSettings {
                only_last_hits: desc.specular_only_last_hits,
                min_strength: desc.specular_min_strength,
            },
            diffraction: DiffractionSettings::from_desc(&desc),
            assembler: OutputAssembler::new(desc.points_in_sensor_frame, desc.enable_sub_outputs),
            dispatcher: TraceDispatcher::new(mode),
            emitter_positions: inputs.emitter_positions.clone(),
            receiver_positions: inputs.receiver_positions.clone(),
            signal_indexes: inputs.default_signal_indexes.clone(),
            desc,
            inputs,
            backend,
            registry,
            geometry,
            rng,
            started: Instant::now(),
            sensor_pose: Pose::identity(),
            mount: None,
            receiver_anchor,
            signal_override: None,
            simulation_requested: false,
            pending: None,
            latest_output: None,
            outputs_produced: 0,
            parse_rate: ParseRate {
                window_start: None,
                parses: 0,
            },
            event_sender,
            event_receiver,
        })
    }

    pub fn desc(&self) -> &SonoTraceDesc {
        &self.desc
    }

    pub fn generated_inputs(&self) -> &GeneratedInputs {
        &self.inputs
    }

    pub fn frequencies(&self) -> &[f32] {
        &self.inputs.frequencies
    }

    pub fn dispatcher(&self) -> &TraceDispatcher {
        &self.dispatcher
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Output of the most recent cycle, kept until the next one replaces it.
    pub fn latest_output(&self) -> Option<&SimulationOutput> {
        self.latest_output.as_ref()
    }

    pub fn take_latest_output(&mut self) -> Option<SimulationOutput> {
        self.latest_output.take()
    }

    /// Drains every event emitted since the last call.
    pub fn poll_events(&self) -> Vec<SonoTraceEvent> {
        self.event_receiver.try_iter().collect()
    }

    fn emit(&self, event: SonoTraceEvent) {
        // both channel ends live in the session, so sending cannot fail
        let _ = self.event_sender.send(event);
    }

    pub fn is_simulation_enabled(&self) -> bool {
        self.desc.enable_simulation
    }

    pub fn set_simulation_enabled(&mut self, enabled: bool) {
        if self.desc.enable_simulation != enabled {
            log::info!(
                "Simulation {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        self.desc.enable_simulation = enabled;
    }

    /// Advances the pipeline by one host frame.
    ///
    /// Retries deferred mesh registrations, pushes scene changes to the backend,
    /// dispatches a requested cycle and parses a finished one. When ray tracing
    /// is off, diffraction runs directly on every tick in continuous mode or on
    /// the tick after a trigger.
    pub fn tick(&mut self, now: Instant) {
        if !self.desc.enable_simulation {
            return;
        }

        self.retry_registrations();
        self.sync_geometry();
        if self.receiver_anchor.is_none() && self.desc.static_receivers.is_some() {
            log::debug!("Static receivers anchored at {:?}", self.sensor_pose);
            self.receiver_anchor = Some(self.sensor_pose);
        }

        if self.desc.ray_tracing_required() {
            self.dispatcher.clock(now);
            if self.dispatcher.state() == RunState::RunRequested
                && self.dispatcher.in_flight().is_none()
            {
                self.dispatch_cycle(now);
            }
            self.dispatcher.poll(&mut self.backend);
            if self.dispatcher.state() == RunState::ResultAvailable {
                self.parse_cycle(now);
            }
        } else if self.simulation_requested || !self.desc.trigger_only {
            self.simulation_requested = false;
            let frame = self.capture_frame(now);
            let geometry = Arc::clone(&self.geometry);
            let output = self.simulate(frame, &geometry, None);
            self.publish(output);
        }
    }

    fn retry_registrations(&mut self) {
        let report = self.registry.retry_pending();
        for id in report.registered {
            self.emit_registered(id);
        }
        for (id, error) in report.abandoned {
            self.emit(SonoTraceEvent::ObjectRegistrationFailed { id, error });
        }
    }

    fn sync_geometry(&mut self) {
        let geometry = self.registry.geometry();
        if geometry.generation() != self.geometry.generation() {
            log::debug!(
                "Scene generation {} with {} instances",
                geometry.generation(),
                geometry.len()
            );
            self.backend.update_scene(Arc::clone(&geometry));
            self.geometry = geometry;
        }
    }

    fn capture_frame(&self, now: Instant) -> CaptureFrame {
        CaptureFrame {
            index: 0,
            timestamp: now.saturating_duration_since(self.started).as_secs_f64(),
            sensor_pose: self.sensor_pose,
            owner_pose: self.mount.map(|m| m.pose),
            emitter_poses: self.emitter_world_poses(),
            receiver_poses: self.receiver_world_poses(),
            emitter_signal_indexes: self
                .signal_override
                .clone()
                .unwrap_or_else(|| self.signal_indexes.clone()),
        }
    }

    fn dispatch_cycle(&mut self, now: Instant) {
        let frame = self.capture_frame(now);
        let distribution = &self.inputs.rays;
        let rays = if self.desc.enable_direct_path {
            distribution.with_direct_path(&direct_path_angles(
                &frame.sensor_pose,
                &frame.receiver_poses,
            ))
        } else {
            distribution.clone()
        };
        let num_distribution_rays = distribution.len();
        let num_direct_path_rays = rays.len() - num_distribution_rays;
        if rays.is_empty() {
            log::warn!("No rays to trace this cycle");
        }

        let sensor = SensorConfig {
            pose: frame.sensor_pose,
            max_distance: self.desc.max_ray_distance,
            emitter_positions: self.emitter_positions.clone(),
        };
        let request = TraceRequest {
            azimuths: rays.azimuths,
            elevations: rays.elevations,
            num_distribution_rays,
            max_bounces: self.desc.max_bounces,
            emitter_count: self.emitter_positions.len(),
            sensor_buffer: sensor.pack(),
        };
        let total_rays = request.num_rays();

        match self.dispatcher.dispatch(&mut self.backend, request, now) {
            Ok(handle) => {
                self.emit(SonoTraceEvent::CycleDispatched {
                    cycle: handle.index(),
                    rays: total_rays,
                });
                self.pending = Some(PendingCycle {
                    handle,
                    frame,
                    geometry: Arc::clone(&self.geometry),
                    num_distribution_rays,
                    num_direct_path_rays,
                });
            }
            Err(e) => log::error!("Failed to dispatch trace cycle: {}", e),
        }
    }

    fn parse_cycle(&mut self, now: Instant) {
        let Some(pending) = self.pending.take() else {
            log::error!("Trace result available without a dispatched cycle, discarding it");
            self.dispatcher.parse_with(|_| ());
            return;
        };

        let emitter_positions: Vec<Vec3> =
            pending.frame.emitter_poses.iter().map(|p| p.position).collect();
        let receiver_positions: Vec<Vec3> =
            pending.frame.receiver_poses.iter().map(|p| p.position).collect();
        let context = ParseContext {
            num_distribution_rays: pending.num_distribution_rays,
            num_direct_path_rays: pending.num_direct_path_rays,
            max_bounces: self.desc.max_bounces,
            max_ray_distance: self.desc.max_ray_distance,
            sensor: pending.frame.sensor_pose,
            emitter_positions: &emitter_positions,
            emitter_directivities: self.inputs.emitter_directivities.as_deref(),
            receiver_positions: &receiver_positions,
        };

        let registry = &mut self.registry;
        let events = &self.event_sender;
        let geometry = &pending.geometry;
        let parsed = self.dispatcher.parse_with(|view| {
            if !view.is_complete() {
                let _ = events.send(SonoTraceEvent::ReadbackSizeMismatch {
                    cycle: view.handle().index(),
                    expected: view.expected_len(),
                    actual: view.len(),
                });
            }
            HitParser::new(context).parse(view, geometry, registry)
        });
        let Some(parsed) = parsed else {
            log::warn!("Could not parse {} yet", pending.handle);
            self.pending = Some(pending);
            return;
        };

        for (id, identity) in &parsed.new_identities {
            self.emit(SonoTraceEvent::ObjectRegistered {
                id: *id,
                label: identity.label.clone(),
            });
        }
        self.emit(SonoTraceEvent::CycleParsed {
            cycle: pending.handle.index(),
            points: parsed.points.len(),
        });
        self.record_parse(now);

        let output = self.simulate(pending.frame, &pending.geometry, Some(parsed));
        self.publish(output);
    }

    fn record_parse(&mut self, now: Instant) {
        let rate = &mut self.parse_rate;
        let window_start = *rate.window_start.get_or_insert(now);
        rate.parses += 1;
        let elapsed = now.saturating_duration_since(window_start);
        if elapsed >= PARSE_RATE_LOG_INTERVAL {
            log::info!(
                "Parsing trace results at {:.2} Hz",
                rate.parses as f32 / elapsed.as_secs_f32()
            );
            rate.window_start = Some(now);
            rate.parses = 0;
        }
    }

    /// Runs the enabled propagation components and assembles the output.
    ///
    /// Without parsed hits, diffraction candidates come from a range query
    /// around the sensor and the traced components are skipped.
    fn simulate(
        &mut self,
        mut frame: CaptureFrame,
        geometry: &SceneGeometry,
        parsed: Option<ParsedHits>,
    ) -> SimulationOutput {
        let traced = parsed.is_some();
        let ParsedHits {
            points,
            hit_objects,
            direct_path,
            ..
        } = parsed.unwrap_or_default();
        let line_of_sight: Vec<bool> = direct_path.iter().map(|s| s.line_of_sight).collect();

        let emitter_positions: Vec<Vec3> = frame.emitter_poses.iter().map(|p| p.position).collect();
        let inputs = PropagationInputs {
            frequencies: &self.inputs.frequencies,
            sensor: frame.sensor_pose,
            emitter_positions: &emitter_positions,
            receivers: &frame.receiver_poses,
            receiver_directivities: self.inputs.receiver_directivities.as_deref(),
        };

        let diffraction = if self.desc.enable_diffraction {
            let objects = select_diffraction_objects(
                traced.then_some(hit_objects.as_slice()),
                &self.registry,
                geometry,
                &inputs,
                &self.diffraction,
            );
            Some(simulate_diffraction(
                &objects,
                &self.registry,
                geometry,
                &inputs,
                &self.diffraction,
                &mut self.rng,
            ))
        } else {
            None
        };
        let specular = (self.desc.enable_specular && traced)
            .then(|| simulate_specular(points, hit_objects, &inputs, &self.specular));
        let direct = (self.desc.enable_direct_path && traced).then(|| {
            simulate_direct_path(&line_of_sight, &inputs, self.desc.direct_path_strength)
        });

        self.outputs_produced += 1;
        frame.index = self.outputs_produced;
        self.assembler
            .assemble(frame, line_of_sight, specular, diffraction, direct)
    }

    fn publish(&mut self, output: SimulationOutput) {
        self.signal_override = None;
        log::debug!(
            "Output {}: {} points, maximum strength {:.3e}",
            output.index,
            output.reflected_points.len(),
            output.maximum_strength
        );
        self.emit(SonoTraceEvent::OutputReady {
            cycle: output.index,
            points: output.reflected_points.len(),
            maximum_strength: output.maximum_strength,
        });
        self.latest_output = Some(output);
    }

    /// Requests one cycle in trigger-only mode.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` if the simulation is disabled, the session runs
    /// continuously or a previous cycle has not been parsed yet. Nothing changes
    /// when a trigger is rejected.
    pub fn trigger(&mut self) -> Result<()> {
        self.request_trigger(None)
    }

    /// Like [`trigger`](Self::trigger), with emitter signal indexes that apply to
    /// this cycle only. An empty list is the same as no override.
    ///
    /// # Errors
    ///
    /// Additionally returns `InvalidSignalOverride` if the list does not have one
    /// in-range index per emitter
    pub fn trigger_with_signals(&mut self, signal_indexes: Vec<usize>) -> Result<()> {
        let signal_override = (!signal_indexes.is_empty()).then_some(signal_indexes);
        self.request_trigger(signal_override)
    }

    fn request_trigger(&mut self, signal_override: Option<Vec<usize>>) -> Result<()> {
        if let Err(e) = self.accept_trigger(signal_override.as_deref()) {
            log::warn!("Trigger rejected: {}", e);
            self.emit(SonoTraceEvent::TriggerRejected {
                reason: e.to_string(),
            });
            return Err(e);
        }
        self.signal_override = signal_override;
        Ok(())
    }

    fn accept_trigger(&mut self, signal_override: Option<&[usize]>) -> Result<()> {
        if !self.desc.enable_simulation {
            return Err(SonoTraceError::Rejected("Simulation is disabled".into()));
        }
        if !self.desc.trigger_only {
            return Err(SonoTraceError::Rejected(
                "Triggers are only accepted in trigger-only mode".into(),
            ));
        }
        if let Some(indexes) = signal_override {
            self.check_signal_override(indexes)?;
        }

        if self.desc.ray_tracing_required() {
            if !self.dispatcher.request_run() {
                return Err(SonoTraceError::Rejected(format!(
                    "Cycle {} is still running",
                    self.dispatcher.execution_counter()
                )));
            }
        } else if self.simulation_requested {
            return Err(SonoTraceError::Rejected(
                "A simulation is already scheduled".into(),
            ));
        } else {
            self.simulation_requested = true;
        }
        Ok(())
    }

    fn check_signal_override(&self, indexes: &[usize]) -> Result<()> {
        if indexes.len() != self.emitter_positions.len() {
            return Err(SonoTraceError::InvalidSignalOverride(format!(
                "{} indexes for {} emitters",
                indexes.len(),
                self.emitter_positions.len()
            )));
        }
        if let Some(&index) = indexes.iter().find(|&&i| i >= self.emitter_signal_count()) {
            return Err(SonoTraceError::InvalidSignalOverride(format!(
                "signal index {} out of range ({} signals)",
                index,
                self.emitter_signal_count()
            )));
        }
        Ok(())
    }

    pub fn emitter_signals(&self) -> &[Vec<f32>] {
        &self.desc.emitter_signals
    }

    pub fn emitter_signal_count(&self) -> usize {
        self.desc.emitter_signals.len()
    }

    pub fn emitter_signal_indexes(&self) -> &[usize] {
        &self.signal_indexes
    }

    pub fn emitter_signal_index(&self, emitter: usize) -> Result<usize> {
        self.signal_indexes
            .get(emitter)
            .copied()
            .ok_or(SonoTraceError::InvalidIndex {
                kind: "emitter",
                index: emitter,
                len: self.signal_indexes.len(),
            })
    }

    /// # Errors
    ///
    /// Returns `InvalidIndex` if either index is out of range
    pub fn set_emitter_signal_index(&mut self, emitter: usize, signal: usize) -> Result<()> {
        if signal >= self.emitter_signal_count() {
            return Err(SonoTraceError::InvalidIndex {
                kind: "signal",
                index: signal,
                len: self.emitter_signal_count(),
            });
        }
        let len = self.signal_indexes.len();
        let slot = self
            .signal_indexes
            .get_mut(emitter)
            .ok_or(SonoTraceError::InvalidIndex {
                kind: "emitter",
                index: emitter,
                len,
            })?;
        *slot = signal;
        Ok(())
    }

    /// Replaces every emitter's signal index at once.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` if the list does not have one entry per emitter and
    /// `InvalidIndex` if an entry is out of range. The current indexes are left
    /// untouched on error.
    pub fn set_emitter_signal_indexes(&mut self, indexes: Vec<usize>) -> Result<()> {
        if indexes.is_empty() || indexes.len() != self.signal_indexes.len() {
            return Err(SonoTraceError::Rejected(format!(
                "Expected {} signal indexes, got {}",
                self.signal_indexes.len(),
                indexes.len()
            )));
        }
        if let Some(&index) = indexes.iter().find(|&&i| i >= self.emitter_signal_count()) {
            return Err(SonoTraceError::InvalidIndex {
                kind: "signal",
                index,
                len: self.emitter_signal_count(),
            });
        }
        self.signal_indexes = indexes;
        Ok(())
    }

    pub fn sensor_pose(&self) -> Pose {
        self.sensor_pose
    }

    /// Moves the sensor. With an owner attached the mount offset follows.
    pub fn set_sensor_world_pose(&mut self, pose: Pose) {
        self.sensor_pose = pose;
        if let Some(mount) = &mut self.mount {
            mount.sensor_offset = pose.relative_to(&mount.pose);
        }
    }

    /// Mounts the sensor on a body at `owner_pose`, keeping the sensor where it is.
    pub fn attach_owner(&mut self, owner_pose: Pose) {
        self.mount = Some(Mount {
            pose: owner_pose,
            sensor_offset: self.sensor_pose.relative_to(&owner_pose),
        });
    }

    pub fn detach_owner(&mut self) {
        self.mount = None;
    }

    pub fn owner_pose(&self) -> Option<Pose> {
        self.mount.map(|m| m.pose)
    }

    /// Moves the owner; the sensor keeps its offset from it.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` if no owner is attached
    pub fn set_owner_world_pose(&mut self, pose: Pose) -> Result<()> {
        let mount = self
            .mount
            .as_mut()
            .ok_or_else(|| SonoTraceError::Rejected("No owner attached".into()))?;
        mount.pose = pose;
        self.sensor_pose = pose.compose(&mount.sensor_offset);
        Ok(())
    }

    /// Places the sensor relative to its owner.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` if no owner is attached
    pub fn set_sensor_relative_pose(&mut self, relative: Pose) -> Result<()> {
        let mount = self
            .mount
            .as_mut()
            .ok_or_else(|| SonoTraceError::Rejected("No owner attached".into()))?;
        mount.sensor_offset = relative;
        self.sensor_pose = mount.pose.compose(&relative);
        Ok(())
    }

    pub fn set_field_of_view(&mut self, field_of_view: FieldOfView) -> Result<()> {
        field_of_view.validate()?;
        self.inputs.rays = RaySet::generate(self.desc.initial_rays, &field_of_view);
        self.desc.field_of_view = field_of_view;
        self.diffraction.field_of_view = field_of_view;
        log::info!(
            "Field of view set to {:?}, {} rays",
            field_of_view,
            self.inputs.rays.len()
        );
        Ok(())
    }

    pub fn emitter_count(&self) -> usize {
        self.emitter_positions.len()
    }

    pub fn receiver_count(&self) -> usize {
        self.receiver_positions.len()
    }

    /// Sensor-relative emitter positions.
    pub fn emitter_positions(&self) -> &[Vec3] {
        &self.emitter_positions
    }

    /// Receiver positions relative to the sensor, or to the static anchor when
    /// receivers are static.
    pub fn receiver_positions(&self) -> &[Vec3] {
        &self.receiver_positions
    }

    /// # Errors
    ///
    /// Returns `InvalidIndex` if `index` is not an emitter
    pub fn set_emitter_position(
        &mut self,
        index: usize,
        position: Vec3,
        space: CoordinateSpace,
        apply_offset: bool,
    ) -> Result<()> {
        let local = match space {
            CoordinateSpace::SensorLocal => position,
            CoordinateSpace::World => self.sensor_pose.inverse_transform_point(position),
        };
        let offset = if apply_offset {
            self.desc.emitter_offset
        } else {
            Vec3::ZERO
        };
        let len = self.emitter_positions.len();
        let slot = self
            .emitter_positions
            .get_mut(index)
            .ok_or(SonoTraceError::InvalidIndex {
                kind: "emitter",
                index,
                len,
            })?;
        *slot = local + offset;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `InvalidIndex` if `index` is not a receiver
    pub fn set_receiver_position(
        &mut self,
        index: usize,
        position: Vec3,
        space: CoordinateSpace,
        apply_offset: bool,
    ) -> Result<()> {
        let local = match space {
            CoordinateSpace::SensorLocal => position,
            CoordinateSpace::World => self.receiver_frame().inverse_transform_point(position),
        };
        let offset = if apply_offset {
            self.desc.receiver_offset
        } else {
            Vec3::ZERO
        };
        let len = self.receiver_positions.len();
        let slot = self
            .receiver_positions
            .get_mut(index)
            .ok_or(SonoTraceError::InvalidIndex {
                kind: "receiver",
                index,
                len,
            })?;
        *slot = local + offset;
        Ok(())
    }

    fn receiver_frame(&self) -> Pose {
        match self.desc.static_receivers {
            Some(_) => self.receiver_anchor.unwrap_or(self.sensor_pose),
            None => self.sensor_pose,
        }
    }

    /// Emitters share the sensor's orientation.
    pub fn emitter_world_poses(&self) -> Vec<Pose> {
        let sensor = self.sensor_pose;
        self.emitter_positions
            .iter()
            .map(|&p| Pose::new(sensor.transform_point(p), sensor.rotation))
            .collect()
    }

    pub fn receiver_world_poses(&self) -> Vec<Pose> {
        let frame = self.receiver_frame();
        self.receiver_positions
            .iter()
            .map(|&p| Pose::new(frame.transform_point(p), frame.rotation))
            .collect()
    }

    pub fn registry(&self) -> &SceneRegistry {
        &self.registry
    }

    /// Direct registry access. Changes reach the backend on the next tick.
    pub fn registry_mut(&mut self) -> &mut SceneRegistry {
        &mut self.registry
    }

    /// Registers a mesh component, emitting an event once it is registered or
    /// if registration fails.
    ///
    /// # Errors
    ///
    /// Returns the registry's error for duplicate ids or unusable meshes
    pub fn register_mesh_instance(
        &mut self,
        id: PersistentPrimitiveId,
        desc: MeshInstanceDesc,
    ) -> Result<Registration> {
        match self.registry.register_mesh_instance(id, desc) {
            Ok(registration) => {
                if registration == Registration::Registered {
                    self.emit_registered(id);
                }
                Ok(registration)
            }
            Err(e) => {
                self.emit(SonoTraceEvent::ObjectRegistrationFailed {
                    id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn emit_registered(&self, id: PersistentPrimitiveId) {
        let label = self
            .registry
            .resolve_identity(id)
            .map(|identity| identity.label.clone())
            .unwrap_or_default();
        self.emit(SonoTraceEvent::ObjectRegistered { id, label });
    }

    pub fn add_passive_geometry(
        &mut self,
        id: PersistentPrimitiveId,
        owner: impl Into<String>,
        resource: impl Into<String>,
        mesh: Arc<TriangleMesh>,
        pose: Pose,
        mobility: Mobility,
    ) -> Result<()> {
        self.registry
            .add_passive_geometry(id, owner, resource, mesh, pose, mobility)
    }

    pub fn unregister(&mut self, id: PersistentPrimitiveId) -> Result<()> {
        self.registry.unregister(id)
    }

    pub fn set_object_pose(&mut self, id: PersistentPrimitiveId, pose: Pose) -> Result<()> {
        self.registry.set_instance_pose(id, pose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticReceivers;
    use crate::output::PointKind;
    use crate::scene::MeshLoader;
    use crate::trace::{InlineTraceBackend, TracePoll};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts submissions and never finishes them.
    #[derive(Default)]
    struct StalledBackend {
        submitted: usize,
    }

    impl TraceBackend for StalledBackend {
        fn submit(&mut self, _handle: CycleHandle, _request: TraceRequest) -> Result<()> {
            self.submitted += 1;
            Ok(())
        }

        fn poll(&mut self, _handle: CycleHandle) -> TracePoll {
            TracePoll::Pending
        }
    }

    fn small_desc() -> SonoTraceDesc {
        SonoTraceDesc::new()
            .initial_rays(300)
            .frequencies(2, 20_000.0, 40_000.0)
            .receivers(vec![Vec3::new(0.0, 10.0, 0.0)])
            .random_seed(11)
    }

    fn wall_desc() -> MeshInstanceDesc {
        MeshInstanceDesc::new(
            "room",
            "wall",
            "plane",
            Arc::new(TriangleMesh::plane(400.0, 400.0)),
        )
        .pose(Pose::from_euler_degrees(
            Vec3::new(200.0, 0.0, 0.0),
            0.0,
            -90.0,
            0.0,
        ))
    }

    /// Routes session logs through the test harness; `RUST_LOG` picks the level.
    fn init_logging() {
        let _ = env_logger::Builder::from_default_env()
            .is_test(true)
            .try_init();
    }

    fn session_with_wall(desc: SonoTraceDesc) -> SonoTraceSession<InlineTraceBackend> {
        init_logging();
        let mut session = SonoTraceSession::new(desc, InlineTraceBackend::default()).unwrap();
        session
            .register_mesh_instance(PersistentPrimitiveId(1), wall_desc())
            .unwrap();
        session
    }

    #[test]
    fn test_triggered_cycle_produces_output() {
        let mut session = session_with_wall(small_desc().components(true, false, true));
        let now = Instant::now();

        session.tick(now);
        assert!(session.latest_output().is_none());

        session.trigger().unwrap();
        session.tick(now);

        let output = session.latest_output().unwrap();
        assert_eq!(output.index, 1);
        assert_eq!(session.dispatcher().execution_counter(), 1);
        assert_eq!(session.dispatcher().state(), RunState::Idle);

        let specular: Vec<_> = output.points_of(PointKind::Specular).collect();
        assert!(!specular.is_empty());
        assert!(specular.iter().all(|p| p.label == "room_wall_plane"));
        assert!(output.maximum_strength > 0.0);

        assert_eq!(output.direct_path_line_of_sight, vec![true]);
        let direct: Vec<_> = output.points_of(PointKind::DirectPath).collect();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].label, "DIRECT_EMITTER_0");

        let events = session.poll_events();
        assert!(matches!(
            events[0],
            SonoTraceEvent::ObjectRegistered { id: PersistentPrimitiveId(1), .. }
        ));
        assert!(events.iter().any(|e| matches!(
            e,
            SonoTraceEvent::CycleDispatched { cycle: 1, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            SonoTraceEvent::OutputReady { cycle: 1, .. }
        )));
        assert!(session.poll_events().is_empty());
    }

    #[test]
    fn test_receiver_behind_wall_is_blocked() {
        let desc = small_desc()
            .components(false, false, true)
            .receivers(vec![Vec3::new(300.0, 0.0, 0.0), Vec3::new(0.0, 50.0, 0.0)]);
        let mut session = session_with_wall(desc);
        session.trigger().unwrap();
        session.tick(Instant::now());

        let output = session.latest_output().unwrap();
        assert_eq!(output.direct_path_line_of_sight, vec![false, true]);
        let point = output.points_of(PointKind::DirectPath).next().unwrap();
        assert_eq!(point.strengths.get(0, 0, 0), Some(0.0));
        assert!(point.strengths.get(0, 1, 0).unwrap() > 0.0);
    }

    #[test]
    fn test_trigger_rejected_while_cycle_pending() {
        let mut session =
            SonoTraceSession::new(small_desc(), StalledBackend::default()).unwrap();
        let now = Instant::now();

        session.trigger().unwrap();
        session.tick(now);
        assert_eq!(session.backend().submitted, 1);
        assert!(session.dispatcher().in_flight().is_some());

        let result = session.trigger();
        assert!(matches!(result, Err(SonoTraceError::Rejected(_))));
        assert_eq!(session.dispatcher().execution_counter(), 1);
        assert!(session.poll_events().iter().any(|e| matches!(
            e,
            SonoTraceEvent::TriggerRejected { .. }
        )));

        session.tick(now + Duration::from_secs(1));
        assert_eq!(session.backend().submitted, 1);
        assert!(session.latest_output().is_none());
    }

    #[test]
    fn test_continuous_mode_follows_rate() {
        let desc = small_desc()
            .components(true, false, false)
            .trigger_only(false)
            .simulation_rate(10.0);
        let mut session = session_with_wall(desc);
        let start = Instant::now();

        session.tick(start);
        assert_eq!(session.latest_output().map(|o| o.index), Some(1));

        session.tick(start + Duration::from_millis(50));
        assert_eq!(session.latest_output().map(|o| o.index), Some(1));

        session.tick(start + Duration::from_millis(150));
        assert_eq!(session.latest_output().map(|o| o.index), Some(2));
        assert_eq!(session.dispatcher().execution_counter(), 2);

        assert!(session.trigger().is_err());
    }

    #[test]
    fn test_disabled_session_does_nothing() {
        let mut session = session_with_wall(small_desc());
        session.set_simulation_enabled(false);
        assert!(session.trigger().is_err());
        session.tick(Instant::now());
        assert_eq!(session.dispatcher().execution_counter(), 0);
        assert!(session.latest_output().is_none());
    }

    #[test]
    fn test_signal_indexes_and_override() {
        let desc = small_desc()
            .components(false, false, true)
            .emitters(vec![Vec3::new(0.0, -5.0, 0.0), Vec3::new(0.0, 5.0, 0.0)])
            .emitter_signals(vec![vec![1.0], vec![0.5], vec![0.25]], vec![0, 1]);
        let mut session = SonoTraceSession::new(desc, InlineTraceBackend::default()).unwrap();
        assert_eq!(session.emitter_signal_indexes(), &[0, 1]);

        session.set_emitter_signal_index(1, 2).unwrap();
        assert_eq!(session.emitter_signal_index(1).unwrap(), 2);
        assert!(matches!(
            session.set_emitter_signal_index(2, 0),
            Err(SonoTraceError::InvalidIndex { kind: "emitter", .. })
        ));
        assert!(matches!(
            session.set_emitter_signal_index(0, 3),
            Err(SonoTraceError::InvalidIndex { kind: "signal", .. })
        ));
        assert!(session.set_emitter_signal_indexes(vec![1]).is_err());
        assert!(session.set_emitter_signal_indexes(vec![1, 7]).is_err());
        assert_eq!(session.emitter_signal_indexes(), &[0, 2]);

        assert!(matches!(
            session.trigger_with_signals(vec![5, 0]),
            Err(SonoTraceError::InvalidSignalOverride(_))
        ));
        assert!(matches!(
            session.trigger_with_signals(vec![1]),
            Err(SonoTraceError::InvalidSignalOverride(_))
        ));
        assert_eq!(session.dispatcher().state(), RunState::Idle);

        let now = Instant::now();
        session.trigger_with_signals(vec![2, 2]).unwrap();
        session.tick(now);
        let output = session.latest_output().unwrap();
        assert_eq!(output.emitter_signal_indexes, vec![2, 2]);
        assert_eq!(output.points_of(PointKind::DirectPath).count(), 2);

        // the override applied to one cycle only
        session.trigger().unwrap();
        session.tick(now);
        let output = session.latest_output().unwrap();
        assert_eq!(output.index, 2);
        assert_eq!(output.emitter_signal_indexes, vec![0, 2]);
    }

    #[test]
    fn test_owner_mount() {
        let mut session = session_with_wall(small_desc());
        assert!(session.set_owner_world_pose(Pose::identity()).is_err());
        assert!(session.set_sensor_relative_pose(Pose::identity()).is_err());

        session.attach_owner(Pose::from_position(Vec3::new(100.0, 0.0, 0.0)));
        session
            .set_owner_world_pose(Pose::from_position(Vec3::new(200.0, 0.0, 0.0)))
            .unwrap();
        assert!(session.sensor_pose().position.abs_diff_eq(Vec3::new(100.0, 0.0, 0.0), 1e-4));

        session
            .set_sensor_relative_pose(Pose::from_position(Vec3::new(0.0, 0.0, 50.0)))
            .unwrap();
        assert!(session.sensor_pose().position.abs_diff_eq(Vec3::new(200.0, 0.0, 50.0), 1e-4));
        assert_eq!(session.owner_pose().map(|p| p.position), Some(Vec3::new(200.0, 0.0, 0.0)));

        session.detach_owner();
        assert!(session.owner_pose().is_none());
    }

    #[test]
    fn test_emitter_and_receiver_placement() {
        let mut session = session_with_wall(small_desc());
        session.set_sensor_world_pose(Pose::from_euler_degrees(
            Vec3::new(100.0, 0.0, 0.0),
            0.0,
            0.0,
            90.0,
        ));

        session
            .set_emitter_position(0, Vec3::new(10.0, 0.0, 0.0), CoordinateSpace::SensorLocal, false)
            .unwrap();
        let emitter = session.emitter_world_poses()[0].position;
        // yawed 90°, forward is +Y
        assert!(emitter.abs_diff_eq(Vec3::new(100.0, 10.0, 0.0), 1e-4));

        session
            .set_receiver_position(0, Vec3::new(100.0, -20.0, 0.0), CoordinateSpace::World, false)
            .unwrap();
        assert!(session.receiver_positions()[0].abs_diff_eq(Vec3::new(-20.0, 0.0, 0.0), 1e-4));
        let receiver = session.receiver_world_poses()[0].position;
        assert!(receiver.abs_diff_eq(Vec3::new(100.0, -20.0, 0.0), 1e-4));

        assert!(matches!(
            session.set_emitter_position(3, Vec3::ZERO, CoordinateSpace::World, true),
            Err(SonoTraceError::InvalidIndex { kind: "emitter", index: 3, len: 1 })
        ));
        assert!(session
            .set_receiver_position(1, Vec3::ZERO, CoordinateSpace::SensorLocal, true)
            .is_err());
    }

    #[test]
    fn test_static_receivers_stay_put() {
        let mut desc = small_desc().receivers(vec![Vec3::new(10.0, 0.0, 0.0)]);
        desc.static_receivers = Some(StaticReceivers {
            world_coordinates: false,
        });
        let mut session = SonoTraceSession::new(desc.clone(), InlineTraceBackend::default()).unwrap();
        session.set_sensor_world_pose(Pose::from_position(Vec3::new(100.0, 0.0, 0.0)));
        session.tick(Instant::now());

        session.set_sensor_world_pose(Pose::from_position(Vec3::new(500.0, 0.0, 0.0)));
        let receiver = session.receiver_world_poses()[0].position;
        assert!(receiver.abs_diff_eq(Vec3::new(110.0, 0.0, 0.0), 1e-4));

        desc.static_receivers = Some(StaticReceivers {
            world_coordinates: true,
        });
        let mut session = SonoTraceSession::new(desc, InlineTraceBackend::default()).unwrap();
        session.set_sensor_world_pose(Pose::from_position(Vec3::new(500.0, 0.0, 0.0)));
        assert_eq!(
            session.receiver_world_poses()[0].position,
            Vec3::new(10.0, 0.0, 0.0)
        );
    }

    #[test]
    fn test_diffraction_without_ray_tracing() {
        let mut desc = small_desc()
            .initial_rays(2_000)
            .components(false, true, false)
            .trigger_only(false);
        desc.enable_ray_tracing = false;
        let mut session = SonoTraceSession::new(desc, InlineTraceBackend::default()).unwrap();
        session
            .register_mesh_instance(
                PersistentPrimitiveId(4),
                MeshInstanceDesc::new(
                    "rock",
                    "mesh",
                    "sphere",
                    Arc::new(TriangleMesh::uv_sphere(20.0, 16, 8)),
                )
                .pose(Pose::from_position(Vec3::new(150.0, 0.0, 0.0))),
            )
            .unwrap();

        let now = Instant::now();
        session.tick(now);
        let output = session.latest_output().unwrap();
        assert_eq!(session.dispatcher().execution_counter(), 0);
        assert!(output.points_of(PointKind::Diffraction).count() > 0);
        assert_eq!(output.points_of(PointKind::Specular).count(), 0);
        assert!(output.direct_path_line_of_sight.is_empty());

        // continuous without ray tracing runs every tick
        session.tick(now);
        assert_eq!(session.latest_output().map(|o| o.index), Some(2));
    }

    #[test]
    fn test_deferred_registration_events() {
        init_logging();
        let mut desc = small_desc();
        desc.mesh_generation_attempts = 3;
        let mut session = SonoTraceSession::new(desc, InlineTraceBackend::default()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let loader: MeshLoader = Arc::new(move || {
            (counter.fetch_add(1, Ordering::SeqCst) >= 2)
                .then(|| Arc::new(TriangleMesh::plane(100.0, 100.0)))
        });
        let never: MeshLoader = Arc::new(|| None);

        let late = wall_desc().deferred(loader);
        let missing = wall_desc().deferred(never);
        assert_eq!(
            session.register_mesh_instance(PersistentPrimitiveId(1), late).unwrap(),
            Registration::Deferred
        );
        assert_eq!(
            session.register_mesh_instance(PersistentPrimitiveId(2), missing).unwrap(),
            Registration::Deferred
        );
        assert!(session
            .register_mesh_instance(PersistentPrimitiveId(2), wall_desc())
            .is_err());
        assert!(matches!(
            &session.poll_events()[..],
            [SonoTraceEvent::ObjectRegistrationFailed { id: PersistentPrimitiveId(2), .. }]
        ));

        let now = Instant::now();
        session.tick(now);
        assert!(session.poll_events().is_empty());

        session.tick(now);
        let events = session.poll_events();
        assert!(events.contains(&SonoTraceEvent::ObjectRegistered {
            id: PersistentPrimitiveId(1),
            label: "room_wall_plane".into(),
        }));
        assert!(events.iter().any(|e| matches!(
            e,
            SonoTraceEvent::ObjectRegistrationFailed { id: PersistentPrimitiveId(2), .. }
        )));
        assert_eq!(session.registry().pending_count(), 0);
        assert!(session.registry().contains(PersistentPrimitiveId(1)));
    }

    #[test]
    fn test_field_of_view_update() {
        let mut session = session_with_wall(small_desc());
        let before = session.generated_inputs().rays.clone();

        assert!(session
            .set_field_of_view(FieldOfView::symmetric(200.0, 10.0))
            .is_err());
        assert_eq!(session.generated_inputs().rays, before);

        let narrow = FieldOfView::symmetric(10.0, 10.0);
        session.set_field_of_view(narrow).unwrap();
        let rays = &session.generated_inputs().rays;
        assert!(!rays.is_empty());
        assert!(rays
            .azimuths
            .iter()
            .zip(&rays.elevations)
            .all(|(az, el)| narrow.covers_degrees(az.to_degrees(), el.to_degrees())));
        assert_eq!(session.desc().field_of_view, narrow);
    }
}
