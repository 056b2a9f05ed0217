//! Reference ray-intersection backend running on the CPU.
//!
//! [`trace_rays`] fills the hit buffer exactly as a GPU backend would: one
//! row-major slot per ray and bounce. [`CpuTraceBackend`] runs it on a worker
//! thread so submission never blocks the caller; [`InlineTraceBackend`] runs it
//! during `submit` for deterministic single-threaded use.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use rayon::prelude::*;

use crate::error::{Result, SonoTraceError};
use crate::math::{Vec3, direction_from_angles};
use crate::scene::SceneGeometry;
use crate::trace::backend::{CycleHandle, SensorConfig, TraceBackend, TracePoll, TraceRequest};
use crate::trace::raw_hit::RawHit;

/// Distance (cm) a bounced ray is lifted off the surface before continuing.
const SURFACE_OFFSET: f32 = 1e-2;

/// Traces every ray of `request` against `geometry`.
///
/// # Errors
///
/// Returns an error if the sensor buffer is malformed or the angle arrays
/// differ in length
pub fn trace_rays(geometry: &SceneGeometry, request: &TraceRequest) -> Result<Vec<RawHit>> {
    if request.azimuths.len() != request.elevations.len() {
        return Err(SonoTraceError::Backend(format!(
            "{} azimuths but {} elevations",
            request.azimuths.len(),
            request.elevations.len()
        )));
    }
    let sensor = request.sensor_config()?;
    let emitters = sensor.emitter_world_positions();

    let mut rows = vec![RawHit::miss(); request.expected_rows()];
    if request.max_bounces == 0 {
        return Ok(rows);
    }

    rows.par_chunks_mut(request.max_bounces)
        .enumerate()
        .for_each(|(ray, chunk)| {
            let local = direction_from_angles(request.azimuths[ray], request.elevations[ray]);
            let direction = sensor.pose.rotate(local).normalize_or_zero();
            if ray < request.num_distribution_rays {
                trace_bounces(geometry, &sensor, &emitters, direction, chunk);
            } else {
                trace_direct_path(geometry, &sensor, direction, &mut chunk[0]);
            }
        });
    Ok(rows)
}

fn trace_bounces(
    geometry: &SceneGeometry,
    sensor: &SensorConfig,
    emitters: &[Vec3],
    mut direction: Vec3,
    rows: &mut [RawHit],
) {
    let mut origin = sensor.pose.position;
    let mut travelled = 0.0;
    let mut first_hit: Option<(Vec3, f32)> = None;

    for row in rows.iter_mut() {
        let remaining = sensor.max_distance - travelled;
        if remaining <= 0.0 {
            break;
        }
        let Some(hit) = geometry.cast_ray(origin, direction, remaining) else {
            break;
        };
        travelled += hit.distance;

        // face the incoming ray regardless of winding
        let normal = if hit.normal.dot(direction) > 0.0 {
            -hit.normal
        } else {
            hit.normal
        };
        let outgoing = (direction - 2.0 * direction.dot(normal) * normal).normalize_or_zero();
        let lifted = hit.position + normal * SURFACE_OFFSET;
        let (first_position, first_leg) = *first_hit.get_or_insert((hit.position, travelled));

        row.hit = 1;
        row.position = hit.position.to_array();
        row.reflection = (-outgoing).to_array();
        row.scene_primitive_index = i32::try_from(hit.scene_index).unwrap_or(-1);
        row.triangle_index = i32::try_from(hit.triangle_index).unwrap_or(-1);
        row.cumulative_distance = travelled;
        row.line_of_sight_to_sensor =
            u32::from(geometry.has_line_of_sight(lifted, sensor.pose.position, None));
        for (slot, emitter) in row.emitter_distances.iter_mut().zip(emitters) {
            *slot = first_position.distance(*emitter) + (travelled - first_leg);
        }

        origin = lifted;
        direction = outgoing;
    }
}

fn trace_direct_path(
    geometry: &SceneGeometry,
    sensor: &SensorConfig,
    direction: Vec3,
    row: &mut RawHit,
) {
    let origin = sensor.pose.position;
    row.hit = 1;
    match geometry.cast_ray(origin, direction, sensor.max_distance) {
        Some(hit) => {
            row.position = hit.position.to_array();
            row.scene_primitive_index = i32::try_from(hit.scene_index).unwrap_or(-1);
            row.triangle_index = i32::try_from(hit.triangle_index).unwrap_or(-1);
            row.cumulative_distance = hit.distance;
        }
        None => {
            row.position = (origin + direction * sensor.max_distance).to_array();
            row.scene_primitive_index = -1;
            row.triangle_index = -1;
            row.cumulative_distance = sensor.max_distance;
            row.line_of_sight_to_sensor = 1;
            row.direct_path = 1;
        }
    }
}

/// Traces synchronously inside `submit`; results are ready on the next poll.
#[derive(Default)]
pub struct InlineTraceBackend {
    geometry: Arc<SceneGeometry>,
    completed: HashMap<CycleHandle, Vec<RawHit>>,
}

impl InlineTraceBackend {
    pub fn new(geometry: Arc<SceneGeometry>) -> Self {
        Self {
            geometry,
            completed: HashMap::new(),
        }
    }
}

impl TraceBackend for InlineTraceBackend {
    fn submit(&mut self, handle: CycleHandle, request: TraceRequest) -> Result<()> {
        let rows = trace_rays(&self.geometry, &request)?;
        self.completed.insert(handle, rows);
        Ok(())
    }

    fn poll(&mut self, handle: CycleHandle) -> TracePoll {
        match self.completed.remove(&handle) {
            Some(rows) => TracePoll::Ready(rows),
            None => TracePoll::Pending,
        }
    }

    fn update_scene(&mut self, geometry: Arc<SceneGeometry>) {
        self.geometry = geometry;
    }
}

enum WorkerCommand {
    Trace {
        handle: CycleHandle,
        request: TraceRequest,
        geometry: Arc<SceneGeometry>,
    },
    Shutdown,
}

/// Threaded CPU backend.
///
/// Jobs are handed to a worker thread over a channel; `poll` collects finished
/// readbacks without blocking. Dropping the backend stops the worker.
pub struct CpuTraceBackend {
    geometry: Arc<SceneGeometry>,
    job_sender: Sender<WorkerCommand>,
    result_receiver: Receiver<(CycleHandle, Vec<RawHit>)>,
    completed: HashMap<CycleHandle, Vec<RawHit>>,
    worker: Option<JoinHandle<()>>,
}

impl CpuTraceBackend {
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be spawned
    pub fn new(geometry: Arc<SceneGeometry>) -> Result<Self> {
        let (job_sender, job_receiver) = crossbeam_channel::unbounded();
        let (result_sender, result_receiver) = crossbeam_channel::unbounded();

        let worker = std::thread::Builder::new()
            .name("sonotrace-trace".into())
            .spawn(move || run_worker(job_receiver, result_sender))
            .map_err(|e| SonoTraceError::Backend(format!("Failed to spawn trace worker: {}", e)))?;

        log::info!("CPU trace backend started");
        Ok(Self {
            geometry,
            job_sender,
            result_receiver,
            completed: HashMap::new(),
            worker: Some(worker),
        })
    }

    pub fn geometry(&self) -> &Arc<SceneGeometry> {
        &self.geometry
    }
}

fn run_worker(jobs: Receiver<WorkerCommand>, results: Sender<(CycleHandle, Vec<RawHit>)>) {
    while let Ok(command) = jobs.recv() {
        match command {
            WorkerCommand::Trace {
                handle,
                request,
                geometry,
            } => {
                let started = Instant::now();
                let rows = trace_rays(&geometry, &request).unwrap_or_else(|e| {
                    log::error!("Trace of {} failed: {}", handle, e);
                    Vec::new()
                });
                log::debug!(
                    "Traced {} ({} rays) in {:?}",
                    handle,
                    request.num_rays(),
                    started.elapsed()
                );
                if results.send((handle, rows)).is_err() {
                    break;
                }
            }
            WorkerCommand::Shutdown => break,
        }
    }
    log::info!("CPU trace backend stopped");
}

impl TraceBackend for CpuTraceBackend {
    fn submit(&mut self, handle: CycleHandle, request: TraceRequest) -> Result<()> {
        self.job_sender
            .send(WorkerCommand::Trace {
                handle,
                request,
                geometry: Arc::clone(&self.geometry),
            })
            .map_err(|e| SonoTraceError::Backend(format!("Trace worker unavailable: {}", e)))
    }

    fn poll(&mut self, handle: CycleHandle) -> TracePoll {
        self.completed.extend(self.result_receiver.try_iter());
        match self.completed.remove(&handle) {
            Some(rows) => TracePoll::Ready(rows),
            None => TracePoll::Pending,
        }
    }

    fn update_scene(&mut self, geometry: Arc<SceneGeometry>) {
        self.geometry = geometry;
    }
}

impl Drop for CpuTraceBackend {
    fn drop(&mut self) {
        let _ = self.job_sender.send(WorkerCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Pose;
    use crate::scene::{GeometryInstance, Mobility, PersistentPrimitiveId, TriangleMesh};
    use std::time::Duration;

    /// Wall facing the origin, spanning Y and Z at `x`.
    fn wall(x: f32, id: u64) -> GeometryInstance {
        GeometryInstance::new(
            PersistentPrimitiveId(id),
            "wall",
            "plane",
            Arc::new(TriangleMesh::plane(400.0, 400.0)),
            Pose::from_euler_degrees(Vec3::new(x, 0.0, 0.0), 0.0, -90.0, 0.0),
            Mobility::Static,
        )
    }

    fn request(azimuths: Vec<f32>, direct: usize, bounces: usize, emitters: Vec<Vec3>) -> TraceRequest {
        let sensor = SensorConfig {
            pose: Pose::identity(),
            max_distance: 500.0,
            emitter_positions: emitters.clone(),
        };
        TraceRequest {
            elevations: vec![0.0; azimuths.len()],
            num_distribution_rays: azimuths.len() - direct,
            azimuths,
            max_bounces: bounces,
            emitter_count: emitters.len(),
            sensor_buffer: sensor.pack(),
        }
    }

    #[test]
    fn test_single_bounce_back_to_sensor() {
        let geometry = SceneGeometry::new(vec![wall(200.0, 1)], 1);
        let rows = trace_rays(&geometry, &request(vec![0.0], 0, 2, vec![Vec3::ZERO])).unwrap();
        assert_eq!(rows.len(), 2);

        let first = &rows[0];
        assert!(first.is_hit());
        assert!(first.has_line_of_sight());
        assert!(first.position().abs_diff_eq(Vec3::new(200.0, 0.0, 0.0), 1e-3));
        assert!((first.cumulative_distance - 200.0).abs() < 1e-3);
        assert!((first.emitter_distances[0] - 200.0).abs() < 1e-3);
        // reflection axis points away from the outgoing (-X) lobe
        assert!(first.reflection().abs_diff_eq(Vec3::X, 1e-5));
        assert_eq!(first.scene_primitive_index, 0);

        // the reflected ray leaves through empty space
        assert!(!rows[1].is_hit());
    }

    #[test]
    fn test_multi_bounce_between_walls() {
        let geometry = SceneGeometry::new(vec![wall(100.0, 1), wall(-100.0, 2)], 1);
        let emitter = Vec3::new(0.0, 30.0, 0.0);
        let rows = trace_rays(&geometry, &request(vec![0.0], 0, 3, vec![emitter])).unwrap();

        assert!(rows.iter().all(|r| r.is_hit()));
        // every bounce restarts slightly off the surface
        assert!((rows[0].cumulative_distance - 100.0).abs() < 0.1);
        assert!((rows[1].cumulative_distance - 300.0).abs() < 0.1);
        assert!((rows[2].cumulative_distance - 500.0).abs() < 0.1);
        assert_eq!(rows[1].scene_primitive_index, 1);

        let first_leg = Vec3::new(100.0, 0.0, 0.0).distance(emitter);
        assert!((rows[0].emitter_distances[0] - first_leg).abs() < 0.1);
        assert!((rows[2].emitter_distances[0] - (first_leg + 400.0)).abs() < 0.1);
    }

    #[test]
    fn test_direct_path_rows() {
        let geometry = SceneGeometry::new(vec![wall(200.0, 1)], 1);
        // distribution ray, then a blocked and a clear direct-path ray
        let azimuths = vec![0.0, 0.0, std::f32::consts::PI];
        let rows = trace_rays(&geometry, &request(azimuths, 2, 2, vec![Vec3::ZERO])).unwrap();
        assert_eq!(rows.len(), 6);

        let blocked = &rows[2];
        assert!(blocked.is_hit());
        assert!(!blocked.is_direct_path());
        assert!((blocked.cumulative_distance - 200.0).abs() < 1e-3);

        let clear = &rows[4];
        assert!(clear.is_hit());
        assert!(clear.is_direct_path());
        assert_eq!(clear.cumulative_distance, 500.0);
        assert!(!rows[3].is_hit() && !rows[5].is_hit());
    }

    #[test]
    fn test_malformed_request() {
        let geometry = SceneGeometry::default();
        let mut bad = request(vec![0.0], 0, 1, vec![Vec3::ZERO]);
        bad.elevations.clear();
        assert!(trace_rays(&geometry, &bad).is_err());
        bad = request(vec![0.0], 0, 1, vec![Vec3::ZERO]);
        bad.sensor_buffer.truncate(3);
        assert!(trace_rays(&geometry, &bad).is_err());
    }

    #[test]
    fn test_threaded_backend_matches_inline() {
        let geometry = Arc::new(SceneGeometry::new(vec![wall(150.0, 1)], 1));
        let azimuths: Vec<f32> = (0..32).map(|i| (i as f32 - 16.0).to_radians() * 2.0).collect();
        let req = request(azimuths, 0, 3, vec![Vec3::ZERO]);

        let mut inline = InlineTraceBackend::new(Arc::clone(&geometry));
        inline.submit(CycleHandle::new(1), req.clone()).unwrap();
        let TracePoll::Ready(expected) = inline.poll(CycleHandle::new(1)) else {
            panic!("inline backend should be ready after submit");
        };

        let mut threaded = CpuTraceBackend::new(geometry).unwrap();
        threaded.submit(CycleHandle::new(1), req).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let rows = loop {
            if let TracePoll::Ready(rows) = threaded.poll(CycleHandle::new(1)) {
                break rows;
            }
            assert!(Instant::now() < deadline, "trace worker timed out");
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(rows, expected);
        assert!(matches!(threaded.poll(CycleHandle::new(2)), TracePoll::Pending));
    }
}
