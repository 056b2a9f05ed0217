mod cli;
mod room;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use sonotrace_core::math::{Pose, Vec3};
use sonotrace_core::scene::SceneGeometry;
use sonotrace_core::{
    CpuTraceBackend, ObjectProfile, PointKind, ProfileParameters, SimulationOutput,
    SonoTraceDesc, SonoTraceEvent, SonoTraceSession,
};

use crate::cli::Args;

/// Sample rate of the generated emitter signals (Hz)
const SIGNAL_SAMPLE_RATE: f32 = 450_000.0;

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(args.log_level)
        .init();

    let mut desc = SonoTraceDesc::new()
        .initial_rays(args.rays)
        .max_bounces(args.bounces)
        .components(true, true, true)
        .emitters(vec![Vec3::new(0.0, 0.0, 2.0)])
        .receivers(vec![Vec3::new(0.0, 5.0, 0.0), Vec3::new(0.0, -5.0, 0.0)])
        .emitter_signals(
            vec![chirp(80_000.0, 20_000.0, 0.002), chirp(40_000.0, 40_000.0, 0.001)],
            vec![0],
        )
        .profile(ObjectProfile::custom(
            room::ROCK_PROFILE,
            ProfileParameters {
                material_strength_specular: (4.0, 3.0),
                material_strength_diffraction: (0.05, 0.08),
                ..ProfileParameters::DEFAULT
            },
        ));
    if let Some(seed) = args.seed {
        desc = desc.random_seed(seed);
    }

    let backend = CpuTraceBackend::new(Arc::new(SceneGeometry::default()))?;
    let mut session = SonoTraceSession::new(desc, backend)?;
    room::populate(&mut session)?;

    let start = Vec3::new(-150.0, 0.0, 100.0);
    for cycle in 0..args.cycles {
        let yaw = (cycle as f32 * args.yaw_step + 180.0).rem_euclid(360.0) - 180.0;
        session.set_sensor_world_pose(Pose::from_euler_degrees(start, 0.0, 0.0, yaw));

        // alternate the signal every other cycle without touching the defaults
        if cycle % 2 == 1 {
            session.trigger_with_signals(vec![1])?;
        } else {
            session.trigger()?;
        }

        let expected = u64::from(cycle) + 1;
        let deadline = Instant::now() + Duration::from_secs(args.timeout);
        loop {
            session.tick(Instant::now());
            log_events(&session.poll_events());
            if session.latest_output().map(|o| o.index) == Some(expected) {
                break;
            }
            if Instant::now() > deadline {
                bail!("Cycle {} did not finish within {} s", expected, args.timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        if let Some(output) = session.latest_output() {
            summarize(output, yaw);
        }
    }

    if let Some(path) = &args.output {
        let output = session
            .latest_output()
            .context("no output was produced")?;
        let json = serde_json::to_string_pretty(output)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        log::info!("Wrote output {} to {}", output.index, path.display());
    }
    Ok(())
}

/// Linear frequency sweep with a Hann window.
fn chirp(start_hz: f32, end_hz: f32, duration_s: f32) -> Vec<f32> {
    let samples = (duration_s * SIGNAL_SAMPLE_RATE) as usize;
    let sweep_rate = (end_hz - start_hz) / duration_s;
    (0..samples)
        .map(|i| {
            let t = i as f32 / SIGNAL_SAMPLE_RATE;
            let phase = 2.0 * std::f32::consts::PI * (start_hz * t + 0.5 * sweep_rate * t * t);
            let window = 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / samples as f32).cos();
            window * phase.sin()
        })
        .collect()
}

fn log_events(events: &[SonoTraceEvent]) {
    for event in events {
        if event.is_error() {
            log::warn!("{:?}", event);
        } else {
            log::debug!("{:?}", event);
        }
    }
}

fn summarize(output: &SimulationOutput, yaw: f32) {
    let count = |kind| output.points_of(kind).count();
    log::info!(
        "Output {} at yaw {:.0}°: {} specular, {} diffraction, {} direct path points, signals {:?}",
        output.index,
        yaw,
        count(PointKind::Specular),
        count(PointKind::Diffraction),
        count(PointKind::DirectPath),
        output.emitter_signal_indexes
    );
    log::info!(
        "  max strength {:.3e}, max curvature {:.3}, max distance {:.1} cm, line of sight {:?}",
        output.maximum_strength,
        output.maximum_curvature,
        output.maximum_total_distance,
        output.direct_path_line_of_sight
    );
}
