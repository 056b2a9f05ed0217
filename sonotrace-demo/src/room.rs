use std::sync::Arc;

use anyhow::{Context, Result};
use sonotrace_core::math::{Pose, Vec3};
use sonotrace_core::{
    MeshInstanceDesc, Mobility, PersistentPrimitiveId, SonoTraceSession, TraceBackend,
    TriangleMesh,
};

/// Half the room's edge length (cm)
const HALF_SIZE: f32 = 300.0;

pub const ROCK_PROFILE: &str = "rock";

/// Floor, three walls and a passive ceiling, plus a boulder and a crate.
pub fn populate<B: TraceBackend>(session: &mut SonoTraceSession<B>) -> Result<()> {
    let panel = Arc::new(TriangleMesh::plane(2.0 * HALF_SIZE, 2.0 * HALF_SIZE));
    let surfaces = [
        ("floor", Pose::from_position(Vec3::ZERO)),
        (
            "back_wall",
            Pose::from_euler_degrees(Vec3::new(HALF_SIZE, 0.0, HALF_SIZE), 0.0, -90.0, 0.0),
        ),
        (
            "left_wall",
            Pose::from_euler_degrees(Vec3::new(0.0, HALF_SIZE, HALF_SIZE), 90.0, 0.0, 0.0),
        ),
        (
            "right_wall",
            Pose::from_euler_degrees(Vec3::new(0.0, -HALF_SIZE, HALF_SIZE), -90.0, 0.0, 0.0),
        ),
    ];
    for (index, (component, pose)) in surfaces.into_iter().enumerate() {
        session.register_mesh_instance(
            PersistentPrimitiveId(index as u64 + 1),
            MeshInstanceDesc::new("room", component, "panel", Arc::clone(&panel)).pose(pose),
        )?;
    }

    session.add_passive_geometry(
        PersistentPrimitiveId(10),
        "room",
        "ceiling",
        Arc::clone(&panel),
        Pose::from_euler_degrees(Vec3::new(0.0, 0.0, 2.0 * HALF_SIZE), 180.0, 0.0, 0.0),
        Mobility::Static,
    )?;

    let rock = session
        .registry()
        .profiles()
        .index_of(ROCK_PROFILE)
        .context("rock profile missing from the session description")?;
    session.registry_mut().assign_profile("boulder", rock)?;
    session.register_mesh_instance(
        PersistentPrimitiveId(20),
        MeshInstanceDesc::new(
            "rock",
            "mesh",
            "boulder",
            Arc::new(TriangleMesh::uv_sphere(30.0, 24, 12)),
        )
        .pose(Pose::from_position(Vec3::new(150.0, 60.0, 60.0))),
    )?;

    session.register_mesh_instance(
        PersistentPrimitiveId(21),
        MeshInstanceDesc::new(
            "crate",
            "body",
            "crate",
            Arc::new(TriangleMesh::cuboid(Vec3::splat(25.0))),
        )
        .pose(Pose::from_euler_degrees(
            Vec3::new(120.0, -80.0, 25.0),
            0.0,
            0.0,
            30.0,
        ))
        .mobility(Mobility::Dynamic),
    )?;

    log::info!(
        "Room ready with {} objects",
        session.registry().len()
    );
    Ok(())
}
