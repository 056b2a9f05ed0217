//! Bookkeeping for everything rays can hit.
//!
//! Acoustic data is generated once per mesh resource and shared by all of its
//! instances through a reference count. Identities are created eagerly for
//! registered mesh instances and lazily, on first hit, for passive geometry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::config::{CurvatureSettings, ProfileTable};
use crate::error::{Result, SonoTraceError};
use crate::math::Pose;
use crate::scene::acoustics::MeshAcousticData;
use crate::scene::geometry::{GeometryInstance, SceneGeometry};
use crate::scene::mesh::TriangleMesh;
use crate::scene::{Mobility, ObjectIdentity, PersistentPrimitiveId};

/// Produces a mesh once it is available, `None` while it is still loading.
pub type MeshLoader = Arc<dyn Fn() -> Option<Arc<TriangleMesh>> + Send + Sync>;

#[derive(Clone)]
pub enum MeshSource {
    Ready(Arc<TriangleMesh>),
    Deferred(MeshLoader),
}

impl MeshSource {
    fn resolve(&self) -> Option<Arc<TriangleMesh>> {
        let mesh = match self {
            Self::Ready(mesh) => Some(Arc::clone(mesh)),
            Self::Deferred(loader) => loader(),
        }?;
        (!mesh.is_empty()).then_some(mesh)
    }
}

impl fmt::Debug for MeshSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(mesh) => write!(f, "Ready({} triangles)", mesh.triangle_count()),
            Self::Deferred(_) => write!(f, "Deferred"),
        }
    }
}

/// Registration request for one mesh component.
#[derive(Debug, Clone)]
pub struct MeshInstanceDesc {
    pub owner: String,
    pub component: String,
    pub resource: String,
    pub mesh: MeshSource,
    pub pose: Pose,
    pub mobility: Mobility,
    /// Replaces the owner name at the start of the label
    pub label_prefix: Option<String>,
}

impl MeshInstanceDesc {
    pub fn new(
        owner: impl Into<String>,
        component: impl Into<String>,
        resource: impl Into<String>,
        mesh: Arc<TriangleMesh>,
    ) -> Self {
        Self {
            owner: owner.into(),
            component: component.into(),
            resource: resource.into(),
            mesh: MeshSource::Ready(mesh),
            pose: Pose::identity(),
            mobility: Mobility::Static,
            label_prefix: None,
        }
    }

    pub fn deferred(mut self, loader: MeshLoader) -> Self {
        self.mesh = MeshSource::Deferred(loader);
        self
    }

    pub fn pose(mut self, pose: Pose) -> Self {
        self.pose = pose;
        self
    }

    pub fn mobility(mut self, mobility: Mobility) -> Self {
        self.mobility = mobility;
        self
    }

    pub fn label_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.label_prefix = Some(prefix.into());
        self
    }

    fn label(&self) -> String {
        format!(
            "{}_{}_{}",
            self.label_prefix.as_deref().unwrap_or(&self.owner),
            self.component,
            self.resource
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshDataSettings {
    pub curvature: CurvatureSettings,
    pub diffraction_size_threshold: f32,
    /// Registration attempts before a mesh that never becomes ready is dropped
    pub generation_attempts: u32,
}

impl Default for MeshDataSettings {
    fn default() -> Self {
        Self {
            curvature: CurvatureSettings::default(),
            diffraction_size_threshold: 200.0,
            generation_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    /// Mesh not ready yet, queued for retry
    Deferred,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub registered: Vec<PersistentPrimitiveId>,
    pub abandoned: Vec<(PersistentPrimitiveId, String)>,
}

impl RetryReport {
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty() && self.abandoned.is_empty()
    }
}

struct SharedMeshData {
    data: Arc<MeshAcousticData>,
    instances: usize,
}

struct RegisteredInstance {
    owner: String,
    resource: String,
    mesh: Arc<TriangleMesh>,
    pose: Pose,
    mobility: Mobility,
    /// Passive geometry carries no acoustic data
    acoustic: bool,
}

struct PendingRegistration {
    id: PersistentPrimitiveId,
    desc: MeshInstanceDesc,
    attempts: u32,
}

pub struct SceneRegistry {
    profiles: ProfileTable,
    settings: MeshDataSettings,
    resource_profiles: HashMap<String, usize>,
    identities: HashMap<PersistentPrimitiveId, ObjectIdentity>,
    instances: BTreeMap<PersistentPrimitiveId, RegisteredInstance>,
    mesh_data: HashMap<String, SharedMeshData>,
    pending: Vec<PendingRegistration>,
    geometry: Arc<SceneGeometry>,
    generation: u64,
    dirty: bool,
}

impl SceneRegistry {
    pub fn new(profiles: ProfileTable, settings: MeshDataSettings) -> Self {
        Self {
            profiles,
            settings,
            resource_profiles: HashMap::new(),
            identities: HashMap::new(),
            instances: BTreeMap::new(),
            mesh_data: HashMap::new(),
            pending: Vec::new(),
            geometry: Arc::new(SceneGeometry::default()),
            generation: 0,
            dirty: false,
        }
    }

    pub fn profiles(&self) -> &ProfileTable {
        &self.profiles
    }

    /// Maps a mesh resource to a profile. Applies to acoustic data generated
    /// after the call.
    ///
    /// # Errors
    ///
    /// Returns an error if `object_type` is not in the profile table
    pub fn assign_profile(&mut self, resource: impl Into<String>, object_type: usize) -> Result<()> {
        if self.profiles.get(object_type).is_none() {
            return Err(SonoTraceError::InvalidIndex {
                kind: "profile",
                index: object_type,
                len: self.profiles.len(),
            });
        }
        let resource = resource.into();
        if self.mesh_data.contains_key(&resource) {
            log::warn!(
                "Resource '{}' already has acoustic data; new profile applies once it is regenerated",
                resource
            );
        }
        self.resource_profiles.insert(resource, object_type);
        Ok(())
    }

    pub fn profile_index_for(&self, resource: &str) -> usize {
        self.resource_profiles.get(resource).copied().unwrap_or(0)
    }

    fn is_known(&self, id: PersistentPrimitiveId) -> bool {
        self.instances.contains_key(&id) || self.pending.iter().any(|p| p.id == id)
    }

    /// Registers a mesh component and, on first sight of its resource, generates
    /// the resource's acoustic data.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is already registered or acoustic data cannot be
    /// generated for the mesh
    pub fn register_mesh_instance(
        &mut self,
        id: PersistentPrimitiveId,
        desc: MeshInstanceDesc,
    ) -> Result<Registration> {
        if self.is_known(id) {
            return Err(SonoTraceError::DuplicateObject(id));
        }
        match desc.mesh.resolve() {
            Some(mesh) => {
                self.complete_registration(id, &desc, mesh)?;
                Ok(Registration::Registered)
            }
            None => {
                log::info!(
                    "Mesh for '{}' not ready, deferring registration of {}",
                    desc.label(),
                    id
                );
                self.pending.push(PendingRegistration {
                    id,
                    desc,
                    attempts: 1,
                });
                Ok(Registration::Deferred)
            }
        }
    }

    fn complete_registration(
        &mut self,
        id: PersistentPrimitiveId,
        desc: &MeshInstanceDesc,
        mesh: Arc<TriangleMesh>,
    ) -> Result<()> {
        let object_type = self.profile_index_for(&desc.resource);
        match self.mesh_data.get_mut(&desc.resource) {
            Some(shared) => shared.instances += 1,
            None => {
                let data = MeshAcousticData::from_mesh(
                    &mesh,
                    self.profiles.get_or_default(object_type),
                    &self.settings.curvature,
                    self.settings.diffraction_size_threshold,
                )?;
                log::debug!(
                    "Generated acoustic data for '{}' ({} triangles)",
                    desc.resource,
                    data.triangle_count()
                );
                self.mesh_data.insert(
                    desc.resource.clone(),
                    SharedMeshData {
                        data: Arc::new(data),
                        instances: 1,
                    },
                );
            }
        }

        let identity = ObjectIdentity::new(desc.label(), object_type);
        log::info!(
            "Registered {} as '{}' (object type {})",
            id,
            identity.label,
            object_type
        );
        self.identities.insert(id, identity);
        self.instances.insert(
            id,
            RegisteredInstance {
                owner: desc.owner.clone(),
                resource: desc.resource.clone(),
                mesh,
                pose: desc.pose,
                mobility: desc.mobility,
                acoustic: true,
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// Adds hit-able geometry without acoustic data or an eager identity.
    pub fn add_passive_geometry(
        &mut self,
        id: PersistentPrimitiveId,
        owner: impl Into<String>,
        resource: impl Into<String>,
        mesh: Arc<TriangleMesh>,
        pose: Pose,
        mobility: Mobility,
    ) -> Result<()> {
        if self.is_known(id) {
            return Err(SonoTraceError::DuplicateObject(id));
        }
        self.instances.insert(
            id,
            RegisteredInstance {
                owner: owner.into(),
                resource: resource.into(),
                mesh,
                pose,
                mobility,
                acoustic: false,
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// Removes an instance, its identity and, with the last instance of its
    /// resource, the resource's acoustic data.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is not registered or pending
    pub fn unregister(&mut self, id: PersistentPrimitiveId) -> Result<()> {
        if let Some(index) = self.pending.iter().position(|p| p.id == id) {
            self.pending.remove(index);
            return Ok(());
        }
        let instance = self
            .instances
            .remove(&id)
            .ok_or(SonoTraceError::UnknownObject(id))?;
        self.identities.remove(&id);

        if instance.acoustic {
            if let Some(shared) = self.mesh_data.get_mut(&instance.resource) {
                shared.instances -= 1;
                if shared.instances == 0 {
                    self.mesh_data.remove(&instance.resource);
                    log::debug!("Released acoustic data for '{}'", instance.resource);
                }
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Retries deferred registrations once. Registrations that exhaust their
    /// attempts or fail are dropped and reported.
    pub fn retry_pending(&mut self) -> RetryReport {
        let mut report = RetryReport::default();
        for mut pending in std::mem::take(&mut self.pending) {
            pending.attempts += 1;
            match pending.desc.mesh.resolve() {
                Some(mesh) => match self.complete_registration(pending.id, &pending.desc, mesh) {
                    Ok(()) => report.registered.push(pending.id),
                    Err(e) => {
                        log::warn!("Deferred registration of {} failed: {}", pending.id, e);
                        report.abandoned.push((pending.id, e.to_string()));
                    }
                },
                None if pending.attempts >= self.settings.generation_attempts => {
                    log::warn!(
                        "Mesh for {} still not ready after {} attempts, giving up",
                        pending.id,
                        pending.attempts
                    );
                    report.abandoned.push((
                        pending.id,
                        format!("mesh not ready after {} attempts", pending.attempts),
                    ));
                }
                None => self.pending.push(pending),
            }
        }
        report
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn resolve_identity(&self, id: PersistentPrimitiveId) -> Option<&ObjectIdentity> {
        self.identities.get(&id)
    }

    pub fn register_identity(&mut self, id: PersistentPrimitiveId, identity: ObjectIdentity) {
        self.identities.insert(id, identity);
    }

    /// Identity given to passive geometry on its first hit.
    pub fn passive_identity(&self, id: PersistentPrimitiveId) -> Option<ObjectIdentity> {
        self.instances
            .get(&id)
            .map(|i| ObjectIdentity::new(format!("{}_{}", i.owner, i.resource), 0))
    }

    pub fn identities(&self) -> impl Iterator<Item = (&PersistentPrimitiveId, &ObjectIdentity)> {
        self.identities.iter()
    }

    pub fn mesh_data(&self, resource: &str) -> Option<&Arc<MeshAcousticData>> {
        self.mesh_data.get(resource).map(|shared| &shared.data)
    }

    pub fn mesh_data_for(&self, id: PersistentPrimitiveId) -> Option<&Arc<MeshAcousticData>> {
        let instance = self.instances.get(&id).filter(|i| i.acoustic)?;
        self.mesh_data(&instance.resource)
    }

    pub fn mesh_instance_count(&self, resource: &str) -> usize {
        self.mesh_data.get(resource).map_or(0, |shared| shared.instances)
    }

    pub fn instance_pose(&self, id: PersistentPrimitiveId) -> Option<Pose> {
        self.instances.get(&id).map(|i| i.pose)
    }

    /// Moves an instance. Takes effect in the next geometry snapshot.
    pub fn set_instance_pose(&mut self, id: PersistentPrimitiveId, pose: Pose) -> Result<()> {
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(SonoTraceError::UnknownObject(id))?;
        instance.pose = pose;
        self.dirty = true;
        Ok(())
    }

    pub fn contains(&self, id: PersistentPrimitiveId) -> bool {
        self.instances.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Current geometry snapshot, rebuilt if anything changed since the last call.
    pub fn geometry(&mut self) -> Arc<SceneGeometry> {
        if self.dirty {
            self.generation += 1;
            let instances = self
                .instances
                .iter()
                .map(|(&id, i)| {
                    GeometryInstance::new(
                        id,
                        i.owner.clone(),
                        i.resource.clone(),
                        Arc::clone(&i.mesh),
                        i.pose,
                        i.mobility,
                    )
                })
                .collect();
            self.geometry = Arc::new(SceneGeometry::new(instances, self.generation));
            self.dirty = false;
        }
        Arc::clone(&self.geometry)
    }
}
