use std::sync::{Arc, RwLock};

use bevy::{
    math::{Mat4, Vec3},
    platform::collections::HashMap,
    prelude::{Event, Resource},
};

use crate::{
    links::connect_external_links,
    volume::{Aabb3, VolumeData, VolumeId},
};

/// Fired once before a transactional batch of registry mutations. In-flight
/// searches are force-completed and requeued when they see it.
#[derive(Event)]
pub struct VolumeDataChanging;

/// Fired once after a transactional batch of registry mutations settles.
#[derive(Event)]
pub struct VolumeDataChanged;

/// One loaded volume: its immutable bake output plus the transform snapshot
/// and the world-space caches derived from it.
pub struct LoadedVolume {
    pub data: Arc<VolumeData>,
    pub local_aabb: Aabb3,
    pub local_to_world: Mat4,
    pub world_to_local: Mat4,
    /// World-space external link endpoints, `[region][link]`, parallel to
    /// `data.regions[region].external_links`.
    link_positions: Vec<Vec<(Vec3, Vec3)>>,
}

impl LoadedVolume {
    fn new(data: Arc<VolumeData>, local_aabb: Aabb3, local_to_world: Mat4) -> Self {
        let mut volume = Self {
            data,
            local_aabb,
            local_to_world,
            world_to_local: local_to_world.inverse(),
            link_positions: Vec::new(),
        };
        volume.refresh_link_positions();
        volume
    }

    fn refresh_link_positions(&mut self) {
        let to_world = |position: Vec3| -> Vec3 {
            if self.data.external_links_are_local_space {
                self.local_to_world.transform_point3(position)
            } else {
                position
            }
        };

        self.link_positions = self
            .data
            .regions
            .iter()
            .map(|region| {
                region
                    .external_links
                    .iter()
                    .map(|link| (to_world(link.from_position), to_world(link.to_position)))
                    .collect()
            })
            .collect();
    }

    /// World-space `(from, to)` endpoints of a region's external links.
    pub fn link_world_positions(&self, region: usize) -> &[(Vec3, Vec3)] {
        &self.link_positions[region]
    }
}

/// Process-wide mapping of every active volume, keyed by [`VolumeId`].
///
/// Read-mostly: mutations happen in transactional batches bracketed by
/// [`VolumeDataChanging`]/[`VolumeDataChanged`], each bumping the change
/// epoch exactly once. Any computation spanning multiple reads compares the
/// epoch it started with to detect invalidation.
#[derive(Default)]
pub struct VolumeRegistry {
    volumes: HashMap<VolumeId, LoadedVolume>,
    change_epoch: u64,
}

impl VolumeRegistry {
    #[inline]
    pub fn change_epoch(&self) -> u64 {
        self.change_epoch
    }

    /// Increment the change epoch. Called once per mutation batch.
    pub fn bump_epoch(&mut self) {
        self.change_epoch += 1;
    }

    #[inline]
    pub fn is_loaded(&self, id: VolumeId) -> bool {
        self.volumes.contains_key(&id)
    }

    #[inline]
    pub fn get(&self, id: VolumeId) -> Option<&LoadedVolume> {
        self.volumes.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (VolumeId, &LoadedVolume)> {
        self.volumes.iter().map(|(id, volume)| (*id, volume))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn insert(
        &mut self,
        id: VolumeId,
        data: Arc<VolumeData>,
        local_aabb: Aabb3,
        local_to_world: Mat4,
    ) {
        self.volumes
            .insert(id, LoadedVolume::new(data, local_aabb, local_to_world));
    }

    pub fn remove(&mut self, id: VolumeId) {
        self.volumes.remove(&id);
    }

    /// Refreshes the cached inverse transform and recomputes the world-space
    /// form of the volume's external links.
    pub fn update_transform(&mut self, id: VolumeId, local_to_world: Mat4) {
        if let Some(volume) = self.volumes.get_mut(&id) {
            volume.local_to_world = local_to_world;
            volume.world_to_local = local_to_world.inverse();
            volume.refresh_link_positions();
        }
    }

    /// Re-runs the external-link pass over every loaded volume and refreshes
    /// the world-space caches.
    pub fn rebuild_external_links(&mut self, max_distance: f32) {
        let mut ids: Vec<VolumeId> = self.volumes.keys().copied().collect();
        ids.sort_unstable();

        let mut datas: Vec<(VolumeId, VolumeData, Mat4)> = ids
            .iter()
            .map(|id| {
                let volume = &self.volumes[id];
                (*id, (*volume.data).clone(), volume.local_to_world)
            })
            .collect();

        {
            let mut view: Vec<(VolumeId, &mut VolumeData, Mat4)> = datas
                .iter_mut()
                .map(|(id, data, transform)| (*id, data, *transform))
                .collect();
            connect_external_links(&mut view, max_distance);
        }

        for (id, data, _) in datas {
            let volume = self.volumes.get_mut(&id).unwrap();
            volume.data = Arc::new(data);
            volume.refresh_link_positions();
        }
    }
}

/// Wrapper resource around the volume registry.
///
/// The underlying [`VolumeRegistry`] must be retrieved with
/// [`NavVolumes::get`] and read through the lock.
#[derive(Default, Resource)]
pub struct NavVolumes(Arc<RwLock<VolumeRegistry>>);

impl NavVolumes {
    pub fn get(&self) -> Arc<RwLock<VolumeRegistry>> {
        self.0.clone()
    }
}
