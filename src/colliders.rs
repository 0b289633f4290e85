use bevy::ecs::component::Component;

/// The trait to implement for the collider component you want volume baking
/// to sample. Essentially it allows any bevy component that contains a
/// `parry3d::shape::SharedShape` to act as blocking geometry.
///
/// This trait may be implemented directly on the component (though
/// `VolumeCollider::Component` must still be specified), or may be
/// implemented on a different (foreign) type wrapping a physics engine's
/// collider component.
pub trait VolumeCollider: 'static {
    type Component: Component;

    fn volume_collider_shape(item: &Self::Component) -> parry3d::shape::SharedShape;

    fn volume_collider_compute_local_aabb(
        item: &Self::Component,
    ) -> parry3d::bounding_volume::Aabb;
}
