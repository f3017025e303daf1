//! Culling math shared between the host and the WGSL kernels.
//!
//! The GPU does the real per-cluster work; these types exist so the host can
//! reason about the same predicates (view splitting, LOD scale computation,
//! SW/HW classification) and so tests can exercise them without a device.

use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};

/// A plane in constant-normal form: `dot(normal, p) + distance = 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    /// Unit normal.
    pub normal: Vec3,
    /// Signed distance from the origin along the normal.
    pub distance: f32,
}

impl Plane {
    /// Build a plane from raw coefficients and normalize it.
    pub fn from_coefficients(v: Vec4) -> Self {
        let len = v.xyz().length();
        if len > 0.0 {
            Self {
                normal: v.xyz() / len,
                distance: v.w / len,
            }
        } else {
            Self {
                normal: Vec3::Y,
                distance: v.w,
            }
        }
    }

    /// Signed distance from a point to the plane.
    pub fn signed_distance(&self, p: Vec3) -> f32 {
        self.normal.dot(p) + self.distance
    }
}

/// A view frustum as six inward-facing planes extracted from a
/// view-projection matrix (left, right, bottom, top, near, far).
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    /// Frustum planes, inward-facing.
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extract frustum planes from a view-projection matrix.
    pub fn from_view_proj(m: &Mat4) -> Self {
        let r0 = m.row(0);
        let r1 = m.row(1);
        let r2 = m.row(2);
        let r3 = m.row(3);

        Self {
            planes: [
                Plane::from_coefficients(r3 + r0), // left
                Plane::from_coefficients(r3 - r0), // right
                Plane::from_coefficients(r3 + r1), // bottom
                Plane::from_coefficients(r3 - r1), // top
                Plane::from_coefficients(r3 + r2), // near
                Plane::from_coefficients(r3 - r2), // far
            ],
        }
    }

    /// Conservative sphere-vs-frustum test. Returns true when the sphere may
    /// be at least partially inside.
    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|p| p.signed_distance(center) >= -radius)
    }
}

/// Scale factor that converts a world-space length at unit view depth into
/// pixels, for a perspective projection and viewport height.
pub fn lod_scale(proj: &Mat4, viewport_height: u32) -> f32 {
    0.5 * viewport_height as f32 * proj.col(1).y
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perspective() -> Mat4 {
        Mat4::perspective_rh(std::f32::consts::FRAC_PI_4, 1.0, 0.1, 100.0)
    }

    #[test]
    fn point_on_axis_is_inside_frustum() {
        let frustum = Frustum::from_view_proj(&perspective());
        assert!(frustum.intersects_sphere(Vec3::new(0.0, 0.0, -1.0), 0.01));
    }

    #[test]
    fn sphere_behind_camera_is_rejected() {
        let frustum = Frustum::from_view_proj(&perspective());
        assert!(!frustum.intersects_sphere(Vec3::new(0.0, 0.0, 10.0), 1.0));
    }

    #[test]
    fn lod_scale_grows_with_viewport_height() {
        let proj = perspective();
        let at_1080 = lod_scale(&proj, 1080);
        let at_2160 = lod_scale(&proj, 2160);
        assert!(at_1080 > 0.0);
        assert_eq!(at_2160, 2.0 * at_1080);
    }
}
