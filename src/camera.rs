use glam::{Mat4, Vec3};

/// Smallest field of view the projection accepts, in degrees.
pub const MIN_FOV_DEGREES: f32 = 0.01;
/// Largest field of view the projection accepts, in degrees.
pub const MAX_FOV_DEGREES: f32 = 179.99;

/// A camera that circles the origin at a fixed radius and height.
///
/// The eye position is a pure function of elapsed time, so the same time
/// always yields the same view.
///
/// # Example
/// ```
/// use workshop::OrbitCamera;
///
/// let orbit = OrbitCamera::new().radius(8.0).height(2.0).speed(0.5);
/// let view = orbit.view(1.0);
/// let projection = OrbitCamera::projection(60.0, 16.0 / 9.0, 0.1, 100.0);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OrbitCamera {
    /// Point the camera looks at.
    pub target: Vec3,
    /// Horizontal distance from the target.
    pub radius: f32,
    /// Height of the eye above the target.
    pub height: f32,
    /// Angular speed in radians per second (counterclockwise from above).
    pub speed: f32,
}

impl Default for OrbitCamera {
    fn default() -> Self {
        Self {
            target: Vec3::ZERO,
            radius: 10.0,
            height: 3.0,
            speed: 0.4,
        }
    }
}

impl OrbitCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn radius(mut self, radius: f32) -> Self {
        self.radius = radius;
        self
    }

    pub fn height(mut self, height: f32) -> Self {
        self.height = height;
        self
    }

    pub fn speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    /// Eye position at `time` seconds.
    pub fn eye(&self, time: f32) -> Vec3 {
        let angle = time * self.speed;
        self.target + Vec3::new(self.radius * angle.sin(), self.height, self.radius * angle.cos())
    }

    /// Right-handed view matrix at `time` seconds.
    pub fn view(&self, time: f32) -> Mat4 {
        let eye = self.eye(time);
        // Looking straight down the up axis has no defined orientation.
        let up = if (eye - self.target).cross(Vec3::Y).length_squared() > f32::EPSILON {
            Vec3::Y
        } else {
            Vec3::Z
        };
        Mat4::look_at_rh(eye, self.target, up)
    }

    /// Right-handed perspective projection with a `[0, 1]` depth range.
    ///
    /// The field of view is clamped to `[MIN_FOV_DEGREES, MAX_FOV_DEGREES]`
    /// and a non-positive aspect ratio is treated as 1, so slider extremes
    /// produce a degenerate but finite matrix.
    pub fn projection(fov_degrees: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
        let fov = if fov_degrees.is_nan() {
            MIN_FOV_DEGREES
        } else {
            fov_degrees.clamp(MIN_FOV_DEGREES, MAX_FOV_DEGREES)
        };
        let aspect = if aspect > 0.0 && aspect.is_finite() {
            aspect
        } else {
            1.0
        };
        Mat4::perspective_rh(fov.to_radians(), aspect, near, far)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_finite(m: Mat4) -> bool {
        m.to_cols_array().iter().all(|v| v.is_finite())
    }

    #[test]
    fn slider_extremes_give_finite_projections() {
        for fov in [0.0, 180.0, -5.0, 400.0, f32::NAN] {
            let p = OrbitCamera::projection(fov, 16.0 / 9.0, 0.1, 100.0);
            assert!(is_finite(p), "projection for fov {fov} is not finite");
        }
    }

    #[test]
    fn degenerate_aspect_falls_back_to_square() {
        let square = OrbitCamera::projection(60.0, 1.0, 0.1, 100.0);
        assert_eq!(OrbitCamera::projection(60.0, 0.0, 0.1, 100.0), square);
        assert_eq!(OrbitCamera::projection(60.0, -2.0, 0.1, 100.0), square);
    }

    #[test]
    fn eye_orbits_at_radius_and_height() {
        let orbit = OrbitCamera::new().radius(5.0).height(2.0).speed(1.0);
        for t in [0.0, 0.7, 3.1] {
            let eye = orbit.eye(t);
            assert!((eye.x.hypot(eye.z) - 5.0).abs() < 1e-4);
            assert_eq!(eye.y, 2.0);
        }
        assert!((orbit.eye(0.0) - Vec3::new(0.0, 2.0, 5.0)).length() < 1e-6);
    }

    #[test]
    fn view_looks_at_target() {
        let orbit = OrbitCamera::new();
        let view = orbit.view(1.3);
        let target_in_view = view.transform_point3(Vec3::ZERO);
        // Right-handed view space looks down -Z.
        assert!(target_in_view.z < 0.0);
        assert!(target_in_view.x.abs() < 1e-4);
        assert!(target_in_view.y.abs() < 1e-4);
    }

    #[test]
    fn eye_above_target_still_has_a_view() {
        let orbit = OrbitCamera::new().radius(0.0).height(4.0);
        assert!(is_finite(orbit.view(0.0)));
    }
}
