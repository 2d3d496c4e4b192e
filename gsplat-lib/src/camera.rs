use glam::{Mat3, Mat4, Vec3};

use crate::structures::MAX_LIVE_KEY;

/// Camera for a single draw. The camera looks along `-axis_z` (right-handed,
/// y up), the same convention as `Mat4::look_to_rh`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraData {
    pub pos: Vec3,
    pub axis_x: Vec3,
    pub axis_y: Vec3,
    pub axis_z: Vec3,
    /// Vertical field of view in radians.
    pub fov: f32,
}

impl CameraData {
    pub fn look_at(eye: Vec3, target: Vec3, up: Vec3, fov: f32) -> Self {
        let forward = (target - eye).normalize();
        let axis_x = forward.cross(up).normalize();
        let axis_y = axis_x.cross(forward);
        Self {
            pos: eye,
            axis_x,
            axis_y,
            axis_z: -forward,
            fov,
        }
    }

    #[inline]
    pub fn forward(&self) -> Vec3 {
        -self.axis_z
    }

    pub fn world_to_camera(&self) -> Mat4 {
        let rot = Mat3::from_cols(self.axis_x, self.axis_y, self.axis_z).transpose();
        let t = -(rot * self.pos);
        Mat4::from_cols(
            rot.x_axis.extend(0.0),
            rot.y_axis.extend(0.0),
            rot.z_axis.extend(0.0),
            t.extend(1.0),
        )
    }

    /// World to camera with the depth row negated, so camera-space z grows
    /// with distance in front of the camera. Ascending keys are near to far.
    pub fn sort_transform(&self) -> Mat4 {
        let mut m = self.world_to_camera();
        m.x_axis.z = -m.x_axis.z;
        m.y_axis.z = -m.y_axis.z;
        m.z_axis.z = -m.z_axis.z;
        m.w_axis.z = -m.w_axis.z;
        m
    }

    pub fn projection(&self, aspect: f32, near: f32, far: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov, aspect, near, far)
    }

    pub fn view_proj(&self, aspect: f32, near: f32, far: f32) -> Mat4 {
        self.projection(aspect, near, far) * self.world_to_camera()
    }
}

/// CPU mirror of the `calc_depth_keys` kernel.
#[inline]
pub fn depth_key(sort_transform: &Mat4, pos: Vec3) -> f32 {
    let key = sort_transform.transform_point3(pos).z;
    if key.is_finite() {
        key.min(MAX_LIVE_KEY)
    } else {
        MAX_LIVE_KEY
    }
}
