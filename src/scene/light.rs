//! Light types for the scene

use glam::{Vec3, Vec4};

/// Directional light shared by every draw of a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    pub direction: Vec3,
    pub color: Vec4,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: -Vec3::Y,
            color: Vec4::new(0.9, 0.9, 0.9, 1.0),
        }
    }
}

impl DirectionalLight {
    pub fn new(direction: Vec3, color: Vec4) -> Self {
        Self {
            direction: direction.normalize_or_zero(),
            color,
        }
    }

    /// Direction padded to a constant-buffer vector.
    pub fn direction_vector(&self) -> Vec4 {
        self.direction.extend(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_is_normalized() {
        let light = DirectionalLight::new(Vec3::new(0.0, -4.0, 3.0), Vec4::ONE);
        assert!(light.direction_vector().abs_diff_eq(Vec4::new(0.0, -0.8, 0.6, 0.0), 1e-6));
    }
}
