//! Local transform of a mesh

use glam::{EulerRot, Mat4, Quat, Vec3};

use crate::error::{ViewerError, ViewerResult};

/// Matrices whose determinant is smaller than this cannot be decomposed.
const DETERMINANT_EPSILON: f32 = 1e-12;

/// Translation, rotation and scale of a mesh in model space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    /// Create transform from position, rotation (roll, pitch, yaw in radians), and scale
    pub fn from_components(position: Vec3, rotation_euler: Vec3, scale: Vec3) -> Self {
        Self {
            position,
            rotation: rotation_from_euler(rotation_euler),
            scale,
        }
    }

    /// Decompose an affine matrix into translation, rotation and scale.
    ///
    /// Fails with [`ViewerError::DegenerateTransform`] when the matrix has a
    /// non-finite entry or a (near) zero determinant.
    pub fn from_matrix(matrix: &Mat4) -> ViewerResult<Self> {
        if !matrix.is_finite() {
            return Err(ViewerError::DegenerateTransform(
                "matrix has non-finite entries".to_string(),
            ));
        }
        let determinant = matrix.determinant();
        if determinant.abs() < DETERMINANT_EPSILON {
            return Err(ViewerError::DegenerateTransform(format!(
                "matrix determinant {} is too close to zero",
                determinant
            )));
        }
        let (scale, rotation, position) = matrix.to_scale_rotation_translation();
        if !(scale.is_finite() && rotation.is_finite() && position.is_finite()) {
            return Err(ViewerError::DegenerateTransform(
                "decomposition produced non-finite components".to_string(),
            ));
        }
        Ok(Self {
            position,
            rotation: rotation.normalize(),
            scale,
        })
    }

    /// Get the model matrix for this transform
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }
}

/// Rotation from (roll, pitch, yaw) angles: roll about Z, pitch about X, yaw about Y.
pub fn rotation_from_euler(euler: Vec3) -> Quat {
    Quat::from_euler(EulerRot::YXZ, euler.z, euler.y, euler.x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_decompose_round_trip() {
        let transform = Transform::from_components(
            Vec3::new(1.0, -2.0, 3.5),
            Vec3::new(0.3, 0.2, -1.1),
            Vec3::new(2.0, 2.0, 0.5),
        );
        let decomposed = Transform::from_matrix(&transform.matrix()).unwrap();
        assert!(decomposed.matrix().abs_diff_eq(transform.matrix(), 1e-5));
    }

    #[rstest]
    #[case(Mat4::ZERO)]
    #[case(Mat4::from_scale(Vec3::new(1.0, 0.0, 1.0)))]
    #[case(Mat4::from_translation(Vec3::new(f32::NAN, 0.0, 0.0)))]
    fn test_degenerate_matrix_is_rejected(#[case] matrix: Mat4) {
        assert!(matches!(
            Transform::from_matrix(&matrix),
            Err(ViewerError::DegenerateTransform(_))
        ));
    }

    #[test]
    fn test_yaw_turns_about_y() {
        let rotation = rotation_from_euler(Vec3::new(0.0, 0.0, std::f32::consts::FRAC_PI_2));
        let turned = rotation * Vec3::X;
        assert!(turned.abs_diff_eq(-Vec3::Z, 1e-6));
    }
}
