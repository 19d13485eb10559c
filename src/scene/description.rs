//! Decoded scene graph handed to the model loader.
//!
//! A [`SceneDescription`] is what a [`SceneDecoder`] produces: a node tree
//! with local transforms, a flat list of mesh records and a flat list of
//! material records. Nothing in here touches the GPU.

use std::path::Path;

use glam::{Mat4, Vec2, Vec3, Vec4};

use super::image::ImageSource;
use crate::error::{ViewerError, ViewerResult};

/// Node of the scene tree
#[derive(Debug, Clone, PartialEq)]
pub struct SceneNode {
    pub name: String,
    /// Transform relative to the parent node.
    pub local: Mat4,
    /// Indices into [`SceneDescription::nodes`].
    pub children: Vec<usize>,
    /// Indices into [`SceneDescription::meshes`].
    pub meshes: Vec<usize>,
}

impl SceneNode {
    pub fn new(name: impl Into<String>, local: Mat4) -> Self {
        Self {
            name: name.into(),
            local,
            children: Vec::new(),
            meshes: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<usize>) -> Self {
        self.children = children;
        self
    }

    pub fn with_meshes(mut self, meshes: Vec<usize>) -> Self {
        self.meshes = meshes;
        self
    }
}

/// Geometry of one mesh as decoded from the file
///
/// `normals`, `uvs`, `tangents` and `bitangents` are either empty or as long
/// as `positions`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshRecord {
    pub name: String,
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub tangents: Vec<Vec3>,
    pub bitangents: Vec<Vec3>,
    pub indices: Vec<u32>,
    /// Index into [`SceneDescription::materials`].
    pub material: usize,
}

impl MeshRecord {
    /// Create a unit cube centered at origin
    pub fn cube(material: usize) -> Self {
        let faces = [
            (Vec3::Z, Vec3::X),
            (-Vec3::Z, -Vec3::X),
            (Vec3::X, -Vec3::Z),
            (-Vec3::X, Vec3::Z),
            (Vec3::Y, Vec3::X),
            (-Vec3::Y, Vec3::X),
        ];
        let corners = [
            Vec2::new(0.0, 1.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(0.0, 0.0),
        ];

        let mut mesh = MeshRecord {
            name: "cube".to_string(),
            material,
            ..Default::default()
        };
        for (face, (normal, tangent)) in faces.into_iter().enumerate() {
            let bitangent = normal.cross(tangent);
            for uv in corners {
                let offset = tangent * (uv.x - 0.5) + bitangent * (0.5 - uv.y);
                mesh.positions.push(normal * 0.5 + offset);
                mesh.normals.push(normal);
                mesh.uvs.push(uv);
                mesh.tangents.push(tangent);
                mesh.bitangents.push(bitangent);
            }
            let base = face as u32 * 4;
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        mesh
    }
}

/// Texture reference of a material record
#[derive(Debug, Clone, PartialEq)]
pub struct TextureRef {
    /// Raw channel index. Values outside the channel table are skipped.
    pub channel: u32,
    pub source: ImageSource,
}

/// Material parameters as decoded from the file
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialRecord {
    pub name: String,
    pub base_color: Vec4,
    pub metallic: f32,
    pub roughness: f32,
    pub opacity: f32,
    pub textures: Vec<TextureRef>,
}

impl Default for MaterialRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_color: Vec4::new(1.0, 0.0, 1.0, 1.0),
            metallic: 0.0,
            roughness: 0.0,
            opacity: 1.0,
            textures: Vec::new(),
        }
    }
}

/// One mesh placed in the world by the traversal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshInstance {
    pub node: usize,
    pub mesh: usize,
    pub world: Mat4,
}

/// A decoded scene
#[derive(Debug, Clone, PartialEq)]
pub struct SceneDescription {
    pub nodes: Vec<SceneNode>,
    pub root: usize,
    pub meshes: Vec<MeshRecord>,
    pub materials: Vec<MaterialRecord>,
}

impl SceneDescription {
    /// Check that every index is in range and that the nodes form a tree.
    pub fn validate(&self) -> ViewerResult<()> {
        if self.root >= self.nodes.len() {
            return Err(ViewerError::SceneLoad(format!(
                "root node {} out of range ({} nodes)",
                self.root,
                self.nodes.len()
            )));
        }
        if self.meshes.is_empty() {
            return Err(ViewerError::SceneLoad("scene contains no meshes".to_string()));
        }
        for (index, mesh) in self.meshes.iter().enumerate() {
            if mesh.material >= self.materials.len() {
                return Err(ViewerError::SceneLoad(format!(
                    "mesh {} references material {} ({} materials)",
                    index,
                    mesh.material,
                    self.materials.len()
                )));
            }
        }
        self.parents().map(|_| ())
    }

    /// Parent of every node, `None` for the root and for unreachable nodes.
    pub fn parents(&self) -> ViewerResult<Vec<Option<usize>>> {
        let mut parents = vec![None; self.nodes.len()];
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![self.root];
        while let Some(index) = stack.pop() {
            let node = self.node(index)?;
            if std::mem::replace(&mut visited[index], true) {
                return Err(ViewerError::SceneLoad(format!(
                    "node {} ({}) is reachable twice",
                    index, node.name
                )));
            }
            for &mesh in &node.meshes {
                if mesh >= self.meshes.len() {
                    return Err(ViewerError::SceneLoad(format!(
                        "node {} references mesh {} ({} meshes)",
                        node.name,
                        mesh,
                        self.meshes.len()
                    )));
                }
            }
            for &child in &node.children {
                self.node(child)?;
                parents[child] = Some(index);
                stack.push(child);
            }
        }
        Ok(parents)
    }

    /// World transform of every mesh reference, parents before children.
    ///
    /// Each node's world matrix is its parent's world matrix times its own
    /// local matrix. Meshes come out in depth-first order, children and
    /// mesh lists in their declared order.
    pub fn traverse(&self) -> ViewerResult<Vec<MeshInstance>> {
        self.validate()?;
        let mut instances = Vec::new();
        let mut stack = vec![(self.root, Mat4::IDENTITY)];
        while let Some((index, parent_world)) = stack.pop() {
            let node = self.node(index)?;
            let world = parent_world * node.local;
            instances.extend(node.meshes.iter().map(|&mesh| MeshInstance {
                node: index,
                mesh,
                world,
            }));
            stack.extend(node.children.iter().rev().map(|&child| (child, world)));
        }
        Ok(instances)
    }

    /// World transform of `node` accumulated leaf to root through the parent links.
    pub fn global_transform(&self, node: usize) -> ViewerResult<Mat4> {
        let parents = self.parents()?;
        let mut world = self.node(node)?.local;
        let mut current = parents[node];
        while let Some(parent) = current {
            world = self.nodes[parent].local * world;
            current = parents[parent];
        }
        Ok(world)
    }

    fn node(&self, index: usize) -> ViewerResult<&SceneNode> {
        self.nodes.get(index).ok_or_else(|| {
            ViewerError::SceneLoad(format!(
                "node {} out of range ({} nodes)",
                index,
                self.nodes.len()
            ))
        })
    }
}

/// Turns a scene file into a [`SceneDescription`]
pub trait SceneDecoder {
    fn decode(&self, path: &Path) -> ViewerResult<SceneDescription>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    fn triangle(material: usize) -> MeshRecord {
        MeshRecord {
            name: "triangle".to_string(),
            positions: vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            indices: vec![0, 1, 2],
            material,
            ..Default::default()
        }
    }

    fn chain() -> SceneDescription {
        let a = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let b = Mat4::from_rotation_y(0.7);
        let c = Mat4::from_scale_rotation_translation(
            Vec3::splat(2.0),
            Quat::from_rotation_x(-0.3),
            Vec3::new(0.0, -1.0, 0.5),
        );
        SceneDescription {
            nodes: vec![
                SceneNode::new("root", a).with_children(vec![1, 3]),
                SceneNode::new("b", b).with_children(vec![2]).with_meshes(vec![0]),
                SceneNode::new("c", c).with_meshes(vec![1]),
                SceneNode::new("d", Mat4::IDENTITY).with_meshes(vec![0]),
            ],
            root: 0,
            meshes: vec![triangle(0), triangle(0)],
            materials: vec![MaterialRecord::default()],
        }
    }

    #[test]
    fn test_traversal_order_and_composition() {
        let scene = chain();
        let instances = scene.traverse().unwrap();
        let order: Vec<(usize, usize)> = instances.iter().map(|i| (i.node, i.mesh)).collect();
        assert_eq!(order, vec![(1, 0), (2, 1), (3, 0)]);

        let expected = scene.nodes[0].local * scene.nodes[1].local * scene.nodes[2].local;
        assert!(instances[1].world.abs_diff_eq(expected, 1e-5));
    }

    #[test]
    fn test_global_transform_agrees_with_traversal() {
        let scene = chain();
        for instance in scene.traverse().unwrap() {
            let global = scene.global_transform(instance.node).unwrap();
            assert!(global.abs_diff_eq(instance.world, 1e-5));
        }
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut scene = chain();
        scene.nodes[2].children.push(1);
        assert!(matches!(scene.traverse(), Err(ViewerError::SceneLoad(_))));
    }

    #[test]
    fn test_empty_scene_is_rejected() {
        let scene = SceneDescription {
            nodes: vec![SceneNode::new("root", Mat4::IDENTITY)],
            root: 0,
            meshes: Vec::new(),
            materials: Vec::new(),
        };
        assert!(matches!(scene.validate(), Err(ViewerError::SceneLoad(_))));
    }

    #[test]
    fn test_bad_material_index_is_rejected() {
        let mut scene = chain();
        scene.meshes[1].material = 4;
        assert!(matches!(scene.validate(), Err(ViewerError::SceneLoad(_))));
    }
}
