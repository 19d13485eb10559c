//! Common utilities for integration tests.
//!
//! Every test runs on the software device, in either execution mode.

#![allow(dead_code)]

use glam::{Mat4, Quat, Vec3};

use model_viewer::backend::*;
use model_viewer::descriptor::DescriptorAllocator;
use model_viewer::resources::{ChannelType, FallbackTexture};
use model_viewer::scene::{DecodedImage, ImageSource, MaterialRecord, MeshRecord, SceneDescription, SceneNode, TextureRef};
use model_viewer::sync::FrameSync;

/// Device, frame sync, descriptor pool and fallback texture.
pub struct TestContext {
    pub device: SoftwareDevice,
    pub sync: FrameSync,
    pub descriptors: DescriptorAllocator,
    pub fallback: FallbackTexture,
}

impl TestContext {
    /// Context with room for `tables` material tables besides the fallback table.
    pub fn new(mode: ExecutionMode, tables: u32) -> Self {
        let mut device = SoftwareDevice::new(mode);
        let mut sync = FrameSync::new(2, FrameSync::DEFAULT_TIMEOUT).unwrap();
        let mut descriptors =
            DescriptorAllocator::create(&mut device, (tables + 1) * root::MATERIAL_TABLE_SIZE, "test descriptors")
                .unwrap();
        let fallback = FallbackTexture::create(&mut device, &mut descriptors, &mut sync).unwrap();
        Self {
            device,
            sync,
            descriptors,
            fallback,
        }
    }
}

/// Deterministic RGBA pattern where every texel differs from its neighbours.
pub fn test_pattern(width: u32, height: u32) -> DecodedImage {
    let pixels = (0..width * height)
        .flat_map(|i| {
            let i = i as u8;
            [i, i.wrapping_mul(3), i.wrapping_add(101), 255 - i]
        })
        .collect();
    DecodedImage::new(width, height, pixels).unwrap()
}

/// One node holding `meshes` unit cubes that share material 0.
pub fn cube_scene(meshes: usize) -> SceneDescription {
    SceneDescription {
        nodes: vec![SceneNode::new("root", Mat4::IDENTITY).with_meshes((0..meshes).collect())],
        root: 0,
        meshes: vec![MeshRecord::cube(0); meshes],
        materials: vec![MaterialRecord {
            name: "plain".to_string(),
            ..Default::default()
        }],
    }
}

/// `meshes` cubes whose only material has a diffuse texture and nothing else.
pub fn diffuse_scene(meshes: usize) -> SceneDescription {
    let mut scene = cube_scene(meshes);
    scene.materials[0].name = "diffuse".to_string();
    scene.materials[0].textures.push(TextureRef {
        channel: ChannelType::Diffuse.index(),
        source: ImageSource::Decoded(test_pattern(8, 8)),
    });
    scene
}

/// root -> arm -> (hand A, hand B -> finger C); cubes on arm, hand A and finger C.
///
/// Only leaves carry non-uniform scale, so every world matrix is shear-free.
pub fn nested_scene() -> SceneDescription {
    let trs = |t: Vec3, r: Quat, s: Vec3| Mat4::from_scale_rotation_translation(s, r, t);
    let nodes = vec![
        SceneNode::new("root", trs(Vec3::new(0.0, 1.0, 0.0), Quat::from_rotation_y(0.3), Vec3::ONE))
            .with_children(vec![1]),
        SceneNode::new(
            "arm",
            trs(Vec3::new(2.0, 0.0, -1.0), Quat::from_rotation_x(-0.7), Vec3::splat(1.5)),
        )
        .with_children(vec![2, 3])
        .with_meshes(vec![0]),
        SceneNode::new(
            "hand A",
            trs(Vec3::new(0.0, 0.5, 0.0), Quat::from_rotation_z(1.1), Vec3::new(1.0, 2.0, 0.5)),
        )
        .with_meshes(vec![1]),
        SceneNode::new(
            "hand B",
            trs(Vec3::new(-0.5, 0.0, 0.25), Quat::IDENTITY, Vec3::splat(0.5)),
        )
        .with_children(vec![4]),
        SceneNode::new(
            "finger C",
            trs(Vec3::new(0.1, 0.2, 0.3), Quat::from_rotation_y(-2.0), Vec3::splat(0.25)),
        )
        .with_meshes(vec![2]),
    ];
    SceneDescription {
        nodes,
        root: 0,
        meshes: vec![MeshRecord::cube(0); 3],
        materials: vec![MaterialRecord::default()],
    }
}
