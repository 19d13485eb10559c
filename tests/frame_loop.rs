//! Frame loop tests: ring stalls, per-draw constants and the viewer contract.

mod common;

use glam::Mat4;
use rstest::rstest;

use common::{cube_scene, diffuse_scene, nested_scene};
use model_viewer::backend::*;
use model_viewer::renderer::FrameState;
use model_viewer::sync::FrameSync;
use model_viewer::{Viewer, ViewerConfig, ViewerError};

fn config(ring_depth: usize, max_meshes: usize) -> ViewerConfig {
    ViewerConfig {
        width: 96,
        height: 64,
        ring_depth,
        max_meshes,
        ..Default::default()
    }
}

#[rstest]
#[case(2, 0)]
#[case(2, 3)]
#[case(3, 1)]
#[case(3, 7)]
fn test_advance_frame_stalls_once_per_wrap(#[case] depth: usize, #[case] extra: u64) {
    let mut device = SoftwareDevice::new(ExecutionMode::Deferred);
    let mut sync = FrameSync::new(depth, FrameSync::DEFAULT_TIMEOUT).unwrap();

    for _ in 0..depth as u64 + extra {
        let slot = sync.advance_frame(&mut device).unwrap();
        assert!(sync.is_slot_retired(&device, slot));
    }
    assert_eq!(sync.stall_count(), extra);
}

/// Runs ahead of a deferred GPU and checks every draw saw its own constants.
#[rstest]
#[case(2)]
#[case(3)]
fn test_deferred_frames_keep_their_constants(#[case] ring_depth: usize) {
    let mut viewer = Viewer::new(SoftwareDevice::new(ExecutionMode::Deferred), config(ring_depth, 8)).unwrap();
    viewer.load_scene(&nested_scene(), "nested").unwrap();
    viewer.load_scene(&diffuse_scene(2), "diffuse").unwrap();
    let meshes = viewer.mesh_count();
    assert_eq!(meshes, 5);

    let mut expected: Vec<Mat4> = Vec::new();
    for _ in 0..7 {
        viewer.update(0.25);
        for model in viewer.models() {
            expected.extend((0..model.mesh_count()).filter_map(|i| model.world_matrix(i)));
        }
        assert_eq!(viewer.on_render().unwrap(), meshes as u32);
    }
    let device = viewer.shutdown().unwrap();

    let draws = device.executed_draws();
    assert_eq!(draws.len(), expected.len());
    for (index, (draw, world)) in draws.iter().zip(&expected).enumerate() {
        let constants = draw.decode_mesh_constants().unwrap();
        assert!(
            constants.world.abs_diff_eq(*world, 1e-5),
            "draw {} (frame {}, mesh {}) saw another draw's constants",
            index,
            index / meshes,
            index % meshes
        );
        assert!(constants
            .normal_matrix
            .abs_diff_eq(world.inverse().transpose(), 1e-4));
    }
    assert!(
        device.validation_messages().is_empty(),
        "{:#?}",
        device.validation_messages()
    );
}

#[test]
fn test_draws_bind_their_material_table() {
    let mut viewer = Viewer::new(SoftwareDevice::default(), config(2, 8)).unwrap();
    viewer.load_scene(&diffuse_scene(1), "diffuse").unwrap();
    viewer.load_scene(&cube_scene(1), "plain").unwrap();

    viewer.on_render().unwrap();
    let draws = viewer.device().executed_draws();
    assert_eq!(draws.len(), 2);
    for (draw, model) in draws.iter().zip(viewer.models()) {
        let table = model.materials()[0].descriptor_range().unwrap().gpu;
        assert_eq!(draw.material_table, Some(table));
        assert_ne!(table, viewer.fallback().table());
    }

    assert_eq!(draws[0].decode_mesh_constants().unwrap().texture_flags, 1);
    assert_eq!(draws[1].decode_mesh_constants().unwrap().texture_flags, 0);
    let frame = draws[0].decode_frame_constants().unwrap();
    assert_eq!(frame.view, viewer.camera().view_matrix());
    assert_eq!(frame.light_direction, viewer.light().direction_vector());
}

#[test]
fn test_unload_all_empties_the_frame() {
    let mut viewer = Viewer::new(SoftwareDevice::default(), config(2, 8)).unwrap();
    viewer.load_scene(&cube_scene(2), "cubes").unwrap();
    viewer.on_render().unwrap();
    assert_eq!(viewer.device().executed_draws().len(), 2);

    viewer.unload_all().unwrap();
    assert_eq!(viewer.on_render().unwrap(), 0);
    assert_eq!(viewer.device().executed_draws().len(), 2);
    assert_eq!(viewer.device().presents(), 2);
}

#[test]
fn test_resize_between_frames() {
    let mut viewer = Viewer::new(SoftwareDevice::new(ExecutionMode::Deferred), config(2, 4)).unwrap();
    viewer.load_scene(&cube_scene(1), "cube").unwrap();
    viewer.on_render().unwrap();
    viewer.on_render().unwrap();

    viewer.on_resize(200, 100).unwrap();
    viewer.on_render().unwrap();
    assert_eq!(viewer.device().swap_chain_size(), (200, 100));
    assert!(matches!(viewer.renderer().state(), FrameState::Submitted { .. }));

    viewer.toggle_full_screen().unwrap();
    viewer.on_render().unwrap();
    viewer.toggle_full_screen().unwrap();
    assert_eq!(viewer.size(), (200, 100));

    let device = viewer.shutdown().unwrap();
    assert!(device.validation_messages().is_empty(), "{:#?}", device.validation_messages());
}

#[test]
fn test_frame_draw_limit_is_reported() {
    let mut viewer = Viewer::new(SoftwareDevice::default(), config(2, 2)).unwrap();
    assert!(matches!(
        viewer.load_scene(&cube_scene(3), "too many"),
        Err(ViewerError::TooManyMeshes { count: 3, limit: 2 })
    ));
    assert!(viewer.models().is_empty());
    // Only the two constant rings.
    assert_eq!(viewer.device().live_buffer_count(), 2);
}
