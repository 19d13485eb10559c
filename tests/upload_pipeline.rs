//! Staging upload tests: texture round trips and batch ordering.

mod common;

use rstest::rstest;

use common::{test_pattern, TestContext};
use model_viewer::backend::software::CommandKind;
use model_viewer::backend::*;
use model_viewer::resources::Model;
use model_viewer::scene::ImageCrateDecoder;
use model_viewer::upload::{read_back_texture, GpuTexture, StagingBuffer, UploadBatch};

/// Upload a pattern through a pitch-padded staging buffer and read it back.
#[rstest]
#[case::narrow(3, 2)]
#[case::exact_pitch(64, 4)]
#[case::one_past_pitch(65, 3)]
#[case::tall(1, 17)]
fn test_texture_round_trip(
    #[case] width: u32,
    #[case] height: u32,
    #[values(ExecutionMode::Immediate, ExecutionMode::Deferred)] mode: ExecutionMode,
) {
    let mut ctx = TestContext::new(mode, 0);
    let image = test_pattern(width, height);

    let mut texture = GpuTexture::create(&mut ctx.device, "pattern", width, height, TextureFormat::Rgba8Unorm).unwrap();
    let footprint = texture.footprint();
    assert_eq!(footprint.row_pitch % TEXTURE_DATA_PITCH_ALIGNMENT, 0);
    let staging = StagingBuffer::from_image(&mut ctx.device, "pattern staging", &footprint, &image.pixels).unwrap();
    assert_eq!(staging.size(), footprint.total_size());

    let mut batch = UploadBatch::new();
    batch
        .add_texture(&texture, &staging, ResourceState::PixelShaderResource)
        .unwrap();
    let fence = batch.submit(&mut ctx.device, &mut ctx.sync).unwrap();
    ctx.sync.wait_for_value(&mut ctx.device, fence).unwrap();
    assert!(batch.complete_texture(&mut texture).unwrap());
    staging.release(&mut ctx.device);

    let pixels = read_back_texture(&mut ctx.device, &mut ctx.sync, &texture).unwrap();
    assert_eq!(pixels, image.pixels);
    assert_eq!(
        ctx.device.resource_state(ResourceId::Texture(texture.handle())),
        Some(ResourceState::PixelShaderResource)
    );
    assert!(ctx.device.validation_messages().is_empty());
}

#[test]
fn test_model_upload_is_one_grouped_batch() {
    let mut ctx = TestContext::new(ExecutionMode::Immediate, 4);
    let scene = common::diffuse_scene(2);
    let mut model = Model::from_scene(&mut ctx.device, &scene, &ImageCrateDecoder, 8, "batch").unwrap();
    let before = ctx.device.submissions().len();
    model
        .upload_gpu(&mut ctx.device, &mut ctx.descriptors, &ctx.fallback, &mut ctx.sync)
        .unwrap();

    let submissions = ctx.device.submissions();
    assert_eq!(submissions.len(), before + 1);
    let upload = submissions.last().unwrap();
    // Two meshes with two buffers each, one texture.
    let mut expected = vec![CommandKind::Barrier];
    expected.extend(std::iter::repeat(CommandKind::Copy).take(5));
    expected.push(CommandKind::Barrier);
    assert_eq!(upload.kinds(), expected);

    let barriers: Vec<_> = upload.barriers().collect();
    assert_eq!(barriers.len(), 10);
    assert!(barriers[..5]
        .iter()
        .all(|b| b.before == ResourceState::Common && b.after == ResourceState::CopyDest));
    let terminal: Vec<_> = barriers[5..].iter().map(|b| b.after).collect();
    assert_eq!(
        terminal
            .iter()
            .filter(|&&state| state == ResourceState::VertexOrConstant)
            .count(),
        2
    );
    assert_eq!(
        terminal
            .iter()
            .filter(|&&state| state == ResourceState::IndexBuffer)
            .count(),
        2
    );
    assert!(terminal.contains(&ResourceState::PixelShaderResource));
}

#[test]
fn test_upload_heaps_outlive_deferred_upload() {
    let mut ctx = TestContext::new(ExecutionMode::Deferred, 4);
    let mut model =
        Model::from_scene(&mut ctx.device, &common::diffuse_scene(1), &ImageCrateDecoder, 8, "deferred").unwrap();
    model
        .upload_gpu(&mut ctx.device, &mut ctx.descriptors, &ctx.fallback, &mut ctx.sync)
        .unwrap();
    let fence = model.upload_fence().unwrap();
    assert!(ctx.device.completed_value() < fence);

    // Freeing the staging buffers waits for the copies to retire first.
    model.reset_upload_heaps(&mut ctx.device, &mut ctx.sync).unwrap();
    assert!(ctx.device.completed_value() >= fence);
    assert!(ctx.device.validation_messages().is_empty());
}
