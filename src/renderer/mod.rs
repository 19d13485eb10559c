//! Per-frame command recording
//!
//! [`FrameRenderer`] runs the frame state machine:
//!
//! ```text
//! Idle -> Recording -> Submitted -> (fence-gated) -> Recording -> ...
//! ```
//!
//! `begin_frame` asks [`FrameSync`] for the next ring slot, which blocks only
//! while that slot's previous frame is still on the GPU. The slot then tags
//! the command allocator that gets reset and the regions of the constant
//! rings that get rewritten.

mod constant_ring;

pub use constant_ring::*;

use crate::backend::*;
use crate::error::{ViewerError, ViewerResult};
use crate::resources::Model;
use crate::scene::{Camera, DirectionalLight};
use crate::sync::FrameSync;

/// What a model needs to record its draws into the current frame
pub struct DrawContext<'a, D: GpuDevice> {
    pub device: &'a mut D,
    pub mesh_constants: &'a ConstantRing,
    pub frame_slot: usize,
    /// Table bound for meshes whose material is not on the GPU.
    pub fallback_table: GpuDescriptorHandle,
}

/// Where the renderer is in its frame cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Recording { slot: usize, back_buffer: TextureHandle },
    Submitted { slot: usize },
}

/// Build the per-frame constants from the camera and the light.
pub fn frame_constants(camera: &Camera, light: &DirectionalLight) -> FrameConstants {
    FrameConstants {
        view: camera.view_matrix(),
        projection: camera.projection_matrix(),
        light_direction: light.direction_vector(),
        light_color: light.color,
    }
}

/// Records, submits and presents frames
#[derive(Debug)]
pub struct FrameRenderer {
    state: FrameState,
    frame_constants: ConstantRing,
    mesh_constants: ConstantRing,
    depth: TextureHandle,
    width: u32,
    height: u32,
    clear_color: [f32; 4],
    frames_submitted: u64,
}

impl FrameRenderer {
    /// Create the constant rings and the depth buffer.
    ///
    /// `max_draws` bounds the draws of one frame across all models.
    pub fn new<D: GpuDevice>(
        device: &mut D,
        ring_depth: usize,
        max_draws: u32,
        width: u32,
        height: u32,
        clear_color: [f32; 4],
    ) -> ViewerResult<Self> {
        let frame_constants = ConstantRing::new(
            device,
            ring_depth,
            1,
            std::mem::size_of::<FrameConstants>() as u64,
            "frame constants",
        )?;
        let mesh_constants = match ConstantRing::new(
            device,
            ring_depth,
            max_draws,
            std::mem::size_of::<MeshConstants>() as u64,
            "mesh constants",
        ) {
            Ok(ring) => ring,
            Err(err) => {
                frame_constants.release(device);
                return Err(err);
            }
        };
        let depth = match create_depth_buffer(device, width, height) {
            Ok(depth) => depth,
            Err(err) => {
                frame_constants.release(device);
                mesh_constants.release(device);
                return Err(err);
            }
        };
        log::debug!(
            "FrameRenderer: {}x{}, {} frames in flight, {} draws per frame",
            width,
            height,
            ring_depth,
            max_draws
        );
        Ok(Self {
            state: FrameState::Idle,
            frame_constants,
            mesh_constants,
            depth,
            width,
            height,
            clear_color,
            frames_submitted: 0,
        })
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn depth_buffer(&self) -> TextureHandle {
        self.depth
    }

    pub fn max_draws(&self) -> u32 {
        self.mesh_constants.slots_per_frame()
    }

    pub fn mesh_constants(&self) -> &ConstantRing {
        &self.mesh_constants
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    /// Recreate the depth buffer at the new size.
    ///
    /// The GPU must be idle: the old depth buffer is destroyed immediately.
    pub fn resize<D: GpuDevice>(&mut self, device: &mut D, width: u32, height: u32) -> ViewerResult<()> {
        if matches!(self.state, FrameState::Recording { .. }) {
            return Err(ViewerError::InvalidOperation("resize while a frame is recording".to_string()));
        }
        let depth = create_depth_buffer(device, width, height)?;
        device.destroy_texture(self.depth);
        self.depth = depth;
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Acquire the next ring slot and open its command list.
    ///
    /// Clears the back buffer and depth buffer, binds the shader-visible heap
    /// and writes the frame constants. Returns the ring slot.
    pub fn begin_frame<D: GpuDevice>(
        &mut self,
        device: &mut D,
        sync: &mut FrameSync,
        heap: DescriptorHeapHandle,
        constants: &FrameConstants,
    ) -> ViewerResult<usize> {
        if matches!(self.state, FrameState::Recording { .. }) {
            log::error!("FrameRenderer: begin_frame while a frame is recording");
            return Err(ViewerError::InvalidOperation("frame already recording".to_string()));
        }
        let slot = sync.advance_frame(device)?;
        if slot >= self.frame_constants.ring_depth() {
            return Err(ViewerError::InvalidOperation(format!(
                "ring slot {} outside the renderer's {} frames",
                slot,
                self.frame_constants.ring_depth()
            )));
        }
        device.reset_command_list(slot)?;

        match self.record_frame_setup(device, slot, heap, constants) {
            Ok(back_buffer) => {
                self.state = FrameState::Recording { slot, back_buffer };
                log::trace!("FrameRenderer: recording into slot {}", slot);
                Ok(slot)
            }
            Err(err) => {
                device.discard_command_list();
                self.state = FrameState::Idle;
                Err(err)
            }
        }
    }

    fn record_frame_setup<D: GpuDevice>(
        &self,
        device: &mut D,
        slot: usize,
        heap: DescriptorHeapHandle,
        constants: &FrameConstants,
    ) -> ViewerResult<TextureHandle> {
        let back_buffer = device.back_buffer(device.current_back_buffer_index())?;
        device.resource_barrier(&[ResourceBarrier::texture(
            back_buffer,
            ResourceState::Present,
            ResourceState::RenderTarget,
        )]);
        device.clear_render_target(back_buffer, self.clear_color);
        device.clear_depth(self.depth, 1.0);
        device.set_render_targets(back_buffer, Some(self.depth));
        device.set_viewport(Viewport::full(self.width, self.height));
        device.set_scissor_rect(ScissorRect::full(self.width, self.height));
        device.set_descriptor_heap(heap);

        let address = self.frame_constants.write(device, slot, 0, constants)?;
        device.set_graphics_root_constant_buffer_view(root::FRAME_CONSTANTS, address);
        Ok(back_buffer)
    }

    /// Context for models to draw into the frame being recorded.
    pub fn draw_context<'a, D: GpuDevice>(
        &'a self,
        device: &'a mut D,
        fallback_table: GpuDescriptorHandle,
    ) -> ViewerResult<DrawContext<'a, D>> {
        let FrameState::Recording { slot, .. } = self.state else {
            return Err(ViewerError::InvalidOperation("no frame is recording".to_string()));
        };
        Ok(DrawContext {
            device,
            mesh_constants: &self.mesh_constants,
            frame_slot: slot,
            fallback_table,
        })
    }

    /// Transition the back buffer for presentation, submit and present.
    pub fn end_frame<D: GpuDevice>(&mut self, device: &mut D) -> ViewerResult<()> {
        let FrameState::Recording { slot, back_buffer } = self.state else {
            return Err(ViewerError::InvalidOperation("end_frame without begin_frame".to_string()));
        };
        device.resource_barrier(&[ResourceBarrier::texture(
            back_buffer,
            ResourceState::RenderTarget,
            ResourceState::Present,
        )]);
        // A failed submit leaves nothing in flight for this slot.
        self.state = FrameState::Idle;
        device.close_and_execute()?;
        device.present()?;
        self.state = FrameState::Submitted { slot };
        self.frames_submitted += 1;
        Ok(())
    }

    /// Drop everything recorded since `begin_frame`.
    pub fn abort_frame<D: GpuDevice>(&mut self, device: &mut D) {
        if matches!(self.state, FrameState::Recording { .. }) {
            device.discard_command_list();
            self.state = FrameState::Idle;
        }
    }

    /// Record and submit one frame drawing `models` in order.
    ///
    /// Each model gets the next contiguous range of draw slots. On failure
    /// the frame is discarded. Returns the number of draw slots used.
    #[allow(clippy::too_many_arguments)]
    pub fn render_frame<D: GpuDevice>(
        &mut self,
        device: &mut D,
        sync: &mut FrameSync,
        heap: DescriptorHeapHandle,
        fallback_table: GpuDescriptorHandle,
        constants: &FrameConstants,
        models: &[Model],
    ) -> ViewerResult<u32> {
        self.begin_frame(device, sync, heap, constants)?;
        let recorded = self.draw_context(device, fallback_table).and_then(|mut ctx| {
            let mut first_draw = 0;
            for model in models {
                first_draw += model.draw(&mut ctx, first_draw)?;
            }
            Ok(first_draw)
        });
        match recorded {
            Ok(draws) => {
                self.end_frame(device)?;
                Ok(draws)
            }
            Err(err) => {
                log::error!("FrameRenderer: frame discarded: {}", err);
                self.abort_frame(device);
                Err(err)
            }
        }
    }

    /// Destroy the constant rings and the depth buffer. The GPU must be idle.
    pub fn release<D: GpuDevice>(self, device: &mut D) {
        self.frame_constants.release(device);
        self.mesh_constants.release(device);
        device.destroy_texture(self.depth);
    }
}

fn create_depth_buffer<D: GpuDevice>(device: &mut D, width: u32, height: u32) -> ViewerResult<TextureHandle> {
    if width == 0 || height == 0 {
        return Err(ViewerError::InvalidOperation(format!(
            "depth buffer of {}x{}",
            width, height
        )));
    }
    Ok(device.create_texture(&TextureDescriptor {
        label: Some("depth buffer".to_string()),
        width,
        height,
        format: TextureFormat::Depth32Float,
        initial_state: ResourceState::DepthWrite,
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorAllocator;
    use crate::resources::FallbackTexture;
    use crate::scene::{ImageCrateDecoder, MaterialRecord, MeshRecord, SceneDescription, SceneNode};
    use glam::Mat4;
    use std::time::Duration;

    struct Fixture {
        device: SoftwareDevice,
        sync: FrameSync,
        descriptors: DescriptorAllocator,
        fallback: FallbackTexture,
        renderer: FrameRenderer,
    }

    impl Fixture {
        fn new(max_draws: u32) -> Self {
            let mut device = SoftwareDevice::default();
            device.resize_swap_chain(64, 64, 2).unwrap();
            let mut sync = FrameSync::new(2, Duration::from_secs(1)).unwrap();
            let mut descriptors = DescriptorAllocator::create(&mut device, 28 * 4, "descriptors").unwrap();
            let fallback = FallbackTexture::create(&mut device, &mut descriptors, &mut sync).unwrap();
            let renderer = FrameRenderer::new(&mut device, 2, max_draws, 64, 64, [0.0, 0.0, 0.0, 1.0]).unwrap();
            Self {
                device,
                sync,
                descriptors,
                fallback,
                renderer,
            }
        }

        fn model(&mut self, meshes: usize) -> Model {
            let scene = SceneDescription {
                nodes: vec![SceneNode::new("root", Mat4::IDENTITY).with_meshes((0..meshes).collect())],
                root: 0,
                meshes: vec![MeshRecord::cube(0); meshes],
                materials: vec![MaterialRecord::default()],
            };
            let mut model = Model::from_scene(&mut self.device, &scene, &ImageCrateDecoder, 16, "cubes").unwrap();
            model
                .upload_gpu(&mut self.device, &mut self.descriptors, &self.fallback, &mut self.sync)
                .unwrap();
            model
        }

        fn render(&mut self, models: &[Model]) -> ViewerResult<u32> {
            let constants = frame_constants(&Camera::default(), &DirectionalLight::default());
            let heap = self.descriptors.heap().heap;
            self.renderer.render_frame(
                &mut self.device,
                &mut self.sync,
                heap,
                self.fallback.table(),
                &constants,
                models,
            )
        }
    }

    #[test]
    fn test_empty_frame_presents() {
        let mut fixture = Fixture::new(4);
        assert_eq!(fixture.render(&[]).unwrap(), 0);
        assert_eq!(fixture.renderer.state(), FrameState::Submitted { slot: 0 });
        assert_eq!(fixture.device.presents(), 1);
        assert!(fixture.device.validation_messages().is_empty());
    }

    #[test]
    fn test_frames_draw_every_mesh() {
        let mut fixture = Fixture::new(4);
        let models = vec![fixture.model(2), fixture.model(1)];
        for _ in 0..3 {
            assert_eq!(fixture.render(&models).unwrap(), 3);
        }
        assert_eq!(fixture.device.executed_draws().len(), 9);
        assert_eq!(fixture.renderer.frames_submitted(), 3);
        assert!(
            fixture.device.validation_messages().is_empty(),
            "{:?}",
            fixture.device.validation_messages()
        );
    }

    #[test]
    fn test_begin_twice_is_rejected() {
        let mut fixture = Fixture::new(4);
        let constants = frame_constants(&Camera::default(), &DirectionalLight::default());
        let heap = fixture.descriptors.heap().heap;
        fixture
            .renderer
            .begin_frame(&mut fixture.device, &mut fixture.sync, heap, &constants)
            .unwrap();
        let again = fixture
            .renderer
            .begin_frame(&mut fixture.device, &mut fixture.sync, heap, &constants);
        assert!(matches!(again, Err(ViewerError::InvalidOperation(_))));
        fixture.renderer.end_frame(&mut fixture.device).unwrap();
    }

    #[test]
    fn test_overfull_frame_is_discarded() {
        let mut fixture = Fixture::new(2);
        let models = vec![fixture.model(3)];
        assert!(matches!(
            fixture.render(&models),
            Err(ViewerError::TooManyMeshes { count: 3, limit: 2 })
        ));
        assert_eq!(fixture.renderer.state(), FrameState::Idle);
        assert_eq!(fixture.device.presents(), 0);
        assert_eq!(fixture.render(&[]).unwrap(), 0);
    }

    #[test]
    fn test_resize_recreates_depth() {
        let mut fixture = Fixture::new(1);
        let old = fixture.renderer.depth_buffer();
        fixture.renderer.resize(&mut fixture.device, 32, 16).unwrap();
        assert!(!fixture.device.texture_exists(old));
        assert!(fixture.device.texture_exists(fixture.renderer.depth_buffer()));
        assert_eq!(fixture.renderer.size(), (32, 16));
    }
}
