//! Viewer shell: owns the device and every subsystem, and exposes the
//! host-facing contract (`on_resize`, `toggle_full_screen`, `on_update`,
//! `on_render`).

use std::path::Path;
use std::time::Instant;

use glam::Vec3;

use crate::backend::*;
use crate::descriptor::DescriptorAllocator;
use crate::error::{ViewerError, ViewerResult};
use crate::renderer::{frame_constants, FrameRenderer};
use crate::resources::{FallbackTexture, Model};
use crate::scene::{
    Camera, DirectionalLight, GltfSceneDecoder, ImageCrateDecoder, ImageDecoder, SceneDecoder, SceneDescription,
};
use crate::sync::FrameSync;
use crate::ViewerConfig;

/// Model viewer over a [`GpuDevice`]
pub struct Viewer<D: GpuDevice> {
    config: ViewerConfig,
    device: D,
    sync: FrameSync,
    descriptors: DescriptorAllocator,
    fallback: FallbackTexture,
    renderer: FrameRenderer,
    camera: Camera,
    light: DirectionalLight,
    models: Vec<Model>,
    scenes: Box<dyn SceneDecoder>,
    images: Box<dyn ImageDecoder>,
    width: u32,
    height: u32,
    windowed_size: (u32, u32),
    full_screen: bool,
    start_time: Instant,
    last_frame_time: Instant,
    elapsed_time: f32,
    frame_count: u64,
}

impl<D: GpuDevice> Viewer<D> {
    /// Create a viewer decoding glTF scenes and images through the `gltf` and `image` crates.
    pub fn new(device: D, config: ViewerConfig) -> ViewerResult<Self> {
        Self::with_decoders(
            device,
            config,
            Box::new(GltfSceneDecoder::new()),
            Box::new(ImageCrateDecoder::new()),
        )
    }

    /// Create a viewer with custom scene and image decoders.
    pub fn with_decoders(
        mut device: D,
        config: ViewerConfig,
        scenes: Box<dyn SceneDecoder>,
        images: Box<dyn ImageDecoder>,
    ) -> ViewerResult<Self> {
        log::info!(
            "{}: starting on {} ({}x{}, {} frames in flight, {} meshes)",
            config.title,
            device.name(),
            config.width,
            config.height,
            config.ring_depth,
            config.max_meshes
        );
        let max_draws = u32::try_from(config.max_meshes)
            .ok()
            .filter(|&max| max > 0 && max < u32::MAX / root::MATERIAL_TABLE_SIZE)
            .ok_or_else(|| {
                ViewerError::InvalidOperation(format!("unsupported mesh limit {}", config.max_meshes))
            })?;

        let mut sync = FrameSync::new(config.ring_depth, config.fence_timeout)?;
        device.resize_swap_chain(config.width, config.height, config.ring_depth as u32)?;

        // One table per mesh plus the fallback table.
        let capacity = (max_draws + 1) * root::MATERIAL_TABLE_SIZE;
        let mut descriptors = DescriptorAllocator::create(&mut device, capacity, "material tables")?;
        let fallback = FallbackTexture::create(&mut device, &mut descriptors, &mut sync)?;
        let renderer = match FrameRenderer::new(
            &mut device,
            config.ring_depth,
            max_draws,
            config.width,
            config.height,
            config.clear_color,
        ) {
            Ok(renderer) => renderer,
            Err(err) => {
                fallback.release(&mut device, &mut descriptors)?;
                return Err(err);
            }
        };

        let mut camera = Camera::default();
        camera.set_aspect(config.width, config.height);
        let now = Instant::now();
        Ok(Self {
            width: config.width,
            height: config.height,
            windowed_size: (config.width, config.height),
            config,
            device,
            sync,
            descriptors,
            fallback,
            renderer,
            camera,
            light: DirectionalLight::default(),
            models: Vec::new(),
            scenes,
            images,
            full_screen: false,
            start_time: now,
            last_frame_time: now,
            elapsed_time: 0.0,
            frame_count: 0,
        })
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn light(&self) -> &DirectionalLight {
        &self.light
    }

    pub fn set_light(&mut self, light: DirectionalLight) {
        self.light = light;
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut [Model] {
        &mut self.models
    }

    pub fn descriptors(&self) -> &DescriptorAllocator {
        &self.descriptors
    }

    pub fn fallback(&self) -> &FallbackTexture {
        &self.fallback
    }

    pub fn frame_sync(&self) -> &FrameSync {
        &self.sync
    }

    pub fn renderer(&self) -> &FrameRenderer {
        &self.renderer
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_full_screen(&self) -> bool {
        self.full_screen
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Seconds accumulated by [`Self::on_update`] and [`Self::update`].
    pub fn elapsed_time(&self) -> f32 {
        self.elapsed_time
    }

    /// Meshes across all loaded models.
    pub fn mesh_count(&self) -> usize {
        self.models.iter().map(Model::mesh_count).sum()
    }

    /// Resize the swap chain and everything sized to it.
    ///
    /// Zero sizes (a minimized window) and unchanged sizes are ignored.
    pub fn on_resize(&mut self, width: u32, height: u32) -> ViewerResult<()> {
        if width == 0 || height == 0 {
            log::debug!("Viewer: ignoring resize to {}x{}", width, height);
            return Ok(());
        }
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }
        log::debug!("Viewer: resizing {}x{} -> {}x{}", self.width, self.height, width, height);

        // The back buffers and depth buffer are destroyed below.
        self.sync.wait_for_idle(&mut self.device)?;
        self.device
            .resize_swap_chain(width, height, self.config.ring_depth as u32)?;
        self.renderer.resize(&mut self.device, width, height)?;
        self.camera.set_aspect(width, height);
        self.width = width;
        self.height = height;
        if !self.full_screen {
            self.windowed_size = (width, height);
        }
        Ok(())
    }

    /// Switch between the windowed size and the full-screen size.
    ///
    /// The mode only changes once the resize has succeeded.
    pub fn toggle_full_screen(&mut self) -> ViewerResult<()> {
        let full_screen = !self.full_screen;
        let (width, height) = if full_screen {
            (self.config.full_screen_width, self.config.full_screen_height)
        } else {
            self.windowed_size
        };
        log::info!(
            "Viewer: {} ({}x{})",
            if full_screen { "full screen" } else { "windowed" },
            width,
            height
        );
        // Entering full screen must not overwrite the remembered windowed size.
        let windowed_size = self.windowed_size;
        self.full_screen = full_screen;
        if let Err(err) = self.on_resize(width, height) {
            self.full_screen = !full_screen;
            self.windowed_size = windowed_size;
            return Err(err);
        }
        Ok(())
    }

    /// Advance the frame timer by the wall-clock time since the last call.
    pub fn on_update(&mut self) {
        let now = Instant::now();
        let delta_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.update(delta_time);
        log::trace!(
            "Viewer: update at {:.3}s",
            now.duration_since(self.start_time).as_secs_f32()
        );
    }

    /// Advance by `delta_time` seconds: spin every model about the vertical axis.
    pub fn update(&mut self, delta_time: f32) {
        self.elapsed_time += delta_time;
        // Yaw is the third Euler component.
        let spin = Vec3::new(0.0, 0.0, self.config.spin_rate * delta_time);
        for model in &mut self.models {
            model.rotate_add(spin);
        }
    }

    /// Record, submit and present one frame. Returns the draw slots used.
    pub fn on_render(&mut self) -> ViewerResult<u32> {
        let constants = frame_constants(&self.camera, &self.light);
        let heap = self.descriptors.heap().heap;
        let draws = self.renderer.render_frame(
            &mut self.device,
            &mut self.sync,
            heap,
            self.fallback.table(),
            &constants,
            &self.models,
        )?;
        self.frame_count += 1;
        Ok(draws)
    }

    /// Decode `path` with the scene decoder, upload it and add it to the view.
    pub fn load_model(&mut self, path: &Path) -> ViewerResult<usize> {
        let limit = self.remaining_meshes();
        let model = Model::load(&mut self.device, path, self.scenes.as_ref(), self.images.as_ref(), limit)?;
        self.add_model(model)
    }

    /// Upload an already decoded scene and add it to the view.
    pub fn load_scene(&mut self, scene: &SceneDescription, name: &str) -> ViewerResult<usize> {
        let limit = self.remaining_meshes();
        let model = Model::from_scene(&mut self.device, scene, self.images.as_ref(), limit, name)?;
        self.add_model(model)
    }

    fn remaining_meshes(&self) -> usize {
        self.config.max_meshes.saturating_sub(self.mesh_count())
    }

    /// Upload a staged model, free its upload heaps and append it. Returns its index.
    fn add_model(&mut self, mut model: Model) -> ViewerResult<usize> {
        let uploaded = model
            .upload_gpu(&mut self.device, &mut self.descriptors, &self.fallback, &mut self.sync)
            .and_then(|()| model.reset_upload_heaps(&mut self.device, &mut self.sync));
        if let Err(err) = uploaded {
            log::error!("Viewer: upload of {} failed: {}", model.name, err);
            self.sync.wait_for_idle(&mut self.device)?;
            if model.reset_upload_heaps(&mut self.device, &mut self.sync).is_err() {
                log::debug!("Viewer: {} had no upload heaps left", model.name);
            }
            if model.unload_gpu(&mut self.device, &mut self.descriptors).is_err() {
                log::debug!("Viewer: {} had nothing on the GPU", model.name);
            }
            return Err(err);
        }
        log::info!("Viewer: loaded {} ({} meshes)", model.name, model.mesh_count());
        self.models.push(model);
        Ok(self.models.len() - 1)
    }

    /// Wait for the GPU, then unload and drop every model.
    pub fn unload_all(&mut self) -> ViewerResult<()> {
        if self.models.is_empty() {
            return Ok(());
        }
        self.sync.wait_for_idle(&mut self.device)?;
        for mut model in self.models.drain(..) {
            if model.is_gpu_resident() {
                model.unload_gpu(&mut self.device, &mut self.descriptors)?;
            }
        }
        log::debug!("Viewer: all models unloaded");
        Ok(())
    }

    /// Drain the GPU, release everything and hand the device back.
    pub fn shutdown(mut self) -> ViewerResult<D> {
        log::info!("Viewer: shutting down after {} frames", self.frame_count);
        self.unload_all()?;
        self.sync.wait_for_idle(&mut self.device)?;
        self.renderer.release(&mut self.device);
        self.fallback.release(&mut self.device, &mut self.descriptors)?;
        Ok(self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::MAX_TEXTURE_DIMENSION;
    use crate::scene::{MaterialRecord, MeshRecord, SceneNode};
    use glam::Mat4;

    fn config() -> ViewerConfig {
        ViewerConfig {
            width: 64,
            height: 48,
            full_screen_width: 128,
            full_screen_height: 96,
            max_meshes: 4,
            ..Default::default()
        }
    }

    fn cube_scene(meshes: usize) -> SceneDescription {
        SceneDescription {
            nodes: vec![SceneNode::new("root", Mat4::IDENTITY).with_meshes((0..meshes).collect())],
            root: 0,
            meshes: vec![MeshRecord::cube(0); meshes],
            materials: vec![MaterialRecord::default()],
        }
    }

    #[test]
    fn test_descriptor_capacity_covers_fallback() {
        let viewer = Viewer::new(SoftwareDevice::default(), config()).unwrap();
        assert_eq!(viewer.descriptors().capacity(), 5 * 28);
        assert_eq!(viewer.descriptors().free_count(), 4 * 28);
    }

    #[test]
    fn test_resize_ignores_zero_and_unchanged() {
        let mut viewer = Viewer::new(SoftwareDevice::default(), config()).unwrap();
        let depth = viewer.renderer().depth_buffer();
        viewer.on_resize(0, 10).unwrap();
        viewer.on_resize(64, 48).unwrap();
        assert_eq!(viewer.renderer().depth_buffer(), depth);

        viewer.on_resize(80, 40).unwrap();
        assert_eq!(viewer.size(), (80, 40));
        assert_eq!(viewer.device().swap_chain_size(), (80, 40));
        assert!((viewer.camera().projection.aspect - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_full_screen_round_trip() {
        let mut viewer = Viewer::new(SoftwareDevice::default(), config()).unwrap();
        viewer.toggle_full_screen().unwrap();
        assert!(viewer.is_full_screen());
        assert_eq!(viewer.size(), (128, 96));
        viewer.toggle_full_screen().unwrap();
        assert_eq!(viewer.size(), (64, 48));
    }

    #[test]
    fn test_unreferenced_material_does_not_take_a_table() {
        let mut viewer = Viewer::new(
            SoftwareDevice::default(),
            ViewerConfig {
                max_meshes: 1,
                ..config()
            },
        )
        .unwrap();
        let mut scene = cube_scene(1);
        scene.materials.push(MaterialRecord::default());

        viewer.load_scene(&scene, "cube").unwrap();
        assert_eq!(viewer.models()[0].materials().len(), 1);
        assert_eq!(viewer.descriptors().free_count(), 0);
        assert_eq!(viewer.on_render().unwrap(), 1);
    }

    #[test]
    fn test_failed_toggle_keeps_mode() {
        let mut config = config();
        config.full_screen_width = MAX_TEXTURE_DIMENSION + 1;
        let mut viewer = Viewer::new(SoftwareDevice::default(), config).unwrap();

        assert!(viewer.toggle_full_screen().is_err());
        assert!(!viewer.is_full_screen());
        assert_eq!(viewer.size(), (64, 48));
    }

    #[test]
    fn test_update_spins_models() {
        let mut viewer = Viewer::new(SoftwareDevice::default(), config()).unwrap();
        viewer.load_scene(&cube_scene(1), "cube").unwrap();
        viewer.update(1.0);
        let rotation = viewer.models()[0].root_rotation();
        assert_eq!(rotation.x, 0.0);
        assert!((rotation.z - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_mesh_limit_spans_models() {
        let mut viewer = Viewer::new(SoftwareDevice::default(), config()).unwrap();
        viewer.load_scene(&cube_scene(3), "three").unwrap();
        assert!(matches!(
            viewer.load_scene(&cube_scene(2), "two"),
            Err(ViewerError::TooManyMeshes { count: 2, limit: 1 })
        ));
        assert_eq!(viewer.models().len(), 1);
        assert_eq!(viewer.on_render().unwrap(), 3);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut viewer = Viewer::new(SoftwareDevice::default(), config()).unwrap();
        viewer.load_scene(&cube_scene(2), "cubes").unwrap();
        viewer.on_render().unwrap();
        let device = viewer.shutdown().unwrap();
        // Only the swap chain remains.
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_texture_count(), 2);
        assert!(device.validation_messages().is_empty());
    }
}
