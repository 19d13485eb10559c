//! Models: the meshes and materials of one loaded scene.
//!
//! Lifecycle of a [`Model`]:
//!
//! 1. [`Model::from_scene`] creates every device buffer and texture in
//!    `Common` and stages its data (CPU phase).
//! 2. [`Model::upload_gpu`] records all copies into one batch, submits it
//!    and remembers the fence value that retires it.
//! 3. [`Model::reset_upload_heaps`] waits for that fence and frees the
//!    staging buffers.
//! 4. [`Model::unload_gpu`] frees the device resources and descriptor slots.
//!
//! Steps 3 and 4 fail on a second call instead of passing silently.

use std::f32::consts::TAU;
use std::path::Path;

use glam::{Mat4, Vec3, Vec4};

use super::material::Material;
use super::mesh::Mesh;
use super::texture::{ChannelType, FallbackTexture};
use crate::backend::*;
use crate::descriptor::DescriptorAllocator;
use crate::error::{ViewerError, ViewerResult};
use crate::renderer::DrawContext;
use crate::scene::{
    rotation_from_euler, ImageDecoder, MaterialRecord, MeshInstance, SceneDecoder, SceneDescription, Transform,
};
use crate::sync::FrameSync;
use crate::upload::UploadBatch;

/// Meshes and materials of one loaded asset
#[derive(Debug)]
pub struct Model {
    pub name: String,
    meshes: Vec<Mesh>,
    materials: Vec<Material>,
    root_rotation: Vec3,
    upload_fence: Option<u64>,
    uploaded: bool,
}

impl Model {
    /// Decode `path` and stage its content.
    pub fn load<D: GpuDevice>(
        device: &mut D,
        path: &Path,
        scenes: &dyn SceneDecoder,
        images: &dyn ImageDecoder,
        max_meshes: usize,
    ) -> ViewerResult<Self> {
        let scene = scenes.decode(path)?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        Self::from_scene(device, &scene, images, max_meshes, &name)
    }

    /// Place every mesh of `scene` and stage its geometry and textures.
    ///
    /// Textures that fail to decode are skipped with a warning and their
    /// channel falls back to the placeholder. Any other failure releases what
    /// was created so far and is returned.
    pub fn from_scene<D: GpuDevice>(
        device: &mut D,
        scene: &SceneDescription,
        images: &dyn ImageDecoder,
        max_meshes: usize,
        name: &str,
    ) -> ViewerResult<Self> {
        let instances = scene.traverse()?;
        if instances.len() > max_meshes {
            log::error!(
                "Model {}: {} meshes exceed the limit of {}",
                name,
                instances.len(),
                max_meshes
            );
            return Err(ViewerError::TooManyMeshes {
                count: instances.len(),
                limit: max_meshes,
            });
        }
        let transforms = instances
            .iter()
            .map(|instance| {
                Transform::from_matrix(&instance.world).map_err(|err| match err {
                    ViewerError::DegenerateTransform(reason) => ViewerError::DegenerateTransform(format!(
                        "node {}: {}",
                        scene.nodes[instance.node].name, reason
                    )),
                    other => other,
                })
            })
            .collect::<ViewerResult<Vec<_>>>()?;

        let mut model = Self {
            name: name.to_string(),
            meshes: Vec::with_capacity(instances.len()),
            materials: Vec::with_capacity(scene.materials.len()),
            root_rotation: Vec3::ZERO,
            upload_fence: None,
            uploaded: false,
        };
        if let Err(err) = model.stage(device, scene, images, &instances, transforms) {
            model.discard(device);
            return Err(err);
        }
        log::debug!(
            "Model {}: staged {} meshes, {} materials",
            model.name,
            model.meshes.len(),
            model.materials.len()
        );
        Ok(model)
    }

    fn stage<D: GpuDevice>(
        &mut self,
        device: &mut D,
        scene: &SceneDescription,
        images: &dyn ImageDecoder,
        instances: &[MeshInstance],
        transforms: Vec<Transform>,
    ) -> ViewerResult<()> {
        // Only materials some placed mesh uses are loaded, in first-use order.
        let mut remap: Vec<Option<usize>> = vec![None; scene.materials.len()];
        for (instance, transform) in instances.iter().zip(transforms) {
            let record = &scene.meshes[instance.mesh];
            let Some(slot) = remap.get_mut(record.material) else {
                return Err(ViewerError::SceneLoad(format!(
                    "mesh {} references material {} ({} materials)",
                    record.name,
                    record.material,
                    scene.materials.len()
                )));
            };
            let material = match *slot {
                Some(material) => material,
                None => {
                    let material = load_material(device, &scene.materials[record.material], images)?;
                    self.materials.push(material);
                    *slot = Some(self.materials.len() - 1);
                    self.materials.len() - 1
                }
            };
            let mesh = Mesh::load(device, record, transform, material)?;
            self.meshes.push(mesh);
        }
        let unused = remap.iter().filter(|slot| slot.is_none()).count();
        if unused > 0 {
            log::debug!("Model {}: skipped {} unused materials", self.name, unused);
        }
        Ok(())
    }

    /// Release everything a failed load created.
    fn discard<D: GpuDevice>(&mut self, device: &mut D) {
        for mesh in &mut self.meshes {
            mesh.release_staging(device);
            mesh.release_gpu(device);
        }
        for material in &mut self.materials {
            material.release_staging(device);
            material.release_textures(device);
        }
    }

    pub fn meshes(&self) -> &[Mesh] {
        &self.meshes
    }

    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    /// Whether the last upload was submitted and nothing has been unloaded since.
    pub fn is_gpu_resident(&self) -> bool {
        self.uploaded
    }

    /// Fence value that retires the upload, once submitted.
    pub fn upload_fence(&self) -> Option<u64> {
        self.upload_fence
    }

    /// Root rotation as (roll, pitch, yaw) in radians.
    pub fn root_rotation(&self) -> Vec3 {
        self.root_rotation
    }

    pub fn set_root_rotation(&mut self, rotation: Vec3) {
        self.root_rotation = Vec3::new(wrap_angle(rotation.x), wrap_angle(rotation.y), wrap_angle(rotation.z));
    }

    /// Add to the root rotation, keeping every angle in [0, 2π).
    pub fn rotate_add(&mut self, delta: Vec3) {
        self.set_root_rotation(self.root_rotation + delta);
    }

    pub fn root_rotation_matrix(&self) -> Mat4 {
        Mat4::from_quat(rotation_from_euler(self.root_rotation))
    }

    /// World matrix of mesh `index`: root rotation × translation × rotation × scale.
    pub fn world_matrix(&self, index: usize) -> Option<Mat4> {
        self.meshes
            .get(index)
            .map(|mesh| self.root_rotation_matrix() * mesh.transform.matrix())
    }

    /// Upload every mesh and material in one batch.
    ///
    /// Descriptor tables are allocated from `descriptors`. Calling this again
    /// while uploaded does nothing. If the batch cannot be queued or
    /// submitted, the tables allocated by this call are returned and every
    /// resource stays in `Common`, so the upload can be retried.
    pub fn upload_gpu<D: GpuDevice>(
        &mut self,
        device: &mut D,
        descriptors: &mut DescriptorAllocator,
        fallback: &FallbackTexture,
        sync: &mut FrameSync,
    ) -> ViewerResult<()> {
        if self.uploaded {
            log::debug!("Model {}: already on the GPU", self.name);
            return Ok(());
        }
        let mut batch = UploadBatch::new();
        let submitted = self
            .enqueue_upload(device, descriptors, fallback, &mut batch)
            .and_then(|()| batch.submit(device, sync));
        let fence = match submitted {
            Ok(fence) => fence,
            Err(err) => {
                log::warn!("Model {}: upload abandoned: {}", self.name, err);
                for material in &mut self.materials {
                    material.release_table(descriptors)?;
                }
                return Err(err);
            }
        };
        for mesh in &mut self.meshes {
            mesh.complete_upload(&batch)?;
            mesh.create_views(device)?;
        }
        for material in &mut self.materials {
            material.complete_upload(&batch)?;
        }
        self.upload_fence = Some(fence);
        self.uploaded = true;
        log::debug!(
            "Model {}: submitted {} uploads, retired at fence {}",
            self.name,
            batch.len(),
            fence
        );
        Ok(())
    }

    fn enqueue_upload<D: GpuDevice>(
        &mut self,
        device: &mut D,
        descriptors: &mut DescriptorAllocator,
        fallback: &FallbackTexture,
        batch: &mut UploadBatch,
    ) -> ViewerResult<()> {
        for mesh in &mut self.meshes {
            mesh.enqueue_upload(batch)?;
        }
        for material in &mut self.materials {
            material.upload_gpu(device, descriptors, fallback, batch)?;
        }
        Ok(())
    }

    /// Wait for the upload to retire, then free every staging buffer.
    pub fn reset_upload_heaps<D: GpuDevice>(&mut self, device: &mut D, sync: &mut FrameSync) -> ViewerResult<()> {
        let staged = self.meshes.iter().any(Mesh::has_staging) || self.materials.iter().any(Material::is_cpu_resident);
        if !staged {
            log::error!("Model {}: no upload heaps to reset", self.name);
            return Err(ViewerError::NoCpuResource(format!("model {}", self.name)));
        }
        if let Some(fence) = self.upload_fence {
            sync.wait_for_value(device, fence)?;
        }
        for mesh in &mut self.meshes {
            mesh.release_staging(device);
        }
        for material in &mut self.materials {
            material.release_staging(device);
        }
        log::debug!("Model {}: upload heaps released", self.name);
        Ok(())
    }

    /// Free the device buffers, textures and descriptor tables.
    ///
    /// The GPU must have retired every frame that drew the model.
    pub fn unload_gpu<D: GpuDevice>(&mut self, device: &mut D, descriptors: &mut DescriptorAllocator) -> ViewerResult<()> {
        let resident =
            self.meshes.iter().any(Mesh::has_gpu_resources) || self.materials.iter().any(Material::has_gpu_resources);
        if !resident {
            log::error!("Model {}: nothing on the GPU to unload", self.name);
            return Err(ViewerError::NoGpuResource(format!("model {}", self.name)));
        }
        for mesh in &mut self.meshes {
            mesh.release_gpu(device);
        }
        for material in &mut self.materials {
            material.release_gpu(device, descriptors)?;
        }
        self.uploaded = false;
        self.upload_fence = None;
        log::debug!("Model {}: unloaded from the GPU", self.name);
        Ok(())
    }

    /// Record one draw per mesh, using draw slots `first_draw..first_draw + mesh_count`.
    ///
    /// Returns the number of draw slots the model reserves. A mesh whose
    /// material is not on the GPU samples the fallback table.
    pub fn draw<D: GpuDevice>(&self, ctx: &mut DrawContext<'_, D>, first_draw: u32) -> ViewerResult<u32> {
        let root = self.root_rotation_matrix();
        for (index, mesh) in self.meshes.iter().enumerate() {
            if !mesh.is_drawable() {
                continue;
            }
            let material = self.materials.get(mesh.material());
            let world = root * mesh.transform.matrix();
            let constants = MeshConstants {
                world,
                normal_matrix: world.inverse().transpose(),
                base_color: material.map_or(Vec4::new(1.0, 0.0, 1.0, 1.0), |m| m.base_color),
                metallic: material.map_or(0.0, |m| m.metallic),
                roughness: material.map_or(0.0, |m| m.roughness),
                opacity: material.map_or(1.0, |m| m.opacity),
                texture_flags: material.map_or(0, Material::texture_flags),
            };
            let address = ctx
                .mesh_constants
                .write(ctx.device, ctx.frame_slot, first_draw + index as u32, &constants)?;
            ctx.device
                .set_graphics_root_constant_buffer_view(root::MESH_CONSTANTS, address);
            if !material.is_some_and(|material| material.bind(ctx.device)) {
                ctx.device
                    .set_graphics_root_descriptor_table(root::MATERIAL_TABLE, ctx.fallback_table);
            }
            mesh.bind_geometry(ctx.device);
            ctx.device.draw_indexed_instanced(mesh.index_count(), 1, 0, 0, 0);
        }
        Ok(self.meshes.len() as u32)
    }
}

/// Map an angle into [0, 2π).
fn wrap_angle(angle: f32) -> f32 {
    let wrapped = angle.rem_euclid(TAU);
    // Tiny negative angles round up to TAU itself.
    if wrapped >= TAU {
        0.0
    } else {
        wrapped
    }
}

fn load_material<D: GpuDevice>(
    device: &mut D,
    record: &MaterialRecord,
    images: &dyn ImageDecoder,
) -> ViewerResult<Material> {
    let mut material = Material::new(&record.name)
        .with_base_color(record.base_color)
        .with_metallic(record.metallic)
        .with_roughness(record.roughness)
        .with_opacity(record.opacity);
    for texture in &record.textures {
        let channel = match ChannelType::from_index(texture.channel) {
            Ok(channel) => channel,
            Err(err) => {
                log::warn!("Material {}: {}", record.name, err);
                continue;
            }
        };
        let image = match images.decode(&texture.source) {
            Ok(image) => image,
            Err(err) => {
                log::warn!("Material {}: {} texture not loaded: {}", record.name, channel, err);
                continue;
            }
        };
        match material.load_texture(device, &image, channel) {
            Ok(()) => {}
            Err(err @ ViewerError::InvalidTexture(_)) => {
                log::warn!("Material {}: {}", record.name, err);
            }
            Err(err) => {
                material.release_staging(device);
                material.release_textures(device);
                return Err(err);
            }
        }
    }
    Ok(material)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.0, 0.0)]
    #[case(TAU, 0.0)]
    #[case(-1.0, TAU - 1.0)]
    #[case(7.0, 7.0 - TAU)]
    #[case(-1e-9, 0.0)]
    fn test_wrap_angle(#[case] angle: f32, #[case] expected: f32) {
        let wrapped = wrap_angle(angle);
        assert!((0.0..TAU).contains(&wrapped));
        assert!((wrapped - expected).abs() < 1e-5, "{} -> {}", angle, wrapped);
    }
}
