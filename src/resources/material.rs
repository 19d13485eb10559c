//! Materials: scalar factors plus one descriptor table of channel textures

use glam::Vec4;

use super::texture::{ChannelType, FallbackTexture, Texture, MAX_CHANNEL_COUNT};
use crate::backend::*;
use crate::descriptor::{DescriptorAllocator, DescriptorRange};
use crate::error::{ViewerError, ViewerResult};
use crate::scene::DecodedImage;
use crate::upload::UploadBatch;

/// PBR material and its channel textures
#[derive(Debug)]
pub struct Material {
    pub name: String,
    pub base_color: Vec4,
    pub metallic: f32,
    pub roughness: f32,
    pub opacity: f32,
    texture_flags: u32,
    textures: Vec<Texture>,
    table: Option<DescriptorRange>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            base_color: Vec4::new(1.0, 0.0, 1.0, 1.0),
            metallic: 0.0,
            roughness: 0.0,
            opacity: 1.0,
            texture_flags: 0,
            textures: Vec::new(),
            table: None,
        }
    }
}

impl Material {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_base_color(mut self, color: Vec4) -> Self {
        self.base_color = color;
        self
    }

    pub fn with_metallic(mut self, metallic: f32) -> Self {
        self.metallic = metallic;
        self
    }

    pub fn with_roughness(mut self, roughness: f32) -> Self {
        self.roughness = roughness;
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity;
        self
    }

    /// Presence mask: bit `i` is set when channel `i` has a texture.
    pub fn texture_flags(&self) -> u32 {
        self.texture_flags
    }

    pub fn has_channel(&self, channel: ChannelType) -> bool {
        self.texture_flags & channel.bit() != 0
    }

    pub fn textures(&self) -> &[Texture] {
        &self.textures
    }

    pub fn texture(&self, channel: ChannelType) -> Option<&Texture> {
        self.textures.iter().find(|texture| texture.channel() == channel)
    }

    /// Whether any texture still holds a staging buffer.
    pub fn is_cpu_resident(&self) -> bool {
        self.textures.iter().any(Texture::has_staging)
    }

    /// Whether the descriptor table has been allocated and filled.
    pub fn is_gpu_resident(&self) -> bool {
        self.table.is_some()
    }

    /// The material's descriptor table, once uploaded.
    pub fn descriptor_range(&self) -> Option<&DescriptorRange> {
        self.table.as_ref()
    }

    /// Stage `image` for `channel` and record the channel as present.
    ///
    /// A channel can be loaded once.
    pub fn load_texture<D: GpuDevice>(
        &mut self,
        device: &mut D,
        image: &DecodedImage,
        channel: ChannelType,
    ) -> ViewerResult<()> {
        if self.has_channel(channel) {
            return Err(ViewerError::InvalidTexture(format!(
                "material {} already has a {} texture",
                self.name, channel
            )));
        }
        if image.width == 0 || image.height == 0 || image.pixels.is_empty() {
            return Err(ViewerError::InvalidTexture(format!(
                "material {}: empty {} image",
                self.name, channel
            )));
        }
        let label = format!("{} {}", self.name, channel);
        let texture = Texture::load(device, image, channel, &label)?;
        self.textures.push(texture);
        self.texture_flags |= channel.bit();
        log::debug!("Material {}: loaded {} texture", self.name, channel);
        Ok(())
    }

    /// Like [`Self::load_texture`], for a channel given as a raw index.
    pub fn load_texture_raw<D: GpuDevice>(
        &mut self,
        device: &mut D,
        image: Option<&DecodedImage>,
        channel: u32,
    ) -> ViewerResult<()> {
        let channel = ChannelType::from_index(channel)?;
        let image = image.ok_or_else(|| {
            ViewerError::InvalidTexture(format!("material {}: no image for {}", self.name, channel))
        })?;
        self.load_texture(device, image, channel)
    }

    /// Allocate the descriptor table and queue the texture uploads.
    ///
    /// Every slot first receives the fallback view; each loaded channel then
    /// gets its own view at `base + channel`. Calling this again while the
    /// table exists does nothing.
    pub fn upload_gpu<D: GpuDevice>(
        &mut self,
        device: &mut D,
        descriptors: &mut DescriptorAllocator,
        fallback: &FallbackTexture,
        batch: &mut UploadBatch,
    ) -> ViewerResult<()> {
        if self.table.is_some() {
            log::debug!("Material {}: already on the GPU", self.name);
            return Ok(());
        }
        let table = descriptors.allocate_contiguous(MAX_CHANNEL_COUNT as u32)?;
        if let Err(err) = self.fill_table(device, &table, fallback, batch) {
            descriptors.free_range(&table)?;
            return Err(err);
        }
        self.table = Some(table);
        log::debug!(
            "Material {}: table at slots {}..{}, flags {:#x}",
            self.name,
            table.index,
            table.index + table.count,
            self.texture_flags
        );
        Ok(())
    }

    fn fill_table<D: GpuDevice>(
        &mut self,
        device: &mut D,
        table: &DescriptorRange,
        fallback: &FallbackTexture,
        batch: &mut UploadBatch,
    ) -> ViewerResult<()> {
        for slot in table.cpu_handles() {
            device.copy_descriptor(slot, fallback.view())?;
        }
        for texture in &mut self.textures {
            texture.enqueue_upload(batch)?;
            let Some(gpu) = texture.gpu() else {
                continue;
            };
            device.create_shader_resource_view(
                gpu.handle(),
                texture.format(),
                table.cpu_handle(texture.channel().index()),
            )?;
        }
        Ok(())
    }

    /// Adopt the terminal states of a submitted `batch` for every texture.
    pub(crate) fn complete_upload(&mut self, batch: &UploadBatch) -> ViewerResult<()> {
        for texture in &mut self.textures {
            texture.complete_upload(batch)?;
        }
        Ok(())
    }

    /// Return the descriptor table to `descriptors`, keeping the textures.
    ///
    /// Used when the batch that would have filled the table was never
    /// submitted.
    pub(crate) fn release_table(&mut self, descriptors: &mut DescriptorAllocator) -> ViewerResult<()> {
        if let Some(table) = self.table.take() {
            descriptors.free_range(&table)?;
        }
        Ok(())
    }

    /// Bind the descriptor table at the material root parameter.
    ///
    /// Returns `false` without recording anything when the material is not on
    /// the GPU.
    pub fn bind<D: GpuDevice>(&self, device: &mut D) -> bool {
        match &self.table {
            Some(table) => {
                device.set_graphics_root_descriptor_table(root::MATERIAL_TABLE, table.gpu);
                true
            }
            None => false,
        }
    }

    /// Release the staging buffers of every texture.
    ///
    /// The uploads must have retired. Fails when nothing is staged.
    pub fn reset_upload_heaps<D: GpuDevice>(&mut self, device: &mut D) -> ViewerResult<()> {
        if !self.release_staging(device) {
            log::error!("Material {}: no staging buffers to release", self.name);
            return Err(ViewerError::NoCpuResource(format!("material {}", self.name)));
        }
        Ok(())
    }

    /// Release the device textures and return all table slots.
    ///
    /// The GPU must have retired every draw using the material. Fails when
    /// nothing is on the GPU.
    pub fn unload_gpu<D: GpuDevice>(
        &mut self,
        device: &mut D,
        descriptors: &mut DescriptorAllocator,
    ) -> ViewerResult<()> {
        if !self.release_gpu(device, descriptors)? {
            log::error!("Material {}: nothing to unload", self.name);
            return Err(ViewerError::NoGpuResource(format!("material {}", self.name)));
        }
        Ok(())
    }

    pub(crate) fn release_staging<D: GpuDevice>(&mut self, device: &mut D) -> bool {
        self.textures
            .iter_mut()
            .fold(false, |released, texture| texture.release_staging(device) | released)
    }

    /// Destroy the device textures, leaving any descriptor table allocated.
    pub(crate) fn release_textures<D: GpuDevice>(&mut self, device: &mut D) -> bool {
        self.textures
            .iter_mut()
            .fold(false, |released, texture| texture.release_gpu(device) | released)
    }

    pub(crate) fn has_gpu_resources(&self) -> bool {
        self.table.is_some() || self.textures.iter().any(|texture| texture.gpu().is_some())
    }

    pub(crate) fn release_gpu<D: GpuDevice>(
        &mut self,
        device: &mut D,
        descriptors: &mut DescriptorAllocator,
    ) -> ViewerResult<bool> {
        let had_textures = self.release_textures(device);
        let had_table = match self.table.take() {
            Some(table) => {
                descriptors.free_range(&table)?;
                true
            }
            None => false,
        };
        Ok(had_textures || had_table)
    }
}
