//! Material texture channels and their GPU images.
//!
//! A material binds one descriptor table of [`MAX_CHANNEL_COUNT`] slots; slot
//! `i` always holds the view of channel `i`, or the fallback checkerboard when
//! the channel is absent, so shaders index the table by channel type.

use std::fmt;

use crate::backend::*;
use crate::descriptor::{DescriptorAllocator, DescriptorRange};
use crate::error::{ViewerError, ViewerResult};
use crate::scene::DecodedImage;
use crate::sync::FrameSync;
use crate::upload::{GpuTexture, StagingBuffer, UploadBatch};

/// Number of material channels, and slots in a material descriptor table.
pub const MAX_CHANNEL_COUNT: usize = root::MATERIAL_TABLE_SIZE as usize;

/// Semantic role of a texture within a material
///
/// The discriminant is the channel's slot in the material table and its bit
/// in the texture presence mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ChannelType {
    Diffuse = 0,
    Specular,
    Ambient,
    Emissive,
    Height,
    Normals,
    Shininess,
    Opacity,
    Displacement,
    Lightmap,
    Reflection,
    BaseColor,
    NormalCamera,
    EmissionColor,
    Metalness,
    DiffuseRoughness,
    AmbientOcclusion,
    Unknown,
    Sheen,
    Clearcoat,
    Transmission,
    MayaBase,
    MayaSpecular,
    MayaSpecularColor,
    MayaSpecularRoughness,
    Anisotropy,
    GltfMetallicRoughness,
    Glossiness,
}

struct ChannelInfo {
    name: &'static str,
    format: TextureFormat,
}

const fn color(name: &'static str) -> ChannelInfo {
    ChannelInfo {
        name,
        format: TextureFormat::Rgba8UnormSrgb,
    }
}

const fn data(name: &'static str) -> ChannelInfo {
    ChannelInfo {
        name,
        format: TextureFormat::Rgba8Unorm,
    }
}

static CHANNEL_TABLE: [ChannelInfo; MAX_CHANNEL_COUNT] = [
    color("diffuse"),
    color("specular"),
    color("ambient"),
    color("emissive"),
    data("height"),
    data("normals"),
    data("shininess"),
    data("opacity"),
    data("displacement"),
    data("lightmap"),
    data("reflection"),
    color("base_color"),
    data("normal_camera"),
    color("emission_color"),
    data("metalness"),
    data("diffuse_roughness"),
    data("ambient_occlusion"),
    color("unknown"),
    data("sheen"),
    data("clearcoat"),
    data("transmission"),
    color("maya_base"),
    data("maya_specular"),
    color("maya_specular_color"),
    data("maya_specular_roughness"),
    data("anisotropy"),
    data("gltf_metallic_roughness"),
    data("glossiness"),
];

impl ChannelType {
    /// Every channel in slot order.
    pub const ALL: [ChannelType; MAX_CHANNEL_COUNT] = [
        ChannelType::Diffuse,
        ChannelType::Specular,
        ChannelType::Ambient,
        ChannelType::Emissive,
        ChannelType::Height,
        ChannelType::Normals,
        ChannelType::Shininess,
        ChannelType::Opacity,
        ChannelType::Displacement,
        ChannelType::Lightmap,
        ChannelType::Reflection,
        ChannelType::BaseColor,
        ChannelType::NormalCamera,
        ChannelType::EmissionColor,
        ChannelType::Metalness,
        ChannelType::DiffuseRoughness,
        ChannelType::AmbientOcclusion,
        ChannelType::Unknown,
        ChannelType::Sheen,
        ChannelType::Clearcoat,
        ChannelType::Transmission,
        ChannelType::MayaBase,
        ChannelType::MayaSpecular,
        ChannelType::MayaSpecularColor,
        ChannelType::MayaSpecularRoughness,
        ChannelType::Anisotropy,
        ChannelType::GltfMetallicRoughness,
        ChannelType::Glossiness,
    ];

    /// Slot of this channel in the material table.
    pub fn index(self) -> u32 {
        self as u32
    }

    /// Bit of this channel in the texture presence mask.
    pub fn bit(self) -> u32 {
        1 << self.index()
    }

    /// Stable lowercase name.
    pub fn name(self) -> &'static str {
        CHANNEL_TABLE[self as usize].name
    }

    /// Pixel format textures of this channel are stored in.
    pub fn format(self) -> TextureFormat {
        CHANNEL_TABLE[self as usize].format
    }

    pub fn from_index(index: u32) -> ViewerResult<Self> {
        Self::ALL
            .get(index as usize)
            .copied()
            .ok_or_else(|| ViewerError::InvalidTexture(format!("unknown texture channel {}", index)))
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|channel| channel.name() == name)
    }
}

impl TryFrom<u32> for ChannelType {
    type Error = ViewerError;

    fn try_from(index: u32) -> ViewerResult<Self> {
        Self::from_index(index)
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One channel's image: the device-local texture and, until the upload has
/// retired, the staging buffer holding its pixels.
#[derive(Debug)]
pub struct Texture {
    channel: ChannelType,
    row_pitch: u32,
    gpu: Option<GpuTexture>,
    staging: Option<StagingBuffer>,
}

impl Texture {
    /// CPU phase of the upload: create the device texture and stage the pixels.
    ///
    /// If staging fails the device texture is destroyed again.
    pub fn load<D: GpuDevice>(
        device: &mut D,
        image: &DecodedImage,
        channel: ChannelType,
        label: &str,
    ) -> ViewerResult<Self> {
        let format = channel.format();
        let gpu = GpuTexture::create(device, label, image.width, image.height, format)?;
        let footprint = gpu.footprint();
        let staging = match StagingBuffer::from_image(device, label, &footprint, &image.pixels) {
            Ok(staging) => staging,
            Err(err) => {
                gpu.release(device);
                return Err(err);
            }
        };
        log::trace!(
            "Texture: staged {} ({}x{}, pitch {}, {:?})",
            label,
            image.width,
            image.height,
            footprint.row_pitch,
            format
        );
        Ok(Self {
            channel,
            row_pitch: footprint.row_pitch,
            gpu: Some(gpu),
            staging: Some(staging),
        })
    }

    pub fn channel(&self) -> ChannelType {
        self.channel
    }

    pub fn row_pitch(&self) -> u32 {
        self.row_pitch
    }

    pub fn format(&self) -> TextureFormat {
        self.channel.format()
    }

    /// Device-local texture, if it has not been unloaded.
    pub fn gpu(&self) -> Option<&GpuTexture> {
        self.gpu.as_ref()
    }

    pub fn has_staging(&self) -> bool {
        self.staging.is_some()
    }

    /// Queue the GPU phase of the upload into `batch`.
    pub(crate) fn enqueue_upload(&mut self, batch: &mut UploadBatch) -> ViewerResult<()> {
        match (self.gpu.as_ref(), self.staging.as_ref()) {
            (Some(gpu), Some(staging)) => batch.add_texture(gpu, staging, ResourceState::PixelShaderResource),
            (None, _) => Err(ViewerError::NoGpuResource(format!("{} texture was unloaded", self.channel))),
            (_, None) => Err(ViewerError::NoCpuResource(format!(
                "{} texture has no staged pixels",
                self.channel
            ))),
        }
    }

    /// Adopt the terminal state of a submitted `batch`.
    pub(crate) fn complete_upload(&mut self, batch: &UploadBatch) -> ViewerResult<()> {
        if let Some(gpu) = self.gpu.as_mut() {
            batch.complete_texture(gpu)?;
        }
        Ok(())
    }

    /// Release the staging buffer. Returns whether there was one.
    pub(crate) fn release_staging<D: GpuDevice>(&mut self, device: &mut D) -> bool {
        match self.staging.take() {
            Some(staging) => {
                staging.release(device);
                true
            }
            None => false,
        }
    }

    /// Release the device texture. Returns whether there was one.
    pub(crate) fn release_gpu<D: GpuDevice>(&mut self, device: &mut D) -> bool {
        match self.gpu.take() {
            Some(gpu) => {
                gpu.release(device);
                true
            }
            None => false,
        }
    }
}

/// Placeholder image bound to every channel slot a material leaves empty
///
/// Owns the uploaded checkerboard, its view in a small non-shader-visible
/// heap (the copy source for material tables) and one full table in the
/// shared allocator for meshes whose material never reached the GPU.
#[derive(Debug)]
pub struct FallbackTexture {
    texture: GpuTexture,
    view_heap: DescriptorHeapInfo,
    table: DescriptorRange,
}

impl FallbackTexture {
    /// Edge length of the checkerboard in pixels.
    pub const SIZE: u32 = 64;
    pub const DARK: [u8; 4] = [0, 0, 0, 255];
    pub const LIGHT: [u8; 4] = [255, 0, 255, 255];

    /// Checkerboard pixels of the fallback image.
    pub fn image() -> DecodedImage {
        DecodedImage::checkerboard(Self::SIZE, Self::DARK, Self::LIGHT)
    }

    /// Upload the checkerboard and fill the fallback table.
    ///
    /// Waits for the upload to retire before releasing its staging buffer.
    pub fn create<D: GpuDevice>(
        device: &mut D,
        descriptors: &mut DescriptorAllocator,
        sync: &mut FrameSync,
    ) -> ViewerResult<Self> {
        let image = Self::image();
        let mut texture = GpuTexture::create(
            device,
            "fallback texture",
            image.width,
            image.height,
            TextureFormat::Rgba8UnormSrgb,
        )?;
        let staging = match StagingBuffer::from_image(device, "fallback staging", &texture.footprint(), &image.pixels) {
            Ok(staging) => staging,
            Err(err) => {
                texture.release(device);
                return Err(err);
            }
        };

        let mut batch = UploadBatch::new();
        let uploaded = batch
            .add_texture(&texture, &staging, ResourceState::PixelShaderResource)
            .and_then(|()| batch.submit(device, sync))
            .and_then(|fence| sync.wait_for_value(device, fence))
            .and_then(|()| batch.complete_texture(&mut texture));
        staging.release(device);
        if let Err(err) = uploaded {
            texture.release(device);
            return Err(err);
        }

        let view_heap = match Self::create_view(device, &texture) {
            Ok(heap) => heap,
            Err(err) => {
                texture.release(device);
                return Err(err);
            }
        };
        let table = match descriptors.allocate_contiguous(root::MATERIAL_TABLE_SIZE) {
            Ok(table) => table,
            Err(err) => {
                texture.release(device);
                return Err(err);
            }
        };
        let fallback = Self {
            texture,
            view_heap,
            table,
        };
        let copied: BackendResult<()> = table
            .cpu_handles()
            .try_for_each(|slot| device.copy_descriptor(slot, fallback.view()));
        if let Err(err) = copied {
            fallback.release(device, descriptors)?;
            return Err(err.into());
        }
        log::debug!("FallbackTexture: uploaded, table at slot {}", table.index);
        Ok(fallback)
    }

    fn create_view<D: GpuDevice>(device: &mut D, texture: &GpuTexture) -> ViewerResult<DescriptorHeapInfo> {
        let heap = device.create_descriptor_heap(&DescriptorHeapDescriptor {
            label: Some("fallback view".to_string()),
            capacity: 1,
            shader_visible: false,
        })?;
        device.create_shader_resource_view(texture.handle(), texture.format(), heap.cpu_start)?;
        Ok(heap)
    }

    /// CPU handle of the fallback view, the source for descriptor copies.
    pub fn view(&self) -> CpuDescriptorHandle {
        self.view_heap.cpu_start
    }

    /// Table to bind for a material that is not on the GPU.
    pub fn table(&self) -> GpuDescriptorHandle {
        self.table.gpu
    }

    pub fn table_range(&self) -> &DescriptorRange {
        &self.table
    }

    pub fn texture(&self) -> &GpuTexture {
        &self.texture
    }

    /// Return the table to the allocator and destroy the texture.
    ///
    /// The GPU must be idle.
    pub fn release<D: GpuDevice>(self, device: &mut D, descriptors: &mut DescriptorAllocator) -> ViewerResult<()> {
        self.texture.release(device);
        descriptors.free_range(&self.table)
    }
}
