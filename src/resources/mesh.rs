//! Mesh geometry and its GPU buffers

use glam::{Vec2, Vec3};

use crate::backend::*;
use crate::error::{ViewerError, ViewerResult};
use crate::scene::{MeshRecord, Transform};
use crate::upload::{GpuBuffer, StagingBuffer, UploadBatch};

/// Axis-aligned bounding box in mesh-local space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn from_points(points: &[Vec3]) -> Option<Self> {
        let first = *points.first()?;
        Some(points.iter().fold(Self { min: first, max: first }, |aabb, &p| Self {
            min: aabb.min.min(p),
            max: aabb.max.max(p),
        }))
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }
}

/// Interleave a mesh record into vertices.
///
/// Missing normals default to +Z, missing UVs to zero and missing tangent
/// frames to T = +X, B = +Y. Where the frame is left-handed relative to the
/// normal the bitangent is flipped.
pub fn build_vertices(record: &MeshRecord) -> ViewerResult<Vec<Vertex>> {
    let count = record.positions.len();
    if count == 0 {
        return Err(ViewerError::SceneLoad(format!("mesh {} has no vertices", record.name)));
    }
    let attribute_ok = |len: usize| len == 0 || len == count;
    if !(attribute_ok(record.normals.len())
        && attribute_ok(record.uvs.len())
        && attribute_ok(record.tangents.len())
        && attribute_ok(record.bitangents.len()))
    {
        return Err(ViewerError::SceneLoad(format!(
            "mesh {} has attribute arrays that do not match its {} positions",
            record.name, count
        )));
    }
    let has_frame = !record.tangents.is_empty() && !record.bitangents.is_empty();

    Ok((0..count)
        .map(|i| {
            let normal = record.normals.get(i).copied().unwrap_or(Vec3::Z);
            let (tangent, mut bitangent) = if has_frame {
                (record.tangents[i], record.bitangents[i])
            } else {
                (Vec3::X, Vec3::Y)
            };
            if normal.dot(tangent.cross(bitangent)) < 0.0 {
                bitangent = -bitangent;
            }
            Vertex {
                position: record.positions[i],
                normal,
                uv: record.uvs.get(i).copied().unwrap_or(Vec2::ZERO),
                tangent,
                bitangent,
            }
        })
        .collect())
}

/// One drawable mesh: vertex and index buffers, placement and material
#[derive(Debug)]
pub struct Mesh {
    pub name: String,
    pub transform: Transform,
    material: usize,
    vertex_count: u32,
    index_count: u32,
    bounds: Aabb,
    vertex_buffer: Option<GpuBuffer>,
    index_buffer: Option<GpuBuffer>,
    vertex_staging: Option<StagingBuffer>,
    index_staging: Option<StagingBuffer>,
    vertex_view: Option<VertexBufferView>,
    index_view: Option<IndexBufferView>,
}

impl Mesh {
    /// CPU phase of the upload: create the device buffers and stage the geometry.
    ///
    /// Whatever this mesh created is destroyed again when a step fails.
    pub fn load<D: GpuDevice>(
        device: &mut D,
        record: &MeshRecord,
        transform: Transform,
        material: usize,
    ) -> ViewerResult<Self> {
        let vertices = build_vertices(record)?;
        if record.indices.is_empty() {
            return Err(ViewerError::SceneLoad(format!("mesh {} has no indices", record.name)));
        }
        if let Some(&index) = record.indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(ViewerError::SceneLoad(format!(
                "mesh {} index {} exceeds its {} vertices",
                record.name,
                index,
                vertices.len()
            )));
        }
        let bounds = Aabb::from_points(&record.positions).unwrap_or(Aabb {
            min: Vec3::ZERO,
            max: Vec3::ZERO,
        });

        let mut mesh = Self {
            name: record.name.clone(),
            transform,
            material,
            vertex_count: vertices.len() as u32,
            index_count: record.indices.len() as u32,
            bounds,
            vertex_buffer: None,
            index_buffer: None,
            vertex_staging: None,
            index_staging: None,
            vertex_view: None,
            index_view: None,
        };
        if let Err(err) = mesh.stage(device, bytemuck::cast_slice(&vertices), bytemuck::cast_slice(&record.indices)) {
            mesh.release_staging(device);
            mesh.release_gpu(device);
            return Err(err);
        }
        log::trace!(
            "Mesh {}: staged {} vertices, {} indices",
            mesh.name,
            mesh.vertex_count,
            mesh.index_count
        );
        Ok(mesh)
    }

    fn stage<D: GpuDevice>(&mut self, device: &mut D, vertex_bytes: &[u8], index_bytes: &[u8]) -> ViewerResult<()> {
        let label = format!("{} vertices", self.name);
        self.vertex_buffer = Some(GpuBuffer::create(device, &label, vertex_bytes.len() as u64)?);
        self.vertex_staging = Some(StagingBuffer::from_bytes(device, &label, vertex_bytes)?);
        let label = format!("{} indices", self.name);
        self.index_buffer = Some(GpuBuffer::create(device, &label, index_bytes.len() as u64)?);
        self.index_staging = Some(StagingBuffer::from_bytes(device, &label, index_bytes)?);
        Ok(())
    }

    pub fn material(&self) -> usize {
        self.material
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Local-space bounds of the vertex positions.
    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    pub fn vertex_buffer(&self) -> Option<&GpuBuffer> {
        self.vertex_buffer.as_ref()
    }

    pub fn index_buffer(&self) -> Option<&GpuBuffer> {
        self.index_buffer.as_ref()
    }

    pub fn has_staging(&self) -> bool {
        self.vertex_staging.is_some() || self.index_staging.is_some()
    }

    pub fn has_gpu_resources(&self) -> bool {
        self.vertex_buffer.is_some() || self.index_buffer.is_some()
    }

    /// Whether the views are set and the mesh can be drawn.
    pub fn is_drawable(&self) -> bool {
        self.vertex_view.is_some() && self.index_view.is_some()
    }

    /// Queue the GPU phase of the upload into `batch`.
    pub(crate) fn enqueue_upload(&mut self, batch: &mut UploadBatch) -> ViewerResult<()> {
        let (Some(vertex_staging), Some(index_staging)) = (&self.vertex_staging, &self.index_staging) else {
            return Err(ViewerError::NoCpuResource(format!(
                "mesh {} has no staged geometry",
                self.name
            )));
        };
        let (Some(vertex_buffer), Some(index_buffer)) = (&self.vertex_buffer, &self.index_buffer) else {
            return Err(ViewerError::NoGpuResource(format!("mesh {} was unloaded", self.name)));
        };
        batch.add_buffer(vertex_buffer, vertex_staging, ResourceState::VertexOrConstant)?;
        batch.add_buffer(index_buffer, index_staging, ResourceState::IndexBuffer)
    }

    /// Adopt the terminal states of a submitted `batch`.
    pub(crate) fn complete_upload(&mut self, batch: &UploadBatch) -> ViewerResult<()> {
        for buffer in [&mut self.vertex_buffer, &mut self.index_buffer].into_iter().flatten() {
            batch.complete_buffer(buffer)?;
        }
        Ok(())
    }

    /// Build the vertex and index views once the buffers have addresses.
    pub(crate) fn create_views<D: GpuDevice>(&mut self, device: &D) -> ViewerResult<()> {
        let (Some(vertex_buffer), Some(index_buffer)) = (&self.vertex_buffer, &self.index_buffer) else {
            return Err(ViewerError::NoGpuResource(format!("mesh {} was unloaded", self.name)));
        };
        self.vertex_view = Some(VertexBufferView {
            location: device.buffer_gpu_address(vertex_buffer.handle())?,
            size: vertex_buffer.size() as u32,
            stride: Vertex::STRIDE,
        });
        self.index_view = Some(IndexBufferView {
            location: device.buffer_gpu_address(index_buffer.handle())?,
            size: index_buffer.size() as u32,
            format: IndexFormat::Uint32,
        });
        Ok(())
    }

    /// Bind the vertex and index views. Returns `false` when not drawable.
    pub(crate) fn bind_geometry<D: GpuDevice>(&self, device: &mut D) -> bool {
        match (self.vertex_view, self.index_view) {
            (Some(vertex), Some(index)) => {
                device.set_vertex_buffer(vertex);
                device.set_index_buffer(index);
                true
            }
            _ => false,
        }
    }

    /// Release the staging buffers. Returns whether there were any.
    pub(crate) fn release_staging<D: GpuDevice>(&mut self, device: &mut D) -> bool {
        let vertex = self.vertex_staging.take().map(|staging| staging.release(device));
        let index = self.index_staging.take().map(|staging| staging.release(device));
        vertex.is_some() || index.is_some()
    }

    /// Release the device buffers. Returns whether there were any.
    pub(crate) fn release_gpu<D: GpuDevice>(&mut self, device: &mut D) -> bool {
        self.vertex_view = None;
        self.index_view = None;
        let vertex = self.vertex_buffer.take().map(|buffer| buffer.release(device));
        let index = self.index_buffer.take().map(|buffer| buffer.release(device));
        vertex.is_some() || index.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tangent_frame_defaults() {
        let record = MeshRecord {
            name: "flat".to_string(),
            positions: vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            normals: vec![Vec3::Z; 3],
            indices: vec![0, 1, 2],
            ..Default::default()
        };
        let vertices = build_vertices(&record).unwrap();
        assert!(vertices.iter().all(|v| v.tangent == Vec3::X && v.bitangent == Vec3::Y));
    }

    #[test]
    fn test_left_handed_frame_is_flipped() {
        let record = MeshRecord {
            name: "mirrored".to_string(),
            positions: vec![Vec3::ZERO],
            normals: vec![Vec3::Z],
            tangents: vec![Vec3::X],
            bitangents: vec![-Vec3::Y],
            indices: vec![0],
            ..Default::default()
        };
        let vertices = build_vertices(&record).unwrap();
        assert_eq!(vertices[0].bitangent, Vec3::Y);
    }

    #[test]
    fn test_mismatched_attributes_are_rejected() {
        let record = MeshRecord {
            name: "broken".to_string(),
            positions: vec![Vec3::ZERO, Vec3::X],
            normals: vec![Vec3::Z],
            indices: vec![0, 1, 0],
            ..Default::default()
        };
        assert!(matches!(build_vertices(&record), Err(ViewerError::SceneLoad(_))));
    }

    #[test]
    fn test_load_stages_both_buffers() {
        let mut device = SoftwareDevice::default();
        let mesh = Mesh::load(&mut device, &MeshRecord::cube(0), Transform::default(), 0).unwrap();
        assert_eq!(mesh.vertex_count(), 24);
        assert_eq!(mesh.index_count(), 36);
        assert_eq!(mesh.vertex_buffer().unwrap().size(), 24 * Vertex::STRIDE as u64);
        assert!(mesh.has_staging());
        assert!(!mesh.is_drawable());
        assert_eq!(device.live_buffer_count(), 4);
        assert_eq!(mesh.bounds().extent(), Vec3::ONE);
        assert_eq!(mesh.bounds().center(), Vec3::ZERO);
    }

    #[test]
    fn test_out_of_range_index_is_rejected() {
        let mut device = SoftwareDevice::default();
        let mut record = MeshRecord::cube(0);
        record.indices.push(24);
        assert!(Mesh::load(&mut device, &record, Transform::default(), 0).is_err());
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn test_failed_staging_releases_partial_buffers() {
        let mut device = SoftwareDevice::default();
        // Room for the device vertex buffer only.
        device.set_memory_budget(Some(24 * Vertex::STRIDE as u64));
        let result = Mesh::load(&mut device, &MeshRecord::cube(0), Transform::default(), 0);
        assert!(matches!(result, Err(ViewerError::ResourceCreationFailed(_))));
        assert_eq!(device.live_buffer_count(), 0);
    }
}
