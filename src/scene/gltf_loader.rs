//! glTF scene decoding.
//!
//! Reads `.gltf` and `.glb` files with the `gltf` crate. Every primitive
//! becomes one [`MeshRecord`]; the roots of the default scene hang under a
//! synthetic identity root so the description always has a single root.

use std::path::Path;

use glam::{Mat4, Vec2, Vec3, Vec4};

use super::description::*;
use super::image::ImageSource;
use crate::error::{ViewerError, ViewerResult};
use crate::resources::ChannelType;

/// [`SceneDecoder`] for glTF 2.0 files
#[derive(Debug, Clone, Copy, Default)]
pub struct GltfSceneDecoder;

impl GltfSceneDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl SceneDecoder for GltfSceneDecoder {
    fn decode(&self, path: &Path) -> ViewerResult<SceneDescription> {
        let gltf = ::gltf::Gltf::open(path)
            .map_err(|e| ViewerError::SceneLoad(format!("{}: {}", path.display(), e)))?;
        let ::gltf::Gltf { document, blob } = gltf;
        let buffers = ::gltf::import_buffers(&document, path.parent(), blob)
            .map_err(|e| ViewerError::SceneLoad(format!("{}: {}", path.display(), e)))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut materials: Vec<MaterialRecord> = document
            .materials()
            .map(|material| load_material(&material, base, &buffers))
            .collect();

        let mut meshes = Vec::new();
        let mut mesh_index_map: Vec<Vec<usize>> = Vec::new();
        let mut default_material = None;
        for mesh in document.meshes() {
            let mut records = Vec::new();
            for primitive in mesh.primitives() {
                let material = match primitive.material().index() {
                    Some(index) => index,
                    None => *default_material.get_or_insert_with(|| {
                        materials.push(MaterialRecord {
                            name: "default".to_string(),
                            ..Default::default()
                        });
                        materials.len() - 1
                    }),
                };
                match load_primitive(&mesh, &primitive, &buffers, material)? {
                    Some(record) => {
                        records.push(meshes.len());
                        meshes.push(record);
                    }
                    None => log::warn!(
                        "GltfSceneDecoder: skipping {:?} primitive {} of mesh {}",
                        primitive.mode(),
                        primitive.index(),
                        mesh.name().unwrap_or("<unnamed>")
                    ),
                }
            }
            mesh_index_map.push(records);
        }

        let mut nodes: Vec<SceneNode> = document
            .nodes()
            .map(|node| {
                let local = Mat4::from_cols_array_2d(&node.transform().matrix());
                SceneNode::new(node.name().unwrap_or("node"), local)
                    .with_children(node.children().map(|child| child.index()).collect())
                    .with_meshes(
                        node.mesh()
                            .map(|mesh| mesh_index_map[mesh.index()].clone())
                            .unwrap_or_default(),
                    )
            })
            .collect();

        let scene = document
            .default_scene()
            .or_else(|| document.scenes().next())
            .ok_or_else(|| ViewerError::SceneLoad(format!("{}: no scene", path.display())))?;
        let root = nodes.len();
        nodes.push(
            SceneNode::new(scene.name().unwrap_or("root"), Mat4::IDENTITY)
                .with_children(scene.nodes().map(|node| node.index()).collect()),
        );

        log::debug!(
            "GltfSceneDecoder: {} nodes, {} meshes, {} materials from {}",
            nodes.len(),
            meshes.len(),
            materials.len(),
            path.display()
        );
        let description = SceneDescription {
            nodes,
            root,
            meshes,
            materials,
        };
        description.validate()?;
        Ok(description)
    }
}

fn load_primitive(
    mesh: &::gltf::Mesh<'_>,
    primitive: &::gltf::Primitive<'_>,
    buffers: &[::gltf::buffer::Data],
    material: usize,
) -> ViewerResult<Option<MeshRecord>> {
    if primitive.mode() != ::gltf::mesh::Mode::Triangles {
        return Ok(None);
    }
    let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| data.0.as_slice()));
    let name = mesh.name().unwrap_or("mesh").to_string();

    let positions: Vec<Vec3> = reader
        .read_positions()
        .ok_or_else(|| {
            ViewerError::SceneLoad(format!(
                "mesh {} primitive {} has no positions",
                name,
                primitive.index()
            ))
        })?
        .map(Vec3::from)
        .collect();
    let normals: Vec<Vec3> = reader
        .read_normals()
        .map(|normals| normals.map(Vec3::from).collect())
        .unwrap_or_default();
    let uvs: Vec<Vec2> = reader
        .read_tex_coords(0)
        .map(|uvs| uvs.into_f32().map(Vec2::from).collect())
        .unwrap_or_default();
    let (tangents, bitangents): (Vec<Vec3>, Vec<Vec3>) = match reader.read_tangents() {
        Some(tangents) if normals.len() == positions.len() => tangents
            .zip(&normals)
            .map(|(t, n)| {
                let tangent = Vec3::new(t[0], t[1], t[2]);
                (tangent, n.cross(tangent) * t[3])
            })
            .unzip(),
        _ => (Vec::new(), Vec::new()),
    };
    let indices: Vec<u32> = match reader.read_indices() {
        Some(indices) => indices.into_u32().collect(),
        None => (0..positions.len() as u32).collect(),
    };

    Ok(Some(MeshRecord {
        name,
        positions,
        normals,
        uvs,
        tangents,
        bitangents,
        indices,
        material,
    }))
}

fn load_material(
    material: &::gltf::Material<'_>,
    base: &Path,
    buffers: &[::gltf::buffer::Data],
) -> MaterialRecord {
    let pbr = material.pbr_metallic_roughness();
    let base_color = Vec4::from(pbr.base_color_factor());
    let mut record = MaterialRecord {
        name: material.name().unwrap_or("material").to_string(),
        base_color,
        metallic: pbr.metallic_factor(),
        roughness: pbr.roughness_factor(),
        opacity: base_color.w,
        textures: Vec::new(),
    };

    let channels = [
        (ChannelType::Diffuse, pbr.base_color_texture().map(|info| info.texture())),
        (
            ChannelType::GltfMetallicRoughness,
            pbr.metallic_roughness_texture().map(|info| info.texture()),
        ),
        (ChannelType::Normals, material.normal_texture().map(|info| info.texture())),
        (
            ChannelType::AmbientOcclusion,
            material.occlusion_texture().map(|info| info.texture()),
        ),
        (ChannelType::Emissive, material.emissive_texture().map(|info| info.texture())),
    ];
    for (channel, texture) in channels {
        let Some(texture) = texture else {
            continue;
        };
        match image_source(&texture.source(), base, buffers) {
            Ok(source) => record.textures.push(TextureRef {
                channel: channel.index(),
                source,
            }),
            Err(message) => log::warn!(
                "GltfSceneDecoder: material {} {} texture skipped: {}",
                record.name,
                channel.name(),
                message
            ),
        }
    }
    record
}

fn image_source(
    image: &::gltf::Image<'_>,
    base: &Path,
    buffers: &[::gltf::buffer::Data],
) -> Result<ImageSource, String> {
    match image.source() {
        ::gltf::image::Source::View { view, mime_type } => {
            let buffer_index = view.buffer().index();
            let data = buffers
                .get(buffer_index)
                .ok_or_else(|| format!("image buffer index {} out of range", buffer_index))?;
            let start = view.offset();
            let end = start + view.length();
            let bytes = data
                .0
                .get(start..end)
                .ok_or_else(|| format!("image view {}..{} exceeds its buffer", start, end))?;
            Ok(ImageSource::Embedded {
                bytes: bytes.to_vec(),
                mime_type: Some(mime_type.to_string()),
            })
        }
        ::gltf::image::Source::Uri { uri, mime_type } => match uri.strip_prefix("data:") {
            Some(data) => decode_data_uri(data, mime_type),
            None => Ok(ImageSource::File(base.join(uri))),
        },
    }
}

/// Decode the part of a `data:` URI after the scheme: `<mime>;base64,<payload>`.
fn decode_data_uri(data: &str, fallback_mime: Option<&str>) -> Result<ImageSource, String> {
    use base64::Engine;

    let (header, payload) = data
        .split_once(',')
        .ok_or_else(|| "data URI without a payload".to_string())?;
    let Some(mime) = header.strip_suffix(";base64") else {
        return Err(format!("data URI {:?} is not base64 encoded", header));
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| format!("data URI payload: {}", e))?;
    let mime_type = Some(mime)
        .filter(|mime| !mime.is_empty())
        .or(fallback_mime)
        .map(str::to_string);
    Ok(ImageSource::Embedded { bytes, mime_type })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{ImageCrateDecoder, ImageDecoder};
    use rstest::rstest;

    #[test]
    fn test_missing_file_is_scene_load_error() {
        let result = GltfSceneDecoder.decode(Path::new("/nonexistent/model.gltf"));
        assert!(matches!(result, Err(ViewerError::SceneLoad(_))));
    }

    /// Write a one-triangle glTF plus its `.bin` to a fresh directory and decode it.
    ///
    /// `primitive` is spliced into the primitive object and `extra` into the
    /// top-level object.
    fn decode_triangle(name: &str, primitive: &str, extra: &str) -> SceneDescription {
        // One triangle: 3 positions followed by 3 u16 indices (padded to 4 bytes).
        let mut bin = Vec::new();
        for value in [0.0f32, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0] {
            bin.extend_from_slice(&value.to_le_bytes());
        }
        for index in [0u16, 1, 2, 0] {
            bin.extend_from_slice(&index.to_le_bytes());
        }
        let json = format!(
            r#"{{
  "asset": {{ "version": "2.0" }},
  "scene": 0,
  "scenes": [{{ "nodes": [0] }}],
  "nodes": [{{ "name": "tri", "mesh": 0, "translation": [0.0, 2.0, 0.0] }}],
  "meshes": [{{ "primitives": [{{ "attributes": {{ "POSITION": 0 }}, "indices": 1{primitive} }}] }}],
  "buffers": [{{ "byteLength": {len}, "uri": "triangle.bin" }}],
  "bufferViews": [
    {{ "buffer": 0, "byteOffset": 0, "byteLength": 36 }},
    {{ "buffer": 0, "byteOffset": 36, "byteLength": 6 }}
  ],
  "accessors": [
    {{ "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
       "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0] }},
    {{ "bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR" }}
  ]{extra}
}}"#,
            len = bin.len()
        );

        let dir = std::env::temp_dir().join(format!("model-viewer-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("triangle.bin"), &bin).unwrap();
        let path = dir.join("triangle.gltf");
        std::fs::write(&path, json).unwrap();

        let scene = GltfSceneDecoder.decode(&path).unwrap();
        std::fs::remove_dir_all(&dir).ok();
        scene
    }

    #[test]
    fn test_decodes_embedded_triangle() {
        let scene = decode_triangle("gltf", "", "");

        assert_eq!(scene.meshes.len(), 1);
        assert_eq!(scene.meshes[0].indices, vec![0, 1, 2]);
        assert_eq!(scene.meshes[0].positions[1], Vec3::X);
        // A primitive without a material gets the default material.
        assert_eq!(scene.materials.len(), 1);
        assert_eq!(scene.materials[0].base_color, Vec4::new(1.0, 0.0, 1.0, 1.0));

        assert_eq!(scene.root, 1);
        let instances = scene.traverse().unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(
            instances[0].world.transform_point3(Vec3::ZERO),
            Vec3::new(0.0, 2.0, 0.0)
        );
    }

    #[test]
    fn test_data_uri_base_color_texture() {
        use base64::Engine;

        let mut png = Vec::new();
        ::image::RgbaImage::from_raw(1, 1, vec![10, 20, 30, 255])
            .unwrap()
            .write_to(&mut std::io::Cursor::new(&mut png), ::image::ImageOutputFormat::Png)
            .unwrap();
        let uri = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&png)
        );
        let extra = format!(
            r#",
  "materials": [{{ "name": "painted", "pbrMetallicRoughness": {{ "baseColorTexture": {{ "index": 0 }} }} }}],
  "textures": [{{ "source": 0 }}],
  "images": [{{ "uri": "{}" }}]"#,
            uri
        );
        let scene = decode_triangle("data-uri", r#", "material": 0"#, &extra);

        assert_eq!(scene.materials.len(), 1);
        let textures = &scene.materials[0].textures;
        assert_eq!(textures.len(), 1);
        assert_eq!(textures[0].channel, ChannelType::Diffuse.index());
        assert_eq!(
            textures[0].source,
            ImageSource::Embedded {
                bytes: png,
                mime_type: Some("image/png".to_string()),
            }
        );
        let decoded = ImageCrateDecoder.decode(&textures[0].source).unwrap();
        assert_eq!(decoded.pixels, vec![10, 20, 30, 255]);
    }

    #[rstest]
    #[case::plain_text("text/plain,hello")]
    #[case::no_payload("image/png;base64")]
    #[case::bad_base64("image/png;base64,@@@")]
    fn test_unusable_data_uri(#[case] data: &str) {
        assert!(decode_data_uri(data, None).is_err());
    }

    #[test]
    fn test_data_uri_mime_falls_back_to_image_field() {
        let source = decode_data_uri(";base64,AAEC", Some("image/jpeg")).unwrap();
        assert_eq!(
            source,
            ImageSource::Embedded {
                bytes: vec![0, 1, 2],
                mime_type: Some("image/jpeg".to_string()),
            }
        );
    }
}
