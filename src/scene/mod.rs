//! Scene description, decoding and placement

mod camera;
mod description;
mod gltf_loader;
mod image;
mod light;
mod transform;

pub use camera::*;
pub use description::*;
pub use gltf_loader::GltfSceneDecoder;
pub use self::image::*;
pub use light::*;
pub use transform::*;
