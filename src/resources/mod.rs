//! GPU resource sets: textures, materials, meshes and models

mod material;
mod mesh;
mod model;
mod texture;

pub use material::*;
pub use mesh::*;
pub use model::*;
pub use texture::*;
