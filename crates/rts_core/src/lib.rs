//! RTS Core - scene description and asset loading for the ray tracing core.
//!
//! This crate provides:
//!
//! - **Scene files**: the JSON scene schema (`SceneDescription`) with load/save
//! - **Meshes**: triangle meshes loaded from OBJ/MTL via tobj
//! - **Materials**: material keys extracted from MTL and a deduplicating library
//! - **Animation**: keyframe timelines sampled by wall-clock time
//! - **Textures**: environment images decoded with the image crate
//!
//! # Example
//!
//! ```ignore
//! use rts_core::SceneDescription;
//!
//! let scene = SceneDescription::load("scene.json")?;
//! println!("{} models", scene.models.len());
//! ```

pub mod animation;
pub mod material;
pub mod mesh;
pub mod scene;
pub mod texture;

// Re-export commonly used types
pub use animation::{Keyframe, Timeline, TransformSample};
pub use material::{MaterialKey, MaterialLibrary, MaterialOverrides};
pub use mesh::{load_obj, LoadedModel, Mesh, MeshError, MeshResult};
pub use scene::{
    AnimationDesc, CameraDesc, EnvironmentDesc, KeyframeDesc, LightDesc, LightKind, ModelDesc,
    SceneDescription, SceneError, SceneResult,
};
pub use texture::{load_texture, Texture, TextureError, TextureResult};
