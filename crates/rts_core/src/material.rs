//! Material keys and the deduplicating material library.
//!
//! Models loaded from OBJ/MTL produce a `MaterialKey`. Identical keys share
//! one library slot, so the per-instance data only stores a material index.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// Surface parameters as read from a model's material file.
#[derive(Clone, Debug, PartialEq)]
pub struct MaterialKey {
    pub albedo: [f32; 3],
    pub roughness: f32,
    pub albedo_texture: Option<String>,
    pub normal_texture: Option<String>,
    pub metallic: bool,
    pub glass: bool,
    pub ior: f32,
}

impl Default for MaterialKey {
    fn default() -> Self {
        Self {
            albedo: [1.0, 1.0, 1.0],
            roughness: 0.4,
            albedo_texture: None,
            normal_texture: None,
            metallic: false,
            glass: false,
            ior: 1.5,
        }
    }
}

impl MaterialKey {
    /// Extract a key from a tobj material. Texture paths are resolved
    /// against the model's directory.
    pub fn from_obj(material: &tobj::Material, model_dir: &Path) -> Self {
        let resolve = |p: &String| model_dir.join(p).to_string_lossy().replace('\\', "/");
        let defaults = Self::default();
        Self {
            albedo: material.diffuse.unwrap_or(defaults.albedo),
            roughness: material
                .unknown_param
                .get("Pr")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.roughness),
            albedo_texture: material.diffuse_texture.as_ref().map(resolve),
            normal_texture: material.normal_texture.as_ref().map(resolve),
            ..defaults
        }
    }

    /// Apply per-model overrides from a scene file.
    pub fn with_overrides(mut self, overrides: &MaterialOverrides) -> Self {
        if let Some(albedo) = overrides.albedo {
            self.albedo = albedo;
        }
        if let Some(roughness) = overrides.roughness {
            self.roughness = roughness;
        }
        if let Some(metallic) = overrides.metallic {
            self.metallic = metallic;
        }
        if let Some(glass) = overrides.glass {
            self.glass = glass;
        }
        if let Some(ior) = overrides.ior {
            self.ior = ior;
        }
        self
    }
}

// Floats are hashed by bit pattern; keys come from parsed files so NaN
// never shows up in practice.
impl Eq for MaterialKey {}

impl Hash for MaterialKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for c in self.albedo {
            c.to_bits().hash(state);
        }
        self.roughness.to_bits().hash(state);
        self.albedo_texture.hash(state);
        self.normal_texture.hash(state);
        self.metallic.hash(state);
        self.glass.hash(state);
        self.ior.to_bits().hash(state);
    }
}

/// Optional material values a scene file may set on a model.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaterialOverrides {
    pub albedo: Option<[f32; 3]>,
    pub roughness: Option<f32>,
    pub metallic: Option<bool>,
    pub glass: Option<bool>,
    pub ior: Option<f32>,
}

/// Contiguous, deduplicated material and texture tables.
#[derive(Debug, Default)]
pub struct MaterialLibrary {
    materials: Vec<MaterialKey>,
    lookup: HashMap<MaterialKey, u32>,
    textures: Vec<String>,
    texture_lookup: HashMap<String, u32>,
}

impl MaterialLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `key`, inserting it if this is the first time it is seen.
    pub fn index_of(&mut self, key: &MaterialKey) -> u32 {
        if let Some(&index) = self.lookup.get(key) {
            return index;
        }
        let index = self.materials.len() as u32;
        for path in [&key.albedo_texture, &key.normal_texture].into_iter().flatten() {
            self.texture_index(path);
        }
        self.materials.push(key.clone());
        self.lookup.insert(key.clone(), index);
        log::debug!("Material {} registered: {:?}", index, key);
        index
    }

    /// Index of a texture path in the texture table.
    pub fn texture_index(&mut self, path: &str) -> u32 {
        if let Some(&index) = self.texture_lookup.get(path) {
            return index;
        }
        let index = self.textures.len() as u32;
        self.textures.push(path.to_string());
        self.texture_lookup.insert(path.to_string(), index);
        index
    }

    pub fn get(&self, index: u32) -> Option<&MaterialKey> {
        self.materials.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn textures(&self) -> &[String] {
        &self.textures
    }

    pub fn clear(&mut self) {
        self.materials.clear();
        self.lookup.clear();
        self.textures.clear();
        self.texture_lookup.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_keys_share_an_index() {
        let mut library = MaterialLibrary::new();
        let a = MaterialKey::default();
        let b = MaterialKey {
            albedo: [0.2, 0.3, 0.4],
            ..Default::default()
        };

        assert_eq!(library.index_of(&a), 0);
        assert_eq!(library.index_of(&b), 1);
        assert_eq!(library.index_of(&a.clone()), 0);
        assert_eq!(library.len(), 2);
        assert_eq!(library.get(1), Some(&b));
    }

    #[test]
    fn test_textures_are_deduplicated_across_materials() {
        let mut library = MaterialLibrary::new();
        let a = MaterialKey {
            albedo_texture: Some("tex/wood.png".into()),
            ..Default::default()
        };
        let b = MaterialKey {
            roughness: 0.9,
            albedo_texture: Some("tex/wood.png".into()),
            normal_texture: Some("tex/wood_n.png".into()),
            ..Default::default()
        };
        library.index_of(&a);
        library.index_of(&b);
        assert_eq!(library.textures(), &["tex/wood.png".to_string(), "tex/wood_n.png".to_string()]);
    }

    #[test]
    fn test_overrides_apply_only_set_fields() {
        let key = MaterialKey::default().with_overrides(&MaterialOverrides {
            roughness: Some(0.1),
            glass: Some(true),
            ..Default::default()
        });
        assert_eq!(key.roughness, 0.1);
        assert!(key.glass);
        assert_eq!(key.albedo, [1.0, 1.0, 1.0]);
        assert_eq!(key.ior, 1.5);
    }
}
