//! Triangle meshes and OBJ loading.
//!
//! A `Mesh` is host-side geometry that the geometry store uploads into
//! vertex/index buffers. Meshes are static once loaded.

use std::path::Path;

use rts_math::{Aabb, Vec3};
use thiserror::Error;

use crate::material::MaterialKey;

/// Errors that can occur while loading model geometry.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("failed to load {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: tobj::LoadError,
    },

    #[error("no triangles found in {0}")]
    Empty(String),
}

pub type MeshResult<T> = Result<T, MeshError>;

/// Vertex positions, per-vertex normals and optional triangle indices.
///
/// An empty `indices` list means the positions are a plain triangle list.
#[derive(Clone, Debug)]
pub struct Mesh {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub bounds: Aabb,
}

impl Mesh {
    /// Create a mesh and compute smooth normals for it.
    pub fn new(positions: Vec<Vec3>, indices: Vec<u32>) -> Self {
        let bounds = Aabb::from_slice(&positions);
        let mut mesh = Self {
            positions,
            normals: Vec::new(),
            indices,
            bounds,
        };
        mesh.compute_normals();
        mesh
    }

    /// Create a mesh with normals supplied by the file. Falls back to
    /// computed normals when the counts don't line up.
    pub fn with_normals(positions: Vec<Vec3>, indices: Vec<u32>, normals: Vec<Vec3>) -> Self {
        if normals.len() != positions.len() {
            log::debug!(
                "Normals array length ({}) doesn't match vertex count ({}), computing smooth normals",
                normals.len(),
                positions.len()
            );
            return Self::new(positions, indices);
        }
        let bounds = Aabb::from_slice(&positions);
        Self {
            positions,
            normals,
            indices,
            bounds,
        }
    }

    pub fn is_indexed(&self) -> bool {
        !self.indices.is_empty()
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        if self.is_indexed() {
            self.indices.len() / 3
        } else {
            self.positions.len() / 3
        }
    }

    /// Vertex indices of triangle `i`, whether or not the mesh is indexed.
    pub fn triangle_indices(&self, i: usize) -> [usize; 3] {
        if self.is_indexed() {
            [
                self.indices[3 * i] as usize,
                self.indices[3 * i + 1] as usize,
                self.indices[3 * i + 2] as usize,
            ]
        } else {
            [3 * i, 3 * i + 1, 3 * i + 2]
        }
    }

    /// Smooth vertex normals from area-weighted face normals (CCW winding).
    pub fn compute_normals(&mut self) {
        let vertex_count = self.positions.len();
        let mut normals = vec![Vec3::ZERO; vertex_count];

        for tri in 0..self.triangle_count() {
            let [i0, i1, i2] = self.triangle_indices(tri);
            if i0 >= vertex_count || i1 >= vertex_count || i2 >= vertex_count {
                continue;
            }
            let p0 = self.positions[i0];
            let face_normal = (self.positions[i1] - p0).cross(self.positions[i2] - p0);
            normals[i0] += face_normal;
            normals[i1] += face_normal;
            normals[i2] += face_normal;
        }

        for normal in &mut normals {
            *normal = normal.try_normalize().unwrap_or(Vec3::Y);
        }
        self.normals = normals;
    }
}

/// Geometry plus the material key of its first shape.
#[derive(Clone, Debug)]
pub struct LoadedModel {
    pub mesh: Mesh,
    pub material: MaterialKey,
}

/// Load every shape of an OBJ file into one mesh.
pub fn load_obj<P: AsRef<Path>>(path: P) -> MeshResult<LoadedModel> {
    let path = path.as_ref();
    let display = path.display().to_string();

    let (models, materials) = tobj::load_obj(
        path,
        &tobj::LoadOptions {
            single_index: true,
            triangulate: true,
            ..Default::default()
        },
    )
    .map_err(|source| MeshError::Load {
        path: display.clone(),
        source,
    })?;

    let materials = materials.unwrap_or_else(|e| {
        log::warn!("{}: material library unavailable ({}), using defaults", display, e);
        Vec::new()
    });

    let mut positions = Vec::new();
    let mut normals = Vec::new();
    let mut indices = Vec::new();
    let mut material_id = None;

    for model in &models {
        let mesh = &model.mesh;
        let base = positions.len() as u32;
        positions.extend(mesh.positions.chunks_exact(3).map(Vec3::from_slice));
        normals.extend(mesh.normals.chunks_exact(3).map(Vec3::from_slice));
        indices.extend(mesh.indices.iter().map(|i| base + i));
        material_id = material_id.or(mesh.material_id);
    }

    if indices.len() < 3 {
        return Err(MeshError::Empty(display));
    }

    let model_dir = path.parent().unwrap_or_else(|| Path::new(""));
    let material = material_id
        .and_then(|id| materials.get(id))
        .map(|m| MaterialKey::from_obj(m, model_dir))
        .unwrap_or_default();

    let mesh = Mesh::with_normals(positions, indices, normals);
    log::info!(
        "Loaded {}: {} vertices, {} triangles",
        display,
        mesh.vertex_count(),
        mesh.triangle_count()
    );

    Ok(LoadedModel { mesh, material })
}
