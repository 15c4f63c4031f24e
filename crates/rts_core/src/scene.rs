//! Scene description file.
//!
//! The JSON schema keeps the key names of the scene files the renderer
//! has always written (`isMetallic`, `IOR`, `animationFrames.frames`, ...)
//! so older scenes keep loading.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::material::MaterialOverrides;

/// Errors that can occur while reading or writing scene files.
#[derive(Error, Debug)]
pub enum SceneError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SceneResult<T> = Result<T, SceneError>;

/// Top-level scene file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneDescription {
    #[serde(default)]
    pub models: Vec<ModelDesc>,

    #[serde(default)]
    pub camera: CameraDesc,

    #[serde(default)]
    pub light: LightDesc,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentDesc>,
}

/// One model entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDesc {
    #[serde(default)]
    pub id: u32,

    pub path: String,

    #[serde(default)]
    pub position: [f32; 3],

    /// Pitch, yaw, roll in radians.
    #[serde(default)]
    pub rotation: [f32; 3],

    #[serde(default = "unit_scale")]
    pub scale: [f32; 3],

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub albedo: Option<[f32; 3]>,

    #[serde(default)]
    pub emission: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roughness: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_metallic: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_glass: Option<bool>,

    #[serde(rename = "IOR", default, skip_serializing_if = "Option::is_none")]
    pub ior: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation_frames: Option<AnimationDesc>,
}

fn unit_scale() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}

impl ModelDesc {
    /// A model at the origin with no overrides.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            id: 0,
            path: path.into(),
            position: [0.0; 3],
            rotation: [0.0; 3],
            scale: unit_scale(),
            albedo: None,
            emission: 0.0,
            roughness: None,
            is_metallic: None,
            is_glass: None,
            ior: None,
            animation_frames: None,
        }
    }

    pub fn material_overrides(&self) -> MaterialOverrides {
        MaterialOverrides {
            albedo: self.albedo,
            roughness: self.roughness,
            metallic: self.is_metallic,
            glass: self.is_glass,
            ior: self.ior,
        }
    }

    pub fn keyframes(&self) -> &[KeyframeDesc] {
        self.animation_frames
            .as_ref()
            .map(|a| a.frames.as_slice())
            .unwrap_or(&[])
    }

    /// Fill keyframe fields left out of the file from the keyframe before
    /// them. The first keyframe inherits the model's own transform.
    ///
    /// Keyframes are kept in file order even when their times go backwards;
    /// the timeline then holds the model still wherever no pair of
    /// consecutive keyframes brackets the current time.
    fn resolve_keyframes(&mut self, model: usize) {
        let (mut position, mut rotation, mut scale) = (self.position, self.rotation, self.scale);
        let mut last_time = f32::NEG_INFINITY;
        let Some(animation) = self.animation_frames.as_mut() else {
            return;
        };
        for (index, frame) in animation.frames.iter_mut().enumerate() {
            if frame.time < last_time {
                log::warn!(
                    "Model {} ({}): keyframe {} at t={} comes before the previous keyframe",
                    model,
                    self.path,
                    index,
                    frame.time
                );
            }
            last_time = frame.time;
            position = *frame.position.get_or_insert(position);
            rotation = *frame.rotation.get_or_insert(rotation);
            scale = *frame.scale.get_or_insert(scale);
        }
    }
}

/// Wrapper matching the `animationFrames: { frames: [...] }` nesting.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnimationDesc {
    #[serde(default)]
    pub frames: Vec<KeyframeDesc>,
}

/// A keyframe as stored in the file. After loading every field is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyframeDesc {
    #[serde(default = "default_keyframe_time")]
    pub time: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f32; 3]>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<[f32; 3]>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<[f32; 3]>,
}

fn default_keyframe_time() -> f32 {
    1.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraDesc {
    pub eye: [f32; 3],
    pub center: [f32; 3],
    pub up: [f32; 3],
}

impl Default for CameraDesc {
    fn default() -> Self {
        Self {
            eye: [1.5, 1.5, 1.5],
            center: [0.0, 0.0, 0.0],
            up: [0.0, 1.0, 0.0],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightKind {
    #[default]
    Point,
    Directional,
}

/// The single scene light.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightDesc {
    pub position: [f32; 3],
    pub direction: [f32; 3],
    pub color: [f32; 3],
    pub intensity: f32,
    #[serde(rename = "type")]
    pub kind: LightKind,
}

impl Default for LightDesc {
    fn default() -> Self {
        Self {
            position: [2.0, 5.0, -3.0],
            direction: [0.0, -1.0, 0.0],
            color: [1.0, 0.0, 0.0],
            intensity: 1.0,
            kind: LightKind::Point,
        }
    }
}

/// Background seen by rays that escape the scene.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentDesc {
    /// Equirectangular image; when absent the constant colour is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub color: [f32; 3],
    pub intensity: f32,
}

impl Default for EnvironmentDesc {
    fn default() -> Self {
        Self {
            path: None,
            color: [0.0, 0.2, 0.4],
            intensity: 1.0,
        }
    }
}

impl SceneDescription {
    /// Read and validate a scene file.
    pub fn load<P: AsRef<Path>>(path: P) -> SceneResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let scene = Self::from_json_str(&text)?;
        log::info!(
            "Loaded scene {} ({} models)",
            path.as_ref().display(),
            scene.models.len()
        );
        Ok(scene)
    }

    pub fn from_json_str(text: &str) -> SceneResult<Self> {
        let mut scene: SceneDescription = serde_json::from_str(text)?;
        for (i, model) in scene.models.iter_mut().enumerate() {
            model.resolve_keyframes(i);
        }
        Ok(scene)
    }

    pub fn to_json_string(&self) -> SceneResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> SceneResult<()> {
        fs::write(path.as_ref(), self.to_json_string()?)?;
        log::info!(
            "Saved scene {} ({} models)",
            path.as_ref().display(),
            self.models.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENE: &str = r#"{
        "models": [
            {
                "id": 0,
                "path": "models/cube.obj",
                "position": [1, 2, 3],
                "albedo": [0.5, 0.5, 0.5],
                "isMetallic": true,
                "IOR": 1.33,
                "animationFrames": {
                    "frames": [
                        { "time": 0.0, "position": [0, 0, 0] },
                        { "time": 2.0, "rotation": [0, 1.5, 0] },
                        { "time": 4.0, "scale": [2, 2, 2] }
                    ]
                }
            },
            { "id": 1, "path": "models/sphere.obj" }
        ],
        "camera": { "eye": [0, 1, 5], "center": [0, 0, 0], "up": [0, 1, 0] },
        "light": { "position": [0, 10, 0], "color": [1, 1, 1], "intensity": 3, "type": "directional" }
    }"#;

    #[test]
    fn test_parse_camel_case_key_names() {
        let scene = SceneDescription::from_json_str(SCENE).unwrap();
        assert_eq!(scene.models.len(), 2);

        let cube = &scene.models[0];
        assert_eq!(cube.position, [1.0, 2.0, 3.0]);
        assert_eq!(cube.scale, [1.0, 1.0, 1.0]);
        assert_eq!(cube.is_metallic, Some(true));
        assert_eq!(cube.ior, Some(1.33));
        assert_eq!(cube.roughness, None);

        assert_eq!(scene.camera.eye, [0.0, 1.0, 5.0]);
        assert_eq!(scene.light.kind, LightKind::Directional);
        assert_eq!(scene.light.intensity, 3.0);
        // Fields missing from the light keep their defaults.
        assert_eq!(scene.light.direction, [0.0, -1.0, 0.0]);
    }

    #[test]
    fn test_keyframes_inherit_previous_values() {
        let scene = SceneDescription::from_json_str(SCENE).unwrap();
        let frames = scene.models[0].keyframes();
        assert_eq!(frames.len(), 3);

        // First keyframe inherits rotation and scale from the model.
        assert_eq!(frames[0].rotation, Some([0.0, 0.0, 0.0]));
        assert_eq!(frames[0].scale, Some([1.0, 1.0, 1.0]));
        // Second inherits position from the first.
        assert_eq!(frames[1].position, Some([0.0, 0.0, 0.0]));
        assert_eq!(frames[2].rotation, Some([0.0, 1.5, 0.0]));
        assert_eq!(frames[2].scale, Some([2.0, 2.0, 2.0]));
    }

    #[test]
    fn test_keyframe_time_defaults_to_one() {
        let text = r#"{ "models": [ { "path": "a.obj", "animationFrames": { "frames": [
            { "time": 0.0 }, { "position": [1, 0, 0] } ] } } ] }"#;
        let scene = SceneDescription::from_json_str(text).unwrap();
        assert_eq!(scene.models[0].keyframes()[1].time, 1.0);
    }

    #[test]
    fn test_out_of_order_keyframes_still_load() {
        // The third keyframe has no time, so it lands at 1.0 after t=2.
        let text = r#"{ "models": [
            { "path": "cube.obj" },
            { "path": "sphere.obj", "animationFrames": { "frames": [
                { "time": 0.0 }, { "time": 2.0 }, { "position": [0, 3, 0] } ] } } ] }"#;
        let scene = SceneDescription::from_json_str(text).unwrap();
        assert_eq!(scene.models.len(), 2);
        let times: Vec<f32> = scene.models[1].keyframes().iter().map(|k| k.time).collect();
        assert_eq!(times, [0.0, 2.0, 1.0]);
        assert_eq!(scene.models[1].keyframes()[2].position, Some([0.0, 3.0, 0.0]));
    }

    #[test]
    fn test_empty_scene_gets_defaults() {
        let scene = SceneDescription::from_json_str("{}").unwrap();
        assert!(scene.models.is_empty());
        assert_eq!(scene.camera, CameraDesc::default());
        assert_eq!(scene.light.position, [2.0, 5.0, -3.0]);
        assert!(scene.environment.is_none());
    }

    #[test]
    fn test_save_then_load_preserves_scene() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.json");

        let mut scene = SceneDescription::from_json_str(SCENE).unwrap();
        scene.environment = Some(EnvironmentDesc::default());
        scene.save(&path).unwrap();

        let reloaded = SceneDescription::load(&path).unwrap();
        assert_eq!(reloaded, scene);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"isMetallic\""));
        assert!(text.contains("\"IOR\""));
        assert!(text.contains("\"animationFrames\""));
    }
}
