//! Errors raised while building or editing the scene.

use rts_core::{MeshError, SceneError, TextureError};
use thiserror::Error;

use crate::device::{DeviceError, ParamKind};

#[derive(Error, Debug)]
pub enum AccelError {
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("geometry load failed: {0}")]
    Mesh(#[from] MeshError),

    #[error("scene file error: {0}")]
    Scene(#[from] SceneError),

    #[error("environment texture error: {0}")]
    Texture(#[from] TextureError),

    #[error("unknown shading mode '{0}' (expected Flat, Normal, Phong or MirrorDemo)")]
    UnknownShadingMode(String),

    #[error("export {export} declares {declared:?} but records are written as {written:?}")]
    RecordSignatureMismatch {
        export: String,
        declared: Vec<ParamKind>,
        written: Vec<ParamKind>,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl AccelError {
    /// Whether the error leaves device-side state unusable.
    ///
    /// Device failures (allocation, builds, lost device) abort the scene.
    /// A model that fails to load, a bad scene file or an unknown mode name
    /// is reported to the caller and nothing committed is touched.
    pub fn is_fatal(&self) -> bool {
        match self {
            AccelError::Device(_) | AccelError::RecordSignatureMismatch { .. } | AccelError::InvalidState(_) => true,
            AccelError::Mesh(_)
            | AccelError::Scene(_)
            | AccelError::Texture(_)
            | AccelError::UnknownShadingMode(_) => false,
        }
    }
}

pub type AccelResult<T> = Result<T, AccelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let oom = AccelError::from(DeviceError::OutOfMemory {
            label: "tlas result".into(),
            size: 1 << 20,
        });
        assert!(oom.is_fatal());
        assert!(AccelError::from(DeviceError::RayTracingUnsupported).is_fatal());

        let missing = AccelError::from(MeshError::Empty("cube.obj".into()));
        assert!(!missing.is_fatal());
        assert!(!AccelError::UnknownShadingMode("Toon".into()).is_fatal());
    }

    #[test]
    fn test_messages_name_the_cause() {
        let err = AccelError::UnknownShadingMode("Toon".into());
        assert!(err.to_string().contains("Toon"));
    }
}
