//! Shading modes and the ray tracing pipeline.
//!
//! The pipeline exports the ray generation and miss programs plus one hit
//! group per (shading mode, instance) pair, named `<Mode>_<id>`. Switching
//! mode only changes which of those exports the record table points at,
//! so the pipeline is regenerated on structural edits alone.

use std::fmt;
use std::str::FromStr;

use log::info;

use crate::device::{
    DeviceResult, ExportKind, PipelineDesc, PipelineExport, PipelineId, RayTracingDevice,
};
use crate::error::AccelError;
use crate::layout::{HitParam, MissParam, ParamSlots, RayGenParam};

pub const RAY_GEN_EXPORT: &str = "RayGen";
pub const MISS_EXPORT: &str = "Miss";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ShadingMode {
    #[default]
    Flat,
    Normal,
    Phong,
    MirrorDemo,
}

impl ShadingMode {
    pub const ALL: [ShadingMode; 4] = [
        ShadingMode::Flat,
        ShadingMode::Normal,
        ShadingMode::Phong,
        ShadingMode::MirrorDemo,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ShadingMode::Flat => "Flat",
            ShadingMode::Normal => "Normal",
            ShadingMode::Phong => "Phong",
            ShadingMode::MirrorDemo => "MirrorDemo",
        }
    }

    /// Closest-hit program run by this mode's hit groups.
    pub fn closest_hit_program(self) -> String {
        format!("ClosestHit_{}", self.name())
    }
}

impl fmt::Display for ShadingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ShadingMode {
    type Err = AccelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ShadingMode::ALL
            .into_iter()
            .find(|mode| mode.name() == s)
            .ok_or_else(|| AccelError::UnknownShadingMode(s.to_string()))
    }
}

/// Export name of the hit group for `instance` under `mode`.
pub fn hit_group_name(mode: ShadingMode, instance: u32) -> String {
    format!("{}_{}", mode.name(), instance)
}

/// Pipeline description exporting every mode for `instance_count` instances.
pub fn pipeline_desc(instance_count: u32, max_recursion_depth: u32) -> PipelineDesc {
    let mut exports = vec![
        PipelineExport {
            name: RAY_GEN_EXPORT.to_string(),
            kind: ExportKind::RayGeneration,
            signature: RayGenParam::signature(),
        },
        PipelineExport {
            name: MISS_EXPORT.to_string(),
            kind: ExportKind::Miss,
            signature: MissParam::signature(),
        },
    ];
    for mode in ShadingMode::ALL {
        for id in 0..instance_count {
            exports.push(PipelineExport {
                name: hit_group_name(mode, id),
                kind: ExportKind::HitGroup {
                    closest_hit: mode.closest_hit_program(),
                },
                signature: HitParam::signature(),
            });
        }
    }
    PipelineDesc {
        exports,
        max_recursion_depth,
    }
}

/// The current pipeline and the description it was created from.
#[derive(Debug, Default)]
pub struct RayTracingPipeline {
    id: Option<PipelineId>,
    desc: PipelineDesc,
    instance_count: u32,
}

impl RayTracingPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recreate the pipeline for `instance_count` instances. The previous
    /// pipeline is destroyed only once its replacement exists.
    pub fn rebuild<D: RayTracingDevice + ?Sized>(
        &mut self,
        device: &D,
        instance_count: u32,
        max_recursion_depth: u32,
    ) -> DeviceResult<PipelineId> {
        let desc = pipeline_desc(instance_count, max_recursion_depth);
        let id = device.create_pipeline(&desc)?;
        if let Some(old) = self.id.replace(id) {
            device.destroy_pipeline(old);
        }
        info!(
            "Built ray tracing pipeline: {} exports for {} instances",
            desc.exports.len(),
            instance_count
        );
        self.desc = desc;
        self.instance_count = instance_count;
        Ok(id)
    }

    pub fn id(&self) -> Option<PipelineId> {
        self.id
    }

    pub fn desc(&self) -> &PipelineDesc {
        &self.desc
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn release<D: RayTracingDevice + ?Sized>(&mut self, device: &D) {
        if let Some(id) = self.id.take() {
            device.destroy_pipeline(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareDevice;

    #[test]
    fn test_mode_names_round_trip() {
        for mode in ShadingMode::ALL {
            assert_eq!(mode.name().parse::<ShadingMode>().unwrap(), mode);
        }
        assert!(matches!(
            "flat".parse::<ShadingMode>(),
            Err(AccelError::UnknownShadingMode(_))
        ));
    }

    #[test]
    fn test_hit_group_names() {
        assert_eq!(hit_group_name(ShadingMode::Phong, 3), "Phong_3");
        assert_eq!(ShadingMode::MirrorDemo.closest_hit_program(), "ClosestHit_MirrorDemo");
    }

    #[test]
    fn test_desc_exports_every_mode() {
        let desc = pipeline_desc(2, 1);
        assert_eq!(desc.exports.len(), 2 + 4 * 2);
        assert!(desc.export("Normal_1").is_some());
        assert!(desc.export("Normal_2").is_none());
        assert_eq!(desc.export(MISS_EXPORT).unwrap().signature, MissParam::signature());
    }

    #[test]
    fn test_rebuild_replaces_pipeline() {
        let device = SoftwareDevice::new();
        let mut pipeline = RayTracingPipeline::new();
        let first = pipeline.rebuild(&device, 1, 2).unwrap();
        let second = pipeline.rebuild(&device, 3, 2).unwrap();
        assert_ne!(first, second);
        assert_eq!(pipeline.instance_count(), 3);
        assert!(device.shader_identifier(first, "Flat_0").is_err());
        assert!(device.shader_identifier(second, "Flat_2").is_ok());
    }
}
