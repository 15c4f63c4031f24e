//! Parameter slots of each program's local signature.
//!
//! The pipeline derives export signatures from these enums and the shader
//! record builder fills parameter blocks by iterating the same enums, so
//! the declared order and the written order cannot drift apart.

use crate::device::ParamKind;

/// A program's ordered list of record parameters.
pub trait ParamSlots: Copy + Sized + 'static {
    /// Every slot, in record order.
    const ALL: &'static [Self];

    fn kind(self) -> ParamKind;

    fn signature() -> Vec<ParamKind> {
        Self::ALL.iter().map(|slot| slot.kind()).collect()
    }

    /// Parameter block with one value per slot, in record order.
    fn fill(mut value: impl FnMut(Self) -> u64) -> Vec<u64> {
        Self::ALL.iter().map(|&slot| value(slot)).collect()
    }
}

/// Ray generation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RayGenParam {
    /// Start of the resource view table.
    ViewTable,
}

impl ParamSlots for RayGenParam {
    const ALL: &'static [Self] = &[RayGenParam::ViewTable];

    fn kind(self) -> ParamKind {
        ParamKind::DescriptorTable
    }
}

/// Miss parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissParam {
    /// View table handle of the environment texture, null without one.
    Environment,
    Sampler,
}

impl ParamSlots for MissParam {
    const ALL: &'static [Self] = &[MissParam::Environment, MissParam::Sampler];

    fn kind(self) -> ParamKind {
        match self {
            MissParam::Environment => ParamKind::DescriptorTable,
            MissParam::Sampler => ParamKind::SamplerTable,
        }
    }
}

/// Hit group parameters, shared by every closest-hit program.
///
/// Programs that ignore a slot still get it filled: the device reads the
/// whole block regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitParam {
    VertexBuffer,
    /// Zero for non-indexed geometry.
    IndexBuffer,
    InstanceData,
    Lights,
    /// Declared by the programs but unused; carries the lights address.
    Auxiliary,
    SceneHierarchy,
}

impl ParamSlots for HitParam {
    const ALL: &'static [Self] = &[
        HitParam::VertexBuffer,
        HitParam::IndexBuffer,
        HitParam::InstanceData,
        HitParam::Lights,
        HitParam::Auxiliary,
        HitParam::SceneHierarchy,
    ];

    fn kind(self) -> ParamKind {
        match self {
            HitParam::VertexBuffer => ParamKind::ShaderResource(0),
            HitParam::IndexBuffer => ParamKind::ShaderResource(1),
            HitParam::InstanceData => ParamKind::ShaderResource(2),
            HitParam::Lights => ParamKind::ConstantBuffer(1),
            HitParam::Auxiliary => ParamKind::ConstantBuffer(2),
            HitParam::SceneHierarchy => ParamKind::ShaderResource(3),
        }
    }
}

/// Largest parameter block of any program.
pub const MAX_PARAMS: usize = max(max(RayGenParam::ALL.len(), MissParam::ALL.len()), HitParam::ALL.len());

const fn max(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_signature_order() {
        assert_eq!(
            HitParam::signature(),
            vec![
                ParamKind::ShaderResource(0),
                ParamKind::ShaderResource(1),
                ParamKind::ShaderResource(2),
                ParamKind::ConstantBuffer(1),
                ParamKind::ConstantBuffer(2),
                ParamKind::ShaderResource(3),
            ]
        );
        assert_eq!(MAX_PARAMS, 6);
    }

    #[test]
    fn test_fill_follows_slot_order() {
        let block = MissParam::fill(|slot| match slot {
            MissParam::Environment => 7,
            MissParam::Sampler => 9,
        });
        assert_eq!(block, vec![7, 9]);
        assert_eq!(block.len(), MissParam::signature().len());
    }
}
