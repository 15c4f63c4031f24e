//! RTS Accel - acceleration structures and shader record tables for
//! hardware ray tracing.
//!
//! The crate keeps three pieces of device state consistent while a scene
//! is edited:
//!
//! - **Hierarchies**: one bottom-level structure per instance and a
//!   scene-wide top-level structure with full build and refit
//! - **Resource view table**: outputs, hierarchy, camera constants,
//!   per-instance data and environment at fixed slots
//! - **Shader record table**: ray generation, miss, and one hit group per
//!   instance for the active shading mode
//!
//! `SceneEditCoordinator` drives all of them against any
//! `RayTracingDevice`. `SoftwareDevice` runs the whole pipeline on the CPU.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rts_accel::{FrameInput, RendererConfig, SceneEditCoordinator, SoftwareDevice};
//!
//! let device = Arc::new(SoftwareDevice::new());
//! let mut scene = SceneEditCoordinator::new(device, RendererConfig::default())?;
//! scene.add_instance("cube.obj")?;
//! scene.set_shading_mode("Phong")?;
//! scene.per_frame_tick(&FrameInput::default())?;
//! let pixels = scene.read_output()?;
//! ```

pub mod blas;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod geometry;
pub mod gpu_types;
pub mod growable;
pub mod layout;
pub mod pipeline;
pub mod shader_table;
pub mod tlas;
pub mod view_table;

pub use blas::{build_bottom_level, BottomLevelStructure};
pub use config::RendererConfig;
pub use coordinator::{EditCommand, EditState, FrameInput, Instance, SceneEditCoordinator};
pub use device::{DeviceError, DeviceResult, RayTracingDevice, SoftwareDevice};
pub use error::{AccelError, AccelResult};
pub use geometry::{GeometryBuffers, GeometryStore};
pub use growable::GrowableBuffer;
pub use layout::{HitParam, MissParam, ParamSlots, RayGenParam};
pub use pipeline::{hit_group_name, RayTracingPipeline, ShadingMode};
pub use shader_table::{InstanceBindings, ShaderTable, ShaderTableLayout, SharedBindings};
pub use tlas::{InstancePlacement, TopLevelBuild, TopLevelBuilder};
pub use view_table::{slot_count_for, ResourceViewTable, ViewTableInputs};
