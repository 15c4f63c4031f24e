//! The scene edit coordinator.
//!
//! Owns the geometry store, the bottom-level structures, the top-level
//! builder, the view table, the pipeline and the shader record table, and
//! keeps them consistent as edits arrive. Every edit records its device
//! work into one command list, submits it, and blocks on the fence before
//! returning, so the host never rewrites a buffer the device may still be
//! reading.
//!
//! Instance ids are always `0..N`: the id of an instance is its position
//! in the store, in the top-level structure and in the hit group section.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use rts_core::{
    load_obj, load_texture, CameraDesc, EnvironmentDesc, LightDesc, MaterialKey, MaterialLibrary,
    ModelDesc, SceneDescription, Timeline, TransformSample,
};
use rts_math::{compose_srt, FlyCamera, MovementKeys, Vec3};

use crate::blas::{build_bottom_level, BottomLevelStructure};
use crate::config::RendererConfig;
use crate::device::{
    align_up, BufferDesc, BufferId, BufferUsage, Command, CommandList, DescriptorHandle,
    DeviceAddress, DeviceError, FenceValue, ImageDesc, ImageId, MemoryLocation, RayTracingDevice,
    CONSTANT_BUFFER_ALIGNMENT,
};
use crate::error::{AccelError, AccelResult};
use crate::geometry::GeometryStore;
use crate::gpu_types::{InstanceData, LightData, SceneConstants};
use crate::growable::GrowableBuffer;
use crate::pipeline::{RayTracingPipeline, ShadingMode};
use crate::shader_table::{InstanceBindings, ShaderTable, SharedBindings};
use crate::tlas::{InstancePlacement, TopLevelBuild, TopLevelBuilder};
use crate::view_table::{ResourceViewTable, ViewTableInputs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditState {
    Idle,
    Rebuilding,
}

/// High-level edits issued by the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum EditCommand {
    AddInstance(PathBuf),
    RemoveInstance(usize),
    SetShadingMode(String),
    LoadScene(PathBuf),
    SaveScene(PathBuf),
    SetLight(LightDesc),
}

/// Per-frame input.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameInput {
    /// Wall-clock seconds since start; drives animation.
    pub elapsed: f64,
    /// Seconds since the previous frame; drives camera movement.
    pub dt: f32,
    pub keys: MovementKeys,
}

/// One drawable object.
#[derive(Debug)]
pub struct Instance {
    /// Description as loaded; `desc.id` is kept equal to the instance id.
    pub desc: ModelDesc,
    pub material: MaterialKey,
    pub material_index: u32,
    pub timeline: Timeline,
    /// Transform used for the next build.
    pub transform: TransformSample,
    blas: BottomLevelStructure,
}

impl Instance {
    pub fn id(&self) -> u32 {
        self.desc.id
    }

    pub fn blas(&self) -> &BottomLevelStructure {
        &self.blas
    }
}

fn base_transform(desc: &ModelDesc) -> TransformSample {
    TransformSample {
        position: Vec3::from(desc.position),
        rotation: Vec3::from(desc.rotation),
        scale: Vec3::from(desc.scale),
    }
}

pub struct SceneEditCoordinator<D: RayTracingDevice> {
    device: Arc<D>,
    config: RendererConfig,
    state: EditState,
    mode: ShadingMode,

    instances: Vec<Instance>,
    geometry: GeometryStore,
    materials: MaterialLibrary,
    tlas: TopLevelBuilder,
    views: ResourceViewTable,
    pipeline: RayTracingPipeline,
    records: ShaderTable,
    /// Set when the instance count changed since the last full top-level build.
    structural_dirty: bool,
    /// Hierarchy address the current records were written with.
    bound_hierarchy: DeviceAddress,

    outputs: Vec<ImageId>,
    camera: FlyCamera,
    camera_buffer: BufferId,
    light: LightDesc,
    lights_buffer: BufferId,
    instance_data: GrowableBuffer,
    environment: Option<EnvironmentDesc>,
    environment_image: Option<ImageId>,
    sampler: DescriptorHandle,
    frame_index: u32,
    last_fence: FenceValue,
}

impl<D: RayTracingDevice> SceneEditCoordinator<D> {
    /// Create the render targets and shared buffers and build the tables
    /// for an empty scene.
    pub fn new(device: Arc<D>, config: RendererConfig) -> AccelResult<Self> {
        if !device.supports_ray_tracing() {
            return Err(DeviceError::RayTracingUnsupported.into());
        }

        let mut outputs = Vec::with_capacity(config.output_count() as usize);
        for i in 0..config.output_count() {
            let label = match i {
                0 => "output".to_string(),
                1 => "normal_roughness".to_string(),
                2 => "depth".to_string(),
                3 => "albedo".to_string(),
                n => format!("aux{n}"),
            };
            outputs.push(device.create_image(&ImageDesc {
                label,
                width: config.width,
                height: config.height,
            })?);
        }
        let constant_buffer = |label: &str, size: usize| {
            device.create_buffer(&BufferDesc::new(
                label,
                align_up(size as u64, CONSTANT_BUFFER_ALIGNMENT),
                BufferUsage::Constant,
                MemoryLocation::CpuToGpu,
            ))
        };
        let camera_buffer = constant_buffer("camera constants", std::mem::size_of::<SceneConstants>())?;
        let lights_buffer = constant_buffer("lights", std::mem::size_of::<LightData>())?;
        let sampler = device.create_sampler()?;

        let mut coordinator = Self {
            tlas: TopLevelBuilder::new(config.rotation_order),
            mode: config.default_shading_mode,
            device,
            config,
            state: EditState::Idle,
            instances: Vec::new(),
            geometry: GeometryStore::new(),
            materials: MaterialLibrary::new(),
            views: ResourceViewTable::new(),
            pipeline: RayTracingPipeline::new(),
            records: ShaderTable::new(),
            structural_dirty: false,
            bound_hierarchy: 0,
            outputs,
            camera: FlyCamera::default(),
            camera_buffer,
            light: LightDesc::default(),
            lights_buffer,
            instance_data: GrowableBuffer::new("instance data", BufferUsage::Storage, MemoryLocation::CpuToGpu),
            environment: None,
            environment_image: None,
            sampler,
            frame_index: 0,
            last_fence: 0,
        };
        coordinator.write_light()?;
        coordinator.rebuild_structures(CommandList::new(), true)?;
        info!(
            "Scene coordinator ready: {}x{}, {} render targets",
            coordinator.config.width,
            coordinator.config.height,
            coordinator.outputs.len()
        );
        Ok(coordinator)
    }

    /// Apply one edit command.
    pub fn handle(&mut self, command: EditCommand) -> AccelResult<()> {
        match command {
            EditCommand::AddInstance(path) => self.add_instance(path).map(|_| ()),
            EditCommand::RemoveInstance(index) => self.remove_instance(index),
            EditCommand::SetShadingMode(name) => self.set_shading_mode(&name),
            EditCommand::LoadScene(path) => self.load_scene(path),
            EditCommand::SaveScene(path) => self.save_scene(path),
            EditCommand::SetLight(light) => self.set_light(light),
        }
    }

    /// Load a model at the origin and append it. Returns its id.
    pub fn add_instance<P: AsRef<Path>>(&mut self, path: P) -> AccelResult<u32> {
        self.add_model(ModelDesc::new(path.as_ref().to_string_lossy()))
    }

    /// Append a model with its transform, material overrides and animation.
    ///
    /// A model that fails to load leaves the scene as it was.
    pub fn add_model(&mut self, desc: ModelDesc) -> AccelResult<u32> {
        self.run_edit(|this| {
            let mut commands = CommandList::new();
            let id = this.stage_model(desc, &mut commands)?;
            this.structural_dirty = true;
            this.rebuild_structures(commands, true)?;
            Ok(id)
        })
    }

    /// Remove instance `index` and renumber the instances after it.
    /// Out-of-range indices are ignored.
    pub fn remove_instance(&mut self, index: usize) -> AccelResult<()> {
        if index >= self.instances.len() {
            warn!(
                "Ignoring removal of instance {} (scene has {})",
                index,
                self.instances.len()
            );
            return Ok(());
        }
        self.run_edit(|this| {
            this.drain()?;
            let device = Arc::clone(&this.device);
            let instance = this.instances.remove(index);
            this.geometry.remove(device.as_ref(), index);
            instance.blas.release(device.as_ref());
            for (id, instance) in this.instances.iter_mut().enumerate() {
                instance.desc.id = id as u32;
            }
            info!("Removed instance {} ({})", index, instance.desc.path);
            this.structural_dirty = true;
            this.rebuild_structures(CommandList::new(), true)
        })
    }

    /// Switch every hit group record to `name`'s programs. Geometry and
    /// hierarchies are untouched.
    pub fn set_shading_mode(&mut self, name: &str) -> AccelResult<()> {
        let mode: ShadingMode = name.parse()?;
        self.set_mode(mode)
    }

    pub fn set_mode(&mut self, mode: ShadingMode) -> AccelResult<()> {
        self.run_edit(|this| {
            this.mode = mode;
            this.rebuild_records()?;
            this.submit_and_wait(CommandList::new())?;
            info!("Shading mode set to {}", mode);
            Ok(())
        })
    }

    /// Replace the scene with the contents of a scene file.
    pub fn load_scene<P: AsRef<Path>>(&mut self, path: P) -> AccelResult<()> {
        let scene = SceneDescription::load(path)?;
        self.load_description(scene)
    }

    /// Replace the scene. Models that fail to load are skipped; device
    /// failures abort. The top-level structure is built by the next tick.
    pub fn load_description(&mut self, scene: SceneDescription) -> AccelResult<()> {
        self.run_edit(|this| {
            this.drain()?;
            this.clear_instances();

            let camera = &scene.camera;
            this.camera = FlyCamera::new(
                Vec3::from(camera.eye),
                Vec3::from(camera.center),
                Vec3::from(camera.up),
            );
            this.light = scene.light.clone();
            this.write_light()?;
            this.set_environment(scene.environment.clone())?;

            let mut commands = CommandList::new();
            for model in scene.models {
                let path = model.path.clone();
                match this.stage_model(model, &mut commands) {
                    Ok(_) => {}
                    Err(e) if !e.is_fatal() => error!("Skipping model {}: {}", path, e),
                    Err(e) => return Err(e),
                }
            }
            this.structural_dirty = true;
            this.rebuild_structures(commands, false)?;
            info!("Loaded scene with {} instances", this.instances.len());
            Ok(())
        })
    }

    pub fn save_scene<P: AsRef<Path>>(&self, path: P) -> AccelResult<()> {
        self.scene_description().save(path)?;
        Ok(())
    }

    /// The current scene in file form.
    pub fn scene_description(&self) -> SceneDescription {
        SceneDescription {
            models: self.instances.iter().map(|i| i.desc.clone()).collect(),
            camera: CameraDesc {
                eye: self.camera.eye.to_array(),
                center: self.camera.center.to_array(),
                up: self.camera.up.to_array(),
            },
            light: self.light.clone(),
            environment: self.environment.clone(),
        }
    }

    /// Replace the scene light. Structures are untouched.
    pub fn set_light(&mut self, light: LightDesc) -> AccelResult<()> {
        self.light = light;
        self.write_light()?;
        info!("Light set to {:?} at {:?}", self.light.kind, self.light.position);
        Ok(())
    }

    /// Move an instance. Takes effect at the next tick, through a refit.
    pub fn set_transform(&mut self, id: usize, position: Vec3, rotation: Vec3, scale: Vec3) -> bool {
        match self.instances.get_mut(id) {
            Some(instance) => {
                instance.desc.position = position.to_array();
                instance.desc.rotation = rotation.to_array();
                instance.desc.scale = scale.to_array();
                instance.transform = base_transform(&instance.desc);
                true
            }
            None => {
                warn!("Ignoring transform of instance {} (scene has {})", id, self.instances.len());
                false
            }
        }
    }

    /// Advance the camera and animations, update the top-level structure
    /// and trace one frame.
    ///
    /// Refits when the instance set is unchanged since the last full build;
    /// otherwise does a full build and repoints the hierarchy slot. An empty
    /// scene skips the hierarchy build but still traces, so every ray misses.
    pub fn per_frame_tick(&mut self, input: &FrameInput) -> AccelResult<TopLevelBuild> {
        self.camera.advance(&input.keys, input.dt);
        for instance in &mut self.instances {
            if let Some(sample) = instance.timeline.sample(input.elapsed) {
                instance.transform = sample;
            }
        }
        if self.instances.is_empty() {
            debug!("Empty scene, tracing the environment only");
        }

        let device = Arc::clone(&self.device);
        let mut commands = CommandList::new();
        self.write_instance_data()?;
        let placements = self.placements();
        let build = if self.structural_dirty {
            let build = self.tlas.build(device.as_ref(), &placements, false, &mut commands)?;
            self.structural_dirty = false;
            let hierarchy = self.tlas.result_address(device.as_ref())?;
            self.views.update_hierarchy(device.as_ref(), hierarchy)?;
            if hierarchy != self.bound_hierarchy {
                self.rebuild_records()?;
            }
            build
        } else {
            self.tlas.build(device.as_ref(), &placements, true, &mut commands)?
        };

        self.frame_index = self.frame_index.wrapping_add(1);
        self.write_camera()?;
        commands.push(Command::DispatchRays(
            self.records.dispatch_desc(self.config.width, self.config.height)?,
        ));
        self.submit_and_wait(commands)?;
        Ok(build)
    }

    /// Output image pixels, row-major RGBA.
    pub fn read_output(&self) -> AccelResult<Vec<[f32; 4]>> {
        self.read_target(0)
    }

    /// Pixels of render target `index`: 0 is the output, then the auxiliary targets.
    pub fn read_target(&self, index: usize) -> AccelResult<Vec<[f32; 4]>> {
        let image = self
            .outputs
            .get(index)
            .ok_or_else(|| AccelError::InvalidState(format!("no render target {index}")))?;
        Ok(self.device.read_image(*image)?)
    }

    pub fn state(&self) -> EditState {
        self.state
    }

    pub fn mode(&self) -> ShadingMode {
        self.mode
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn instance_ids(&self) -> Vec<u32> {
        self.instances.iter().map(Instance::id).collect()
    }

    pub fn geometry(&self) -> &GeometryStore {
        &self.geometry
    }

    pub fn materials(&self) -> &MaterialLibrary {
        &self.materials
    }

    pub fn top_level(&self) -> &TopLevelBuilder {
        &self.tlas
    }

    pub fn view_table(&self) -> &ResourceViewTable {
        &self.views
    }

    pub fn pipeline(&self) -> &RayTracingPipeline {
        &self.pipeline
    }

    pub fn records(&self) -> &ShaderTable {
        &self.records
    }

    pub fn hit_group_names(&self) -> &[String] {
        self.records.hit_group_names()
    }

    pub fn is_structurally_dirty(&self) -> bool {
        self.structural_dirty
    }

    pub fn camera(&self) -> &FlyCamera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut FlyCamera {
        &mut self.camera
    }

    pub fn light(&self) -> &LightDesc {
        &self.light
    }

    // Internals

    /// Run `edit` in the `Rebuilding` state.
    fn run_edit<T>(&mut self, edit: impl FnOnce(&mut Self) -> AccelResult<T>) -> AccelResult<T> {
        self.state = EditState::Rebuilding;
        let result = edit(self);
        self.state = EditState::Idle;
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("Edit failed: {}", e);
            } else {
                warn!("Edit abandoned: {}", e);
            }
        }
        result
    }

    /// Load geometry, upload it and record its bottom-level build, then
    /// commit the instance. Nothing is committed if any step fails.
    fn stage_model(&mut self, mut desc: ModelDesc, commands: &mut CommandList) -> AccelResult<u32> {
        let device = Arc::clone(&self.device);
        let loaded = load_obj(&desc.path)?;
        let material = loaded.material.clone().with_overrides(&desc.material_overrides());
        let geometry = self.geometry.upload(device.as_ref(), &loaded.mesh, material.albedo)?;
        let blas = match build_bottom_level(device.as_ref(), &[geometry.triangle_geometry()], commands) {
            Ok(blas) => blas,
            Err(e) => {
                self.geometry.discard(device.as_ref(), geometry);
                return Err(e.into());
            }
        };

        let material_index = self.materials.index_of(&material);
        let id = self.geometry.push(geometry);
        desc.id = id;
        info!(
            "Added instance {} from {} ({} triangles, material {})",
            id,
            desc.path,
            loaded.mesh.triangle_count(),
            material_index
        );
        self.instances.push(Instance {
            timeline: Timeline::from_model(&desc),
            transform: base_transform(&desc),
            desc,
            material,
            material_index,
            blas,
        });
        Ok(id)
    }

    /// Rewrite instance data, pipeline, view table and records, submit
    /// `commands` and wait. With `build_hierarchy` the top-level structure
    /// is rebuilt as well; otherwise it is left to the next tick.
    fn rebuild_structures(&mut self, mut commands: CommandList, build_hierarchy: bool) -> AccelResult<()> {
        let device = Arc::clone(&self.device);
        self.write_instance_data()?;
        if build_hierarchy {
            let placements = self.placements();
            self.tlas.build(device.as_ref(), &placements, false, &mut commands)?;
            self.structural_dirty = false;
        } else {
            self.tlas.invalidate();
        }
        self.pipeline.rebuild(
            device.as_ref(),
            self.instances.len() as u32,
            self.config.max_recursion_depth,
        )?;
        self.write_camera()?;
        self.rebuild_views()?;
        self.rebuild_records()?;
        self.submit_and_wait(commands)?;
        for instance in &mut self.instances {
            instance.blas.release_scratch(device.as_ref());
        }
        Ok(())
    }

    fn rebuild_views(&mut self) -> AccelResult<()> {
        let device = self.device.as_ref();
        let camera = device.buffer_address(self.camera_buffer)?;
        let camera_size = device.buffer_size(self.camera_buffer)?;
        let inputs = ViewTableInputs {
            outputs: &self.outputs,
            hierarchy: self.tlas.result_address(device)?,
            camera,
            camera_size,
            instance_data: self.instance_data.buffer().filter(|_| !self.instances.is_empty()),
            instance_count: self.instances.len() as u32,
            environment: self.environment_image,
        };
        self.views.rebuild(device, &inputs)?;
        Ok(())
    }

    fn rebuild_records(&mut self) -> AccelResult<()> {
        let device = self.device.as_ref();
        let instances: Vec<InstanceBindings> = self
            .geometry
            .iter()
            .map(|g| InstanceBindings {
                vertex_buffer: g.vertex_address,
                index_buffer: g.index_address,
            })
            .collect();
        let hierarchy = self.tlas.result_address(device)?;
        let shared = SharedBindings {
            view_table: self.views.start(),
            environment: self.views.environment_handle(),
            sampler: self.sampler,
            instance_data: self.instance_data.address(device)?,
            lights: device.buffer_address(self.lights_buffer)?,
            hierarchy,
        };
        self.records
            .rebuild(device, &self.pipeline, self.mode, &instances, &shared)?;
        self.bound_hierarchy = hierarchy;
        Ok(())
    }

    fn placements(&self) -> Vec<InstancePlacement> {
        self.instances
            .iter()
            .map(|i| InstancePlacement {
                blas_address: i.blas.address,
                position: i.transform.position,
                rotation: i.transform.rotation,
                scale: i.transform.scale,
            })
            .collect()
    }

    fn write_instance_data(&mut self) -> AccelResult<()> {
        if self.instances.is_empty() {
            return Ok(());
        }
        let data: Vec<InstanceData> = self
            .instances
            .iter()
            .enumerate()
            .map(|(id, i)| {
                let world = compose_srt(
                    i.transform.position,
                    i.transform.rotation,
                    i.transform.scale,
                    self.config.rotation_order,
                );
                InstanceData::new(id as u32, world, &i.material, i.material_index, i.desc.emission)
            })
            .collect();
        let bytes: &[u8] = bytemuck::cast_slice(&data);
        self.instance_data.ensure(self.device.as_ref(), bytes.len() as u64)?;
        if let Some(buffer) = self.instance_data.buffer() {
            self.device.write_buffer(buffer, 0, bytes)?;
        }
        Ok(())
    }

    fn write_camera(&self) -> AccelResult<()> {
        let mut constants = SceneConstants::new(&self.camera, self.config.aspect());
        constants.frame_index = self.frame_index;
        constants.sample_count = self.config.sample_count;
        constants.max_recursion_depth = self.config.max_recursion_depth;
        if let Some(environment) = &self.environment {
            constants = constants.with_environment(Vec3::from(environment.color) * environment.intensity);
        }
        self.device
            .write_buffer(self.camera_buffer, 0, bytemuck::bytes_of(&constants))?;
        Ok(())
    }

    fn write_light(&self) -> AccelResult<()> {
        let light = LightData::from(&self.light);
        self.device.write_buffer(self.lights_buffer, 0, bytemuck::bytes_of(&light))?;
        Ok(())
    }

    /// Replace the environment. An image that fails to load falls back to
    /// the constant colour.
    fn set_environment(&mut self, environment: Option<EnvironmentDesc>) -> AccelResult<()> {
        let device = Arc::clone(&self.device);
        if let Some(image) = self.environment_image.take() {
            device.destroy_image(image);
        }
        let path = environment.as_ref().and_then(|e| e.path.clone());
        self.environment = environment;
        let Some(path) = path else {
            return Ok(());
        };
        match load_texture(&path) {
            Ok(texture) => {
                let image = device.create_image(&ImageDesc {
                    label: path.clone(),
                    width: texture.width,
                    height: texture.height,
                })?;
                device.write_image(image, &texture.pixels)?;
                info!("Environment {} ({}x{})", path, texture.width, texture.height);
                self.environment_image = Some(image);
            }
            Err(e) => error!("Environment {} unavailable, using constant colour: {}", path, e),
        }
        Ok(())
    }

    fn clear_instances(&mut self) {
        let device = Arc::clone(&self.device);
        for instance in self.instances.drain(..) {
            instance.blas.release(device.as_ref());
        }
        self.geometry.clear(device.as_ref());
        self.materials.clear();
        self.tlas.invalidate();
    }

    fn submit_and_wait(&mut self, commands: CommandList) -> AccelResult<()> {
        let fence = self.device.submit(commands)?;
        self.last_fence = fence;
        self.device.wait_for_fence(fence)?;
        Ok(())
    }

    /// Wait for every submission so far.
    fn drain(&self) -> AccelResult<()> {
        self.device.wait_for_fence(self.last_fence)?;
        Ok(())
    }
}

impl<D: RayTracingDevice> Drop for SceneEditCoordinator<D> {
    fn drop(&mut self) {
        if self.drain().is_err() {
            return;
        }
        let device = Arc::clone(&self.device);
        let device = device.as_ref();
        self.clear_instances();
        self.tlas.release(device);
        self.records.release(device);
        self.pipeline.release(device);
        self.views.release(device);
        self.instance_data.release(device);
        device.destroy_buffer(self.camera_buffer);
        device.destroy_buffer(self.lights_buffer);
        for image in self.outputs.drain(..).chain(self.environment_image.take()) {
            device.destroy_image(image);
        }
    }
}
