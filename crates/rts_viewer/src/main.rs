//! Headless scene driver.
//!
//! Loads a scene, applies edit commands given on the command line in
//! order, ticks a number of frames on the software device and writes the
//! output image as PNG.
//!
//! ```text
//! rts_viewer [scene.json] [--size WxH] [--mode NAME] [--add model.obj]...
//!            [--remove INDEX]... [--keys wasdqe] [--frames N] [--fps F]
//!            [--out image.png] [--save scene.json]
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use rts_accel::{EditCommand, FrameInput, RendererConfig, SceneEditCoordinator, SoftwareDevice};
use rts_math::MovementKeys;

#[derive(Debug, Clone, PartialEq)]
struct Options {
    scene: Option<PathBuf>,
    width: u32,
    height: u32,
    edits: Vec<EditCommand>,
    keys: MovementKeys,
    frames: u32,
    fps: f32,
    out: PathBuf,
    save: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        let config = RendererConfig::default();
        Self {
            scene: None,
            width: config.width,
            height: config.height,
            edits: Vec::new(),
            keys: MovementKeys::default(),
            frames: 1,
            fps: 30.0,
            out: PathBuf::from("output.png"),
            save: None,
        }
    }
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Options> {
    let mut options = Options::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().with_context(|| format!("{name} needs a value"));
        match arg.as_str() {
            "--size" => {
                let size = value("--size")?;
                let (w, h) = size
                    .split_once('x')
                    .with_context(|| format!("--size expects WxH, got {size}"))?;
                options.width = w.parse().context("invalid width")?;
                options.height = h.parse().context("invalid height")?;
            }
            "--mode" => options.edits.push(EditCommand::SetShadingMode(value("--mode")?)),
            "--add" => options.edits.push(EditCommand::AddInstance(value("--add")?.into())),
            "--remove" => {
                let index = value("--remove")?.parse().context("invalid instance index")?;
                options.edits.push(EditCommand::RemoveInstance(index));
            }
            "--keys" => options.keys = MovementKeys::from_chars(&value("--keys")?),
            "--frames" => options.frames = value("--frames")?.parse().context("invalid frame count")?,
            "--fps" => options.fps = value("--fps")?.parse().context("invalid fps")?,
            "--out" => options.out = value("--out")?.into(),
            "--save" => options.save = Some(value("--save")?.into()),
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            path => {
                if options.scene.is_some() {
                    bail!("more than one scene given ({path})");
                }
                options.scene = Some(path.into());
            }
        }
    }
    if options.width == 0 || options.height == 0 {
        bail!("image size must be non-zero");
    }
    if options.fps <= 0.0 {
        bail!("--fps must be positive");
    }
    Ok(options)
}

/// Linear float pixel to 8-bit sRGB-ish (gamma 2).
fn to_rgba8(pixel: [f32; 4]) -> [u8; 4] {
    let encode = |c: f32| (255.0 * c.max(0.0).sqrt().clamp(0.0, 1.0)) as u8;
    [encode(pixel[0]), encode(pixel[1]), encode(pixel[2]), 255]
}

fn write_png(path: &PathBuf, width: u32, height: u32, pixels: &[[f32; 4]]) -> Result<()> {
    let bytes: Vec<u8> = pixels.iter().flat_map(|&p| to_rgba8(p)).collect();
    let image = image::RgbaImage::from_raw(width, height, bytes).context("output size mismatch")?;
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let options = parse_args(std::env::args().skip(1))?;
    log::info!("Starting RTS viewer ({}x{})", options.width, options.height);

    let config = RendererConfig::with_size(options.width, options.height);
    let device = Arc::new(SoftwareDevice::new());
    let mut scene = SceneEditCoordinator::new(device, config)?;

    if let Some(path) = &options.scene {
        scene
            .handle(EditCommand::LoadScene(path.clone()))
            .with_context(|| format!("failed to load {}", path.display()))?;
    }
    for edit in &options.edits {
        if let Err(e) = scene.handle(edit.clone()) {
            if e.is_fatal() {
                return Err(e).context("edit failed");
            }
            log::error!("{:?} failed: {}", edit, e);
        }
    }

    let dt = 1.0 / options.fps;
    let start = Instant::now();
    for frame in 0..options.frames {
        let input = FrameInput {
            elapsed: (frame as f32 * dt) as f64,
            dt,
            keys: options.keys,
        };
        let build = scene.per_frame_tick(&input)?;
        log::debug!("Frame {}: {:?}", frame, build);
    }
    log::info!(
        "Traced {} frames in {:.2?} ({} instances, mode {})",
        options.frames,
        start.elapsed(),
        scene.instances().len(),
        scene.mode()
    );

    let pixels = scene.read_output()?;
    write_png(&options.out, options.width, options.height, &pixels)?;
    log::info!("Wrote {}", options.out.display());

    if let Some(path) = &options.save {
        scene.handle(EditCommand::SaveScene(path.clone()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_edits_keep_command_line_order() {
        let options = parse_args(args(&[
            "scene.json", "--add", "cube.obj", "--remove", "0", "--mode", "Phong",
        ]))
        .unwrap();
        assert_eq!(options.scene, Some(PathBuf::from("scene.json")));
        assert_eq!(
            options.edits,
            vec![
                EditCommand::AddInstance("cube.obj".into()),
                EditCommand::RemoveInstance(0),
                EditCommand::SetShadingMode("Phong".into()),
            ]
        );
    }

    #[test]
    fn test_size_and_keys() {
        let options = parse_args(args(&["--size", "64x32", "--keys", "wd", "--frames", "3"])).unwrap();
        assert_eq!((options.width, options.height), (64, 32));
        assert!(options.keys.forward && options.keys.right && !options.keys.back);
        assert_eq!(options.frames, 3);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse_args(args(&["--size", "64"])).is_err());
        assert!(parse_args(args(&["--frames"])).is_err());
        assert!(parse_args(args(&["--bogus"])).is_err());
        assert!(parse_args(args(&["a.json", "b.json"])).is_err());
    }

    #[test]
    fn test_pixel_encoding() {
        assert_eq!(to_rgba8([0.0, 0.25, 1.0, 1.0]), [0, 127, 255, 255]);
        assert_eq!(to_rgba8([-1.0, 4.0, f32::NAN, 0.0])[..2], [0, 255]);
    }
}
