//! Keyframe timelines.
//!
//! A timeline loops over its keyframes with period equal to the last
//! keyframe's time and linearly interpolates position, rotation and scale.

use rts_math::Vec3;

use crate::scene::ModelDesc;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Keyframe {
    pub time: f32,
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
}

/// Interpolated transform at one instant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransformSample {
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Timeline {
    frames: Vec<Keyframe>,
    sorted: bool,
}

impl Timeline {
    /// Keyframes in file order. Unsorted times are allowed; see `sample`.
    pub fn new(frames: Vec<Keyframe>) -> Self {
        let sorted = frames.windows(2).all(|w| w[0].time <= w[1].time);
        Self { frames, sorted }
    }

    /// Timeline of a model's keyframes. Missing fields fall back to the
    /// model's own transform.
    pub fn from_model(model: &ModelDesc) -> Self {
        let frames = model
            .keyframes()
            .iter()
            .map(|k| Keyframe {
                time: k.time,
                position: Vec3::from(k.position.unwrap_or(model.position)),
                rotation: Vec3::from(k.rotation.unwrap_or(model.rotation)),
                scale: Vec3::from(k.scale.unwrap_or(model.scale)),
            })
            .collect();
        Self::new(frames)
    }

    /// Fewer than two keyframes never animate.
    pub fn is_animated(&self) -> bool {
        self.frames.len() >= 2 && self.period() > 0.0
    }

    pub fn period(&self) -> f32 {
        self.frames.last().map(|f| f.time).unwrap_or(0.0)
    }

    pub fn frames(&self) -> &[Keyframe] {
        &self.frames
    }

    fn bracket(&self, t: f32) -> Option<(&Keyframe, &Keyframe)> {
        if self.sorted {
            // First keyframe strictly after t.
            let next = self.frames.partition_point(|f| f.time <= t);
            if next == 0 || next == self.frames.len() {
                return None;
            }
            return Some((&self.frames[next - 1], &self.frames[next]));
        }
        self.frames
            .windows(2)
            .find(|w| w[0].time <= t && t < w[1].time)
            .map(|w| (&w[0], &w[1]))
    }

    /// Transform at wall-clock `seconds`, looped on the last keyframe's time.
    /// `None` when the timeline does not animate or no pair of consecutive
    /// keyframes brackets the looped time.
    pub fn sample(&self, seconds: f64) -> Option<TransformSample> {
        if !self.is_animated() {
            return None;
        }
        let t = (seconds % self.period() as f64) as f32;
        let (a, b) = self.bracket(t)?;
        let span = b.time - a.time;
        let factor = if span > 0.0 { (t - a.time) / span } else { 0.0 };

        Some(TransformSample {
            position: a.position.lerp(b.position, factor),
            rotation: a.rotation.lerp(b.rotation, factor),
            scale: a.scale.lerp(b.scale, factor),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(time: f32, x: f32) -> Keyframe {
        Keyframe {
            time,
            position: Vec3::new(x, 0.0, 0.0),
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }

    #[test]
    fn test_single_keyframe_does_not_animate() {
        let timeline = Timeline::new(vec![frame(1.0, 5.0)]);
        assert!(!timeline.is_animated());
        assert!(timeline.sample(0.5).is_none());
    }

    #[test]
    fn test_linear_interpolation() {
        let timeline = Timeline::new(vec![frame(0.0, 0.0), frame(1.0, 10.0), frame(2.0, 0.0)]);
        let s = timeline.sample(0.25).unwrap();
        assert!((s.position.x - 2.5).abs() < 1e-4);
        let s = timeline.sample(1.5).unwrap();
        assert!((s.position.x - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_sampling_loops_on_last_keyframe_time() {
        let timeline = Timeline::new(vec![frame(0.0, 0.0), frame(2.0, 4.0)]);
        let first = timeline.sample(0.5).unwrap();
        let looped = timeline.sample(4.5).unwrap();
        assert!((first.position - looped.position).length() < 1e-4);
    }

    #[test]
    fn test_time_before_first_keyframe_is_skipped() {
        let timeline = Timeline::new(vec![frame(1.0, 0.0), frame(3.0, 4.0)]);
        assert!(timeline.sample(0.5).is_none());
        assert!(timeline.sample(2.0).is_some());
    }

    #[test]
    fn test_unsorted_keyframes_hold_still_outside_a_bracket() {
        // Period is the last keyframe's time (1.0); only the 0..2 pair can
        // bracket a looped time.
        let timeline = Timeline::new(vec![frame(0.0, 0.0), frame(2.0, 4.0), frame(1.0, 8.0)]);
        assert!(timeline.is_animated());
        let s = timeline.sample(0.5).unwrap();
        assert!((s.position.x - 1.0).abs() < 1e-4);

        let backwards = Timeline::new(vec![frame(3.0, 0.0), frame(1.0, 4.0), frame(2.0, 0.0)]);
        assert!(backwards.sample(0.5).is_none());
        assert!(backwards.sample(1.5).is_some());
    }

    #[test]
    fn test_from_model_fills_missing_fields() {
        let text = r#"{ "models": [ { "path": "a.obj", "scale": [2, 2, 2], "animationFrames": { "frames": [
            { "time": 0.0, "position": [0, 0, 0] }, { "time": 1.0, "position": [0, 4, 0] } ] } } ] }"#;
        let scene = crate::SceneDescription::from_json_str(text).unwrap();
        let timeline = Timeline::from_model(&scene.models[0]);
        let s = timeline.sample(0.5).unwrap();
        assert!((s.position - Vec3::new(0.0, 2.0, 0.0)).length() < 1e-4);
        assert_eq!(s.scale, Vec3::splat(2.0));
    }
}
