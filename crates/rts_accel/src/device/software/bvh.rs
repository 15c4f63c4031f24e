//! Binary bounding volume hierarchy over indexed primitives.
//!
//! Used for both levels: triangles inside a bottom-level structure and
//! instances inside a top-level structure. Primitives are referred to by
//! index into a caller-owned bounds array, which lets `refit` recompute
//! bounds without touching the topology.

use rts_math::{Aabb, Interval, Ray};

/// Maximum primitives per leaf node before splitting.
const LEAF_MAX_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub enum BvhNode {
    Branch {
        left: Box<BvhNode>,
        right: Box<BvhNode>,
        bbox: Aabb,
    },
    Leaf {
        prims: Vec<u32>,
        bbox: Aabb,
    },
    Empty,
}

impl BvhNode {
    /// Build over `bounds[i]` for every primitive `i`.
    pub fn build(bounds: &[Aabb]) -> Self {
        if bounds.is_empty() {
            return BvhNode::Empty;
        }
        let prims: Vec<u32> = (0..bounds.len() as u32).collect();
        Self::build_range(prims, bounds)
    }

    /// Median split on the longest axis of the centroid bounds.
    fn build_range(mut prims: Vec<u32>, bounds: &[Aabb]) -> Self {
        let bbox = Self::bounds_of(&prims, bounds);
        if prims.len() <= LEAF_MAX_SIZE {
            return BvhNode::Leaf { prims, bbox };
        }

        let centroid_bounds = prims.iter().fold(Aabb::EMPTY, |acc, &p| {
            let c = bounds[p as usize].centroid();
            Aabb::surrounding(&acc, &Aabb::from_points(c, c))
        });
        let axis = centroid_bounds.longest_axis();

        prims.sort_unstable_by(|&a, &b| {
            let ca = bounds[a as usize].centroid()[axis];
            let cb = bounds[b as usize].centroid()[axis];
            ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
        });

        let right = prims.split_off(prims.len() / 2);
        BvhNode::Branch {
            left: Box::new(Self::build_range(prims, bounds)),
            right: Box::new(Self::build_range(right, bounds)),
            bbox,
        }
    }

    fn bounds_of(prims: &[u32], bounds: &[Aabb]) -> Aabb {
        prims
            .iter()
            .fold(Aabb::EMPTY, |acc, &p| Aabb::surrounding(&acc, &bounds[p as usize]))
    }

    /// Recompute every node's bounds bottom-up from new primitive bounds.
    /// The tree shape and leaf membership stay as they were.
    pub fn refit(&mut self, bounds: &[Aabb]) -> Aabb {
        match self {
            BvhNode::Empty => Aabb::EMPTY,
            BvhNode::Leaf { prims, bbox } => {
                *bbox = Self::bounds_of(prims, bounds);
                *bbox
            }
            BvhNode::Branch { left, right, bbox } => {
                let l = left.refit(bounds);
                let r = right.refit(bounds);
                *bbox = Aabb::surrounding(&l, &r);
                *bbox
            }
        }
    }

    pub fn bbox(&self) -> Aabb {
        match self {
            BvhNode::Empty => Aabb::EMPTY,
            BvhNode::Leaf { bbox, .. } | BvhNode::Branch { bbox, .. } => *bbox,
        }
    }

    pub fn primitive_count(&self) -> usize {
        match self {
            BvhNode::Empty => 0,
            BvhNode::Leaf { prims, .. } => prims.len(),
            BvhNode::Branch { left, right, .. } => left.primitive_count() + right.primitive_count(),
        }
    }

    /// Closest-hit traversal. `intersect` tests one primitive against the
    /// current interval and returns its hit distance; the interval shrinks
    /// to the closest hit found so far.
    pub fn closest_hit<H, F>(&self, ray: &Ray, ray_t: Interval, intersect: &mut F) -> Option<H>
    where
        F: FnMut(u32, Interval) -> Option<(f32, H)>,
    {
        let mut closest = ray_t.max;
        let mut best = None;
        self.visit(ray, ray_t.min, &mut closest, &mut best, intersect);
        best
    }

    fn visit<H, F>(&self, ray: &Ray, t_min: f32, closest: &mut f32, best: &mut Option<H>, intersect: &mut F)
    where
        F: FnMut(u32, Interval) -> Option<(f32, H)>,
    {
        match self {
            BvhNode::Empty => {}
            BvhNode::Leaf { prims, bbox } => {
                if bbox.hit(ray, Interval::new(t_min, *closest)).is_none() {
                    return;
                }
                for &p in prims {
                    if let Some((t, hit)) = intersect(p, Interval::new(t_min, *closest)) {
                        *closest = t;
                        *best = Some(hit);
                    }
                }
            }
            BvhNode::Branch { left, right, bbox } => {
                if bbox.hit(ray, Interval::new(t_min, *closest)).is_none() {
                    return;
                }
                // Nearer child first so the far one is more likely culled.
                let tl = left.bbox().hit(ray, Interval::new(t_min, *closest));
                let tr = right.bbox().hit(ray, Interval::new(t_min, *closest));
                let (first, second) = match (tl, tr) {
                    (Some(a), Some(b)) if b < a => (right, left),
                    _ => (left, right),
                };
                first.visit(ray, t_min, closest, best, intersect);
                second.visit(ray, t_min, closest, best, intersect);
            }
        }
    }
}
