//! Collision, avoidance, placeable-area and wall-restriction volumes.
//!
//! [`TreeModelVolumes`] answers the queries the support pipeline needs:
//! "where can a branch of radius `r` be at layer `L`?" Results are cached per
//! quantized radius band and layer behind read-write locks, so repeated
//! queries from the propagation loop are cheap.
//!
//! Definitions:
//!
//! - **Collision**: where a branch center of radius `r` would touch the model
//!   (model outline dilated by `r` plus the XY clearance), plus blocker areas.
//! - **Avoidance**: where a branch center must not be if it is ever to escape
//!   downward. Computed bottom-up: the avoidance of the layer below, eroded
//!   by the per-layer movement allowance, united with the collision of the
//!   current layer. The to-model variant first carves out the areas where the
//!   branch may simply rest on the model.
//! - **Placeable areas**: model top surface where a branch tip may land.
//! - **Wall restriction**: the part of the current layer's model outline that
//!   overlaps the collision below; moving an influence area through it would
//!   teleport the branch through a wall.

use crate::clipper::{self, OffsetJoinType};
use crate::geometry::{BoundingBox, ExPolygon, ExPolygons, Point, Polygon};
use crate::{div_ceil_coord, scale, Coord};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Radius band width for cache quantization below the exponential threshold.
pub const COLLISION_RESOLUTION: Coord = 500_000; // 0.5 mm

/// Above this radius, bands grow exponentially.
pub const EXPONENTIAL_THRESHOLD: Coord = 3_000_000; // 3 mm

/// Growth factor of the exponential bands.
pub const EXPONENTIAL_FACTOR: f64 = 1.5;

/// Avoidance flavor. `Slow` assumes the branch moves at the slow speed,
/// `Fast` at the full speed, `FastSafe` additionally refuses to route through
/// holes a grown branch could not escape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum AvoidanceType {
    Slow,
    FastSafe,
    #[default]
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    radius: Coord,
    layer_idx: usize,
    min_xy: bool,
}

/// Polygon cache keyed by (radius band, layer, xy-distance flavor).
#[derive(Debug, Default)]
struct VolumeCache {
    data: RwLock<HashMap<CacheKey, Arc<ExPolygons>>>,
}

impl VolumeCache {
    fn get(&self, key: &CacheKey) -> Option<Arc<ExPolygons>> {
        self.data.read().unwrap().get(key).cloned()
    }

    fn insert(&self, key: CacheKey, value: ExPolygons) -> Arc<ExPolygons> {
        let value = Arc::new(value);
        self.data.write().unwrap().insert(key, value.clone());
        value
    }
}

/// Configuration for volume computation.
#[derive(Debug, Clone)]
pub struct TreeModelVolumesConfig {
    /// Maximum horizontal movement per layer at full speed.
    pub max_move: Coord,
    /// Maximum horizontal movement per layer at slow speed.
    pub max_move_slow: Coord,
    /// XY clearance between branch surface and model.
    pub xy_distance: Coord,
    /// Tighter XY clearance used directly below overhangs.
    pub xy_min_distance: Coord,
    /// Whether branches may rest on the model at all.
    pub support_rests_on_model: bool,
    /// Smallest branch (tip) radius; used by precalculation.
    pub min_radius: Coord,
    /// Simplification tolerance applied to computed volumes.
    pub min_resolution: Coord,
    /// Printable build area; placeable area on layer 0 and the outer wall
    /// branches must stay inside.
    pub build_area: BoundingBox,
}

impl Default for TreeModelVolumesConfig {
    fn default() -> Self {
        Self {
            max_move: scale(1.0),
            max_move_slow: scale(0.5),
            xy_distance: scale(0.8),
            xy_min_distance: scale(0.4),
            support_rests_on_model: true,
            min_radius: scale(0.4),
            min_resolution: scale(0.025),
            build_area: BoundingBox::from_points(&[
                Point::new_scale(-150.0, -150.0),
                Point::new_scale(150.0, 150.0),
            ]),
        }
    }
}

/// Precomputed per-layer, per-radius forbidden and allowed regions.
#[derive(Debug)]
pub struct TreeModelVolumes {
    config: TreeModelVolumesConfig,
    /// Sliced model outlines, bottom layer first.
    layer_outlines: Vec<ExPolygons>,
    /// Blocker polygons per layer; always forbidden.
    anti_overhang: Vec<ExPolygons>,

    collision_cache: VolumeCache,
    collision_holefree_cache: VolumeCache,
    avoidance_cache_slow: VolumeCache,
    avoidance_cache_fast: VolumeCache,
    avoidance_cache_fast_safe: VolumeCache,
    avoidance_cache_slow_to_model: VolumeCache,
    avoidance_cache_fast_to_model: VolumeCache,
    avoidance_cache_fast_safe_to_model: VolumeCache,
    placeable_cache: VolumeCache,
    wall_restriction_cache: VolumeCache,
}

impl TreeModelVolumes {
    pub fn new(config: TreeModelVolumesConfig, layer_outlines: Vec<ExPolygons>) -> Self {
        let layers = layer_outlines.len();
        Self {
            config,
            layer_outlines,
            anti_overhang: vec![Vec::new(); layers],
            collision_cache: VolumeCache::default(),
            collision_holefree_cache: VolumeCache::default(),
            avoidance_cache_slow: VolumeCache::default(),
            avoidance_cache_fast: VolumeCache::default(),
            avoidance_cache_fast_safe: VolumeCache::default(),
            avoidance_cache_slow_to_model: VolumeCache::default(),
            avoidance_cache_fast_to_model: VolumeCache::default(),
            avoidance_cache_fast_safe_to_model: VolumeCache::default(),
            placeable_cache: VolumeCache::default(),
            wall_restriction_cache: VolumeCache::default(),
        }
    }

    /// Blocker areas per layer. They join every collision result.
    pub fn set_anti_overhang(&mut self, anti_overhang: Vec<ExPolygons>) {
        self.anti_overhang = anti_overhang;
        self.anti_overhang.resize(self.layer_outlines.len(), Vec::new());
    }

    pub fn config(&self) -> &TreeModelVolumesConfig {
        &self.config
    }

    pub fn layer_count(&self) -> usize {
        self.layer_outlines.len()
    }

    pub fn layer_outlines(&self, layer_idx: usize) -> &[ExPolygon] {
        self.layer_outlines
            .get(layer_idx)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Quantize a radius up to its cache band.
    pub fn ceil_radius(&self, radius: Coord) -> Coord {
        if radius <= 0 {
            return 0;
        }
        if radius <= EXPONENTIAL_THRESHOLD {
            div_ceil_coord(radius, COLLISION_RESOLUTION) * COLLISION_RESOLUTION
        } else {
            let mut band = EXPONENTIAL_THRESHOLD as f64;
            while (band as Coord) < radius {
                band *= EXPONENTIAL_FACTOR;
            }
            band as Coord
        }
    }

    /// The smallest band at or above `radius`, stepping to the next band when
    /// `radius` already sits exactly on one.
    pub fn radius_next_ceil(&self, radius: Coord) -> Coord {
        let ceiled = self.ceil_radius(radius);
        if ceiled > radius {
            ceiled
        } else if ceiled < EXPONENTIAL_THRESHOLD {
            ceiled + COLLISION_RESOLUTION
        } else {
            (ceiled as f64 * EXPONENTIAL_FACTOR) as Coord
        }
    }

    /// Collision area for a branch of radius `radius` at `layer_idx`.
    pub fn get_collision(&self, radius: Coord, layer_idx: usize, min_xy: bool) -> Arc<ExPolygons> {
        let key = CacheKey {
            radius: self.ceil_radius(radius),
            layer_idx,
            min_xy,
        };
        if let Some(cached) = self.collision_cache.get(&key) {
            return cached;
        }
        let result = self.calculate_collision(key.radius, layer_idx, min_xy);
        self.collision_cache.insert(key, result)
    }

    /// Collision with holes filled: the hole-escape hazard mask for FastSafe.
    pub fn get_collision_holefree(
        &self,
        radius: Coord,
        layer_idx: usize,
        min_xy: bool,
    ) -> Arc<ExPolygons> {
        let key = CacheKey {
            radius: self.ceil_radius(radius),
            layer_idx,
            min_xy,
        };
        if let Some(cached) = self.collision_holefree_cache.get(&key) {
            return cached;
        }
        let collision = self.get_collision(radius, layer_idx, min_xy);
        let filled: ExPolygons = collision
            .iter()
            .map(|ex| ExPolygon::new(ex.contour.clone()))
            .collect();
        let result = clipper::union_all(&filled);
        self.collision_holefree_cache.insert(key, result)
    }

    /// Avoidance area for a branch of radius `radius` at `layer_idx`.
    pub fn get_avoidance(
        &self,
        radius: Coord,
        layer_idx: usize,
        avoidance_type: AvoidanceType,
        to_model: bool,
        min_xy: bool,
    ) -> Arc<ExPolygons> {
        let cache = self.avoidance_cache(avoidance_type, to_model);
        let radius = self.ceil_radius(radius);
        let key = CacheKey {
            radius,
            layer_idx,
            min_xy,
        };
        if let Some(cached) = cache.get(&key) {
            return cached;
        }
        // Computed bottom-up so the recurrence only ever looks one layer down.
        // Fill the cache from the lowest missing layer to the requested one.
        let mut start = layer_idx;
        while start > 0 {
            let below = CacheKey {
                radius,
                layer_idx: start - 1,
                min_xy,
            };
            if cache.get(&below).is_some() {
                break;
            }
            start -= 1;
        }
        let mut result = Arc::new(Vec::new());
        for idx in start..=layer_idx {
            let key_here = CacheKey {
                radius,
                layer_idx: idx,
                min_xy,
            };
            let value = self.calculate_avoidance(radius, idx, avoidance_type, to_model, min_xy);
            result = cache.insert(key_here, value);
        }
        result
    }

    /// Model-top regions where a branch of radius `radius` may land.
    pub fn get_placeable_areas(&self, radius: Coord, layer_idx: usize) -> Arc<ExPolygons> {
        let key = CacheKey {
            radius: self.ceil_radius(radius),
            layer_idx,
            min_xy: false,
        };
        if let Some(cached) = self.placeable_cache.get(&key) {
            return cached;
        }
        let result = self.calculate_placeable(key.radius, layer_idx);
        self.placeable_cache.insert(key, result)
    }

    /// Mask preventing an influence area from crossing a model wall between
    /// `layer_idx` and the layer below.
    pub fn get_wall_restriction(
        &self,
        radius: Coord,
        layer_idx: usize,
        min_xy: bool,
    ) -> Arc<ExPolygons> {
        let key = CacheKey {
            radius: self.ceil_radius(radius),
            layer_idx,
            min_xy,
        };
        if let Some(cached) = self.wall_restriction_cache.get(&key) {
            return cached;
        }
        let result = if layer_idx == 0 {
            Vec::new()
        } else {
            clipper::intersection(
                &self.get_collision(0, layer_idx, min_xy),
                &self.get_collision(key.radius, layer_idx - 1, min_xy),
            )
        };
        self.wall_restriction_cache.insert(key, result)
    }

    /// Warm the caches every propagation layer will need.
    pub fn precalculate(&self, max_layer: usize) {
        let radii = [0, self.config.min_radius];
        for radius in radii {
            for layer_idx in 0..=max_layer.min(self.layer_count().saturating_sub(1)) {
                let _ = self.get_collision(radius, layer_idx, false);
                let _ = self.get_avoidance(radius, layer_idx, AvoidanceType::Fast, false, false);
                if self.config.support_rests_on_model {
                    let _ = self.get_avoidance(radius, layer_idx, AvoidanceType::Fast, true, false);
                }
            }
        }
    }

    fn avoidance_cache(&self, avoidance_type: AvoidanceType, to_model: bool) -> &VolumeCache {
        match (avoidance_type, to_model) {
            (AvoidanceType::Slow, false) => &self.avoidance_cache_slow,
            (AvoidanceType::Fast, false) => &self.avoidance_cache_fast,
            (AvoidanceType::FastSafe, false) => &self.avoidance_cache_fast_safe,
            (AvoidanceType::Slow, true) => &self.avoidance_cache_slow_to_model,
            (AvoidanceType::Fast, true) => &self.avoidance_cache_fast_to_model,
            (AvoidanceType::FastSafe, true) => &self.avoidance_cache_fast_safe_to_model,
        }
    }

    fn calculate_collision(&self, radius: Coord, layer_idx: usize, min_xy: bool) -> ExPolygons {
        if layer_idx >= self.layer_outlines.len() {
            return Vec::new();
        }
        let xy = if min_xy {
            self.config.xy_min_distance
        } else {
            self.config.xy_distance
        };
        let mut collision = clipper::offset(
            &self.layer_outlines[layer_idx],
            radius + xy,
            OffsetJoinType::Round,
        );
        if !self.anti_overhang[layer_idx].is_empty() {
            let blockers = clipper::offset(
                &self.anti_overhang[layer_idx],
                radius,
                OffsetJoinType::Round,
            );
            collision = clipper::union(&collision, &blockers);
        }
        clipper::simplify(&collision, self.config.min_resolution)
    }

    fn calculate_avoidance(
        &self,
        radius: Coord,
        layer_idx: usize,
        avoidance_type: AvoidanceType,
        to_model: bool,
        min_xy: bool,
    ) -> ExPolygons {
        let collision = if avoidance_type == AvoidanceType::FastSafe {
            self.get_collision_holefree(radius, layer_idx, min_xy)
        } else {
            self.get_collision(radius, layer_idx, min_xy)
        };
        let mut result = if layer_idx == 0 {
            (*collision).clone()
        } else {
            let below = self.get_avoidance(radius, layer_idx - 1, avoidance_type, to_model, min_xy);
            let max_move = match avoidance_type {
                AvoidanceType::Slow => self.config.max_move_slow,
                _ => self.config.max_move,
            };
            let propagated = clipper::offset(&below, -max_move, OffsetJoinType::Round);
            clipper::union(&collision, &propagated)
        };
        if to_model {
            // A branch over a placeable area is not trapped; it can land.
            // Collision stays forbidden even where it overlaps a landing.
            result = clipper::union(
                &clipper::difference(&result, &self.get_placeable_areas(radius, layer_idx)),
                &collision,
            );
        }
        clipper::simplify(&result, self.config.min_resolution)
    }

    fn calculate_placeable(&self, radius: Coord, layer_idx: usize) -> ExPolygons {
        if layer_idx == 0 {
            // The build plate, wherever the model is not.
            let bed = self.config.build_area;
            if !bed.is_defined() {
                return Vec::new();
            }
            let bed = vec![ExPolygon::new(Polygon::rectangle(bed.min, bed.max))];
            return clipper::difference(&bed, &self.get_collision(radius, 0, false));
        }
        if layer_idx >= self.layer_outlines.len() {
            return Vec::new();
        }
        // Top surface of the model below this layer, shrunk so the whole
        // branch foot fits.
        let below = &self.layer_outlines[layer_idx - 1];
        let here = &self.layer_outlines[layer_idx];
        let exposed = clipper::difference(below, here);
        clipper::offset(&exposed, -radius, OffsetJoinType::Round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipper::area;
    use crate::geometry::Point;

    fn square_outline(size_mm: f64) -> ExPolygons {
        let half = scale(size_mm / 2.0);
        vec![ExPolygon::rectangle(
            Point::new(-half, -half),
            Point::new(half, half),
        )]
    }

    fn volumes_with_tower(layers: usize, size_mm: f64) -> TreeModelVolumes {
        TreeModelVolumes::new(
            TreeModelVolumesConfig::default(),
            vec![square_outline(size_mm); layers],
        )
    }

    #[test]
    fn test_ceil_radius_banding() {
        let volumes = volumes_with_tower(1, 10.0);
        assert_eq!(volumes.ceil_radius(0), 0);
        assert_eq!(volumes.ceil_radius(1), COLLISION_RESOLUTION);
        assert_eq!(volumes.ceil_radius(COLLISION_RESOLUTION), COLLISION_RESOLUTION);
        assert_eq!(
            volumes.ceil_radius(COLLISION_RESOLUTION + 1),
            2 * COLLISION_RESOLUTION
        );
        // Exponential territory grows by the factor.
        let above = volumes.ceil_radius(EXPONENTIAL_THRESHOLD + 1);
        assert!(above > EXPONENTIAL_THRESHOLD);
    }

    #[test]
    fn test_radius_next_ceil_increases() {
        let volumes = volumes_with_tower(1, 10.0);
        let r = scale(0.7);
        assert!(volumes.radius_next_ceil(r) >= volumes.ceil_radius(r));
    }

    #[test]
    fn test_collision_grows_with_radius() {
        let volumes = volumes_with_tower(3, 10.0);
        let small = volumes.get_collision(0, 1, false);
        let big = volumes.get_collision(scale(2.0), 1, false);
        assert!(area(&big) > area(&small));
        // min_xy variant is tighter.
        let tight = volumes.get_collision(0, 1, true);
        assert!(area(&tight) < area(&small));
    }

    #[test]
    fn test_collision_cached() {
        let volumes = volumes_with_tower(2, 10.0);
        let a = volumes.get_collision(scale(1.0), 1, false);
        let b = volumes.get_collision(scale(1.0), 1, false);
        assert!(Arc::ptr_eq(&a, &b));
        // Same band, same cache entry.
        let c = volumes.get_collision(scale(1.0) - 1, 1, false);
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_avoidance_contains_collision() {
        let volumes = volumes_with_tower(8, 10.0);
        let layer = 5;
        let collision = volumes.get_collision(scale(1.0), layer, false);
        let avoidance = volumes.get_avoidance(scale(1.0), layer, AvoidanceType::Fast, false, false);
        // Avoidance is a superset of collision: subtracting it leaves nothing.
        let leftover = clipper::difference(&collision, &avoidance);
        assert!(area(&leftover) < 1e3);
    }

    #[test]
    fn test_slow_avoidance_no_smaller_than_fast() {
        let volumes = volumes_with_tower(8, 10.0);
        let fast = volumes.get_avoidance(scale(1.0), 6, AvoidanceType::Fast, false, false);
        let slow = volumes.get_avoidance(scale(1.0), 6, AvoidanceType::Slow, false, false);
        assert!(area(&slow) >= area(&fast) - 1e3);
    }

    #[test]
    fn test_placeable_on_step() {
        // A wide base with a narrow tower: the step is placeable above layer 2.
        let mut outlines = vec![square_outline(30.0), square_outline(30.0), square_outline(30.0)];
        outlines.extend(vec![square_outline(10.0); 3]);
        let volumes = TreeModelVolumes::new(TreeModelVolumesConfig::default(), outlines);
        let placeable = volumes.get_placeable_areas(scale(0.4), 3);
        assert!(area(&placeable) > 0.0);
        // No step between identical layers.
        let none = volumes.get_placeable_areas(scale(0.4), 2);
        assert!(area(&none) < 1e3);
    }

    #[test]
    fn test_placeable_layer0_is_bed() {
        let volumes = volumes_with_tower(2, 10.0);
        let bed = volumes.get_placeable_areas(scale(1.0), 0);
        assert_eq!(bed.len(), 1);
    }

    #[test]
    fn test_wall_restriction() {
        let volumes = volumes_with_tower(4, 10.0);
        assert!(volumes.get_wall_restriction(scale(0.4), 0, false).is_empty());
        let restriction = volumes.get_wall_restriction(scale(0.4), 2, false);
        // Identical stacked layers: the restriction is the overlap, non-empty.
        assert!(area(&restriction) > 0.0);
    }

    #[test]
    fn test_anti_overhang_joins_collision() {
        let plain = volumes_with_tower(2, 10.0);
        let before = area(&plain.get_collision(0, 1, false));

        let mut blocked = volumes_with_tower(2, 10.0);
        blocked.set_anti_overhang(vec![
            Vec::new(),
            vec![ExPolygon::rectangle(
                Point::new_scale(20.0, 20.0),
                Point::new_scale(30.0, 30.0),
            )],
        ]);
        let after = area(&blocked.get_collision(0, 1, false));
        assert!(after > before);
    }
}
