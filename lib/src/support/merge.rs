//! In-layer merging of influence areas.
//!
//! Two branches merge when a branch drawn at the larger collision radius
//! anywhere in the intersection would already engulf the smaller one: the
//! smaller area is grown by the real-radius delta and intersected with the
//! larger. Batches are merged divide-and-conquer over buckets ordered by a
//! 2D AABB tree, so spatially close areas meet early and each element belongs
//! to exactly one bucket per level.

use crate::clipper::{self, OffsetJoinType};
use crate::error::{CancellationToken, TreeSupportError};
use crate::geometry::{sort_into_box_tree_order, Point};
use crate::support::placement::move_inside_if_outside;
use crate::support::propagation::{safe_offset_inc, safe_union, SupportElementMerging};
use crate::support::settings::{
    AreaIncreaseSettings, SupportElementState, TreeSupportSettings, TINY_AREA_THRESHOLD,
};
use crate::volumes::TreeModelVolumes;
use crate::{scale, Coord};

/// Combine the states of two merged elements.
fn merge_support_element_states(
    first: &SupportElementState,
    second: &SupportElementState,
    next_position: Point,
    layer_idx: usize,
    config: &TreeSupportSettings,
) -> SupportElementState {
    let mut out = SupportElementState {
        next_position,
        layer_idx,
        use_min_xy_dist: first.use_min_xy_dist || second.use_min_xy_dist,
        supports_roof: first.supports_roof || second.supports_roof,
        dont_move_until: first.dont_move_until.max(second.dont_move_until),
        can_use_safe_radius: first.can_use_safe_radius || second.can_use_safe_radius,
        missing_roof_layers: first.missing_roof_layers.min(second.missing_roof_layers),
        skip_ovalisation: false,
        effective_radius_height: first.effective_radius_height.max(second.effective_radius_height),
        distance_to_top: first.distance_to_top.max(second.distance_to_top),
        to_buildplate: first.to_buildplate && second.to_buildplate,
        // Valid because gracious and non-gracious never merge.
        to_model_gracious: first.to_model_gracious && second.to_model_gracious,
        lost: first.lost || second.lost,
        verylost: first.verylost || second.verylost,
        ..Default::default()
    };
    if first.target_height > second.target_height {
        out.target_height = first.target_height;
        out.target_position = first.target_position;
    } else {
        out.target_height = second.target_height;
        out.target_position = second.target_position;
    }

    // The foot flare has to be re-derived: merging a small flared tree into a
    // thicker branch must not make the radius jump.
    out.elephant_foot_increases = 0.0;
    if config.diameter_scale_bp_radius > 0.0 {
        let foot_increase_radius = (config
            .get_collision_radius(second)
            .max(config.get_collision_radius(first))
            - config.get_collision_radius(&out))
        .abs();
        out.elephant_foot_increases = foot_increase_radius as f64
            / (config.branch_radius as f64 * config.diameter_scale_bp_radius);
    }

    out.last_area_increase = AreaIncreaseSettings {
        avoidance_type: first
            .last_area_increase
            .avoidance_type
            .min(second.last_area_increase.avoidance_type),
        increase_speed: first
            .last_area_increase
            .increase_speed
            .min(second.last_area_increase.increase_speed),
        increase_radius: first.last_area_increase.increase_radius
            || second.last_area_increase.increase_radius,
        no_error: first.last_area_increase.no_error || second.last_area_increase.no_error,
        use_min_distance: first.last_area_increase.use_min_distance
            && second.last_area_increase.use_min_distance,
        allow_move: first.last_area_increase.allow_move || second.last_area_increase.allow_move,
    };

    out
}

/// Try to merge `src` into `dst`. On success `dst` holds the merged element
/// and `src` is cleared.
fn merge_influence_areas_two_elements(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    layer_idx: usize,
    dst: &mut SupportElementMerging,
    src: &mut SupportElementMerging,
) -> bool {
    // A gracious and a non-gracious area merging could place the whole
    // subtree on unreliable ground.
    if dst.state.to_model_gracious != src.state.to_model_gracious {
        return false;
    }
    // Mixing xy clearances would break the engulfment assumption below, as a
    // different collision is subtracted from each circle when drawing.
    if dst.state.use_min_xy_dist != src.state.use_min_xy_dist {
        return false;
    }

    let dst_radius_bigger =
        config.get_collision_radius(&dst.state) > config.get_collision_radius(&src.state);
    let (smaller_rad, bigger_rad) = if dst_radius_bigger {
        (&*src, &*dst)
    } else {
        (&*dst, &*src)
    };
    let real_radius_delta =
        (config.get_radius_state(&bigger_rad.state) - config.get_radius_state(&smaller_rad.state)).abs();

    // Cheap reject on bounding boxes; the smaller box is inflated to match
    // the rounded offset the merge check applies.
    if !smaller_rad
        .bbox
        .inflated(real_radius_delta)
        .intersects(&bigger_rad.bbox)
    {
        return false;
    }

    let merging_to_bp = dst.state.to_buildplate && src.state.to_buildplate;
    let mut increased_to_model_radius: Coord = 0;
    if !merging_to_bp {
        if dst.state.to_buildplate != src.state.to_buildplate {
            // Merging a to-build-plate branch into a to-model one; track the
            // real radius the to-model side inherits.
            let rdst = config.get_radius_state(&dst.state);
            let rsrc = config.get_radius_state(&src.state);
            if dst.state.to_buildplate {
                if rsrc < rdst {
                    increased_to_model_radius = src.state.increased_to_model_radius + rdst - rsrc;
                }
            } else if rsrc > rdst {
                increased_to_model_radius = dst.state.increased_to_model_radius + rsrc - rdst;
            }
            if increased_to_model_radius > config.max_to_model_radius_increase {
                return false;
            }
        }
        // Never merge to model before the branches are tall enough to be
        // drawn at all, unless a roof guarantees they will be.
        if !dst.state.supports_roof
            && !src.state.supports_roof
            && (dst.state.distance_to_top.max(src.state.distance_to_top) as usize)
                < config.min_dtt_to_model
        {
            return false;
        }
    }

    // The bigger area's avoidance guarantees placement validity; do not let a
    // safe-radius area inherit an unsafe one.
    if !bigger_rad.state.can_use_safe_radius && smaller_rad.state.can_use_safe_radius {
        return false;
    }

    let use_min_radius = bigger_rad.state.use_min_xy_dist && smaller_rad.state.use_min_xy_dist;
    let smaller_collision_radius = config.get_collision_radius(&smaller_rad.state);
    let collision = volumes.get_collision(smaller_collision_radius, layer_idx - 1, use_min_radius);

    let intersect_small_with_bigger =
        |small: &crate::geometry::ExPolygons, bigger: &crate::geometry::ExPolygons| {
            clipper::intersection(
                &safe_offset_inc(
                    small,
                    real_radius_delta,
                    &collision,
                    // -3 dodges rounding errors on the step size.
                    2 * (config.xy_distance + smaller_collision_radius - 3),
                    0,
                    0,
                ),
                bigger,
            )
        };
    let intersect = intersect_small_with_bigger(
        if merging_to_bp {
            &smaller_rad.areas.to_bp_areas
        } else {
            &smaller_rad.areas.to_model_areas
        },
        if merging_to_bp {
            &bigger_rad.areas.to_bp_areas
        } else {
            &bigger_rad.areas.to_model_areas
        },
    );

    // The overlap must be large enough that it cannot vanish one union later.
    if clipper::area(&intersect) <= TINY_AREA_THRESHOLD {
        return false;
    }
    if clipper::area(&clipper::offset(&intersect, -scale(0.025), OffsetJoinType::Miter))
        <= TINY_AREA_THRESHOLD
    {
        return false;
    }

    // Committed. Pick the next position closest to where the thicker branch
    // was headed, inside the overlap.
    let new_pos = move_inside_if_outside(&intersect, dst.state.next_position);
    let mut new_state =
        merge_support_element_states(&dst.state, &src.state, new_pos, layer_idx - 1, config);
    new_state.increased_to_model_radius = if increased_to_model_radius == 0 {
        dst.state
            .increased_to_model_radius
            .max(src.state.increased_to_model_radius)
    } else {
        increased_to_model_radius
    };

    // Union with the overlap too; rounding sometimes loses it otherwise.
    let influence_areas = safe_union(
        &intersect_small_with_bigger(
            &smaller_rad.areas.influence_areas,
            &bigger_rad.areas.influence_areas,
        ),
        &intersect,
    );
    let to_model_areas = if merging_to_bp && config.support_rests_on_model {
        if new_state.to_model_gracious {
            safe_union(
                &intersect_small_with_bigger(
                    &smaller_rad.areas.to_model_areas,
                    &bigger_rad.areas.to_model_areas,
                ),
                &intersect,
            )
        } else {
            influence_areas.clone()
        }
    } else {
        Vec::new()
    };

    let mut parents = std::mem::take(&mut dst.parents);
    parents.append(&mut src.parents);
    dst.parents = parents;
    dst.state = new_state;
    dst.areas.influence_areas = influence_areas;
    dst.areas.to_bp_areas.clear();
    dst.areas.to_model_areas.clear();
    if merging_to_bp {
        dst.areas.to_bp_areas = intersect;
        if config.support_rests_on_model {
            dst.areas.to_model_areas = to_model_areas;
        }
    } else {
        dst.areas.to_model_areas = intersect;
    }
    dst.set_bbox();

    src.areas.influence_areas.clear();
    src.areas.to_bp_areas.clear();
    src.areas.to_model_areas.clear();
    true
}

/// O(n²) merging inside one bucket: retry every pair until a pass is clean.
fn merge_influence_areas_leaves(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    layer_idx: usize,
    bucket: &mut Vec<SupportElementMerging>,
) {
    let mut i = 0;
    while i + 1 < bucket.len() {
        let mut merged_any = false;
        let mut j = i + 1;
        while j < bucket.len() {
            let (left, right) = bucket.split_at_mut(j);
            if merge_influence_areas_two_elements(volumes, config, layer_idx, &mut left[i], &mut right[0])
            {
                bucket.swap_remove(j);
                merged_any = true;
                break;
            }
            j += 1;
        }
        if !merged_any {
            // This element merged with nothing; it is final for this bucket.
            i += 1;
        }
    }
}

/// Merge the elements of `src` into `dst`. Elements within each set are
/// already mutually non-overlapping; a successful merge re-tries the merged
/// element against the rest of `dst` to cascade.
fn merge_influence_areas_two_sets(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    layer_idx: usize,
    dst: &mut Vec<SupportElementMerging>,
    src: Vec<SupportElementMerging>,
) {
    for mut s in src {
        let mut merged_at: Option<usize> = None;
        for i in 0..dst.len() {
            if merge_influence_areas_two_elements(volumes, config, layer_idx, &mut dst[i], &mut s) {
                merged_at = Some(i);
                break;
            }
        }
        match merged_at {
            None => dst.push(s),
            Some(i) => {
                let mut j = i + 1;
                while j < dst.len() {
                    let (left, right) = dst.split_at_mut(j);
                    if merge_influence_areas_two_elements(
                        volumes,
                        config,
                        layer_idx,
                        &mut left[i],
                        &mut right[0],
                    ) {
                        dst.swap_remove(j);
                    } else {
                        j += 1;
                    }
                }
            }
        }
    }
}

/// Merge all overlapping influence areas of one layer.
pub fn merge_influence_areas(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    layer_idx: usize,
    influence_areas: &mut Vec<SupportElementMerging>,
    cancel: &CancellationToken,
) -> Result<(), TreeSupportError> {
    if influence_areas.len() < 2 {
        return Ok(());
    }

    // Order the elements so each power-of-two span is spatially coherent,
    // then cut them into initial buckets.
    sort_into_box_tree_order(influence_areas.as_mut_slice(), |elem| elem.bbox);
    cancel.check()?;

    let input_size = influence_areas.len();
    let bucket_size = if (input_size + 2) / 4 >= 2 { 4 } else { 2 };
    let mut buckets: Vec<Vec<SupportElementMerging>> = Vec::new();
    {
        let mut drain = influence_areas.drain(..);
        loop {
            let bucket: Vec<_> = drain.by_ref().take(bucket_size).collect();
            if bucket.is_empty() {
                break;
            }
            buckets.push(bucket);
        }
    }

    // First round: O(n²) inside each bucket.
    for bucket in &mut buckets {
        if bucket.len() > 1 {
            merge_influence_areas_leaves(volumes, config, layer_idx, bucket);
        }
        cancel.check()?;
    }

    // Fold buckets pairwise along the tree until one remains.
    while buckets.len() > 1 {
        let mut next: Vec<Vec<SupportElementMerging>> = Vec::with_capacity((buckets.len() + 1) / 2);
        let mut iter = buckets.into_iter();
        while let Some(mut dst) = iter.next() {
            if let Some(src) = iter.next() {
                merge_influence_areas_two_sets(volumes, config, layer_idx, &mut dst, src);
            }
            next.push(dst);
            cancel.check()?;
        }
        buckets = next;
    }

    *influence_areas = buckets.pop().unwrap_or_default();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{BoundingBox, ExPolygon};
    use crate::support::propagation::SupportElementInfluenceAreas;
    use crate::volumes::TreeModelVolumesConfig;

    fn empty_volumes(layers: usize) -> TreeModelVolumes {
        TreeModelVolumes::new(TreeModelVolumesConfig::default(), vec![Vec::new(); layers])
    }

    fn merging_element(
        center: Point,
        half_mm: f64,
        to_buildplate: bool,
        parents: Vec<i32>,
    ) -> SupportElementMerging {
        let area = vec![ExPolygon::rectangle(
            Point::new(center.x - scale(half_mm), center.y - scale(half_mm)),
            Point::new(center.x + scale(half_mm), center.y + scale(half_mm)),
        )];
        let state = SupportElementState {
            layer_idx: 4,
            next_position: center,
            to_buildplate,
            to_model_gracious: true,
            can_use_safe_radius: true,
            distance_to_top: 20,
            ..Default::default()
        };
        let mut elem = SupportElementMerging {
            state,
            parents,
            areas: SupportElementInfluenceAreas {
                influence_areas: area.clone(),
                to_bp_areas: if to_buildplate { area.clone() } else { Vec::new() },
                to_model_areas: area,
            },
            bbox: BoundingBox::new(),
        };
        elem.set_bbox();
        elem
    }

    #[test]
    fn test_merge_two_overlapping() {
        let volumes = empty_volumes(6);
        let config = TreeSupportSettings::default();
        let mut dst = merging_element(Point::zero(), 2.0, true, vec![0]);
        let mut src = merging_element(Point::new_scale(1.0, 0.0), 2.0, true, vec![1]);

        assert!(merge_influence_areas_two_elements(
            &volumes, &config, 5, &mut dst, &mut src
        ));
        assert_eq!(dst.parents, vec![0, 1]);
        assert!(src.areas.influence_areas.is_empty());
        assert!(!dst.areas.to_bp_areas.is_empty());
        assert_eq!(dst.state.layer_idx, 4);
        // The merged next position sits inside the overlap.
        assert!(dst
            .areas
            .to_bp_areas
            .iter()
            .any(|ex| ex.contains_point(&dst.state.next_position)));
    }

    #[test]
    fn test_no_merge_when_disjoint() {
        let volumes = empty_volumes(6);
        let config = TreeSupportSettings::default();
        let mut dst = merging_element(Point::zero(), 1.0, true, vec![0]);
        let mut src = merging_element(Point::new_scale(30.0, 0.0), 1.0, true, vec![1]);
        assert!(!merge_influence_areas_two_elements(
            &volumes, &config, 5, &mut dst, &mut src
        ));
        assert!(!src.areas.influence_areas.is_empty());
    }

    #[test]
    fn test_no_merge_gracious_with_non_gracious() {
        let volumes = empty_volumes(6);
        let config = TreeSupportSettings::default();
        let mut dst = merging_element(Point::zero(), 2.0, true, vec![0]);
        let mut src = merging_element(Point::new_scale(1.0, 0.0), 2.0, true, vec![1]);
        src.state.to_model_gracious = false;
        assert!(!merge_influence_areas_two_elements(
            &volumes, &config, 5, &mut dst, &mut src
        ));
    }

    #[test]
    fn test_no_merge_mixed_xy_distance() {
        let volumes = empty_volumes(6);
        let config = TreeSupportSettings::default();
        let mut dst = merging_element(Point::zero(), 2.0, true, vec![0]);
        let mut src = merging_element(Point::new_scale(1.0, 0.0), 2.0, true, vec![1]);
        src.state.use_min_xy_dist = true;
        assert!(!merge_influence_areas_two_elements(
            &volumes, &config, 5, &mut dst, &mut src
        ));
    }

    #[test]
    fn test_no_merge_short_branches_to_model() {
        // Two to-model branches near the tip must not merge before they are
        // tall enough to be drawn.
        let volumes = empty_volumes(6);
        let config = TreeSupportSettings::default();
        let mut dst = merging_element(Point::zero(), 2.0, false, vec![0]);
        let mut src = merging_element(Point::new_scale(1.0, 0.0), 2.0, false, vec![1]);
        dst.state.distance_to_top = 1;
        src.state.distance_to_top = 1;
        assert!(!merge_influence_areas_two_elements(
            &volumes, &config, 5, &mut dst, &mut src
        ));
        // With a roof above the merge is fine.
        dst.state.supports_roof = true;
        assert!(merge_influence_areas_two_elements(
            &volumes, &config, 5, &mut dst, &mut src
        ));
    }

    #[test]
    fn test_no_merge_unsafe_into_safe() {
        let volumes = empty_volumes(6);
        let config = TreeSupportSettings::default();
        let mut dst = merging_element(Point::zero(), 2.0, true, vec![0]);
        let mut src = merging_element(Point::new_scale(1.0, 0.0), 2.0, true, vec![1]);
        // Make dst the bigger branch and unsafe, src safe.
        dst.state.effective_radius_height = 10;
        dst.state.can_use_safe_radius = false;
        src.state.can_use_safe_radius = true;
        assert!(!merge_influence_areas_two_elements(
            &volumes, &config, 5, &mut dst, &mut src
        ));
    }

    #[test]
    fn test_merged_state_combination() {
        let config = TreeSupportSettings::default();
        let mut first = SupportElementState {
            target_height: 9,
            target_position: Point::new(1, 1),
            to_buildplate: true,
            to_model_gracious: true,
            supports_roof: true,
            dont_move_until: 2,
            distance_to_top: 9,
            effective_radius_height: 5,
            ..Default::default()
        };
        first.use_min_xy_dist = true;
        let second = SupportElementState {
            target_height: 4,
            target_position: Point::new(2, 2),
            to_buildplate: false,
            to_model_gracious: true,
            dont_move_until: 5,
            distance_to_top: 4,
            effective_radius_height: 7,
            can_use_safe_radius: true,
            ..Default::default()
        };
        let merged =
            merge_support_element_states(&first, &second, Point::new(3, 3), 3, &config);
        assert_eq!(merged.layer_idx, 3);
        assert_eq!(merged.next_position, Point::new(3, 3));
        assert_eq!(merged.target_height, 9);
        assert_eq!(merged.target_position, Point::new(1, 1));
        assert!(!merged.to_buildplate); // AND
        assert!(merged.to_model_gracious); // AND
        assert!(merged.supports_roof); // OR
        assert!(merged.can_use_safe_radius); // OR
        assert!(merged.use_min_xy_dist); // OR
        assert_eq!(merged.dont_move_until, 5); // max
        assert_eq!(merged.distance_to_top, 9); // max
        assert_eq!(merged.effective_radius_height, 7); // max
    }

    #[test]
    fn test_batch_merge_shrinks_set() {
        let volumes = empty_volumes(6);
        let config = TreeSupportSettings::default();
        // A cluster of nine overlapping areas plus one far away.
        let mut elements: Vec<SupportElementMerging> = (0..9)
            .map(|i| {
                merging_element(
                    Point::new_scale(0.5 * i as f64, 0.0),
                    2.0,
                    true,
                    vec![i],
                )
            })
            .collect();
        elements.push(merging_element(Point::new_scale(100.0, 0.0), 2.0, true, vec![9]));
        let count_before = elements.len();

        merge_influence_areas(
            &volumes,
            &config,
            5,
            &mut elements,
            &CancellationToken::new(),
        )
        .unwrap();

        assert!(elements.len() < count_before);
        assert_eq!(elements.len(), 2, "cluster and the lone area remain");
        // Every original parent is still represented exactly once.
        let mut parents: Vec<i32> = elements.iter().flat_map(|e| e.parents.clone()).collect();
        parents.sort_unstable();
        assert_eq!(parents, (0..10).collect::<Vec<_>>());
    }
}
