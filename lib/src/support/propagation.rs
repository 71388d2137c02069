//! Influence-area propagation, one layer down at a time.
//!
//! For every element on layer `L` the propagation computes the influence area
//! of its successor on `L-1`: the parent's area grown by the allowed movement
//! distance under the wall restriction, minus the avoidance appropriate for
//! where the branch is headed. A prioritized list of
//! [`AreaIncreaseSettings`] is tried per element; the first one that leaves a
//! non-trivial area wins. If everything fails, an explicit error strategy
//! over-offsets through collisions so the branch survives visibly rather than
//! vanishing.

use crate::clipper::{self, OffsetJoinType};
use crate::error::{CancellationToken, TreeSupportError};
use crate::geometry::{BoundingBox, ExPolygons, Polyline};
use crate::support::merge::merge_influence_areas;
use crate::support::settings::{
    AreaIncreaseSettings, SupportElement, SupportElementState, SupportElements,
    TreeSupportSettings, TINY_AREA_THRESHOLD,
};
use crate::volumes::{AvoidanceType, TreeModelVolumes};
use crate::{div_ceil_coord, scale, Coord, CoordF, SCALED_EPSILON};

/// Union that never destroys a non-empty input.
///
/// Thin, line-like influence areas can collapse to nothing under a plain
/// union because of rounding. When that happens the inputs are retried as
/// polylines widened by 2 µm.
pub fn safe_union(first: &ExPolygons, second: &ExPolygons) -> ExPolygons {
    if first.is_empty() && second.is_empty() {
        return Vec::new();
    }
    let result = clipper::union(first, second);
    if !result.is_empty() {
        return result;
    }
    let mut polylines: Vec<Polyline> = Vec::new();
    for ex in first.iter().chain(second.iter()) {
        polylines.push(ex.contour.to_closed_polyline());
        for hole in &ex.holes {
            polylines.push(hole.to_closed_polyline());
        }
    }
    clipper::widen_polylines(&polylines, scale(0.002))
}

/// Grow `me` by `distance` in rounded steps of `safe_step_size`, subtracting
/// `collision` between steps so the result cannot lag through an obstacle.
///
/// The last `last_step_offset_without_check` of the distance is grown without
/// subtraction; `min_amount_offset` forces a minimum number of steps so
/// repeated round offsets keep small areas precise.
pub fn safe_offset_inc(
    me: &ExPolygons,
    distance: Coord,
    collision: &ExPolygons,
    safe_step_size: Coord,
    last_step_offset_without_check: Coord,
    min_amount_offset: usize,
) -> ExPolygons {
    let mut do_final_difference = last_step_offset_without_check == 0;
    let mut ret = safe_union(me, &Vec::new());
    if distance == 0 {
        return if do_final_difference {
            clipper::difference(&ret, collision)
        } else {
            clipper::union_all(&ret)
        };
    }
    if safe_step_size < 0 || last_step_offset_without_check < 0 {
        return if do_final_difference {
            clipper::difference(&ret, collision)
        } else {
            clipper::union_all(&ret)
        };
    }

    let mut step_size = safe_step_size.max(1);
    let mut steps: Coord = if distance > last_step_offset_without_check {
        (distance - last_step_offset_without_check) / step_size
    } else {
        0
    };
    if distance - steps * step_size > last_step_offset_without_check {
        if (steps + 1) * step_size <= distance {
            // Happens when the unchecked tail is at least one step wide.
            steps += 1;
        } else {
            do_final_difference = true;
        }
    }
    let partial_step = (distance < last_step_offset_without_check || distance % step_size != 0)
        as Coord;
    if steps + partial_step < min_amount_offset as Coord && min_amount_offset > 1 {
        // Reduce the step size so the area is offset often enough.
        step_size = (distance / min_amount_offset as Coord).max(1);
        if step_size >= safe_step_size {
            step_size = safe_step_size.max(1);
            steps = min_amount_offset as Coord;
        } else {
            steps = distance / step_size;
        }
    }

    for i in 0..steps {
        ret = clipper::difference(
            &clipper::offset(&ret, step_size, OffsetJoinType::Round),
            collision,
        );
        // Round joins pile up vertices fast; trim them periodically.
        if i % 10 == 7 {
            ret = clipper::simplify(&ret, scale(0.015));
        }
    }
    let last_offset = distance - steps * step_size;
    if last_offset > SCALED_EPSILON {
        ret = clipper::offset(&ret, last_offset, OffsetJoinType::Round);
    }
    ret = clipper::simplify(&ret, scale(0.015));

    if do_final_difference {
        ret = clipper::difference(&ret, collision);
    }
    clipper::union_all(&ret)
}

/// The three polygon sets a propagated element carries into merging.
#[derive(Debug, Clone, Default)]
pub struct SupportElementInfluenceAreas {
    /// Full influence area, avoidance ignored.
    pub influence_areas: ExPolygons,
    /// Subset that can still reach the build plate.
    pub to_bp_areas: ExPolygons,
    /// Subset that may stay on the model.
    pub to_model_areas: ExPolygons,
}

/// A propagated element awaiting merging into the layer below.
#[derive(Debug, Clone)]
pub struct SupportElementMerging {
    pub state: SupportElementState,
    /// Elements in the layer above that this element supports.
    pub parents: Vec<i32>,
    pub areas: SupportElementInfluenceAreas,
    pub bbox: BoundingBox,
}

impl SupportElementMerging {
    pub fn set_bbox(&mut self) {
        let mut bbox = BoundingBox::new();
        for ex in self
            .areas
            .influence_areas
            .iter()
            .chain(self.areas.to_bp_areas.iter())
            .chain(self.areas.to_model_areas.iter())
        {
            bbox.merge(&ex.bounding_box());
        }
        self.bbox = bbox.inflated(SCALED_EPSILON);
    }
}

/// Outcome of one strategy attempt for one element.
struct SingleAreaResult {
    state: SupportElementState,
    to_bp_data: ExPolygons,
    to_model_data: ExPolygons,
    increased: ExPolygons,
}

/// Evaluate one [`AreaIncreaseSettings`] for `parent`, producing the state
/// and area of its successor on `layer_idx - 1` if the attempt is viable.
#[allow(clippy::too_many_arguments)]
fn increase_single_area(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    settings: &AreaIncreaseSettings,
    layer_idx: usize,
    parent: &SupportElement,
    relevant_offset: &ExPolygons,
    overspeed: Coord,
    mergelayer: bool,
) -> Option<SingleAreaResult> {
    let mut current_elem = parent.state.propagate_down();
    if settings.increase_radius {
        current_elem.effective_radius_height += 1;
    }
    let radius = std::cell::Cell::new(config.get_collision_radius(&current_elem));

    let mut increased: ExPolygons;
    if settings.allow_move {
        increased = relevant_offset.clone();
        if overspeed > 0 {
            let safe_movement_distance = if current_elem.use_min_xy_dist {
                config.xy_min_distance
            } else {
                config.xy_distance
            } + if config.z_distance_top_layers.min(config.z_distance_bottom_layers) > 0 {
                config.min_feature_size
            } else {
                0
            };
            // Conform to the wall restriction only; collision and avoidance
            // are subtracted below, hence the large unchecked tail.
            increased = safe_offset_inc(
                &increased,
                overspeed,
                &volumes.get_wall_restriction(
                    config.get_collision_radius(&parent.state),
                    layer_idx,
                    parent.state.use_min_xy_dist,
                ),
                safe_movement_distance,
                safe_movement_distance + radius.get(),
                1,
            );
        }
        if settings.no_error {
            // Round offsets explode the vertex count; this simplify carries
            // most of the propagation cost otherwise.
            increased = clipper::simplify(&increased, scale(0.025));
        }
    } else {
        // No movement is offset(0): keep the parent area.
        increased = parent.influence_area.clone();
    }

    let mut to_bp_data: ExPolygons = Vec::new();
    let mut to_model_data: ExPolygons = Vec::new();

    if mergelayer || current_elem.to_buildplate {
        to_bp_data = safe_union(
            &clipper::difference(
                &increased,
                &volumes.get_avoidance(
                    radius.get(),
                    layer_idx - 1,
                    settings.avoidance_type,
                    false,
                    settings.use_min_distance,
                ),
            ),
            &Vec::new(),
        );
        if !current_elem.to_buildplate && clipper::area(&to_bp_data) > TINY_AREA_THRESHOLD {
            // A merge can untaint a subtree that was marked as unable to
            // reach the plate.
            current_elem.to_buildplate = true;
        }
    }
    if config.support_rests_on_model {
        if mergelayer || current_elem.to_model_gracious {
            to_model_data = safe_union(
                &clipper::difference(
                    &increased,
                    &volumes.get_avoidance(
                        radius.get(),
                        layer_idx - 1,
                        settings.avoidance_type,
                        true,
                        settings.use_min_distance,
                    ),
                ),
                &Vec::new(),
            );
        }
        if !current_elem.to_model_gracious {
            if mergelayer && clipper::area(&to_model_data) >= TINY_AREA_THRESHOLD {
                current_elem.to_model_gracious = true;
            } else {
                to_model_data = safe_union(
                    &clipper::difference(
                        &increased,
                        &volumes.get_collision(radius.get(), layer_idx - 1, settings.use_min_distance),
                    ),
                    &Vec::new(),
                );
            }
        }
    }

    let check_area = |to_bp: &ExPolygons, to_model: &ExPolygons| -> CoordF {
        if current_elem.to_buildplate {
            clipper::area(to_bp)
        } else {
            clipper::area(to_model)
        }
    };

    if settings.increase_radius && check_area(&to_bp_data, &to_model_data) > TINY_AREA_THRESHOLD {
        let valid_with_radius = |next_radius: Coord| -> bool {
            if volumes.ceil_radius(next_radius) <= volumes.ceil_radius(radius.get()) {
                return true;
            }
            let check = if current_elem.to_buildplate {
                clipper::difference(
                    &increased,
                    &volumes.get_avoidance(
                        next_radius,
                        layer_idx - 1,
                        settings.avoidance_type,
                        false,
                        settings.use_min_distance,
                    ),
                )
            } else if config.support_rests_on_model {
                clipper::difference(
                    &increased,
                    &if current_elem.to_model_gracious {
                        volumes.get_avoidance(
                            next_radius,
                            layer_idx - 1,
                            settings.avoidance_type,
                            true,
                            settings.use_min_distance,
                        )
                    } else {
                        volumes.get_collision(next_radius, layer_idx - 1, settings.use_min_distance)
                    },
                )
            } else {
                Vec::new()
            };
            clipper::area(&check) > TINY_AREA_THRESHOLD
        };
        let ceil_radius_before = volumes.ceil_radius(radius.get());

        if config.get_collision_radius(&current_elem) < config.increase_radius_until_radius
            && config.get_collision_radius(&current_elem) < config.get_radius_state(&current_elem)
        {
            let target_radius = config
                .get_radius_state(&current_elem)
                .min(config.increase_radius_until_radius);
            let mut current_ceil_radius = volumes.radius_next_ceil(radius.get());
            while current_ceil_radius < target_radius
                && valid_with_radius(volumes.radius_next_ceil(current_ceil_radius + 1))
            {
                current_ceil_radius = volumes.radius_next_ceil(current_ceil_radius + 1);
            }
            let mut resulting_eff_dtt = current_elem.effective_radius_height;
            while (resulting_eff_dtt + 1) < current_elem.distance_to_top
                && config.get_radius(
                    resulting_eff_dtt as usize + 1,
                    current_elem.elephant_foot_increases,
                ) <= current_ceil_radius
                && config.get_radius(
                    resulting_eff_dtt as usize + 1,
                    current_elem.elephant_foot_increases,
                ) <= config.get_radius_state(&current_elem)
            {
                resulting_eff_dtt += 1;
            }
            current_elem.effective_radius_height = resulting_eff_dtt;
        }
        radius.set(config.get_collision_radius(&current_elem));

        // Foot flare near the build plate.
        let foot_radius_increase =
            (config.branch_radius as f64 * config.diameter_scale_bp_radius) as Coord;
        if foot_radius_increase > 0 && current_elem.to_buildplate {
            let planned_foot_increase = (1.0_f64).min(
                (config.recommended_min_radius(layer_idx - 1)
                    - config.get_radius_state(&current_elem)) as f64
                    / foot_radius_increase as f64,
            );
            if planned_foot_increase > 0.0
                && config.get_radius_state(&current_elem) >= config.branch_radius
                && config.get_radius_state(&current_elem) >= config.increase_radius_until_radius
                && valid_with_radius(config.get_radius(
                    current_elem.effective_radius_height as usize,
                    current_elem.elephant_foot_increases + planned_foot_increase,
                ))
            {
                current_elem.elephant_foot_increases += planned_foot_increase;
                radius.set(config.get_collision_radius(&current_elem));
            }
        }

        if ceil_radius_before != volumes.ceil_radius(radius.get()) {
            // The radius grew a band; catch the areas up.
            if current_elem.to_buildplate {
                to_bp_data = safe_union(
                    &clipper::difference(
                        &increased,
                        &volumes.get_avoidance(
                            radius.get(),
                            layer_idx - 1,
                            settings.avoidance_type,
                            false,
                            settings.use_min_distance,
                        ),
                    ),
                    &Vec::new(),
                );
            }
            if config.support_rests_on_model && (!current_elem.to_buildplate || mergelayer) {
                to_model_data = safe_union(
                    &clipper::difference(
                        &increased,
                        &if current_elem.to_model_gracious {
                            volumes.get_avoidance(
                                radius.get(),
                                layer_idx - 1,
                                settings.avoidance_type,
                                true,
                                settings.use_min_distance,
                            )
                        } else {
                            volumes.get_collision(
                                radius.get(),
                                layer_idx - 1,
                                settings.use_min_distance,
                            )
                        },
                    ),
                    &Vec::new(),
                );
            }
        }
    }

    if check_area(&to_bp_data, &to_model_data) > TINY_AREA_THRESHOLD {
        Some(SingleAreaResult {
            state: current_elem,
            to_bp_data,
            to_model_data,
            increased,
        })
    } else {
        None
    }
}

/// Build the prioritized strategy list for one element.
fn build_order(
    config: &TreeSupportSettings,
    elem: &SupportElementState,
    parent: &SupportElement,
    volumes: &TreeModelVolumes,
    layer_idx: usize,
    mergelayer: bool,
    slow_speed: Coord,
    fast_speed: Coord,
) -> Vec<AreaIncreaseSettings> {
    let mut order: Vec<AreaIncreaseSettings> = Vec::new();
    let mut insert = |settings: AreaIncreaseSettings, back: bool, order: &mut Vec<_>| {
        if !order.contains(&settings) {
            if back {
                order.push(settings);
            } else {
                order.insert(0, settings);
            }
        }
    };
    let setting = |avoidance_type, increase_speed, increase_radius, no_error, use_min, allow_move| {
        AreaIncreaseSettings {
            avoidance_type,
            increase_speed,
            increase_radius,
            no_error,
            use_min_distance: use_min,
            allow_move,
        }
    };

    // Warm start: the avoidance that worked for the parent is a good bet.
    let parent_moved_slow = elem.last_area_increase.increase_speed < config.maximum_move_distance;
    let avoidance_speed_mismatch =
        parent_moved_slow && elem.last_area_increase.avoidance_type != AvoidanceType::Slow;
    if elem.last_area_increase.allow_move
        && elem.last_area_increase.no_error
        && elem.can_use_safe_radius
        && !mergelayer
        && !avoidance_speed_mismatch
        && (elem.distance_to_top as usize >= config.tip_layers || parent_moved_slow)
    {
        let speed = if parent_moved_slow { slow_speed } else { fast_speed };
        insert(
            setting(elem.last_area_increase.avoidance_type, speed, true, true, false, true),
            true,
            &mut order,
        );
        insert(
            setting(elem.last_area_increase.avoidance_type, speed, false, true, false, true),
            true,
            &mut order,
        );
    }

    if !elem.can_use_safe_radius {
        // The branch may still sit inside a hole hazard. Check whether the
        // hole was passed already; otherwise move fast so holes smaller than
        // the grown radius are avoided where possible.
        insert(setting(AvoidanceType::Slow, slow_speed, true, true, false, false), true, &mut order);
        if (elem.distance_to_top as usize) < config.tip_layers.div_ceil(2) {
            insert(setting(AvoidanceType::Fast, slow_speed, true, true, false, false), true, &mut order);
        }
        insert(setting(AvoidanceType::FastSafe, fast_speed, true, true, false, false), true, &mut order);
        insert(setting(AvoidanceType::FastSafe, fast_speed, false, true, false, true), true, &mut order);
        insert(setting(AvoidanceType::Fast, fast_speed, false, true, false, true), true, &mut order);
    } else {
        insert(setting(AvoidanceType::Slow, slow_speed, true, true, false, true), true, &mut order);
        // Moving fast to grow the radius would look like a layer shift; the
        // slow non-growing attempt comes first.
        insert(setting(AvoidanceType::Slow, slow_speed, false, true, false, true), true, &mut order);
        if (elem.distance_to_top as usize) < config.tip_layers {
            insert(setting(AvoidanceType::FastSafe, slow_speed, true, true, false, true), true, &mut order);
        }
        insert(setting(AvoidanceType::FastSafe, fast_speed, true, true, false, true), true, &mut order);
        insert(setting(AvoidanceType::FastSafe, fast_speed, false, true, false, true), true, &mut order);
    }

    if elem.use_min_xy_dist {
        // Prefer regaining the regular xy distance before resorting to the
        // tight one (Z overrides XY only while it must).
        let mut new_order = Vec::with_capacity(order.len() * 2);
        for s in order {
            new_order.push(s);
            new_order.push(setting(
                s.avoidance_type,
                s.increase_speed,
                s.increase_radius,
                s.no_error,
                true,
                s.allow_move,
            ));
        }
        order = new_order;
    }

    let radius = config.get_collision_radius(elem);
    if elem.to_buildplate
        || (elem.to_model_gracious
            && clipper::intersection(
                &parent.influence_area,
                &volumes.get_placeable_areas(radius, layer_idx),
            )
            .is_empty())
    {
        // It is normal to eventually find no area when the branch has to
        // connect with the model; otherwise this is the error strategy.
        insert(
            setting(AvoidanceType::Fast, fast_speed, false, false, elem.use_min_xy_dist, true),
            true,
            &mut order,
        );
    }
    if elem.distance_to_top < elem.dont_move_until && elem.can_use_safe_radius {
        // Hold position near the tip while the roof budget lasts, but only if
        // holes would be avoided in every case.
        insert(setting(AvoidanceType::Slow, 0, true, true, false, false), false, &mut order);
    }

    order
}

/// Propagate every element of `layer_elements` (layer `layer_idx`) one layer
/// down into `merging_areas`.
pub fn increase_areas_one_layer(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    merging_areas: &mut [SupportElementMerging],
    layer_idx: usize,
    layer_elements: &mut SupportElements,
    mergelayer: bool,
    cancel: &CancellationToken,
) -> Result<(), TreeSupportError> {
    for merging_area in merging_areas.iter_mut() {
        cancel.check()?;
        debug_assert_eq!(merging_area.parents.len(), 1);
        let parent_idx = merging_area.parents[0] as usize;
        let parent = layer_elements[parent_idx].clone();
        let mut elem = parent.state.propagate_down();
        let wall_restriction = volumes.get_wall_restriction(
            config.get_collision_radius(&parent.state),
            layer_idx,
            parent.state.use_min_xy_dist,
        );

        let radius = config.get_collision_radius(&elem);
        // A few scaled units of rounding slack; the rest compensates for the
        // outer wall of a growing branch moving less than its center.
        let mut extra_speed: Coord = 5;
        let mut extra_slow_speed: Coord = 0;
        let ceiled_parent_radius = volumes.ceil_radius(config.get_collision_radius(&parent.state));
        let projected_radius_increased = config.get_radius(
            parent.state.effective_radius_height as usize + 1,
            parent.state.elephant_foot_increases,
        );
        let projected_radius_delta =
            projected_radius_increased - config.get_collision_radius(&parent.state);

        let safe_movement_distance = if elem.use_min_xy_dist {
            config.xy_min_distance
        } else {
            config.xy_distance
        } + if config.z_distance_top_layers.min(config.z_distance_bottom_layers) > 0 {
            config.min_feature_size
        } else {
            0
        };

        if ceiled_parent_radius == volumes.ceil_radius(projected_radius_increased)
            || projected_radius_increased < config.increase_radius_until_radius
        {
            // Radius increase is guaranteed possible; the full delta may be
            // spent on movement.
            extra_speed += projected_radius_delta;
        } else {
            extra_slow_speed += projected_radius_delta.min(
                (config.maximum_move_distance + extra_speed)
                    - (config.maximum_move_distance_slow + extra_slow_speed),
            );
        }

        if config.layer_start_bp_radius > layer_idx
            && config.recommended_min_radius(layer_idx - 1)
                < config.get_radius(
                    elem.effective_radius_height as usize + 1,
                    elem.elephant_foot_increases,
                )
        {
            // Guaranteed elephant foot increase.
            let foot_speed =
                (config.branch_radius as f64 * config.diameter_scale_bp_radius) as Coord;
            if ceiled_parent_radius
                == volumes.ceil_radius(config.get_radius(
                    parent.state.effective_radius_height as usize + 1,
                    parent.state.elephant_foot_increases + 1.0,
                ))
            {
                extra_speed += foot_speed;
            } else {
                extra_slow_speed += foot_speed.min(
                    config.maximum_move_distance
                        - (config.maximum_move_distance_slow + extra_slow_speed),
                );
            }
        }

        let fast_speed = config.maximum_move_distance + extra_speed;
        let slow_speed = config.maximum_move_distance_slow + extra_speed + extra_slow_speed;

        let order = build_order(
            config, &elem, &parent, volumes, layer_idx, mergelayer, slow_speed, fast_speed,
        );

        let mut offset_slow: Option<ExPolygons> = None;
        let mut offset_fast: Option<ExPolygons> = None;
        // Whether computing the fast offset independently beats extending the
        // slow offset; measured in offset steps.
        let offset_independent_faster = radius / safe_movement_distance.max(1)
            - Coord::from(config.maximum_move_distance + extra_speed < radius + safe_movement_distance)
            > div_ceil_coord(
                extra_speed + extra_slow_speed + config.maximum_move_distance_slow,
                safe_movement_distance.max(1),
            );

        let mut outcome: Option<(SingleAreaResult, AreaIncreaseSettings)> = None;
        for settings in &order {
            if settings.allow_move {
                if offset_slow.is_none()
                    && (settings.increase_speed == slow_speed || !offset_independent_faster)
                {
                    // Two steps minimum keep the offset area round enough for
                    // single-micron precision.
                    offset_slow = Some(safe_offset_inc(
                        &parent.influence_area,
                        extra_speed + extra_slow_speed + config.maximum_move_distance_slow,
                        &wall_restriction,
                        safe_movement_distance,
                        if offset_independent_faster {
                            safe_movement_distance + radius
                        } else {
                            0
                        },
                        2,
                    ));
                }
                if offset_fast.is_none() && settings.increase_speed != slow_speed {
                    if offset_independent_faster {
                        offset_fast = Some(safe_offset_inc(
                            &parent.influence_area,
                            extra_speed + config.maximum_move_distance,
                            &wall_restriction,
                            safe_movement_distance,
                            safe_movement_distance + radius,
                            1,
                        ));
                    } else {
                        let delta_slow_fast = config.maximum_move_distance
                            - (config.maximum_move_distance_slow + extra_slow_speed);
                        offset_fast = Some(safe_offset_inc(
                            offset_slow.as_ref().unwrap(),
                            delta_slow_fast,
                            &wall_restriction,
                            safe_movement_distance,
                            safe_movement_distance + radius,
                            1,
                        ));
                    }
                }
            }

            let result = if !settings.no_error {
                // ERROR CASE: clipper may see a degenerate area as a line and
                // stop offsetting it; widen the outline so something with
                // area remains, then push through collisions.
                let lines_offset = {
                    let mut polylines = Vec::new();
                    for ex in &parent.influence_area {
                        polylines.push(ex.contour.to_closed_polyline());
                        for hole in &ex.holes {
                            polylines.push(hole.to_closed_polyline());
                        }
                    }
                    clipper::widen_polylines(&polylines, scale(0.005))
                };
                let base_error_area = clipper::union(&parent.influence_area, &lines_offset);
                increase_single_area(
                    volumes,
                    config,
                    settings,
                    layer_idx,
                    &parent,
                    &base_error_area,
                    ((config.maximum_move_distance + extra_speed) as CoordF * 1.5) as Coord,
                    mergelayer,
                )
            } else {
                let relevant_offset = if settings.allow_move {
                    if settings.increase_speed == slow_speed {
                        offset_slow.as_ref().unwrap()
                    } else {
                        offset_fast.as_ref().unwrap()
                    }
                } else {
                    &parent.influence_area
                };
                increase_single_area(
                    volumes,
                    config,
                    settings,
                    layer_idx,
                    &parent,
                    relevant_offset,
                    0,
                    mergelayer,
                )
            };

            if let Some(mut result) = result {
                result.state.last_area_increase = *settings;
                if settings.allow_move {
                    result.state.dont_move_until = 0;
                } else {
                    result.state.result_on_layer = parent.state.result_on_layer;
                }
                result.state.can_use_safe_radius = settings.avoidance_type != AvoidanceType::Fast;
                if !settings.use_min_distance {
                    result.state.use_min_xy_dist = false;
                }
                if !settings.no_error {
                    result.state.lost = true;
                    result.state.verylost = true;
                }
                outcome = Some((result, *settings));
                break;
            }
        }

        if let Some((result, settings)) = outcome {
            let elem = result.state;
            let radius = config.get_collision_radius(&elem);
            // Rounding can leave to_bp slightly larger than it should be;
            // the union absorbs it.
            let max_influence_area = safe_union(
                &clipper::difference(
                    &result.increased,
                    &volumes.get_collision(radius, layer_idx - 1, elem.use_min_xy_dist),
                ),
                &safe_union(&result.to_bp_data, &result.to_model_data),
            );
            let bypass_merge = !settings.allow_move
                || (settings.use_min_distance
                    && (elem.distance_to_top as usize) < config.tip_layers);
            merging_area.state = elem;
            merging_area.areas.influence_areas = max_influence_area;
            if !bypass_merge {
                if merging_area.state.to_buildplate {
                    merging_area.areas.to_bp_areas = result.to_bp_data;
                }
                if config.support_rests_on_model {
                    merging_area.areas.to_model_areas = result.to_model_data;
                }
            }
            merging_area.set_bbox();
        } else {
            // The branch ends here. Bottom-most points of dead branches must
            // stay unset so placement culls them.
            layer_elements[parent_idx].state.result_on_layer_reset();
        }
    }
    Ok(())
}

/// Propagate influence areas from the top layer down to the build plate,
/// merging areas within each layer as the cadence allows.
pub fn create_layer_pathing(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    move_bounds: &mut Vec<SupportElements>,
    cancel: &CancellationToken,
) -> Result<(), TreeSupportError> {
    // Merging is expensive; skipping it on some layers trades a few extra
    // branches for speed, as long as at least one merge happens per a few
    // millimeters of height.
    let max_merge_every_x_layers = (5000 / config.maximum_move_distance.clamp(100, 5000) as usize)
        .min(1000 / config.maximum_move_distance_slow.clamp(20, 1000) as usize)
        .min((3000 / crate::unscale(config.layer_height).max(0.05) as usize).max(1))
        .max(1);
    let mut merge_every_x_layers = 1usize;
    let mut last_merge_layer_idx = move_bounds.len();
    let mut new_element = false;

    for layer_idx in (1..move_bounds.len()).rev() {
        if move_bounds[layer_idx].is_empty() {
            continue;
        }
        cancel.check()?;

        let had_new_element = new_element;
        let merge_this_layer =
            had_new_element || (last_merge_layer_idx - layer_idx) >= merge_every_x_layers;
        if had_new_element {
            merge_every_x_layers = 1;
        }

        let mut influence_areas: Vec<SupportElementMerging> = (0..move_bounds[layer_idx].len())
            .map(|element_idx| SupportElementMerging {
                state: move_bounds[layer_idx][element_idx].state.clone(),
                parents: vec![element_idx as i32],
                areas: SupportElementInfluenceAreas::default(),
                bbox: BoundingBox::new(),
            })
            .collect();

        {
            // Split the layers around layer_idx so the upper layer can be
            // mutated (dead-branch result resets) independently.
            let (below, above) = move_bounds.split_at_mut(layer_idx);
            let _ = below;
            increase_areas_one_layer(
                volumes,
                config,
                &mut influence_areas,
                layer_idx,
                &mut above[0],
                merge_this_layer,
                cancel,
            )?;
        }

        // Areas that bypassed merging are complete; move them to the output.
        let mut to_merge: Vec<SupportElementMerging> = Vec::new();
        for elem in influence_areas {
            if elem.areas.influence_areas.is_empty() {
                // Removed completely due to collision.
                continue;
            }
            if elem.areas.to_bp_areas.is_empty() && elem.areas.to_model_areas.is_empty() {
                move_bounds[layer_idx - 1].push(SupportElement::new(
                    elem.state,
                    elem.parents,
                    elem.areas.influence_areas,
                ));
            } else {
                to_merge.push(elem);
            }
        }

        new_element = !move_bounds[layer_idx - 1].is_empty();

        if merge_this_layer {
            let count_before_merge = to_merge.len();
            if count_before_merge > 1 {
                merge_influence_areas(volumes, config, layer_idx, &mut to_merge, cancel)?;
            }
            last_merge_layer_idx = layer_idx;
            if to_merge.len() == count_before_merge && !had_new_element {
                merge_every_x_layers = (merge_every_x_layers + 1).min(max_merge_every_x_layers);
            }
        }

        for elem in to_merge {
            if elem.areas.influence_areas.is_empty() {
                continue;
            }
            let new_area = safe_union(&elem.areas.influence_areas, &Vec::new());
            move_bounds[layer_idx - 1].push(SupportElement::new(elem.state, elem.parents, new_area));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{ExPolygon, Point};
    use crate::volumes::TreeModelVolumesConfig;

    fn square_mm(center: Point, half_mm: f64) -> ExPolygon {
        let half = scale(half_mm);
        ExPolygon::rectangle(
            Point::new(center.x - half, center.y - half),
            Point::new(center.x + half, center.y + half),
        )
    }

    fn empty_volumes(layers: usize) -> TreeModelVolumes {
        TreeModelVolumes::new(TreeModelVolumesConfig::default(), vec![Vec::new(); layers])
    }

    fn tip_element(config: &TreeSupportSettings, layer_idx: usize, at: Point) -> SupportElement {
        let state = SupportElementState {
            layer_idx,
            target_height: layer_idx,
            target_position: at,
            next_position: at,
            result_on_layer: Some(at),
            to_buildplate: true,
            to_model_gracious: true,
            can_use_safe_radius: true,
            ..Default::default()
        };
        let _ = config;
        SupportElement::new(state, Vec::new(), vec![square_mm(at, 0.05)])
    }

    #[test]
    fn test_safe_union_preserves_degenerate_input() {
        // A zero-area sliver that a union would erase.
        let sliver = ExPolygon::new(crate::geometry::Polygon::from_points(vec![
            Point::new(0, 0),
            Point::new(scale(1.0), 0),
            Point::new(scale(0.5), 0),
        ]));
        let result = safe_union(&vec![sliver], &Vec::new());
        assert!(!result.is_empty());
        assert!(clipper::area(&result) > 0.0);
    }

    #[test]
    fn test_safe_offset_inc_avoids_obstacle() {
        let start = vec![square_mm(Point::zero(), 1.0)];
        // A wall to the right that a naive 6mm offset would jump over.
        let wall = vec![ExPolygon::rectangle(
            Point::new_scale(2.0, -10.0),
            Point::new_scale(3.0, 10.0),
        )];
        let grown = safe_offset_inc(&start, scale(6.0), &wall, scale(1.0), 0, 1);
        assert!(!grown.is_empty());
        // Nothing may end up beyond the wall.
        for ex in &grown {
            for p in ex.contour.points() {
                assert!(p.x <= scale(2.01), "offset leaked past the wall: {p:?}");
            }
        }
    }

    #[test]
    fn test_safe_offset_inc_zero_distance() {
        let start = vec![square_mm(Point::zero(), 1.0)];
        let out = safe_offset_inc(&start, 0, &Vec::new(), scale(1.0), 0, 1);
        let area_in = clipper::area(&start);
        let area_out = clipper::area(&out);
        assert!((area_in - area_out).abs() < area_in * 0.01);
    }

    #[test]
    fn test_safe_offset_inc_min_steps() {
        // With min_amount_offset the result still covers the full distance.
        let start = vec![square_mm(Point::zero(), 0.5)];
        let out = safe_offset_inc(&start, scale(1.0), &Vec::new(), scale(5.0), 0, 4);
        let grown_area = clipper::area(&out);
        let expected = (scale(3.0) as CoordF).powi(2); // 1.5mm half-width square-ish
        assert!(grown_area > expected * 0.8);
    }

    #[test]
    fn test_increase_single_area_moves_down() {
        let volumes = empty_volumes(6);
        let config = TreeSupportSettings::default();
        let parent = tip_element(&config, 5, Point::zero());
        let settings = AreaIncreaseSettings {
            avoidance_type: AvoidanceType::Fast,
            increase_speed: config.maximum_move_distance,
            increase_radius: true,
            no_error: true,
            use_min_distance: false,
            allow_move: true,
        };
        let offset_area = safe_offset_inc(
            &parent.influence_area,
            config.maximum_move_distance,
            &Vec::new(),
            scale(0.5),
            0,
            1,
        );
        let result = increase_single_area(
            &volumes, &config, &settings, 5, &parent, &offset_area, 0, true,
        )
        .expect("open space must propagate");
        assert_eq!(result.state.layer_idx, 4);
        assert_eq!(result.state.distance_to_top, 1);
        assert!(result.state.effective_radius_height >= 1);
        assert!(clipper::area(&result.to_bp_data) > TINY_AREA_THRESHOLD);
    }

    #[test]
    fn test_create_layer_pathing_reaches_plate() {
        let volumes = empty_volumes(6);
        let config = TreeSupportSettings::default();
        let mut move_bounds: Vec<SupportElements> = vec![Vec::new(); 6];
        move_bounds[5].push(tip_element(&config, 5, Point::zero()));

        create_layer_pathing(&volumes, &config, &mut move_bounds, &CancellationToken::new())
            .unwrap();

        for layer_idx in 0..5 {
            assert_eq!(
                move_bounds[layer_idx].len(),
                1,
                "expected one element on layer {layer_idx}"
            );
            let elem = &move_bounds[layer_idx][0];
            assert!(elem.state.to_buildplate);
            assert!(!elem.influence_area.is_empty());
        }
        // Radii are monotone down the tree.
        for layer_idx in 0..4 {
            let below = config.get_collision_radius(&move_bounds[layer_idx][0].state);
            let above = config.get_collision_radius(&move_bounds[layer_idx + 1][0].state);
            assert!(below >= above);
        }
    }

    #[test]
    fn test_two_tips_merge_into_one_trunk() {
        let volumes = empty_volumes(12);
        let config = TreeSupportSettings::default();
        let mut move_bounds: Vec<SupportElements> = vec![Vec::new(); 12];
        move_bounds[11].push(tip_element(&config, 11, Point::new_scale(-0.75, 0.0)));
        move_bounds[11].push(tip_element(&config, 11, Point::new_scale(0.75, 0.0)));

        create_layer_pathing(&volumes, &config, &mut move_bounds, &CancellationToken::new())
            .unwrap();

        assert!(
            move_bounds[0].len() < 2,
            "close branches should merge before the plate"
        );
        assert_eq!(move_bounds[0].len(), 1);
        // The merged trunk carries both parents somewhere along the chain.
        let merged_layer = (0..11)
            .find(|&l| move_bounds[l].iter().any(|e| e.parents.len() > 1))
            .expect("a merge must have happened");
        assert!(merged_layer < 11);
    }

    #[test]
    fn test_pathing_keeps_branch_outside_collision() {
        // A tower occupying x > 1mm; the tip starts close to it.
        let outline = vec![ExPolygon::rectangle(
            Point::new_scale(1.0, -10.0),
            Point::new_scale(20.0, 10.0),
        )];
        let volumes = TreeModelVolumes::new(TreeModelVolumesConfig::default(), vec![outline; 8]);
        let config = TreeSupportSettings::default();
        let mut move_bounds: Vec<SupportElements> = vec![Vec::new(); 8];
        move_bounds[7].push(tip_element(&config, 7, Point::new_scale(-2.0, 0.0)));

        create_layer_pathing(&volumes, &config, &mut move_bounds, &CancellationToken::new())
            .unwrap();

        // A to-buildplate element keeps a way out of the avoidance on every
        // layer down to the plate.
        for layer_idx in 0..7 {
            for elem in &move_bounds[layer_idx] {
                assert!(elem.state.to_buildplate);
                let radius = config.get_collision_radius(&elem.state);
                let avoidance =
                    volumes.get_avoidance(radius, layer_idx, AvoidanceType::Fast, false, false);
                let escape = clipper::difference(&elem.influence_area, &avoidance);
                assert!(
                    clipper::area(&escape) > TINY_AREA_THRESHOLD,
                    "element trapped on layer {layer_idx}"
                );
            }
        }
    }
}
