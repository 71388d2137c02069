//! Classic materialization: stacked circles and ellipses per layer.
//!
//! Every anchored element becomes a drawable area: circles ovalized along the
//! movement to its child and parents, clipped against the model, checked for
//! a printable nozzle path. Two smoothing passes then limit how fast the
//! outer wall may change between layers, and branches that do not land
//! graciously are dropped straight down to the build plate.

use crate::clipper::{self, OffsetJoinType};
use crate::error::{CancellationToken, TreeSupportError};
use crate::geometry::{ExPolygons, Point, Polygon};
use crate::support::placement::move_inside;
use crate::support::settings::{
    SupportElements, TreeSupportSettings, TINY_AREA_THRESHOLD, TREE_CIRCLE_RESOLUTION,
};
use crate::volumes::TreeModelVolumes;
use crate::{scale, Coord, CoordF};

/// One drawable area per support element.
#[derive(Debug, Clone)]
pub struct DrawArea {
    /// `(layer_idx, element_idx)` into the move bounds.
    pub element: (usize, usize),
    /// Element index in the layer below that continues this branch.
    pub child: Option<usize>,
    /// Polygons to be printed for this element.
    pub polygons: ExPolygons,
}

/// Flatten the move bounds into a per-element list with downward links.
/// Returns the list and the start offset of each layer within it.
pub fn build_linear_data(move_bounds: &[SupportElements]) -> (Vec<DrawArea>, Vec<usize>) {
    let mut linear_data: Vec<DrawArea> = Vec::new();
    let mut linear_data_layers: Vec<usize> = Vec::new();
    // parent element idx (in layer above) -> child element idx (this layer)
    let mut map_downwards_old: Vec<(usize, usize)> = Vec::new();
    let mut map_downwards_new: Vec<(usize, usize)> = Vec::new();

    for layer_idx in 0..move_bounds.len() {
        linear_data_layers.push(linear_data.len());
        map_downwards_new.clear();
        map_downwards_old.sort_unstable();
        for (elem_idx, elem) in move_bounds[layer_idx].iter().enumerate() {
            let child = if layer_idx > 0 {
                map_downwards_old
                    .binary_search_by_key(&elem_idx, |entry| entry.0)
                    .ok()
                    .map(|pos| map_downwards_old[pos].1)
            } else {
                None
            };
            if layer_idx + 1 < move_bounds.len() {
                let layer_above = &move_bounds[layer_idx + 1];
                for &parent_idx in &elem.parents {
                    if layer_above[parent_idx as usize].state.result_on_layer_is_set() {
                        map_downwards_new.push((parent_idx as usize, elem_idx));
                    }
                }
            }
            linear_data.push(DrawArea {
                element: (layer_idx, elem_idx),
                child,
                polygons: Vec::new(),
            });
        }
        std::mem::swap(&mut map_downwards_old, &mut map_downwards_new);
    }
    linear_data_layers.push(linear_data.len());
    (linear_data, linear_data_layers)
}

/// Draw the ovalized circle set for every element.
pub fn generate_branch_areas(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    move_bounds: &[SupportElements],
    linear_data: &mut [DrawArea],
    cancel: &CancellationToken,
) -> Result<(), TreeSupportError> {
    let branch_circle = Polygon::circle(Point::zero(), config.branch_radius, TREE_CIRCLE_RESOLUTION);

    for draw_area in linear_data.iter_mut() {
        cancel.check()?;
        let (layer_idx, elem_idx) = draw_area.element;
        let element = &move_bounds[layer_idx][elem_idx];
        let Some(anchor) = element.state.result_on_layer else {
            continue;
        };
        let radius = config.get_radius_state(&element.state);
        let mut parent_uses_min = false;

        // Movement vectors to the child below and every parent above; each
        // contributes an ellipse spanning old and new center.
        let mut movement_directions: Vec<(Point, Coord)> = vec![(Point::zero(), radius)];
        if !element.state.skip_ovalisation {
            if let Some(child_idx) = draw_area.child {
                let child = &move_bounds[layer_idx - 1][child_idx];
                if let Some(child_anchor) = child.state.result_on_layer {
                    movement_directions.push((child_anchor - anchor, radius));
                }
            }
            if layer_idx + 1 < move_bounds.len() {
                let layer_above = &move_bounds[layer_idx + 1];
                for &parent_idx in &element.parents {
                    let parent = &layer_above[parent_idx as usize];
                    if let Some(parent_anchor) = parent.state.result_on_layer {
                        movement_directions.push((
                            parent_anchor - anchor,
                            config.get_radius_state(&parent.state).max(config.support_line_width),
                        ));
                    }
                    parent_uses_min |= parent.state.use_min_xy_dist;
                }
            }
        }

        let collision = volumes.get_collision(
            0,
            layer_idx,
            parent_uses_min || element.state.use_min_xy_dist,
        );

        let generate_area = |aoffset: Coord| -> (ExPolygons, CoordF) {
            let mut poly: ExPolygons = Vec::new();
            let mut max_speed: CoordF = 0.0;
            for (movement, move_radius) in &movement_directions {
                max_speed = max_speed.max(movement.length());

                // Ovalize the circle into an ellipse containing both the old
                // center and the target position.
                let used_scale = (move_radius + aoffset) as CoordF / config.branch_radius as CoordF;
                let center_position = anchor + *movement / 2;
                let move_x = movement.x as CoordF / (used_scale * config.branch_radius as CoordF);
                let move_y = movement.y as CoordF / (used_scale * config.branch_radius as CoordF);
                let vsize_inv = 0.5 / (0.01 + (move_x * move_x + move_y * move_y).sqrt());

                let matrix = [
                    used_scale * (1.0 + move_x * move_x * vsize_inv),
                    used_scale * (move_x * move_y * vsize_inv),
                    used_scale * (move_x * move_y * vsize_inv),
                    used_scale * (1.0 + move_y * move_y * vsize_inv),
                ];
                let mut circle = Polygon::new();
                for vertex in branch_circle.points() {
                    circle.push(Point::new(
                        center_position.x
                            + (matrix[0] * vertex.x as CoordF + matrix[1] * vertex.y as CoordF)
                                as Coord,
                        center_position.y
                            + (matrix[2] * vertex.x as CoordF + matrix[3] * vertex.y as CoordF)
                                as Coord,
                    ));
                }
                poly.push(crate::geometry::ExPolygon::new(circle));
            }
            // A small outset absorbs rounding that would leave the branch a
            // hair short of its permitted position.
            let inner_offset = scale(0.05).min(config.support_line_width / 4);
            let poly = clipper::difference(
                &clipper::offset(&clipper::union_all(&poly), inner_offset, OffsetJoinType::Miter),
                &collision,
            );
            (poly, max_speed)
        };

        let (mut polygons, max_speed) = generate_area(0);
        let fast_relative_movement = max_speed > radius as CoordF * 0.75;

        if fast_relative_movement
            || config.get_radius_state(&element.state) - config.get_collision_radius(&element.state)
                > config.support_line_width
        {
            // Simulate the nozzle path on the outermost wall. If it splits,
            // part of the branch would print mid-air.
            let mut nozzle_path =
                clipper::offset(&polygons, -config.support_line_width / 2, OffsetJoinType::Miter);
            if nozzle_path.len() > 1 {
                // A slightly larger area often reconnects the path.
                let (larger, _) = generate_area(config.support_line_width / 2);
                polygons = larger;
                nozzle_path = clipper::offset(
                    &polygons,
                    -config.support_line_width / 2,
                    OffsetJoinType::Miter,
                );
                if nozzle_path.len() > 1 {
                    // Keep only the parts that hold the anchor.
                    let mut parts_with_correct_center: ExPolygons = Vec::new();
                    for part in nozzle_path {
                        let drop = if part.contains_point(&anchor) {
                            false
                        } else {
                            // The anchor may sit on the border; accept a
                            // fuzzy hit.
                            let moved = move_inside(std::slice::from_ref(&part), anchor, 0);
                            anchor.distance(&moved) >= scale(0.025) as CoordF
                        };
                        if !drop {
                            parts_with_correct_center.push(part);
                        }
                    }
                    polygons = clipper::difference(
                        &clipper::offset(
                            &parts_with_correct_center,
                            config.support_line_width / 2,
                            OffsetJoinType::Miter,
                        ),
                        &collision,
                    );
                }
            }
        }

        draw_area.polygons = polygons;
    }
    Ok(())
}

/// Limit radius change along branches: upward against thick feet, then
/// downward so reductions propagate to descendants.
pub fn smooth_branch_areas(
    config: &TreeSupportSettings,
    move_bounds: &mut [SupportElements],
    linear_data: &mut [DrawArea],
    linear_data_layers: &[usize],
    cancel: &CancellationToken,
) -> Result<(), TreeSupportError> {
    // Upper limit a radius may change per layer; +1 avoids rounding errors.
    let max_radius_change_per_layer = 1 + config.support_line_width / 2;

    // Pass 1, upward: where a parent's real radius exceeds its collision
    // radius (foot), cap it by the child's area grown by the allowed change.
    for layer_idx in 0..move_bounds.len().saturating_sub(1) {
        cancel.check()?;
        let processing_base = linear_data_layers[layer_idx];
        let processing_base_above = linear_data_layers[layer_idx + 1];
        for processing_idx in processing_base..processing_base_above {
            let (elem_layer, elem_idx) = linear_data[processing_idx].element;
            debug_assert_eq!(elem_layer, layer_idx);
            let element = &move_bounds[layer_idx][elem_idx];
            let Some(anchor) = element.state.result_on_layer else {
                continue;
            };
            let mut max_outer_wall_distance: CoordF = 0.0;
            let mut do_something = false;
            let layer_above = &move_bounds[layer_idx + 1];
            for &parent_idx in &element.parents {
                let parent = &layer_above[parent_idx as usize];
                if config.get_radius_state(&parent.state)
                    != config.get_collision_radius(&parent.state)
                {
                    do_something = true;
                    if let Some(parent_anchor) = parent.state.result_on_layer {
                        max_outer_wall_distance = max_outer_wall_distance.max(
                            anchor.distance(&parent_anchor)
                                - (config.get_radius_state(&element.state)
                                    - config.get_radius_state(&parent.state))
                                    as CoordF,
                        );
                    }
                }
            }
            max_outer_wall_distance += max_radius_change_per_layer as CoordF;
            if do_something {
                let max_allowed_area = clipper::offset(
                    &linear_data[processing_idx].polygons,
                    max_outer_wall_distance as Coord,
                    OffsetJoinType::Miter,
                );
                for &parent_idx in &element.parents {
                    let parent = &layer_above[parent_idx as usize];
                    if config.get_radius_state(&parent.state)
                        != config.get_collision_radius(&parent.state)
                    {
                        // Only this element links to the parent's area, so
                        // updating it in place is safe.
                        let dst = &mut linear_data[processing_base_above + parent_idx as usize];
                        if !dst.polygons.is_empty() {
                            dst.polygons = clipper::intersection(&dst.polygons, &max_allowed_area);
                        }
                    }
                }
            }
        }
    }

    // Pass 2, downward: each area is bounded by its parents' areas grown by
    // the allowed change and shifted along the branch.
    if let Some(top_layer) = move_bounds.last_mut() {
        for element in top_layer.iter_mut() {
            element.state.marked = false;
        }
    }
    for layer_idx in (0..move_bounds.len().saturating_sub(1)).rev() {
        cancel.check()?;
        let processing_base = linear_data_layers[layer_idx];
        let processing_base_above = linear_data_layers[layer_idx + 1];
        for processing_idx in processing_base..processing_base_above {
            let (_, elem_idx) = linear_data[processing_idx].element;
            let element = &move_bounds[layer_idx][elem_idx];
            let Some(anchor) = element.state.result_on_layer else {
                continue;
            };
            let mut do_something = false;
            let mut max_allowed_area: ExPolygons = Vec::new();
            for &parent_idx in &element.parents {
                let parent = &move_bounds[layer_idx + 1][parent_idx as usize];
                let mut result = clipper::offset(
                    &linear_data[processing_base_above + parent_idx as usize].polygons,
                    max_radius_change_per_layer,
                    OffsetJoinType::Miter,
                );
                if let Some(parent_anchor) = parent.state.result_on_layer {
                    let direction = anchor - parent_anchor;
                    for ex in &mut result {
                        ex.contour.translate(direction);
                        for hole in &mut ex.holes {
                            hole.translate(direction);
                        }
                    }
                }
                max_allowed_area.extend(result);
                do_something = do_something
                    || parent.state.marked
                    || config.get_collision_radius(&parent.state)
                        != config.get_radius_state(&parent.state);
            }
            if do_something {
                let draw_area = &mut linear_data[processing_idx];
                let result = clipper::intersection(&max_allowed_area, &draw_area.polygons);
                if clipper::area(&result) < clipper::area(&draw_area.polygons) {
                    move_bounds[layer_idx][elem_idx].state.marked = true;
                    draw_area.polygons = result;
                }
            }
        }
    }
    Ok(())
}

/// Drop branches that rest non-graciously on the model straight down,
/// subtracting the model each layer, so they stand on something real.
pub fn drop_non_gracious_areas(
    volumes: &TreeModelVolumes,
    move_bounds: &[SupportElements],
    linear_data: &[DrawArea],
    support_layer_storage: &mut [ExPolygons],
    cancel: &CancellationToken,
) -> Result<(), TreeSupportError> {
    for draw_area in linear_data {
        cancel.check()?;
        let (layer_idx, elem_idx) = draw_area.element;
        let element = &move_bounds[layer_idx][elem_idx];
        // Only the bottom element of a branch connects downward.
        if element.state.to_model_gracious || draw_area.child.is_some() || layer_idx == 0 {
            continue;
        }
        let mut rest_support = draw_area.polygons.clone();
        for lower_idx in (0..layer_idx).rev() {
            rest_support =
                clipper::difference(&rest_support, &volumes.get_collision(0, lower_idx, false));
            if clipper::area(&rest_support) < TINY_AREA_THRESHOLD {
                break;
            }
            support_layer_storage[lower_idx].extend(rest_support.clone());
        }
    }
    Ok(())
}

/// Produce per-layer support body and roof polygon stashes from anchored
/// elements.
pub fn draw_areas(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    move_bounds: &mut [SupportElements],
    cancel: &CancellationToken,
) -> Result<(Vec<ExPolygons>, Vec<ExPolygons>), TreeSupportError> {
    let mut support_layer_storage: Vec<ExPolygons> = vec![Vec::new(); move_bounds.len()];
    let mut support_roof_storage: Vec<ExPolygons> = vec![Vec::new(); move_bounds.len()];

    let (mut linear_data, linear_data_layers) = build_linear_data(move_bounds);
    generate_branch_areas(volumes, config, move_bounds, &mut linear_data, cancel)?;
    smooth_branch_areas(config, move_bounds, &mut linear_data, &linear_data_layers, cancel)?;
    drop_non_gracious_areas(
        volumes,
        move_bounds,
        &linear_data,
        &mut support_layer_storage,
        cancel,
    )?;

    for draw_area in linear_data {
        let (layer_idx, elem_idx) = draw_area.element;
        let state = &move_bounds[layer_idx][elem_idx].state;
        // Tips still owed roof layers draw as roof instead of body.
        if state.missing_roof_layers > state.distance_to_top {
            support_roof_storage[layer_idx].extend(draw_area.polygons);
        } else {
            support_layer_storage[layer_idx].extend(draw_area.polygons);
        }
    }

    Ok((support_layer_storage, support_roof_storage))
}
