//! Node positioning: one anchor point per element per layer.
//!
//! Anchors are seeded on layer 0 and swept upward: every parent of an
//! anchored element is anchored at the point of its influence area closest to
//! the child's anchor. Elements left without an anchor either died on the way
//! to the build plate (deleted), find a placeable model area somewhere up
//! their chain (gracious landing), or are put down on the model as they are.

use crate::clipper;
use crate::error::{CancellationToken, TreeSupportError};
use crate::geometry::{ExPolygon, ExPolygons, Point, PointF};
use crate::support::settings::{SupportElements, TreeSupportSettings};
use crate::volumes::TreeModelVolumes;
use crate::Coord;

/// Closest point on the boundary of `polygons` to `from`, pushed `distance`
/// along the inward edge normal when nonzero.
pub fn move_inside(polygons: &[ExPolygon], from: Point, distance: Coord) -> Point {
    let mut best = from;
    let mut best_dist2 = i128::MAX;
    for ex in polygons {
        for ring in std::iter::once(&ex.contour).chain(ex.holes.iter()) {
            let points = ring.points();
            if points.len() < 2 {
                continue;
            }
            for i in 0..points.len() {
                let a = points[i];
                let b = points[(i + 1) % points.len()];
                if a == b {
                    // Zero-length edge; its endpoint is covered by neighbors.
                    continue;
                }
                let candidate = from.project_onto_segment(a, b);
                let dist2 = candidate.distance_squared(&from);
                if dist2 < best_dist2 {
                    best_dist2 = dist2;
                    if distance == 0 {
                        best = candidate;
                    } else {
                        let edge = (b - a).to_f64().normalize();
                        // Inward normal of a counter-clockwise ring.
                        let normal = PointF::new(-edge.y, edge.x);
                        let shifted = candidate.to_f64() + normal * crate::unscale(distance);
                        best = shifted.to_scaled();
                    }
                }
            }
        }
    }
    best
}

/// `from` if it already lies inside, otherwise its boundary projection.
pub fn move_inside_if_outside(polygons: &[ExPolygon], from: Point) -> Point {
    if polygons.iter().any(|ex| ex.contains_point(&from)) {
        from
    } else {
        move_inside(polygons, from, 0)
    }
}

/// Anchor all unanchored parents of `(layer_idx, elem_idx)` next to its
/// anchor and mark them as reached from below.
fn set_points_on_areas(move_bounds: &mut [SupportElements], layer_idx: usize, elem_idx: usize) {
    let Some(result) = move_bounds[layer_idx][elem_idx].state.result_on_layer else {
        // A missing anchor here means a bug upstream; the branch may lose a
        // segment but generation continues.
        return;
    };
    if layer_idx + 1 >= move_bounds.len() {
        return;
    }
    let parents = move_bounds[layer_idx][elem_idx].parents.clone();
    let (_, upper) = move_bounds.split_at_mut(layer_idx + 1);
    let layer_above = &mut upper[0];
    for parent_idx in parents {
        let parent = &mut layer_above[parent_idx as usize];
        // A parent that refused to move (roof hold) keeps its anchor.
        if !parent.state.result_on_layer_is_set() {
            parent.state.result_on_layer =
                Some(move_inside_if_outside(&parent.influence_area, result));
        }
        parent.state.marked = true;
    }
}

/// Put a non-gracious branch down on the model right here.
fn set_to_model_contact_simple(move_bounds: &mut [SupportElements], layer_idx: usize, elem_idx: usize) {
    let elem = &mut move_bounds[layer_idx][elem_idx];
    let best = move_inside_if_outside(&elem.influence_area, elem.state.next_position);
    elem.state.result_on_layer = Some(best);
}

/// Walk up the single-parent chain to the highest layer whose influence area
/// still intersects a placeable area, anchor there, and delete the elements
/// below it on the chain.
fn set_to_model_contact_gracious(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    move_bounds: &mut [SupportElements],
    layer_idx: usize,
    elem_idx: usize,
) {
    let mut last_successful: Option<(usize, usize)> = None;
    let mut cursor = (layer_idx, elem_idx);
    loop {
        let elem = &move_bounds[cursor.0][cursor.1];
        let radius = config.get_collision_radius(&elem.state);
        let placeable = volumes.get_placeable_areas(radius, cursor.0);
        if clipper::intersection(&elem.influence_area, &placeable).is_empty() {
            break;
        }
        last_successful = Some(cursor);
        if elem.parents.len() != 1 || cursor.0 + 1 >= move_bounds.len() {
            // Merge point (or top); landing higher would drop other subtrees.
            break;
        }
        cursor = (cursor.0 + 1, elem.parents[0] as usize);
    }

    match last_successful {
        None => {
            // Should exist for a gracious branch; place it down anyway and
            // accept the imperfect landing.
            move_bounds[layer_idx][elem_idx].state.to_model_gracious = false;
            set_to_model_contact_simple(move_bounds, layer_idx, elem_idx);
        }
        Some(top) => {
            let mut cursor = (layer_idx, elem_idx);
            while cursor != top {
                let parent = move_bounds[cursor.0][cursor.1].parents[0] as usize;
                move_bounds[cursor.0][cursor.1].state.deleted = true;
                cursor = (cursor.0 + 1, parent);
            }
            let elem = &mut move_bounds[top.0][top.1];
            let best = move_inside_if_outside(&elem.influence_area, elem.state.next_position);
            elem.state.result_on_layer = Some(best);
        }
    }
}

/// Resolve an anchor for every element, bottom-up.
pub fn create_nodes_from_area(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    move_bounds: &mut Vec<SupportElements>,
    cancel: &CancellationToken,
) -> Result<(), TreeSupportError> {
    if move_bounds.is_empty() {
        return Ok(());
    }

    // Seed layer 0: any point inside the influence area is valid.
    if move_bounds.len() > 1 {
        for elem in &mut move_bounds[1] {
            elem.state.marked = false;
        }
    }
    for elem_idx in 0..move_bounds[0].len() {
        let init = &mut move_bounds[0][elem_idx];
        init.state.result_on_layer = Some(move_inside_if_outside(
            &init.influence_area,
            init.state.next_position,
        ));
        set_points_on_areas(move_bounds, 0, elem_idx);
    }
    cancel.check()?;

    for layer_idx in 1..move_bounds.len() {
        if layer_idx + 1 < move_bounds.len() {
            for elem in &mut move_bounds[layer_idx + 1] {
                elem.state.marked = false;
            }
        }
        for elem_idx in 0..move_bounds[layer_idx].len() {
            let state = &move_bounds[layer_idx][elem_idx].state;
            if state.deleted {
                continue;
            }
            if !state.result_on_layer_is_set() {
                if state.to_buildplate
                    || ((state.distance_to_top as usize) < config.min_dtt_to_model
                        && !state.supports_roof)
                {
                    // Failed to reach the plate, or too short to land on the
                    // model. Parents have no anchor either and die the same
                    // way on their own layer.
                    move_bounds[layer_idx][elem_idx].state.deleted = true;
                } else if state.to_model_gracious {
                    set_to_model_contact_gracious(
                        volumes, config, move_bounds, layer_idx, elem_idx,
                    );
                } else {
                    set_to_model_contact_simple(move_bounds, layer_idx, elem_idx);
                }
            }

            let state = &move_bounds[layer_idx][elem_idx].state;
            if !state.deleted && !state.marked && state.target_height == layer_idx {
                // A tip never reached from below: bookkeeping anomaly.
                move_bounds[layer_idx][elem_idx].state.deleted = true;
            }

            if move_bounds[layer_idx][elem_idx].state.deleted {
                // Parents kept an anchor when a roof hold refused to move;
                // those anchors are invalid now that this branch is gone.
                let parents = move_bounds[layer_idx][elem_idx].parents.clone();
                if layer_idx + 1 < move_bounds.len() {
                    for parent_idx in parents {
                        move_bounds[layer_idx + 1][parent_idx as usize]
                            .state
                            .result_on_layer_reset();
                    }
                }
            } else {
                set_points_on_areas(move_bounds, layer_idx, elem_idx);
            }
        }
        cancel.check()?;
    }

    remove_deleted_elements(move_bounds);
    Ok(())
}

/// Drop deleted elements and rewrite parent indices with a per-layer remap.
pub fn remove_deleted_elements(move_bounds: &mut [SupportElements]) {
    // Parents index into the layer above, so the remap of layer L rewrites
    // layer L-1; walk top-down.
    let mut map_above: Vec<i32> = Vec::new();
    for layer_idx in (0..move_bounds.len()).rev() {
        let old_layer = std::mem::take(&mut move_bounds[layer_idx]);
        let mut map_current = vec![-1i32; old_layer.len()];
        let mut new_layer = Vec::with_capacity(old_layer.len());
        for (read_idx, mut elem) in old_layer.into_iter().enumerate() {
            if elem.state.deleted {
                continue;
            }
            if !map_above.is_empty() {
                for parent in &mut elem.parents {
                    *parent = map_above[*parent as usize];
                }
                elem.parents.retain(|p| *p >= 0);
            }
            map_current[read_idx] = new_layer.len() as i32;
            new_layer.push(elem);
        }
        move_bounds[layer_idx] = new_layer;
        map_above = map_current;
    }
}
