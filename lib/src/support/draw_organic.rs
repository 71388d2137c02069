//! Organic materialization: one smoothed tube mesh, re-sliced into layers.
//!
//! Branch paths are walked from each branching point up to the next
//! bifurcation and extruded as tubes with hemisphere caps. Before extrusion,
//! branch centers are treated as spheres and nudged out of the model using
//! per-layer line trees over the collision outline, with Laplacian smoothing
//! along the branch; afterwards the combined mesh is sliced back into
//! per-layer polygons.

use crate::clipper;
use crate::error::{CancellationToken, TreeSupportError};
use crate::geometry::{ExPolygons, LineF, LineTree2D, Point3F, PointF};
use crate::mesh::{slice_mesh, TriangleMesh};
use crate::support::draw_classic::{build_linear_data, DrawArea};
use crate::support::settings::{SupportElements, TreeSupportSettings};
use crate::volumes::TreeModelVolumes;
use crate::{unscale, CoordF};

/// Chord error of the tube discretization, millimeters.
const DISCRETIZATION_EPS: CoordF = 0.015;

/// Extra clearance left after resolving a collision, millimeters.
const COLLISION_EXTRA_GAP: CoordF = 0.1;

/// Largest single collision-avoidance nudge, millimeters.
const MAX_NUDGE_COLLISION_AVOIDANCE: CoordF = 0.5;

/// Largest single smoothing nudge, millimeters.
const MAX_NUDGE_SMOOTHING: CoordF = 0.2;

/// Laplacian smoothing blend factor.
const SMOOTHING_FACTOR: CoordF = 0.5;

/// Iteration cap of the nudging loop.
const NUM_ITER: usize = 100;

/// A branch center treated as a sphere during nudging.
#[derive(Debug, Clone)]
struct CollisionSphere {
    element: (usize, usize),
    /// Index of the linked element in the layer below, if any.
    element_below: Option<usize>,
    /// Tips and roots do not move.
    locked: bool,
    radius: CoordF,
    position: Point3F,
    prev_position: Point3F,
    min_z: CoordF,
    max_z: CoordF,
    layer_begin: usize,
    layer_end: usize,
}

fn layer_z(config: &TreeSupportSettings, layer_idx: usize) -> CoordF {
    unscale(config.get_actual_z(layer_idx))
}

/// Nudge branch centers out of the model and smooth them along the branch.
/// Returns the number of iterations used.
pub fn organic_smooth_branches_avoid_collisions(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    move_bounds: &mut [SupportElements],
    linear_data: &[DrawArea],
    linear_data_layers: &[usize],
    cancel: &CancellationToken,
) -> Result<usize, TreeSupportError> {
    let num_layers = move_bounds.len();

    // Per-layer line trees over the model collision outline.
    let mut layer_trees: Vec<LineTree2D> = Vec::with_capacity(num_layers);
    for layer_idx in 0..num_layers {
        cancel.check()?;
        let collision = volumes.get_collision(0, layer_idx, false);
        let mut lines: Vec<LineF> = Vec::new();
        for ex in collision.iter() {
            for ring in std::iter::once(&ex.contour).chain(ex.holes.iter()) {
                let points = ring.points();
                for i in 0..points.len() {
                    lines.push(LineF::new(
                        points[i].to_f64(),
                        points[(i + 1) % points.len()].to_f64(),
                    ));
                }
            }
        }
        layer_trees.push(LineTree2D::build(lines));
    }

    let layer_height_mm = unscale(config.layer_height);
    let z0 = layer_z(config, 0);
    let layer_idx_ceil =
        |z: CoordF| (((z - z0) / layer_height_mm).ceil().max(0.0) as usize).min(num_layers - 1);
    let layer_idx_floor =
        |z: CoordF| (((z - z0) / layer_height_mm).floor().max(0.0) as usize).min(num_layers - 1);

    // Build the spheres in linear (bottom-up) order so a child's bounds are
    // final before its parents read them.
    let mut spheres: Vec<CollisionSphere> = Vec::with_capacity(linear_data.len());
    for draw_area in linear_data {
        let (layer_idx, elem_idx) = draw_area.element;
        let element = &move_bounds[layer_idx][elem_idx];
        let Some(anchor) = element.state.result_on_layer else {
            // Keep indices aligned; an unanchored element never moves.
            spheres.push(CollisionSphere {
                element: draw_area.element,
                element_below: None,
                locked: true,
                radius: 0.0,
                position: Point3F::default(),
                prev_position: Point3F::default(),
                min_z: 0.0,
                max_z: 0.0,
                layer_begin: 0,
                layer_end: 0,
            });
            continue;
        };
        let position = Point3F::new(
            unscale(anchor.x),
            unscale(anchor.y),
            layer_z(config, layer_idx),
        );
        let min_z = match draw_area.child {
            Some(child_idx) => spheres[linear_data_layers[layer_idx - 1] + child_idx].min_z,
            None => position.z,
        };
        spheres.push(CollisionSphere {
            element: draw_area.element,
            element_below: draw_area.child,
            // Tips, plate contacts and roots stay where placement put them.
            locked: element.parents.is_empty() || layer_idx == 0 || draw_area.child.is_none(),
            radius: unscale(config.get_radius_state(&element.state)),
            position,
            prev_position: position,
            min_z,
            max_z: CoordF::MAX,
            layer_begin: 0,
            layer_end: 0,
        });
    }
    // max_z flows from the tips downward.
    for sphere_id in (0..spheres.len()).rev() {
        let (layer_idx, elem_idx) = spheres[sphere_id].element;
        let parents = move_bounds[layer_idx][elem_idx].parents.clone();
        if parents.is_empty() {
            spheres[sphere_id].max_z = spheres[sphere_id].position.z;
        } else {
            let offset_above = linear_data_layers[layer_idx + 1];
            let mut max_z = CoordF::MAX;
            for parent_idx in parents {
                max_z = max_z.min(spheres[offset_above + parent_idx as usize].max_z);
            }
            spheres[sphere_id].max_z = max_z;
        }
    }
    for sphere in &mut spheres {
        sphere.min_z = sphere.min_z.max(sphere.position.z - sphere.radius);
        sphere.max_z = sphere.max_z.min(sphere.position.z + sphere.radius);
        let (layer_idx, _) = sphere.element;
        sphere.layer_begin = layer_idx.min(layer_idx_ceil(sphere.min_z));
        sphere.layer_end = (layer_idx.max(layer_idx_floor(sphere.max_z)) + 1).min(num_layers);
    }
    cancel.check()?;

    let mut iterations = 0;
    for _ in 0..NUM_ITER {
        iterations += 1;
        for sphere in &mut spheres {
            sphere.prev_position = sphere.position;
        }
        let mut num_moved = 0usize;

        for sphere_id in 0..spheres.len() {
            if spheres[sphere_id].locked {
                continue;
            }
            // Deepest penetration of the sphere across all layers it spans.
            let mut last_collision_depth = -CoordF::MAX;
            let mut last_collision: Option<PointF> = None;
            {
                let sphere = &spheres[sphere_id];
                for layer_id in sphere.layer_begin..sphere.layer_end {
                    let dz = layer_z(config, layer_id) - sphere.position.z;
                    let r2 = sphere.radius * sphere.radius - dz * dz;
                    if r2 <= 0.0 {
                        continue;
                    }
                    let tree = &layer_trees[layer_id];
                    if tree.is_empty() {
                        continue;
                    }
                    if let Some((dist, hit)) = tree.closest_point(sphere.position.to_2d()) {
                        let collision_depth = r2.sqrt() - dist;
                        if collision_depth > last_collision_depth {
                            last_collision_depth = collision_depth;
                            last_collision = Some(hit);
                        }
                    }
                }
            }
            if last_collision_depth > 0.0 {
                if last_collision_depth > 1e-6 {
                    num_moved += 1;
                }
                if let Some(hit) = last_collision {
                    let sphere = &mut spheres[sphere_id];
                    let nudge_dist = (last_collision_depth + COLLISION_EXTRA_GAP)
                        .clamp(0.0, MAX_NUDGE_COLLISION_AVOIDANCE);
                    let away = (sphere.position.to_2d() - hit).normalize();
                    sphere.position.x += away.x * nudge_dist;
                    sphere.position.y += away.y * nudge_dist;
                }
            }

            // Laplacian smoothing toward parents and child, weighted by the
            // branch radius.
            let (layer_idx, elem_idx) = spheres[sphere_id].element;
            let parents = &move_bounds[layer_idx][elem_idx].parents;
            let mut avg = PointF::default();
            let mut weight: CoordF = 0.0;
            let offset_above = linear_data_layers
                .get(layer_idx + 1)
                .copied()
                .unwrap_or(usize::MAX);
            for &parent_idx in parents {
                let w = spheres[sphere_id].radius;
                let parent_prev = spheres[offset_above + parent_idx as usize].prev_position;
                avg.x += w * parent_prev.x;
                avg.y += w * parent_prev.y;
                weight += w;
            }
            if let Some(below_idx) = spheres[sphere_id].element_below {
                let offset_below = linear_data_layers[layer_idx - 1];
                let w = weight;
                let below_prev = spheres[offset_below + below_idx].prev_position;
                avg.x += w * below_prev.x;
                avg.y += w * below_prev.y;
                weight += w;
            }
            if weight > 0.0 {
                avg.x /= weight;
                avg.y /= weight;
                let sphere = &mut spheres[sphere_id];
                let old = sphere.position.to_2d();
                let target =
                    old * (1.0 - SMOOTHING_FACTOR) + avg * SMOOTHING_FACTOR;
                let shift = target - old;
                let nudge = shift.length().min(MAX_NUDGE_SMOOTHING);
                let dir = shift.normalize();
                sphere.position.x += dir.x * nudge;
                sphere.position.y += dir.y * nudge;
            }
        }
        cancel.check()?;
        if num_moved == 0 {
            break;
        }
    }

    for sphere in &spheres {
        let (layer_idx, elem_idx) = sphere.element;
        if move_bounds[layer_idx][elem_idx].state.result_on_layer_is_set() {
            move_bounds[layer_idx][elem_idx].state.result_on_layer = Some(
                PointF::new(sphere.position.x, sphere.position.y).to_scaled(),
            );
        }
    }
    Ok(iterations)
}

/// Discretize a 3D circle and append its vertices; returns the index range.
fn discretize_circle(
    mesh: &mut TriangleMesh,
    center: Point3F,
    normal: Point3F,
    radius: CoordF,
    eps: CoordF,
) -> (usize, usize) {
    let angle_step = if radius > eps {
        2.0 * (1.0 - eps / radius).acos()
    } else {
        std::f64::consts::FRAC_PI_2
    };
    let nsteps = ((2.0 * std::f64::consts::PI / angle_step).ceil() as usize).clamp(8, 180);
    let angle_step = 2.0 * std::f64::consts::PI / nsteps as CoordF;

    // Orthonormal basis of the circle plane.
    let reference = if normal.y.abs() < 0.999 {
        Point3F::new(0.0, -1.0, 0.0)
    } else {
        Point3F::new(1.0, 0.0, 0.0)
    };
    let x = normal.cross(&reference).normalize() * radius;
    let y = normal.cross(&normal.cross(&reference).normalize()).normalize() * radius;

    let begin = mesh.vertex_count();
    let mut angle: CoordF = 0.0;
    for _ in 0..nsteps {
        mesh.add_vertex(center + x * angle.cos() + y * angle.sin());
        angle += angle_step;
    }
    (begin, mesh.vertex_count())
}

/// Fan from a pole vertex to a ring.
fn triangulate_fan(mesh: &mut TriangleMesh, flip: bool, ifan: usize, begin: usize, end: usize) {
    let n = end - begin;
    if n < 3 {
        return;
    }
    let mut u = end - 1;
    for v in begin..end {
        if flip {
            mesh.add_triangle(ifan as u32, u as u32, v as u32);
        } else {
            mesh.add_triangle(ifan as u32, v as u32, u as u32);
        }
        u = v;
    }
}

/// Zig-zag triangulation between two rings, always taking the shorter
/// connection.
fn triangulate_strip(
    mesh: &mut TriangleMesh,
    begin1: usize,
    end1: usize,
    begin2: usize,
    end2: usize,
) {
    let mut n1 = end1 - begin1;
    let mut n2 = end2 - begin2;
    if n1 < 3 || n2 < 3 {
        return;
    }

    // Start from the closest vertex pairing.
    let p1 = mesh.vertex(begin1 as u32);
    let mut istart2 = begin2;
    let mut d2min = CoordF::MAX;
    for i in begin2..end2 {
        let d2 = mesh.vertex(i as u32).distance_squared(&p1);
        if d2 < d2min {
            d2min = d2;
            istart2 = i;
        }
    }

    let mut u = begin1;
    let mut v = istart2;
    while n1 > 0 || n2 > 0 {
        let u2 = if u + 1 == end1 { begin1 } else { u + 1 };
        let v2 = if v + 1 == end2 { begin2 } else { v + 1 };
        let take_first = if n1 == 0 {
            false
        } else if n2 == 0 {
            true
        } else {
            let l1 = mesh.vertex(u2 as u32).distance_squared(&mesh.vertex(v as u32));
            let l2 = mesh.vertex(v2 as u32).distance_squared(&mesh.vertex(u as u32));
            l1 < l2
        };
        if take_first {
            mesh.add_triangle(u as u32, u2 as u32, v as u32);
            n1 -= 1;
            u = u2;
        } else {
            mesh.add_triangle(u as u32, v2 as u32, v as u32);
            n2 -= 1;
            v = v2;
        }
    }
}

/// Extrude one branch path, bottom to top, into the mesh.
fn extrude_branch(
    path: &[(usize, usize)],
    config: &TreeSupportSettings,
    move_bounds: &[SupportElements],
    result: &mut TriangleMesh,
) {
    debug_assert!(path.len() >= 2);
    let eps = DISCRETIZATION_EPS;
    let position_of = |(layer_idx, elem_idx): (usize, usize)| -> Option<(Point3F, CoordF)> {
        let element = &move_bounds[layer_idx][elem_idx];
        let anchor = element.state.result_on_layer?;
        Some((
            Point3F::new(
                unscale(anchor.x),
                unscale(anchor.y),
                layer_z(config, layer_idx),
            ),
            unscale(config.get_radius_state(&element.state)),
        ))
    };

    let mut prev_strip: Option<(usize, usize)> = None;
    for ipath in 1..path.len() {
        let Some((p1, r1)) = position_of(path[ipath - 1]) else {
            return;
        };
        let Some((p2, r2)) = position_of(path[ipath]) else {
            return;
        };
        let v1 = (p2 - p1).normalize();

        if ipath == 1 {
            // Bottom hemisphere cap.
            let radius = r1;
            let angle_step = 2.0 * (1.0 - (eps / radius).min(1.0)).acos();
            let nsteps = ((std::f64::consts::FRAC_PI_2) / angle_step.max(1e-3)).ceil() as usize;
            let angle_step = std::f64::consts::FRAC_PI_2 / nsteps.max(1) as CoordF;
            let ifan = result.vertex_count();
            result.add_vertex(p1 - v1 * radius);
            let mut angle = angle_step;
            for i in 1..nsteps.max(2) {
                let strip = discretize_circle(
                    result,
                    p1 - v1 * (radius * angle.cos()),
                    v1,
                    radius * angle.sin(),
                    eps,
                );
                if i == 1 {
                    triangulate_fan(result, false, ifan, strip.0, strip.1);
                } else if let Some(prev) = prev_strip {
                    triangulate_strip(result, prev.0, prev.1, strip.0, strip.1);
                }
                prev_strip = Some(strip);
                angle += angle_step;
            }
        }
        if ipath + 1 == path.len() {
            // Top hemisphere cap.
            let radius = r2;
            let angle_step = 2.0 * (1.0 - (eps / radius).min(1.0)).acos();
            let nsteps = ((std::f64::consts::FRAC_PI_2) / angle_step.max(1e-3)).ceil() as usize;
            let angle_step = std::f64::consts::FRAC_PI_2 / nsteps.max(1) as CoordF;
            let mut angle = std::f64::consts::FRAC_PI_2;
            for _ in 0..nsteps.max(1) {
                let circle_radius = radius * angle.sin();
                if circle_radius > 1e-3 {
                    let strip = discretize_circle(
                        result,
                        p2 + v1 * (radius * angle.cos()),
                        v1,
                        circle_radius,
                        eps,
                    );
                    if let Some(prev) = prev_strip {
                        triangulate_strip(result, prev.0, prev.1, strip.0, strip.1);
                    }
                    prev_strip = Some(strip);
                }
                angle -= angle_step;
            }
            let ifan = result.vertex_count();
            result.add_vertex(p2 + v1 * radius);
            if let Some(prev) = prev_strip {
                triangulate_fan(result, true, ifan, prev.0, prev.1);
            }
        } else {
            // Interior cross-section whose normal bisects the path bend.
            let Some((p3, _)) = position_of(path[ipath + 1]) else {
                return;
            };
            let v2 = (p3 - p2).normalize();
            let ncurrent = (v1 + v2).normalize();
            let strip = discretize_circle(result, p2, ncurrent, r2, eps);
            if let Some(prev) = prev_strip {
                triangulate_strip(result, prev.0, prev.1, strip.0, strip.1);
            }
            prev_strip = Some(strip);
        }
    }
}

/// Traverse all branches and produce the combined tube mesh.
pub fn draw_branches(
    config: &TreeSupportSettings,
    move_bounds: &mut [SupportElements],
    cancel: &CancellationToken,
) -> Result<TriangleMesh, TreeSupportError> {
    for layer in move_bounds.iter_mut() {
        for element in layer.iter_mut() {
            element.state.marked = false;
        }
    }

    let mut cumulative_mesh = TriangleMesh::new();
    for layer_idx in 0..move_bounds.len().saturating_sub(1) {
        cancel.check()?;
        for start_idx in 0..move_bounds[layer_idx].len() {
            let start = &move_bounds[layer_idx][start_idx];
            if start.state.marked || start.parents.is_empty() {
                continue;
            }
            move_bounds[layer_idx][start_idx].state.marked = true;
            let parents = move_bounds[layer_idx][start_idx].parents.clone();
            for parent_idx in parents {
                // Collect the chain up to the next bifurcation (exclusive).
                let mut path: Vec<(usize, usize)> = vec![(layer_idx, start_idx)];
                let mut cursor = (layer_idx + 1, parent_idx as usize);
                path.push(cursor);
                loop {
                    let elem = &move_bounds[cursor.0][cursor.1];
                    if elem.parents.len() > 1 {
                        break;
                    }
                    move_bounds[cursor.0][cursor.1].state.marked = true;
                    let elem = &move_bounds[cursor.0][cursor.1];
                    if elem.parents.is_empty() || cursor.0 + 1 >= move_bounds.len() {
                        break;
                    }
                    cursor = (cursor.0 + 1, elem.parents[0] as usize);
                    path.push(cursor);
                }
                let mut partial_mesh = TriangleMesh::new();
                extrude_branch(&path, config, move_bounds, &mut partial_mesh);
                cumulative_mesh.merge(&partial_mesh);
            }
        }
    }
    Ok(cumulative_mesh)
}

/// Slice the tube mesh back into per-layer support polygons, trimmed against
/// the model.
pub fn slice_branches(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    move_bounds: &[SupportElements],
    cumulative_mesh: &TriangleMesh,
    cancel: &CancellationToken,
) -> Result<Vec<ExPolygons>, TreeSupportError> {
    let mut slice_z: Vec<CoordF> = (0..move_bounds.len())
        .map(|layer_idx| layer_z(config, layer_idx) - unscale(config.layer_height) * 0.5)
        .collect();
    while !slice_z.is_empty() && move_bounds[slice_z.len() - 1].is_empty() {
        slice_z.pop();
    }

    let slices = slice_mesh(cumulative_mesh, &slice_z, config.settings.slice_closing_radius);
    let mut support_layer_storage: Vec<ExPolygons> = vec![Vec::new(); move_bounds.len()];
    for (layer_idx, layer_slices) in slices.into_iter().enumerate() {
        cancel.check()?;
        if layer_slices.is_empty() {
            continue;
        }
        support_layer_storage[layer_idx] =
            clipper::difference(&layer_slices, &volumes.get_collision(0, layer_idx, true));
    }
    Ok(support_layer_storage)
}

/// Full organic pipeline: smooth, extrude, slice. Returns per-layer body
/// polygons.
pub fn draw_branches_and_slice(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    move_bounds: &mut [SupportElements],
    cancel: &CancellationToken,
) -> Result<Vec<ExPolygons>, TreeSupportError> {
    let (linear_data, linear_data_layers) = build_linear_data(move_bounds);
    organic_smooth_branches_avoid_collisions(
        volumes,
        config,
        move_bounds,
        &linear_data,
        &linear_data_layers,
        cancel,
    )?;
    let mesh = draw_branches(config, move_bounds, cancel)?;
    slice_branches(volumes, config, move_bounds, &mesh, cancel)
}
