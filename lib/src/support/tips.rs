//! Tip placement: turning overhangs into the initial influence areas.
//!
//! Tips are inserted `z_distance_top_layers + 1` layers below the overhang
//! they support. Large overhang regions first receive roof interface layers,
//! walked downward until the region becomes too small; the remaining regions
//! are sampled into points along support fill lines, each point classified
//! against the volumes and emitted as a seed [`SupportElement`].

use crate::clipper::{self, OffsetJoinType};
use crate::error::{CancellationToken, TreeSupportError};
use crate::geometry::{ExPolygon, ExPolygons, Point, PointF, Polygon, Polyline, Polylines};
use crate::support::propagation::safe_offset_inc;
use crate::support::settings::{
    LineStatus, SupportElement, SupportElementState, SupportElements, TreeSupportSettings,
    TINY_AREA_THRESHOLD, TREE_CIRCLE_RESOLUTION,
};
use crate::volumes::{AvoidanceType, TreeModelVolumes};
use crate::{div_ceil_coord, scale, Coord, CoordF};
use std::collections::HashSet;
use std::sync::Mutex;

/// Radius of the seed influence circle placed at every tip.
const BASE_RADIUS: Coord = 10_000; // 0.01 mm

/// A sampled point and where its branch can end up.
pub type LineInformation = Vec<(Point, LineStatus)>;
pub type LineInformations = Vec<LineInformation>;

/// Roof areas deposited per layer while tips are generated, merged by the
/// finalizer. Writers append under the lock.
pub type TopContacts = Mutex<Vec<ExPolygons>>;

/// Generate evenly spaced support fill lines inside `area`.
///
/// A plain parallel-line pattern: the roof pattern rotates with the layer so
/// stacked interfaces cross, the tip pattern is stable so branches line up.
pub fn generate_support_infill_lines(
    area: &ExPolygons,
    roof: bool,
    layer_idx: usize,
    line_distance: Coord,
    config: &TreeSupportSettings,
) -> Polylines {
    if area.is_empty() || line_distance <= 0 {
        return Vec::new();
    }
    let angle_deg = if roof {
        let angles = &config.settings.support_roof_angles;
        let base = if angles.is_empty() {
            0.0
        } else {
            angles[layer_idx % angles.len()]
        };
        base + if layer_idx % 2 == 1 { -45.0 } else { 45.0 }
    } else {
        0.0
    };
    let angle = angle_deg.to_radians();
    let dir = PointF::new(angle.cos(), angle.sin());
    let normal = PointF::new(-dir.y, dir.x);

    let mut bbox = crate::geometry::BoundingBox::new();
    for ex in area {
        bbox.merge(&ex.bounding_box());
    }
    if !bbox.is_defined() {
        return Vec::new();
    }
    let center = bbox.center().to_f64();
    let half_diag = bbox.min.to_f64().distance(&bbox.max.to_f64()) / 2.0 + 1.0;
    let spacing = crate::unscale(line_distance);
    let num_lines = (2.0 * half_diag / spacing).ceil() as i64 + 1;
    // Half-spacing shift keeps tip lines off region boundaries.
    let shift = if roof { 0.0 } else { spacing / 2.0 };

    let mut out = Vec::new();
    for i in -num_lines / 2..=num_lines / 2 {
        let offset = i as CoordF * spacing + shift;
        let base = center + normal * offset;
        let a = base - dir * half_diag;
        let b = base + dir * half_diag;
        for (start, end) in clip_segment_to_expolygons(a.to_scaled(), b.to_scaled(), area) {
            out.push(Polyline::from_points(vec![start, end]));
        }
    }
    out
}

/// Clip segment `a`-`b` to the inside of `clip`, returning the kept pieces.
fn clip_segment_to_expolygons(a: Point, b: Point, clip: &[ExPolygon]) -> Vec<(Point, Point)> {
    let ab = b - a;
    let len2 = ab.length_squared();
    if len2 == 0 {
        return Vec::new();
    }

    // Parameters of all edge crossings along the segment.
    let mut ts: Vec<CoordF> = vec![0.0, 1.0];
    for ex in clip {
        for ring in std::iter::once(&ex.contour).chain(ex.holes.iter()) {
            let points = ring.points();
            for i in 0..points.len() {
                let c = points[i];
                let d = points[(i + 1) % points.len()];
                let r = ab;
                let s = d - c;
                let denom = r.cross(&s);
                if denom == 0 {
                    continue;
                }
                let ca = c - a;
                let t = ca.cross(&s) as CoordF / denom as CoordF;
                let u = ca.cross(&r) as CoordF / denom as CoordF;
                if (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u) {
                    ts.push(t);
                }
            }
        }
    }
    ts.sort_by(|x, y| x.partial_cmp(y).unwrap());
    ts.dedup_by(|x, y| (*x - *y).abs() < 1e-9);

    let point_at = |t: CoordF| {
        Point::new(
            a.x + (ab.x as CoordF * t).round() as Coord,
            a.y + (ab.y as CoordF * t).round() as Coord,
        )
    };
    let mut pieces = Vec::new();
    for w in ts.windows(2) {
        let mid = point_at((w[0] + w[1]) / 2.0);
        if clip.iter().any(|ex| ex.contains_point(&mid)) {
            let (p, q) = (point_at(w[0]), point_at(w[1]));
            if p != q {
                pieces.push((p, q));
            }
        }
    }
    pieces
}

/// Sample the next point at distance `dist` from `start_pt` along the
/// polyline, beginning on segment `start_idx`.
fn polyline_sample_next_point_at_distance(
    points: &[Point],
    start_pt: Point,
    start_idx: usize,
    dist: CoordF,
) -> Option<(Point, usize)> {
    let dist2 = dist * dist;
    let eps = scale(0.01) as CoordF;
    for i in start_idx + 1..points.len() {
        let p1 = points[i];
        if (p1.distance_squared(&start_pt) as CoordF) >= dist2 {
            // Segment end left the circle around start_pt; the crossing is on
            // this segment.
            let p0 = points[i - 1];
            let v = (p1 - p0).to_f64();
            let l2v = v.dot(&v);
            if l2v < eps * eps {
                let c = (p0 + p1) / 2;
                if (c.distance(&start_pt) - dist).abs() < eps {
                    return Some((c, i - 1));
                }
                continue;
            }
            let p0f = (start_pt - p0).to_f64();
            let foot = v * (p0f.dot(&v) / l2v);
            let l2_from_line = (p0f - foot).dot(&(p0f - foot));
            let l2_intersection = dist2 - l2_from_line;
            if l2_intersection > -1.0 {
                let l2_intersection = l2_intersection.max(0.0);
                if (v - foot).dot(&(v - foot)) >= l2_intersection {
                    let hit = foot + v * (l2_intersection / l2v).sqrt();
                    let p = Point::new(
                        p0.x + hit.x.round() as Coord,
                        p0.y + hit.y.round() as Coord,
                    );
                    return Some((p, i - 1));
                }
            }
        }
    }
    None
}

/// Resample polylines so points sit about `distance` apart, placing at least
/// `min_points` per part (reducing the spacing if needed).
///
/// Closed parts rotate their point order so the two most distant vertices
/// become the first and last samples; thin overhangs get their far ends
/// supported this way.
pub fn ensure_maximum_distance_polyline(
    input: &Polylines,
    distance: CoordF,
    min_points: usize,
) -> Polylines {
    let mut result = Vec::new();
    for part in input {
        if part.is_empty() {
            continue;
        }
        let mut points = part.points().to_vec();
        let length = part.length();
        let mut line: Vec<Point> = Vec::new();
        let mut current_distance = distance.max(scale(0.1) as CoordF);

        if length < 2.0 * distance && min_points <= 1 {
            // Opposite point of the start, halfway along.
            if let Some(p) = part.point_at_length(length / 2.0) {
                line.push(p);
            }
        } else {
            let mut optimal_end_index = points.len() - 1;
            if points.len() > 2 && points.first() == points.last() {
                let mut optimal_start_index = 0;
                let mut max_dist2: i128 = 0;
                for idx in 0..points.len() - 1 {
                    for inner_idx in 0..points.len() - 1 {
                        let d2 = points[idx].distance_squared(&points[inner_idx]);
                        if d2 > max_dist2 {
                            optimal_start_index = idx;
                            optimal_end_index = inner_idx;
                            max_dist2 = d2;
                        }
                    }
                }
                let open_len = points.len() - 1;
                points.truncate(open_len);
                points.rotate_left(optimal_start_index);
                points.push(points[0]);
                optimal_end_index =
                    (open_len + optimal_end_index - optimal_start_index) % open_len;
            }

            while line.len() < min_points && current_distance >= scale(0.1) as CoordF {
                line.clear();
                let mut current_point = points[0];
                line.push(points[0]);
                if min_points > 1
                    || points[0].distance(&points[optimal_end_index]) > current_distance
                {
                    line.push(points[optimal_end_index]);
                }
                let mut current_index = 0;
                let mut next_distance = current_distance;
                while let Some((candidate, seg_idx)) = polyline_sample_next_point_at_distance(
                    &points,
                    current_point,
                    current_index,
                    next_distance,
                ) {
                    let min_distance_to_existing = line
                        .iter()
                        .map(|p| p.distance(&candidate))
                        .fold(CoordF::MAX, CoordF::min);
                    if min_distance_to_existing >= current_distance {
                        line.push(candidate);
                        current_point = candidate;
                        current_index = seg_idx;
                        next_distance = current_distance;
                    } else {
                        if current_point == candidate {
                            // Fixpoint; overcompensate so the walk cannot stall.
                            if next_distance > 2.0 * current_distance {
                                break;
                            }
                            next_distance += current_distance;
                            continue;
                        }
                        next_distance = (current_distance - min_distance_to_existing)
                            .max(scale(0.1) as CoordF);
                        current_point = candidate;
                        current_index = seg_idx;
                    }
                }
                current_distance *= 0.9;
            }
        }
        result.push(Polyline::from_points(line));
    }
    result
}

/// Classify every polyline point by the avoidance it is currently valid in.
/// Invalid points split lines; they are dropped.
pub fn convert_lines_to_internal(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    polylines: &Polylines,
    layer_idx: usize,
) -> LineInformations {
    let min_xy_dist = config.has_min_xy_dist();
    let r0 = config.get_radius(0, 0.0);

    let mut result = Vec::new();
    for line in polylines {
        let mut res_line: LineInformation = Vec::new();
        for &p in line.points() {
            let status = if !contains(
                &volumes.get_avoidance(r0, layer_idx, AvoidanceType::FastSafe, false, min_xy_dist),
                p,
            ) {
                LineStatus::ToBuildPlateSafe
            } else if !contains(
                &volumes.get_avoidance(r0, layer_idx, AvoidanceType::Fast, false, min_xy_dist),
                p,
            ) {
                LineStatus::ToBuildPlate
            } else if config.support_rests_on_model
                && !contains(
                    &volumes.get_avoidance(
                        r0,
                        layer_idx,
                        AvoidanceType::FastSafe,
                        true,
                        min_xy_dist,
                    ),
                    p,
                )
            {
                LineStatus::ToModelGraciousSafe
            } else if config.support_rests_on_model
                && !contains(
                    &volumes.get_avoidance(r0, layer_idx, AvoidanceType::Fast, true, min_xy_dist),
                    p,
                )
            {
                LineStatus::ToModelGracious
            } else if config.support_rests_on_model
                && !contains(&volumes.get_collision(r0, layer_idx, min_xy_dist), p)
            {
                LineStatus::ToModel
            } else {
                LineStatus::Invalid
            };

            if status == LineStatus::Invalid {
                if !res_line.is_empty() {
                    result.push(std::mem::take(&mut res_line));
                }
            } else {
                res_line.push((p, status));
            }
        }
        if !res_line.is_empty() {
            result.push(res_line);
        }
    }
    result
}

fn convert_internal_to_lines(lines: &LineInformations) -> Polylines {
    lines
        .iter()
        .map(|line| Polyline::from_points(line.iter().map(|(p, _)| *p).collect()))
        .collect()
}

/// Whether a point, valid on `current_layer`, stays valid one layer below.
pub fn evaluate_point_for_next_layer(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    current_layer: usize,
    p: (Point, LineStatus),
) -> bool {
    let min_xy_dist = config.has_min_xy_dist();
    let r0 = config.get_radius(0, 0.0);
    let avoidance_type = if p.1 == LineStatus::ToBuildPlateSafe {
        AvoidanceType::FastSafe
    } else {
        AvoidanceType::Fast
    };
    if !contains(
        &volumes.get_avoidance(r0, current_layer - 1, avoidance_type, false, min_xy_dist),
        p.0,
    ) {
        return true;
    }
    if config.support_rests_on_model && !p.1.to_buildplate() {
        let forbidden = if p.1.gracious() {
            volumes.get_avoidance(
                r0,
                current_layer - 1,
                if p.1 == LineStatus::ToModelGraciousSafe {
                    AvoidanceType::FastSafe
                } else {
                    AvoidanceType::Fast
                },
                true,
                min_xy_dist,
            )
        } else {
            volumes.get_collision(r0, current_layer - 1, min_xy_dist)
        };
        return !contains(&forbidden, p.0);
    }
    false
}

/// Split lines into points that satisfy `evaluate` and points that do not,
/// preserving runs.
pub fn split_lines<F>(lines: &LineInformations, evaluate: F) -> (LineInformations, LineInformations)
where
    F: Fn(&(Point, LineStatus)) -> bool,
{
    let mut keep = Vec::new();
    let mut set_free = Vec::new();
    for line in lines {
        let mut current_keep = true;
        let mut resulting_line: LineInformation = Vec::new();
        for me in line {
            if evaluate(me) != current_keep {
                if !resulting_line.is_empty() {
                    if current_keep {
                        keep.push(std::mem::take(&mut resulting_line));
                    } else {
                        set_free.push(std::mem::take(&mut resulting_line));
                    }
                }
                current_keep = !current_keep;
            }
            resulting_line.push(*me);
        }
        if !resulting_line.is_empty() {
            if current_keep {
                keep.push(resulting_line);
            } else {
                set_free.push(resulting_line);
            }
        }
    }
    (keep, set_free)
}

fn contains(areas: &[ExPolygon], p: Point) -> bool {
    areas.iter().any(|ex| ex.contains_point(&p))
}

fn to_closed_polylines(areas: &[ExPolygon]) -> Polylines {
    let mut out = Vec::new();
    for ex in areas {
        out.push(ex.contour.to_closed_polyline());
        for hole in &ex.holes {
            out.push(hole.to_closed_polyline());
        }
    }
    out
}

struct TipGenerator<'a> {
    volumes: &'a TreeModelVolumes,
    config: &'a TreeSupportSettings,
    top_contacts: &'a TopContacts,
    /// Normalized positions already holding a tip, per insertion layer.
    already_inserted: Vec<Mutex<HashSet<(Coord, Coord)>>>,
    base_circle: Polygon,
    min_xy_dist: bool,
    force_tip_to_roof: bool,
}

impl<'a> TipGenerator<'a> {
    fn add_roof(&self, polygons: ExPolygons, layer_idx: usize) {
        if polygons.is_empty() {
            return;
        }
        let mut contacts = self.top_contacts.lock().unwrap();
        if contacts.len() <= layer_idx {
            contacts.resize(layer_idx + 1, Vec::new());
        }
        contacts[layer_idx].extend(polygons);
    }

    /// Seed one support element, unless an equivalent tip already exists.
    #[allow(clippy::too_many_arguments)]
    fn add_point_as_influence_area(
        &self,
        move_bounds: &mut [SupportElements],
        p: (Point, LineStatus),
        dtt: u32,
        insert_layer: usize,
        dont_move_until: u32,
        roof: bool,
        skip_ovalisation: bool,
    ) {
        let to_bp = p.1.to_buildplate();
        let gracious = p.1.gracious();
        let safe_radius = p.1.safe();
        if !self.config.support_rests_on_model && !to_bp {
            // Nothing below this point can hold a branch.
            return;
        }
        let normalize = (self.config.min_radius + 1) / 10;
        let hash_pos = (p.0.x / normalize.max(1), p.0.y / normalize.max(1));
        {
            let mut inserted = self.already_inserted[insert_layer].lock().unwrap();
            if !inserted.insert(hash_pos) {
                return;
            }
        }

        let state = SupportElementState {
            target_height: insert_layer,
            target_position: p.0,
            next_position: p.0,
            layer_idx: insert_layer,
            effective_radius_height: dtt,
            to_buildplate: to_bp,
            distance_to_top: dtt,
            result_on_layer: Some(p.0),
            to_model_gracious: gracious,
            use_min_xy_dist: self.min_xy_dist,
            supports_roof: roof,
            dont_move_until,
            can_use_safe_radius: safe_radius,
            missing_roof_layers: if self.force_tip_to_roof {
                dont_move_until
            } else {
                0
            },
            skip_ovalisation,
            ..Default::default()
        };
        let circle = ExPolygon::new(self.base_circle.translated(p.0));
        move_bounds[insert_layer].push(SupportElement::new(state, Vec::new(), vec![circle]));
    }

    /// Turn classified lines into tips, first trying to promote whole tips to
    /// small roofs for `roof_tip_layers` layers.
    fn add_lines_as_influence_areas(
        &self,
        move_bounds: &mut [SupportElements],
        mut lines: LineInformations,
        roof_tip_layers: usize,
        insert_layer_idx: usize,
        supports_roof: bool,
        dont_move_until: usize,
    ) {
        let mut dtt_roof_tip = 0usize;
        while dtt_roof_tip < roof_tip_layers && insert_layer_idx - dtt_roof_tip >= 1 {
            // Keep lines whose points survive one layer down; points that do
            // not are inserted as plain tips here.
            let (keep, set_free) = split_lines(&lines, |p| {
                evaluate_point_for_next_layer(
                    self.volumes,
                    self.config,
                    insert_layer_idx - dtt_roof_tip,
                    *p,
                )
            });
            lines = keep;
            for line in &set_free {
                for point_data in line {
                    self.add_point_as_influence_area(
                        move_bounds,
                        *point_data,
                        0,
                        insert_layer_idx - dtt_roof_tip,
                        (roof_tip_layers - dtt_roof_tip) as u32,
                        dtt_roof_tip != 0,
                        false,
                    );
                }
            }

            let mut added_roofs: ExPolygons = Vec::new();
            for line in &lines {
                for (p, _) in line {
                    added_roofs.push(ExPolygon::new(Polygon::circle(
                        *p,
                        self.config.min_radius,
                        TREE_CIRCLE_RESOLUTION,
                    )));
                }
            }
            self.add_roof(
                clipper::union_all(&added_roofs),
                insert_layer_idx - dtt_roof_tip,
            );
            dtt_roof_tip += 1;
        }

        for line in &lines {
            // A line of many tips is a simulated support pattern; ovalisation
            // would degrade those lines when the tip is as wide as one line.
            let disable_ovalisation = self.config.min_radius < 3 * self.config.support_line_width
                && roof_tip_layers == 0
                && dtt_roof_tip == 0
                && line.len() > 5;
            for point_data in line {
                self.add_point_as_influence_area(
                    move_bounds,
                    *point_data,
                    0,
                    insert_layer_idx - dtt_roof_tip,
                    dont_move_until.saturating_sub(dtt_roof_tip) as u32,
                    dtt_roof_tip != 0 || supports_roof,
                    disable_ovalisation,
                );
            }
        }
    }

    fn generate_lines(&self, area: &ExPolygons, roof: bool, layer_idx: usize) -> Polylines {
        let line_distance = if roof {
            self.config.support_roof_line_distance
        } else {
            self.config.support_tree_branch_distance
        };
        generate_support_infill_lines(area, roof, layer_idx, line_distance, self.config)
    }
}

/// Place tips (and their roofs) for every overhang layer.
pub fn generate_initial_areas(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    overhangs: &[ExPolygons],
    move_bounds: &mut Vec<SupportElements>,
    top_contacts: &TopContacts,
    cancel: &CancellationToken,
) -> Result<(), TreeSupportError> {
    let num_layers = move_bounds.len();
    let z_distance_delta = config.z_distance_top_layers + 1;
    if num_layers <= z_distance_delta {
        return Ok(());
    }
    let min_xy_dist = config.has_min_xy_dist();
    let support_roof_layers = config.support_roof_layers;
    let roof_enabled = config.roof_enabled;
    // A tip whose circle already exceeds the minimum roof area is drawn as
    // roof all the way.
    let force_tip_to_roof = roof_enabled
        && (config.min_radius as CoordF * config.min_radius as CoordF * std::f64::consts::PI)
            > config.minimum_roof_area;

    let connect_length = (config.support_line_width as CoordF * 100.0
        / config.settings.support_tree_top_rate)
        + (2 * config.min_radius - config.support_line_width).max(0) as CoordF;
    // How far along a circle one must walk for the sagitta to reach half a
    // line width; controls the outset step for large tips.
    let circle_length_to_half_linewidth_change =
        if config.min_radius < config.support_line_width {
            config.min_radius / 2
        } else {
            (((config.min_radius as CoordF).powi(2)
                - ((config.min_radius - config.support_line_width / 2) as CoordF).powi(2))
            .sqrt()) as Coord
        };
    let extra_outset = (config.min_radius - config.support_line_width / 2).max(0)
        + if min_xy_dist {
            config.support_line_width / 2
        } else {
            0
        };
    let max_overhang_speed = if config.settings.support_angle < 89.0 {
        scale(
            config.settings.support_angle.to_radians().tan()
                * crate::unscale(config.layer_height),
        )
        .max(1)
    } else {
        Coord::MAX / 4
    };
    // Past this lag, a point that still found no valid layer will not produce
    // a reasonable branch; the material cost stops being worth it.
    let max_overhang_insert_lag = if config.z_distance_top_layers > 0 {
        (div_ceil_coord(config.xy_distance, (max_overhang_speed / 2).max(1)).max(1) as usize)
            .max(2 * config.z_distance_top_layers)
    } else {
        0
    };

    let generator = TipGenerator {
        volumes,
        config,
        top_contacts,
        already_inserted: (0..num_layers).map(|_| Mutex::new(HashSet::new())).collect(),
        base_circle: Polygon::circle(Point::zero(), BASE_RADIUS, TREE_CIRCLE_RESOLUTION),
        min_xy_dist,
        force_tip_to_roof,
    };

    for layer_idx in 1..num_layers - z_distance_delta {
        cancel.check()?;
        let overhang_idx = layer_idx + z_distance_delta;
        let Some(overhang_raw) = overhangs.get(overhang_idx) else {
            continue;
        };
        if overhang_raw.is_empty() {
            continue;
        }

        // Least restrictive forbidden area on the insertion layer, padded so
        // points directly on its boundary stay out.
        let relevant_forbidden = {
            let raw = if config.support_rests_on_model {
                volumes.get_collision(config.get_radius(0, 0.0), layer_idx, min_xy_dist)
            } else {
                volumes.get_avoidance(
                    config.get_radius(0, 0.0),
                    layer_idx,
                    AvoidanceType::Fast,
                    false,
                    min_xy_dist,
                )
            };
            clipper::offset(&raw, scale(0.005), OffsetJoinType::Miter)
        };

        let mut overhang_regular = safe_offset_inc(
            overhang_raw,
            config.settings.support_offset,
            &relevant_forbidden,
            (config.min_radius as CoordF * 1.75) as Coord + config.xy_min_distance,
            0,
            1,
        );

        // Areas a support line half-width away from the placed tips would
        // already hold do not count as unsupported.
        let mut remaining_overhang = clipper::intersection(
            &clipper::difference(
                &if config.settings.support_offset == 0 {
                    overhang_raw.clone()
                } else {
                    clipper::offset(
                        &clipper::union_all(overhang_raw),
                        config.settings.support_offset,
                        OffsetJoinType::Miter,
                    )
                },
                &clipper::offset(
                    &clipper::union_all(&overhang_regular),
                    config.support_line_width / 2,
                    OffsetJoinType::Miter,
                ),
            ),
            &relevant_forbidden,
        );

        // Compensate for large tip radii: grow the supported area toward the
        // remaining overhang in small steps, as close to the original
        // overhang as the collision allows.
        let mut extra_total_offset_acc: Coord = 0;
        while !remaining_overhang.is_empty()
            && extra_total_offset_acc + config.support_line_width / 8 < extra_outset
        {
            let offset_current_step = if extra_total_offset_acc + 2 * config.support_line_width
                > config.min_radius
            {
                config.support_line_width / 8
            } else {
                circle_length_to_half_linewidth_change
            }
            .min(extra_outset - extra_total_offset_acc);
            extra_total_offset_acc += offset_current_step;

            let raw_collision = volumes.get_collision(0, layer_idx, true);
            let offset_step = config.xy_min_distance + config.support_line_width;
            remaining_overhang = clipper::difference(
                &remaining_overhang,
                &safe_offset_inc(
                    &overhang_regular,
                    (extra_total_offset_acc as CoordF * 1.5) as Coord,
                    &raw_collision,
                    offset_step,
                    0,
                    1,
                ),
            );
            overhang_regular = clipper::union(
                &overhang_regular,
                &clipper::difference(
                    &safe_offset_inc(
                        &remaining_overhang,
                        extra_total_offset_acc,
                        &raw_collision,
                        offset_step,
                        0,
                        1,
                    ),
                    &relevant_forbidden,
                ),
            );
        }

        // When Z overrides XY, points that cannot be placed here may still be
        // placed a few layers further down where the model has receded.
        if !min_xy_dist && !remaining_overhang.is_empty() {
            let mut overhang_lines: LineInformations = {
                let mut polylines = ensure_maximum_distance_polyline(
                    &generator.generate_lines(&remaining_overhang, false, layer_idx),
                    config.min_radius as CoordF,
                    1,
                );
                if polylines.len() <= 3 {
                    polylines = ensure_maximum_distance_polyline(
                        &to_closed_polylines(&remaining_overhang),
                        connect_length,
                        3,
                    );
                }
                polylines
                    .iter()
                    .map(|line| {
                        line.points()
                            .iter()
                            .map(|p| (*p, LineStatus::Invalid))
                            .collect()
                    })
                    .collect()
            };

            let mut lag_ctr = 1usize;
            while lag_ctr <= max_overhang_insert_lag
                && !overhang_lines.is_empty()
                && layer_idx > lag_ctr
            {
                let relevant_forbidden_below = if config.support_rests_on_model {
                    volumes.get_collision(
                        config.get_radius(0, 0.0),
                        layer_idx - lag_ctr,
                        min_xy_dist,
                    )
                } else {
                    volumes.get_avoidance(
                        config.get_radius(0, 0.0),
                        layer_idx - lag_ctr,
                        AvoidanceType::Fast,
                        false,
                        min_xy_dist,
                    )
                };
                let (still_invalid, now_valid) =
                    split_lines(&overhang_lines, |p| contains(&relevant_forbidden_below, p.0));
                overhang_lines = still_invalid;
                let fresh_valid_points = convert_lines_to_internal(
                    volumes,
                    config,
                    &convert_internal_to_lines(&now_valid),
                    layer_idx - lag_ctr,
                );
                generator.add_lines_as_influence_areas(
                    move_bounds,
                    fresh_valid_points,
                    if force_tip_to_roof && lag_ctr <= support_roof_layers {
                        support_roof_layers
                    } else {
                        0
                    },
                    layer_idx - lag_ctr,
                    false,
                    if roof_enabled { support_roof_layers } else { 0 },
                );
                lag_ctr += 1;
            }
        }

        cancel.check()?;

        // Split into roof-eligible regions and regular regions.
        let mut overhang_processing: Vec<(ExPolygon, bool)> = Vec::new();
        if roof_enabled {
            let mut overhang_roofs = safe_offset_inc(
                overhang_raw,
                0,
                &relevant_forbidden,
                config.min_radius * 2 + config.xy_min_distance,
                0,
                1,
            );
            clipper::remove_small(&mut overhang_roofs, config.minimum_roof_area);
            overhang_regular = clipper::difference(&overhang_regular, &overhang_roofs);
            for roof_part in clipper::union_all(&overhang_roofs) {
                overhang_processing.push((roof_part, true));
            }
        }
        if config.minimum_support_area > 0.0 {
            clipper::remove_small(&mut overhang_regular, config.minimum_support_area);
        }
        for support_part in clipper::union_all(&overhang_regular) {
            overhang_processing.push((support_part, false));
        }

        for (overhang_part, roof_allowed_for_this_part) in overhang_processing {
            let mut overhang_outset = vec![overhang_part];
            let min_support_points = ((crate::geometry::polygon::total_length(
                &crate::geometry::expolygon::to_polygons(&overhang_outset),
            ) / connect_length) as usize)
                .clamp(1, 3);
            let mut overhang_lines: LineInformations = Vec::new();
            let mut last_overhang = overhang_outset.clone();
            let mut dtt_roof = 0usize;
            let mut added_roofs: Vec<ExPolygons> = vec![Vec::new(); support_roof_layers];

            // Walk the roof downward, each layer clipped by the forbidden
            // area below, until it gets too small to work as a roof.
            if roof_allowed_for_this_part {
                while dtt_roof < support_roof_layers && layer_idx > dtt_roof {
                    let forbidden_next = {
                        let raw = if config.support_rests_on_model {
                            volumes.get_collision(
                                config.get_radius(0, 0.0),
                                layer_idx - (dtt_roof + 1),
                                min_xy_dist,
                            )
                        } else {
                            volumes.get_avoidance(
                                config.get_radius(0, 0.0),
                                layer_idx - (dtt_roof + 1),
                                AvoidanceType::Fast,
                                false,
                                min_xy_dist,
                            )
                        };
                        clipper::offset(&raw, scale(0.005), OffsetJoinType::Miter)
                    };
                    let overhang_outset_next =
                        clipper::difference(&overhang_outset, &forbidden_next);
                    if clipper::area(&overhang_outset_next) < config.minimum_roof_area {
                        // Next layer the roof would be too small; sample tips
                        // supporting the interface instead.
                        if dtt_roof != 0 {
                            let dtt_before = dtt_roof - 1;
                            overhang_lines = convert_lines_to_internal(
                                volumes,
                                config,
                                &ensure_maximum_distance_polyline(
                                    &generator.generate_lines(
                                        &last_overhang,
                                        true,
                                        layer_idx - dtt_before,
                                    ),
                                    connect_length,
                                    1,
                                ),
                                layer_idx - dtt_before,
                            );
                            overhang_lines = split_lines(&overhang_lines, |p| {
                                evaluate_point_for_next_layer(
                                    volumes,
                                    config,
                                    layer_idx - dtt_before,
                                    *p,
                                )
                            })
                            .0;
                        }
                        break;
                    }
                    added_roofs[dtt_roof] = overhang_outset.clone();
                    last_overhang = overhang_outset;
                    overhang_outset = overhang_outset_next;
                    dtt_roof += 1;
                }
            }

            let mut layer_generation_dtt = dtt_roof.max(1) - 1;
            // Not every roof area produces fill lines; roll dtt_roof back to
            // the highest layer that does, keeping the tips below it.
            if overhang_lines.is_empty()
                && dtt_roof != 0
                && generator
                    .generate_lines(&overhang_outset, true, layer_idx - layer_generation_dtt)
                    .is_empty()
            {
                for idx in 0..dtt_roof {
                    if generator
                        .generate_lines(&added_roofs[idx], true, layer_idx - idx)
                        .is_empty()
                    {
                        dtt_roof = idx;
                        layer_generation_dtt = dtt_roof.max(1) - 1;
                        break;
                    }
                }
            }

            for (idx, roofs) in added_roofs.iter_mut().enumerate().take(dtt_roof) {
                generator.add_roof(std::mem::take(roofs), layer_idx - idx);
            }

            if overhang_lines.is_empty() {
                let mut polylines = ensure_maximum_distance_polyline(
                    &generator.generate_lines(
                        &overhang_outset,
                        dtt_roof != 0,
                        layer_idx - layer_generation_dtt,
                    ),
                    if dtt_roof == 0 {
                        // Reduced spacing forms a proper line of tips where
                        // the tip diameter is the line width.
                        config.min_radius as CoordF / 2.0
                    } else {
                        connect_length
                    },
                    1,
                );
                let point_count: usize = polylines.iter().map(Polyline::len).sum();
                if point_count <= min_support_points {
                    // Too few points to trust the pattern; support the outer
                    // wall of the overhang directly instead.
                    let reduced_overhang_outset = clipper::offset(
                        &clipper::union_all(&overhang_outset),
                        -(config.support_line_width as CoordF / 2.2) as Coord,
                        OffsetJoinType::Miter,
                    );
                    let use_reduced = !reduced_overhang_outset.is_empty()
                        && clipper::area(&clipper::offset(
                            &clipper::difference(&overhang_outset, &reduced_overhang_outset),
                            config.support_line_width.max(connect_length as Coord),
                            OffsetJoinType::Miter,
                        )) < TINY_AREA_THRESHOLD;
                    polylines = ensure_maximum_distance_polyline(
                        &to_closed_polylines(if use_reduced {
                            &reduced_overhang_outset
                        } else {
                            &overhang_outset
                        }),
                        connect_length,
                        min_support_points,
                    );
                }
                overhang_lines =
                    convert_lines_to_internal(volumes, config, &polylines, layer_idx - dtt_roof);
            }

            if dtt_roof >= layer_idx && roof_allowed_for_this_part && !overhang_outset.is_empty() {
                // The roof walked all the way down; it rests on the plate.
                generator.add_roof(overhang_outset, 0);
            } else {
                generator.add_lines_as_influence_areas(
                    move_bounds,
                    overhang_lines,
                    if force_tip_to_roof {
                        support_roof_layers - dtt_roof
                    } else {
                        0
                    },
                    layer_idx - dtt_roof,
                    dtt_roof > 0,
                    if roof_enabled {
                        support_roof_layers - dtt_roof
                    } else {
                        0
                    },
                );
            }
            cancel.check()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volumes::TreeModelVolumesConfig;

    fn tower_volumes(layers: usize) -> TreeModelVolumes {
        let outline = vec![ExPolygon::rectangle(
            Point::new_scale(-5.0, -5.0),
            Point::new_scale(5.0, 5.0),
        )];
        TreeModelVolumes::new(TreeModelVolumesConfig::default(), vec![outline; layers])
    }

    fn empty_volumes(layers: usize) -> TreeModelVolumes {
        TreeModelVolumes::new(TreeModelVolumesConfig::default(), vec![Vec::new(); layers])
    }

    #[test]
    fn test_generate_support_infill_lines() {
        let area = vec![ExPolygon::rectangle(
            Point::new_scale(0.0, 0.0),
            Point::new_scale(20.0, 20.0),
        )];
        let config = TreeSupportSettings::default();
        let lines = generate_support_infill_lines(&area, false, 3, scale(2.0), &config);
        assert!(!lines.is_empty());
        // Everything stays inside the area.
        for line in &lines {
            for p in line.points() {
                assert!(area[0].contains_point(p));
            }
        }
        // Roughly bbox-width / spacing lines.
        assert!(lines.len() >= 8 && lines.len() <= 12, "got {}", lines.len());
    }

    #[test]
    fn test_infill_lines_respect_holes() {
        let area = clipper::difference(
            &[ExPolygon::rectangle(
                Point::new_scale(0.0, 0.0),
                Point::new_scale(20.0, 20.0),
            )],
            &[ExPolygon::rectangle(
                Point::new_scale(5.0, 5.0),
                Point::new_scale(15.0, 15.0),
            )],
        );
        let config = TreeSupportSettings::default();
        let lines = generate_support_infill_lines(&area, false, 0, scale(2.0), &config);
        for line in &lines {
            for p in line.points() {
                let inside_hole = p.x > scale(5.01)
                    && p.x < scale(14.99)
                    && p.y > scale(5.01)
                    && p.y < scale(14.99);
                assert!(!inside_hole, "line point {p:?} inside hole");
            }
        }
    }

    #[test]
    fn test_ensure_maximum_distance_polyline_spacing() {
        let line = Polyline::from_points(vec![
            Point::new_scale(0.0, 0.0),
            Point::new_scale(30.0, 0.0),
        ]);
        let sampled = ensure_maximum_distance_polyline(&[line], scale(5.0) as CoordF, 1);
        assert_eq!(sampled.len(), 1);
        let points = sampled[0].points();
        assert!(points.len() >= 5);
        for w in points.windows(2) {
            // Points were requested 5mm apart; allow the sampler's slack.
            assert!(w[0].distance(&w[1]) >= scale(4.0) as CoordF);
        }
    }

    #[test]
    fn test_ensure_maximum_distance_polyline_min_points() {
        let line = Polyline::from_points(vec![
            Point::new_scale(0.0, 0.0),
            Point::new_scale(2.0, 0.0),
        ]);
        let sampled = ensure_maximum_distance_polyline(&[line], scale(10.0) as CoordF, 3);
        // Spacing had to shrink until three points fit.
        assert!(sampled[0].len() >= 3);
    }

    #[test]
    fn test_ensure_maximum_distance_short_line_single_point() {
        let line = Polyline::from_points(vec![
            Point::new_scale(0.0, 0.0),
            Point::new_scale(1.0, 0.0),
        ]);
        let sampled = ensure_maximum_distance_polyline(&[line], scale(5.0) as CoordF, 1);
        assert_eq!(sampled[0].len(), 1);
        // The opposite point of the start: halfway.
        assert_eq!(sampled[0].points()[0], Point::new_scale(0.5, 0.0));
    }

    #[test]
    fn test_closed_polyline_endpoints_far_apart() {
        // A long thin closed loop; the two chosen ends must be the distant pair.
        let loop_points = vec![
            Point::new_scale(0.0, 0.0),
            Point::new_scale(30.0, 0.0),
            Point::new_scale(30.0, 1.0),
            Point::new_scale(0.0, 1.0),
            Point::new_scale(0.0, 0.0),
        ];
        let sampled = ensure_maximum_distance_polyline(
            &[Polyline::from_points(loop_points)],
            scale(8.0) as CoordF,
            2,
        );
        let points = sampled[0].points();
        let d = points[0].distance(&points[1]);
        assert!(d > scale(25.0) as CoordF, "endpoints too close: {d}");
    }

    #[test]
    fn test_convert_lines_classification() {
        let volumes = tower_volumes(6);
        let config = TreeSupportSettings::default();
        // A point far outside the model reaches the build plate safely.
        let far = Polyline::from_points(vec![Point::new_scale(40.0, 40.0)]);
        let informations = convert_lines_to_internal(&volumes, &config, &[far], 3);
        assert_eq!(informations.len(), 1);
        assert_eq!(informations[0][0].1, LineStatus::ToBuildPlateSafe);

        // A point inside the model is invalid and dropped.
        let inside = Polyline::from_points(vec![Point::new_scale(0.0, 0.0)]);
        let informations = convert_lines_to_internal(&volumes, &config, &[inside], 3);
        assert!(informations.is_empty());
    }

    #[test]
    fn test_classification_roundtrip_zero_layers() {
        // Re-classifying the surviving points yields the same statuses.
        let volumes = tower_volumes(6);
        let config = TreeSupportSettings::default();
        let line = Polyline::from_points(vec![
            Point::new_scale(40.0, 40.0),
            Point::new_scale(42.0, 40.0),
        ]);
        let first = convert_lines_to_internal(&volumes, &config, &[line], 3);
        let second =
            convert_lines_to_internal(&volumes, &config, &convert_internal_to_lines(&first), 3);
        assert_eq!(first, second);
    }

    #[test]
    fn test_split_lines_runs() {
        let line: LineInformation = vec![
            (Point::new(0, 0), LineStatus::ToBuildPlate),
            (Point::new(1, 0), LineStatus::ToBuildPlate),
            (Point::new(2, 0), LineStatus::ToModel),
            (Point::new(3, 0), LineStatus::ToBuildPlate),
        ];
        let (keep, set_free) = split_lines(&[line], |p| p.1 == LineStatus::ToBuildPlate);
        assert_eq!(keep.len(), 2);
        assert_eq!(set_free.len(), 1);
        assert_eq!(keep[0].len(), 2);
        assert_eq!(set_free[0][0].0, Point::new(2, 0));
    }

    #[test]
    fn test_generate_initial_areas_places_tips() {
        let volumes = empty_volumes(10);
        let mut group = crate::support::settings::TreeSupportMeshGroupSettings::default();
        group.support_roof_enable = false;
        let config = TreeSupportSettings::new(group);
        let mut move_bounds: Vec<SupportElements> = vec![Vec::new(); 10];
        let top_contacts: TopContacts = Mutex::new(vec![Vec::new(); 10]);
        // An overhang at layer 6; tips land z_distance_top_layers + 1 below.
        let mut overhangs = vec![Vec::new(); 10];
        overhangs[6] = vec![ExPolygon::rectangle(
            Point::new_scale(20.0, 0.0),
            Point::new_scale(30.0, 10.0),
        )];

        generate_initial_areas(
            &volumes,
            &config,
            &overhangs,
            &mut move_bounds,
            &top_contacts,
            &CancellationToken::new(),
        )
        .unwrap();

        let insert_layer = 6 - (config.z_distance_top_layers + 1);
        let total: usize = move_bounds.iter().map(Vec::len).sum();
        assert!(total > 0, "no tips were placed");
        assert!(
            !move_bounds[insert_layer].is_empty(),
            "tips not on the expected insertion layer"
        );
        for element in &move_bounds[insert_layer] {
            assert!(element.state.to_buildplate);
            assert!(element.state.result_on_layer_is_set());
            assert!(!element.influence_area.is_empty());
        }
    }

    #[test]
    fn test_roof_walk_deposits_interfaces_and_lowers_tips() {
        let volumes = empty_volumes(10);
        let config = TreeSupportSettings::default();
        assert!(config.roof_enabled);
        let mut move_bounds: Vec<SupportElements> = vec![Vec::new(); 10];
        let top_contacts: TopContacts = Mutex::new(vec![Vec::new(); 10]);
        let mut overhangs = vec![Vec::new(); 10];
        overhangs[6] = vec![ExPolygon::rectangle(
            Point::new_scale(20.0, 0.0),
            Point::new_scale(30.0, 10.0),
        )];

        generate_initial_areas(
            &volumes,
            &config,
            &overhangs,
            &mut move_bounds,
            &top_contacts,
            &CancellationToken::new(),
        )
        .unwrap();

        // The roof walked support_roof_layers down from the insertion layer;
        // the tips sit below the lowest roof.
        let insert_layer = 6 - (config.z_distance_top_layers + 1);
        let tip_layer = insert_layer - config.support_roof_layers;
        assert!(
            !move_bounds[tip_layer].is_empty(),
            "tips expected below the roof stack"
        );
        for element in &move_bounds[tip_layer] {
            assert!(element.state.supports_roof);
        }
        let contacts = top_contacts.lock().unwrap();
        for roof_layer in tip_layer + 1..=insert_layer {
            assert!(
                !contacts[roof_layer].is_empty(),
                "roof interface missing on layer {roof_layer}"
            );
        }
    }

    #[test]
    fn test_tip_dedup() {
        let volumes = empty_volumes(8);
        let config = TreeSupportSettings::default();
        let mut move_bounds: Vec<SupportElements> = vec![Vec::new(); 8];
        let top_contacts: TopContacts = Mutex::new(vec![Vec::new(); 8]);
        let generator = TipGenerator {
            volumes: &volumes,
            config: &config,
            top_contacts: &top_contacts,
            already_inserted: (0..8).map(|_| Mutex::new(HashSet::new())).collect(),
            base_circle: Polygon::circle(Point::zero(), BASE_RADIUS, TREE_CIRCLE_RESOLUTION),
            min_xy_dist: config.has_min_xy_dist(),
            force_tip_to_roof: false,
        };
        let p = (Point::new_scale(1.0, 1.0), LineStatus::ToBuildPlate);
        generator.add_point_as_influence_area(&mut move_bounds, p, 0, 3, 0, false, false);
        generator.add_point_as_influence_area(&mut move_bounds, p, 0, 3, 0, false, false);
        assert_eq!(move_bounds[3].len(), 1);
    }

    #[test]
    fn test_no_overhangs_no_tips() {
        let volumes = tower_volumes(8);
        let config = TreeSupportSettings::default();
        let mut move_bounds: Vec<SupportElements> = vec![Vec::new(); 8];
        let top_contacts: TopContacts = Mutex::new(vec![Vec::new(); 8]);
        generate_initial_areas(
            &volumes,
            &config,
            &vec![Vec::new(); 8],
            &mut move_bounds,
            &top_contacts,
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(move_bounds.iter().all(Vec::is_empty));
    }
}
