//! Configuration and per-element state for tree support generation.
//!
//! [`TreeSupportMeshGroupSettings`] carries the user-facing knobs;
//! [`TreeSupportSettings`] derives from it everything the pipeline reads in
//! hot loops (movement allowances, the radius schedule, layer counts).
//! [`SupportElementState`] is the per-branch, per-layer record that is
//! propagated downward.

use crate::geometry::Point;
use crate::{scale, unscale, Coord, CoordF};
use serde::{Deserialize, Serialize};

/// Vertex count of the circles branches are drawn with.
pub const TREE_CIRCLE_RESOLUTION: usize = 25;

/// Areas smaller than this (scaled units squared, about a 1 µm sliver) are
/// treated as empty; clipper attracts rounding errors near this size.
pub const TINY_AREA_THRESHOLD: CoordF = 1_000_000.0;

/// How support interfaces and the support body resolve their overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterfacePreference {
    /// Interface areas win; body is cut back.
    #[default]
    InterfaceAreaOverwritesSupport,
    /// Body wins; interface areas are cut back.
    SupportAreaOverwritesInterface,
    /// Recognized but resolved as [`InterfacePreference::Nothing`] here.
    InterfaceLinesOverwriteSupport,
    /// Recognized but resolved as [`InterfacePreference::Nothing`] here.
    SupportLinesOverwriteInterface,
    /// Leave both as they are.
    Nothing,
}

/// Support generation style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SupportStyle {
    /// Stacked circles and ellipses per layer.
    #[default]
    Tree,
    /// One smoothed tube mesh, re-sliced into layers.
    Organic,
}

/// User-facing settings for one mesh group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSupportMeshGroupSettings {
    /// Layer height in scaled units.
    pub layer_height: Coord,
    /// Polygon simplification tolerance.
    pub resolution: Coord,
    /// Smallest feature the printer can produce.
    pub min_feature_size: Coord,
    /// Overhang threshold angle in degrees; 90 disables automatic support.
    pub support_angle: f64,
    /// Automatic support placement. When false only enforcers produce tips.
    pub support_auto: bool,
    /// Support everything on the lowest N layers regardless of the threshold.
    pub support_enforce_layers: usize,
    /// Skip support under bridgeable regions.
    pub dont_support_bridges: bool,
    pub support_line_width: Coord,
    pub support_roof_line_width: Coord,
    /// Whether a dense bottom interface is generated where supports rest on
    /// the model.
    pub support_bottom_enable: bool,
    /// Height of the bottom interface stack.
    pub support_bottom_height: Coord,
    /// Outward offset applied to the base when sampling bottom contacts.
    pub support_bottom_offset: Coord,
    pub support_material_buildplate_only: bool,
    /// XY clearance between support and model.
    pub support_xy_distance: Coord,
    /// Tighter XY clearance directly below overhangs (Z overrides XY).
    pub support_xy_distance_overhang: Coord,
    /// Z clearance above the support top.
    pub support_top_distance: Coord,
    /// Z clearance below the support bottom.
    pub support_bottom_distance: Coord,
    pub support_roof_enable: bool,
    /// Number of roof interface layers.
    pub support_roof_layers: usize,
    /// Minimum area for a roof region, scaled units squared.
    pub minimum_roof_area: CoordF,
    /// Minimum area for a support region, scaled units squared.
    pub minimum_support_area: CoordF,
    /// Fill angles used for roof line generation, degrees.
    pub support_roof_angles: Vec<f64>,
    pub support_roof_line_distance: Coord,
    /// Outward offset applied to overhangs before tip placement.
    pub support_offset: Coord,
    /// Branch slope angle, degrees from vertical.
    pub support_tree_angle: f64,
    /// Slope used when the branch prefers to stay close, degrees.
    pub support_tree_angle_slow: f64,
    /// Spacing of support tips along sampled lines.
    pub support_tree_branch_distance: Coord,
    pub support_tree_branch_diameter: Coord,
    /// Radius growth toward the build plate, degrees.
    pub support_tree_branch_diameter_angle: f64,
    /// Cap on radius gained by absorbing to-model branches.
    pub support_tree_max_diameter_increase_by_merges_when_support_to_model: Coord,
    /// Branches shorter than this must not rest on the model.
    pub support_tree_min_height_to_model: Coord,
    /// Trunk diameter at the build plate after the foot flare.
    pub support_tree_bp_diameter: Coord,
    /// Tip density: percentage controlling the sampled point spacing.
    pub support_tree_top_rate: f64,
    pub support_tree_tip_diameter: Coord,
    /// Interface versus body overlap policy.
    pub interface_preference: InterfacePreference,
    /// Sample stride when accumulating bottom interface layers.
    pub performance_interface_skip_layers: usize,
    /// Closing radius applied when re-slicing the organic tube mesh.
    pub slice_closing_radius: Coord,
}

impl Default for TreeSupportMeshGroupSettings {
    fn default() -> Self {
        Self {
            layer_height: scale(0.2),
            resolution: scale(0.025),
            min_feature_size: scale(0.1),
            support_angle: 45.0,
            support_auto: true,
            support_enforce_layers: 0,
            dont_support_bridges: true,
            support_line_width: scale(0.4),
            support_roof_line_width: scale(0.4),
            support_bottom_enable: false,
            support_bottom_height: scale(0.4),
            support_bottom_offset: 0,
            support_material_buildplate_only: false,
            support_xy_distance: scale(0.8),
            support_xy_distance_overhang: scale(0.4),
            support_top_distance: scale(0.2),
            support_bottom_distance: scale(0.2),
            support_roof_enable: true,
            support_roof_layers: 3,
            minimum_roof_area: scale(1.0) as CoordF * scale(1.0) as CoordF,
            minimum_support_area: 0.0,
            support_roof_angles: vec![0.0],
            support_roof_line_distance: scale(0.4),
            support_offset: 0,
            support_tree_angle: 40.0,
            support_tree_angle_slow: 25.0,
            support_tree_branch_distance: scale(1.0),
            support_tree_branch_diameter: scale(2.0),
            support_tree_branch_diameter_angle: 5.0,
            support_tree_max_diameter_increase_by_merges_when_support_to_model: scale(1.0),
            support_tree_min_height_to_model: scale(1.0),
            support_tree_bp_diameter: scale(7.5),
            support_tree_top_rate: 15.0,
            support_tree_tip_diameter: scale(0.8),
            interface_preference: InterfacePreference::default(),
            performance_interface_skip_layers: 1,
            slice_closing_radius: scale(0.049),
        }
    }
}

/// Derived settings used throughout generation.
#[derive(Debug, Clone)]
pub struct TreeSupportSettings {
    /// Branch slope in radians.
    pub angle: f64,
    /// Slow branch slope in radians.
    pub angle_slow: f64,
    pub layer_height: Coord,
    /// Print Z per layer, set from the sliced object.
    pub known_z: Vec<Coord>,
    pub support_line_width: Coord,
    pub support_roof_line_width: Coord,
    pub branch_radius: Coord,
    pub min_radius: Coord,
    pub bp_radius: Coord,
    pub maximum_move_distance: Coord,
    pub maximum_move_distance_slow: Coord,
    /// Layers a branch needs to grow from tip to full branch radius.
    pub tip_layers: usize,
    /// Radius gained per layer inside the tip region, scaled units.
    pub branch_radius_increase_per_layer: CoordF,
    /// Fraction of `branch_radius` the foot flare gains per layer.
    pub diameter_scale_bp_radius: f64,
    /// Highest layer where the foot flare may begin.
    pub layer_start_bp_radius: usize,
    pub max_to_model_radius_increase: Coord,
    /// Minimum distance-to-top before a branch may rest on the model.
    pub min_dtt_to_model: usize,
    pub increase_radius_until_radius: Coord,
    pub increase_radius_until_layer: usize,
    pub support_rests_on_model: bool,
    pub xy_distance: Coord,
    pub xy_min_distance: Coord,
    pub z_distance_top_layers: usize,
    pub z_distance_bottom_layers: usize,
    pub support_bottom_layers: usize,
    pub support_bottom_offset: Coord,
    pub performance_interface_skip_layers: usize,
    pub support_roof_layers: usize,
    pub roof_enabled: bool,
    pub minimum_roof_area: CoordF,
    pub minimum_support_area: CoordF,
    pub support_roof_line_distance: Coord,
    pub support_tree_branch_distance: Coord,
    pub interface_preference: InterfacePreference,
    pub resolution: Coord,
    pub min_feature_size: Coord,
    /// The group settings these were derived from.
    pub settings: TreeSupportMeshGroupSettings,
}

impl TreeSupportSettings {
    pub fn new(settings: TreeSupportMeshGroupSettings) -> Self {
        let angle = settings.support_tree_angle.to_radians();
        let angle_slow = settings.support_tree_angle_slow.to_radians();
        let layer_height_mm = unscale(settings.layer_height);

        // Near-vertical branch angles would make the step unbounded; 50mm per
        // layer is already far beyond anything printable.
        let maximum_move_distance = if settings.support_tree_angle < 89.0 {
            scale(layer_height_mm * angle.tan()).min(scale(50.0))
        } else {
            scale(50.0)
        };
        let maximum_move_distance_slow = scale(layer_height_mm * angle_slow.tan());

        let branch_radius = settings.support_tree_branch_diameter / 2;
        let min_radius = settings.support_tree_tip_diameter / 2;
        let bp_radius = settings.support_tree_bp_diameter / 2;

        // The tip thickens from min_radius to branch_radius over tip_layers,
        // paced by the branch diameter angle.
        let radius_gain_per_layer =
            (layer_height_mm * settings.support_tree_branch_diameter_angle.to_radians().tan())
                .max(1e-4);
        let tip_layers = if branch_radius > min_radius {
            (unscale(branch_radius - min_radius) / radius_gain_per_layer).ceil() as usize
        } else {
            0
        };
        let branch_radius_increase_per_layer = if tip_layers > 0 {
            (branch_radius - min_radius) as CoordF / tip_layers as CoordF
        } else {
            0.0
        };

        // Foot flare: reach bp_radius at layer 0 growing by
        // branch_radius * diameter_scale_bp_radius per layer.
        let diameter_scale_bp_radius = 0.05;
        let layer_start_bp_radius = if bp_radius > branch_radius {
            ((bp_radius - branch_radius) as f64
                / (branch_radius as f64 * diameter_scale_bp_radius))
                .ceil() as usize
        } else {
            0
        };

        let z_distance_top_layers =
            (unscale(settings.support_top_distance) / layer_height_mm).round() as usize;
        let z_distance_bottom_layers =
            (unscale(settings.support_bottom_distance) / layer_height_mm).round() as usize;
        let support_bottom_layers = if settings.support_bottom_enable {
            ((unscale(settings.support_bottom_height) / layer_height_mm).round() as usize).max(1)
        } else {
            0
        };
        let min_dtt_to_model =
            (unscale(settings.support_tree_min_height_to_model) / layer_height_mm).round() as usize;

        Self {
            angle,
            angle_slow,
            layer_height: settings.layer_height,
            known_z: Vec::new(),
            support_line_width: settings.support_line_width,
            support_roof_line_width: settings.support_roof_line_width,
            branch_radius,
            min_radius,
            bp_radius,
            maximum_move_distance,
            maximum_move_distance_slow,
            tip_layers,
            branch_radius_increase_per_layer,
            diameter_scale_bp_radius,
            layer_start_bp_radius,
            max_to_model_radius_increase: settings
                .support_tree_max_diameter_increase_by_merges_when_support_to_model,
            min_dtt_to_model,
            increase_radius_until_radius: branch_radius,
            increase_radius_until_layer: tip_layers,
            support_rests_on_model: !settings.support_material_buildplate_only,
            xy_distance: settings.support_xy_distance,
            xy_min_distance: settings.support_xy_distance_overhang.min(settings.support_xy_distance),
            z_distance_top_layers,
            z_distance_bottom_layers,
            support_bottom_layers,
            support_bottom_offset: settings.support_bottom_offset,
            performance_interface_skip_layers: settings.performance_interface_skip_layers.max(1),
            support_roof_layers: if settings.support_roof_enable {
                settings.support_roof_layers
            } else {
                0
            },
            roof_enabled: settings.support_roof_enable && settings.support_roof_layers > 0,
            minimum_roof_area: settings.minimum_roof_area,
            minimum_support_area: settings.minimum_support_area,
            support_roof_line_distance: settings.support_roof_line_distance,
            support_tree_branch_distance: settings.support_tree_branch_distance,
            interface_preference: settings.interface_preference,
            resolution: settings.resolution,
            min_feature_size: settings.min_feature_size,
            settings,
        }
    }

    /// Whether the tighter overhang XY clearance is a distinct mode.
    #[inline]
    pub fn has_min_xy_dist(&self) -> bool {
        self.xy_distance > self.xy_min_distance
    }

    /// Radius of a branch `dtt` layers below its tip with `elephant_foot`
    /// accumulated flare. The pre-flare part is capped at `branch_radius`.
    pub fn get_radius(&self, dtt: usize, elephant_foot_increases: f64) -> Coord {
        let base = if self.tip_layers > 0 && dtt < self.tip_layers {
            self.min_radius + (self.branch_radius_increase_per_layer * dtt as CoordF) as Coord
        } else {
            self.branch_radius
        };
        let base = base.min(self.branch_radius);
        let flare = (self.branch_radius as f64
            * elephant_foot_increases
            * self.diameter_scale_bp_radius) as Coord;
        (base + flare).min(self.bp_radius.max(self.branch_radius))
    }

    /// Radius used for oracle queries: grows only as fast as the volumes the
    /// element was verified against.
    pub fn get_collision_radius(&self, state: &SupportElementState) -> Coord {
        self.get_radius(
            state.effective_radius_height as usize,
            state.elephant_foot_increases,
        )
    }

    /// Radius the branch is drawn with.
    pub fn get_radius_state(&self, state: &SupportElementState) -> Coord {
        self.get_radius(state.effective_dtt(self), state.elephant_foot_increases)
    }

    /// Smallest radius a trunk should have at `layer_idx` for the foot flare
    /// to complete by layer 0.
    pub fn recommended_min_radius(&self, layer_idx: usize) -> Coord {
        if layer_idx >= self.layer_start_bp_radius {
            return 0;
        }
        let scale_factor =
            (self.layer_start_bp_radius - layer_idx) as f64 * self.diameter_scale_bp_radius;
        (self.branch_radius as f64 * scale_factor) as Coord
    }

    /// Print Z of a layer, estimated from the layer height when unknown.
    pub fn get_actual_z(&self, layer_idx: usize) -> Coord {
        self.known_z
            .get(layer_idx)
            .copied()
            .unwrap_or(self.layer_height * (layer_idx as Coord + 1))
    }

    pub fn set_actual_z(&mut self, known_z: Vec<Coord>) {
        self.known_z = known_z;
    }
}

impl Default for TreeSupportSettings {
    fn default() -> Self {
        Self::new(TreeSupportMeshGroupSettings::default())
    }
}

/// How far and carefully an influence area is grown one layer down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AreaIncreaseSettings {
    pub avoidance_type: crate::volumes::AvoidanceType,
    /// Offset distance for this attempt, scaled units.
    pub increase_speed: Coord,
    /// Attempt to bump the effective radius height.
    pub increase_radius: bool,
    /// Regular attempt; false marks the last-resort error strategy.
    pub no_error: bool,
    /// Evaluate against the tighter overhang XY clearance.
    pub use_min_distance: bool,
    /// Whether the area may move at all.
    pub allow_move: bool,
}

/// Classification of a sampled tip position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineStatus {
    #[default]
    Invalid,
    ToModel,
    ToModelGracious,
    ToModelGraciousSafe,
    ToBuildPlate,
    ToBuildPlateSafe,
}

impl LineStatus {
    pub fn to_buildplate(self) -> bool {
        matches!(self, LineStatus::ToBuildPlate | LineStatus::ToBuildPlateSafe)
    }

    pub fn gracious(self) -> bool {
        self.to_buildplate()
            || matches!(
                self,
                LineStatus::ToModelGracious | LineStatus::ToModelGraciousSafe
            )
    }

    pub fn safe(self) -> bool {
        matches!(
            self,
            LineStatus::ToBuildPlateSafe | LineStatus::ToModelGraciousSafe
        )
    }
}

/// Per-element, per-layer branch state.
#[derive(Debug, Clone)]
pub struct SupportElementState {
    /// Layer this element inhabits.
    pub layer_idx: usize,
    /// Topmost layer of this branch and its anchor there.
    pub target_height: usize,
    pub target_position: Point,
    /// Hint for picking the anchor on the layer below.
    pub next_position: Point,
    /// Resolved anchor; `None` until node positioning runs.
    pub result_on_layer: Option<Point>,
    /// Steps of verified radius growth.
    pub effective_radius_height: u32,
    /// Accumulated foot-flare growth; fractional after merges.
    pub elephant_foot_increases: f64,
    /// Layers traversed from the original tip.
    pub distance_to_top: u32,
    /// Whether this branch can still reach the build plate.
    pub to_buildplate: bool,
    /// Whether, failing that, it will land on a placeable model area.
    pub to_model_gracious: bool,
    /// Lies under a roof interface.
    pub supports_roof: bool,
    /// Has cleared narrow-hole hazard zones.
    pub can_use_safe_radius: bool,
    /// Currently subject to the tighter XY clearance.
    pub use_min_xy_dist: bool,
    /// Hold position while this many more layers are close to the tip.
    pub dont_move_until: u32,
    /// Roof layers still owed to this tip; such areas draw as roof.
    pub missing_roof_layers: u32,
    /// Disable elliptic deformation when drawing.
    pub skip_ovalisation: bool,
    /// Radius gained by absorbing to-model branches, capped by config.
    pub increased_to_model_radius: Coord,
    /// Expansion settings that succeeded last layer; warm start.
    pub last_area_increase: AreaIncreaseSettings,
    /// Needed the error strategy at least once.
    pub lost: bool,
    /// Needed the error strategy on the most recent layer.
    pub verylost: bool,
    /// Removed; skipped everywhere, compacted away after placement.
    pub deleted: bool,
    /// Transient traversal flag for placement and drawing.
    pub marked: bool,
}

impl Default for SupportElementState {
    fn default() -> Self {
        Self {
            layer_idx: 0,
            target_height: 0,
            target_position: Point::zero(),
            next_position: Point::zero(),
            result_on_layer: None,
            effective_radius_height: 0,
            elephant_foot_increases: 0.0,
            distance_to_top: 0,
            to_buildplate: false,
            to_model_gracious: false,
            supports_roof: false,
            can_use_safe_radius: false,
            use_min_xy_dist: false,
            dont_move_until: 0,
            missing_roof_layers: 0,
            skip_ovalisation: false,
            increased_to_model_radius: 0,
            last_area_increase: AreaIncreaseSettings::default(),
            lost: false,
            verylost: false,
            deleted: false,
            marked: false,
        }
    }
}

impl SupportElementState {
    #[inline]
    pub fn result_on_layer_is_set(&self) -> bool {
        self.result_on_layer.is_some()
    }

    pub fn result_on_layer_reset(&mut self) {
        self.result_on_layer = None;
    }

    /// Begin the state of the successor element one layer down.
    pub fn propagate_down(&self) -> Self {
        let mut below = self.clone();
        below.layer_idx = below.layer_idx.saturating_sub(1);
        below.distance_to_top += 1;
        below.result_on_layer_reset();
        below.skip_ovalisation = false;
        below.marked = false;
        below
    }

    /// Distance-to-top used for the drawn radius: growth already verified
    /// against the volumes, or the raw distance while still inside the tip.
    pub fn effective_dtt(&self, config: &TreeSupportSettings) -> usize {
        if (self.effective_radius_height as usize) < config.increase_radius_until_layer {
            (self.distance_to_top as usize).min(config.increase_radius_until_layer)
        } else {
            self.effective_radius_height as usize
        }
    }
}

/// A support element: its state, the influence area of admissible centers on
/// its layer, and the elements it supports on the layer above.
#[derive(Debug, Clone)]
pub struct SupportElement {
    pub state: SupportElementState,
    /// Indices into the layer above. Merges make this longer than one.
    pub parents: Vec<i32>,
    pub influence_area: crate::geometry::ExPolygons,
}

impl SupportElement {
    pub fn new(
        state: SupportElementState,
        parents: Vec<i32>,
        influence_area: crate::geometry::ExPolygons,
    ) -> Self {
        Self {
            state,
            parents,
            influence_area,
        }
    }
}

/// All support elements, indexed by layer then element.
pub type SupportElements = Vec<SupportElement>;
