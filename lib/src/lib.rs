//! Tree-style support structure generation for fused-filament 3D printing.
//!
//! Given a sliced model (a stack of 2D layer outlines plus print settings),
//! this crate synthesizes a forest of thin branching columns that start as
//! small tips under overhanging regions and merge downward into thicker
//! trunks resting on the build plate or landing on the model. The output is,
//! per layer, three polygon sets ready for toolpath generation: roof (top
//! contact), bottom contact, and intermediate support body.
//!
//! The pipeline, in order:
//! 1. Overhang detection ([`support::overhangs`])
//! 2. Tip placement ([`support::tips`])
//! 3. Influence-area propagation and merging ([`support::propagation`],
//!    [`support::merge`])
//! 4. Node positioning ([`support::placement`])
//! 5. Materialization, classic circles ([`support::draw_classic`]) or an
//!    organic tube mesh ([`support::draw_organic`])
//! 6. Interface/body composition ([`support::finalize`])
//!
//! Collision, avoidance, placeable-area and wall-restriction queries are
//! served by the [`volumes::TreeModelVolumes`] oracle, precomputed per radius
//! band and layer.

pub mod clipper;
pub mod error;
pub mod geometry;
pub mod mesh;
pub mod support;
pub mod volumes;

pub use error::{CancellationToken, TreeSupportError};
pub use support::{SupportLayer, SupportOverlays, SupportStyle, TreeSupportGenerator};

/// Scaled integer coordinate. 1 mm is 1,000,000 scaled units.
pub type Coord = i64;

/// Floating point coordinate in millimeters.
pub type CoordF = f64;

/// Conversion factor between millimeters and scaled coordinates.
pub const SCALING_FACTOR: CoordF = 1_000_000.0;

/// Scaled epsilon used to absorb polygon-boolean rounding: one scaled unit.
pub const SCALED_EPSILON: Coord = 1;

/// Largest coordinate magnitude the polygon engine is trusted with.
/// Points beyond this are a fatal geometry error.
pub const MAX_COORD: Coord = 1 << 30;

/// Convert millimeters to scaled coordinates.
#[inline]
pub fn scale(v: CoordF) -> Coord {
    (v * SCALING_FACTOR).round() as Coord
}

/// Convert scaled coordinates to millimeters.
#[inline]
pub fn unscale(v: Coord) -> CoordF {
    v as CoordF / SCALING_FACTOR
}

/// Signed-integer ceiling division (stable-Rust equivalent of the unstable
/// `i64::div_ceil`).
#[inline]
pub(crate) fn div_ceil_coord(lhs: Coord, rhs: Coord) -> Coord {
    let d = lhs / rhs;
    let r = lhs % rhs;
    if (r > 0 && rhs > 0) || (r < 0 && rhs < 0) {
        d + 1
    } else {
        d
    }
}
