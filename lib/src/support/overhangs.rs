//! Overhang detection.
//!
//! For every layer the overhang is the part of its outline the layer below
//! does not support, given the threshold angle. Enforced layers ignore the
//! threshold, blockers always remove support, bridgeable regions are skipped
//! when configured, and enforcers add support even where the threshold would
//! not.

use crate::clipper::{self, OffsetJoinType};
use crate::error::{CancellationToken, TreeSupportError};
use crate::geometry::ExPolygons;
use crate::support::settings::TreeSupportMeshGroupSettings;
use crate::{scale, unscale, Coord};

/// Safety margin applied to blockers so touching overhangs are fully erased.
const BLOCKER_SAFETY_OFFSET: Coord = 10_000; // 0.01 mm

/// Anchors closer than this to a candidate bridge count as one side.
const BRIDGE_ANCHOR_OFFSET: Coord = 100_000; // 0.1 mm

/// Per-layer overhang polygons. Entry 0 is always empty.
pub fn generate_overhangs(
    layer_outlines: &[ExPolygons],
    enforcers: &[ExPolygons],
    blockers: &[ExPolygons],
    external_perimeter_width: Coord,
    settings: &TreeSupportMeshGroupSettings,
    cancel: &CancellationToken,
) -> Result<Vec<ExPolygons>, TreeSupportError> {
    let mut out: Vec<ExPolygons> = vec![Vec::new(); layer_outlines.len()];

    let threshold_auto = settings.support_angle <= 0.0;
    let tan_threshold = if threshold_auto {
        0.0
    } else {
        // +1 degree makes the threshold inclusive.
        (settings.support_angle + 1.0).to_radians().tan()
    };
    let enforcer_overhang_offset = settings.support_tree_tip_diameter;

    let num_overhang_layers = if settings.support_auto {
        layer_outlines.len()
    } else {
        settings
            .support_enforce_layers
            .max(enforcers.len())
            .min(layer_outlines.len())
    };

    for layer_idx in 1..num_overhang_layers {
        cancel.check()?;
        let current = &layer_outlines[layer_idx];
        let lower = &layer_outlines[layer_idx - 1];
        let enforced_layer = layer_idx < settings.support_enforce_layers;

        let mut raw_overhang: Option<ExPolygons> = None;
        let mut overhang: ExPolygons = Vec::new();

        if settings.support_auto || enforced_layer {
            let lower_layer_offset: Coord = if enforced_layer {
                0
            } else if threshold_auto {
                external_perimeter_width / 2
            } else {
                scale(unscale(settings.layer_height) / tan_threshold)
            };

            overhang = if lower_layer_offset == 0 {
                let diff = clipper::difference(current, lower);
                raw_overhang = Some(diff.clone());
                diff
            } else {
                clipper::difference(
                    current,
                    &clipper::offset(lower, lower_layer_offset, OffsetJoinType::Round),
                )
            };

            if !enforced_layer {
                if let Some(layer_blockers) = blockers.get(layer_idx) {
                    if !layer_blockers.is_empty() {
                        overhang = clipper::difference(
                            &overhang,
                            &clipper::offset(
                                layer_blockers,
                                BLOCKER_SAFETY_OFFSET,
                                OffsetJoinType::Miter,
                            ),
                        );
                    }
                }
            }
            if settings.dont_support_bridges {
                let bridges = detect_bridges(current, lower);
                if !bridges.is_empty() {
                    overhang = clipper::difference(&overhang, &bridges);
                }
            }
        }

        if let Some(layer_enforcers) = enforcers.get(layer_idx) {
            if !layer_enforcers.is_empty() {
                let raw = match raw_overhang {
                    Some(ref raw) => raw.clone(),
                    None => clipper::difference(current, lower),
                };
                let enforced = clipper::intersection(&raw, layer_enforcers);
                if !enforced.is_empty() {
                    // Outset so steep near-vertical walls still produce a
                    // supportable area, then keep it off the layer below.
                    let enforced = clipper::difference(
                        &clipper::offset(
                            &clipper::union_all(&enforced),
                            enforcer_overhang_offset,
                            OffsetJoinType::Round,
                        ),
                        lower,
                    );
                    overhang = clipper::union(&overhang, &enforced);
                }
            }
        }

        out[layer_idx] = overhang;
    }

    Ok(out)
}

/// Regions of `current` unsupported by `lower` that span between at least two
/// anchors and can therefore be printed as bridges.
fn detect_bridges(current: &ExPolygons, lower: &ExPolygons) -> ExPolygons {
    if current.is_empty() || lower.is_empty() {
        return Vec::new();
    }
    let unsupported = clipper::difference(current, lower);
    let mut bridges: ExPolygons = Vec::new();
    for candidate in unsupported {
        let expanded = clipper::offset(
            std::slice::from_ref(&candidate),
            BRIDGE_ANCHOR_OFFSET,
            OffsetJoinType::Round,
        );
        let anchors = clipper::intersection(&expanded, lower);
        if anchors.len() >= 2 {
            bridges.push(candidate);
        }
    }
    bridges
}
