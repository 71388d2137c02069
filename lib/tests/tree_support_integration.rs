//! Tree support integration tests.
//!
//! These drive the whole pipeline over constructed layer stacks and check
//! the end-to-end properties: supports appear under overhangs and nowhere
//! else, they respect the model clearance, enforcers and blockers are
//! honored, both materialization styles produce output, and generation is
//! deterministic.

use tree_support::clipper;
use tree_support::geometry::{ExPolygon, ExPolygons, Point};
use tree_support::support::settings::TreeSupportMeshGroupSettings;
use tree_support::volumes::{TreeModelVolumes, TreeModelVolumesConfig};
use tree_support::{
    scale, CancellationToken, CoordF, SupportLayer, SupportOverlays, SupportStyle,
    TreeSupportGenerator,
};

fn rect(x0: CoordF, y0: CoordF, x1: CoordF, y1: CoordF) -> ExPolygons {
    vec![ExPolygon::rectangle(
        Point::new_scale(x0, y0),
        Point::new_scale(x1, y1),
    )]
}

/// A 40x40 base, two layers tall, with a 20x20 slab hovering eight layers
/// above its center.
fn base_with_hovering_slab() -> Vec<ExPolygons> {
    let mut outlines: Vec<ExPolygons> = Vec::new();
    outlines.extend(vec![rect(-20.0, -20.0, 20.0, 20.0); 2]);
    outlines.extend(vec![Vec::new(); 8]);
    outlines.extend(vec![rect(-10.0, -10.0, 10.0, 10.0); 4]);
    outlines
}

fn generate(
    outlines: &[ExPolygons],
    style: SupportStyle,
    overlays: &SupportOverlays,
) -> Vec<SupportLayer> {
    let generator = TreeSupportGenerator::new(TreeSupportMeshGroupSettings::default(), style);
    generator
        .generate(outlines, &[], overlays, &CancellationToken::new())
        .unwrap()
}

fn volumes_for(outlines: &[ExPolygons]) -> TreeModelVolumes {
    TreeModelVolumes::new(TreeModelVolumesConfig::default(), outlines.to_vec())
}

#[test]
fn test_hovering_slab_gets_supported() {
    let outlines = base_with_hovering_slab();
    let layers = generate(&outlines, SupportStyle::Tree, &SupportOverlays::default());
    assert_eq!(layers.len(), outlines.len());

    // Support exists in the air gap under the slab.
    let air_support: CoordF = (2..10).map(|l| clipper::area(&layers[l].base)).sum();
    assert!(air_support > 0.0, "no support under the hovering slab");

    // Roof interfaces exist near the top of the supports (roofs enabled by
    // default).
    let roof_total: CoordF = layers.iter().map(|l| clipper::area(&l.roof)).sum();
    assert!(roof_total > 0.0, "roof interface missing");

    // Supports land somewhere: the lowest support layers above the base are
    // populated down to the base top.
    let lowest_support = (0..outlines.len())
        .find(|&l| !layers[l].is_empty())
        .expect("support expected");
    assert!(
        lowest_support <= 3,
        "support does not come down far enough (first at {lowest_support})"
    );
}

#[test]
fn test_support_clears_model() {
    let outlines = base_with_hovering_slab();
    let layers = generate(&outlines, SupportStyle::Tree, &SupportOverlays::default());
    let volumes = volumes_for(&outlines);
    for layer in &layers {
        if layer.base.is_empty() {
            continue;
        }
        let collision = volumes.get_collision(0, layer.layer_idx, true);
        let overlap = clipper::intersection(&layer.base, &collision);
        assert!(
            clipper::area(&overlap) < 1e10,
            "support body intersects the model clearance on layer {}",
            layer.layer_idx
        );
    }
}

#[test]
fn test_no_support_without_overhang() {
    // A plain tower; every layer is fully supported by the one below.
    let outlines = vec![rect(0.0, 0.0, 15.0, 15.0); 12];
    let layers = generate(&outlines, SupportStyle::Tree, &SupportOverlays::default());
    assert!(layers.iter().all(SupportLayer::is_empty));
}

#[test]
fn test_forests_do_not_cross_narrow_gap() {
    // Two towers a millimeter apart, each with an overhang on its outer
    // side. The gap is narrower than twice the XY clearance, so nothing may
    // be placed inside it.
    let mut outlines: Vec<ExPolygons> = Vec::new();
    for _ in 0..9 {
        let mut layer = rect(-11.0, 0.0, -1.0, 10.0);
        layer.extend(rect(0.0, 0.0, 10.0, 10.0));
        outlines.push(layer);
    }
    // Top: both towers grow outward by 4mm away from the gap.
    for _ in 0..3 {
        let mut layer = rect(-15.0, 0.0, -1.0, 10.0);
        layer.extend(rect(0.0, 0.0, 14.0, 10.0));
        outlines.push(layer);
    }

    let layers = generate(&outlines, SupportStyle::Tree, &SupportOverlays::default());
    let supported: CoordF = layers.iter().map(|l| clipper::area(&l.base)).sum();
    assert!(supported > 0.0, "outer overhangs need support");

    let gap = rect(-1.0, 0.0, 0.0, 10.0);
    for layer in &layers {
        let in_gap = clipper::intersection(&layer.base, &gap);
        assert!(
            clipper::area(&in_gap) < 1e6,
            "support crossed the narrow gap on layer {}",
            layer.layer_idx
        );
    }
}

#[test]
fn test_enforcer_forces_support_below_threshold() {
    // A wall leaning out by 0.15mm per layer stays below the 45 degree
    // threshold (0.19mm per layer), so nothing is supported on its own. An
    // enforcer over the leaning flank must still produce supports there.
    let outlines: Vec<ExPolygons> = (0..12)
        .map(|l| rect(0.0, 0.0, 10.0 + 0.15 * l as CoordF, 10.0))
        .collect();
    let mut overlays = SupportOverlays::default();
    overlays.enforcers = vec![Vec::new(); 12];
    for l in 6..10 {
        overlays.enforcers[l] = rect(9.5, 0.0, 13.0, 10.0);
    }

    let without = generate(&outlines, SupportStyle::Tree, &SupportOverlays::default());
    assert!(without.iter().all(SupportLayer::is_empty));

    let with = generate(&outlines, SupportStyle::Tree, &overlays);
    let total: CoordF = with
        .iter()
        .map(|l| clipper::area(&l.base) + clipper::area(&l.roof))
        .sum();
    assert!(total > 0.0, "enforcer produced no support");
}

#[test]
fn test_blocker_suppresses_support() {
    let outlines = base_with_hovering_slab();
    let mut overlays = SupportOverlays::default();
    // Blockers covering the whole slab footprint on every layer.
    overlays.blockers = vec![rect(-12.0, -12.0, 12.0, 12.0); outlines.len()];

    let layers = generate(&outlines, SupportStyle::Tree, &overlays);
    let total: CoordF = layers
        .iter()
        .map(|l| clipper::area(&l.base) + clipper::area(&l.roof))
        .sum();
    assert!(
        total < 1e6,
        "blocker should suppress all support, found area {total}"
    );
}

#[test]
fn test_organic_style_produces_support() {
    let outlines = base_with_hovering_slab();
    let layers = generate(&outlines, SupportStyle::Organic, &SupportOverlays::default());
    assert_eq!(layers.len(), outlines.len());
    let air_support: CoordF = (2..10).map(|l| clipper::area(&layers[l].base)).sum();
    assert!(air_support > 0.0, "organic style produced no support body");

    // The re-sliced tube mesh is trimmed against the model clearance.
    let volumes = volumes_for(&outlines);
    for layer in &layers {
        if layer.base.is_empty() {
            continue;
        }
        let collision = volumes.get_collision(0, layer.layer_idx, true);
        let overlap = clipper::intersection(&layer.base, &collision);
        assert!(
            clipper::area(&overlap) < 1e10,
            "organic body intersects the model on layer {}",
            layer.layer_idx
        );
    }
}

#[test]
fn test_single_point_overhang_single_column() {
    // A lone 1x1mm patch hovering in the air: one tip, one column.
    let mut outlines: Vec<ExPolygons> = vec![rect(-30.0, -30.0, 30.0, 30.0)];
    outlines.extend(vec![Vec::new(); 7]);
    outlines.extend(vec![rect(-0.5, -0.5, 0.5, 0.5); 3]);

    let layers = generate(&outlines, SupportStyle::Tree, &SupportOverlays::default());
    let support_layers: Vec<usize> = (0..outlines.len())
        .filter(|&l| !layers[l].is_empty())
        .collect();
    assert!(!support_layers.is_empty(), "the patch needs support");
    // Everything stays near the patch.
    for l in support_layers {
        for area_set in [&layers[l].base, &layers[l].roof] {
            for ex in area_set {
                let bbox = ex.bounding_box();
                assert!(bbox.max.x < scale(6.0) && bbox.min.x > scale(-6.0));
                assert!(bbox.max.y < scale(6.0) && bbox.min.y > scale(-6.0));
            }
        }
    }
}

#[test]
fn test_generation_is_deterministic() {
    let outlines = base_with_hovering_slab();
    let first = generate(&outlines, SupportStyle::Tree, &SupportOverlays::default());
    let second = generate(&outlines, SupportStyle::Tree, &SupportOverlays::default());
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.base, b.base, "base differs on layer {}", a.layer_idx);
        assert_eq!(a.roof, b.roof, "roof differs on layer {}", a.layer_idx);
        assert_eq!(a.bottom, b.bottom, "bottom differs on layer {}", a.layer_idx);
    }
}

#[test]
fn test_cancellation_aborts() {
    let outlines = base_with_hovering_slab();
    let generator = TreeSupportGenerator::new(
        TreeSupportMeshGroupSettings::default(),
        SupportStyle::Tree,
    );
    let token = CancellationToken::new();
    token.cancel();
    let result = generator.generate(&outlines, &[], &SupportOverlays::default(), &token);
    assert!(result.is_err());
}

#[test]
fn test_bottom_interface_on_model_landing() {
    // A hovering shelf (an overhang itself) with a slab hovering well above
    // it: the slab's branches land on the shelf top, and the bottom interface
    // samples hit the shelf's overhang a few layers below the landing. The
    // air gap leaves the branches several layers tall below the roof stack.
    let mut outlines: Vec<ExPolygons> = Vec::new();
    outlines.extend(vec![Vec::new(); 4]);
    outlines.extend(vec![rect(-10.0, -10.0, 10.0, 10.0); 2]); // shelf, layers 4-5
    outlines.extend(vec![Vec::new(); 7]);
    outlines.extend(vec![rect(-8.0, -8.0, 8.0, 8.0); 3]); // slab, layers 13-15

    let mut settings = TreeSupportMeshGroupSettings::default();
    settings.support_bottom_enable = true;
    let generator = TreeSupportGenerator::new(settings, SupportStyle::Tree);
    let layers = generator
        .generate(
            &outlines,
            &[],
            &SupportOverlays::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    let bottom_total: CoordF = layers.iter().map(|l| clipper::area(&l.bottom)).sum();
    assert!(
        bottom_total > 0.0,
        "expected bottom contact where supports land on the shelf"
    );
    // The bottom interface sits over the shelf footprint and was carved out
    // of the support body.
    let shelf = rect(-10.0, -10.0, 10.0, 10.0);
    for layer in &layers {
        if layer.bottom.is_empty() {
            continue;
        }
        let outside_shelf = clipper::difference(&layer.bottom, &shelf);
        assert!(
            clipper::area(&outside_shelf) < 1e6,
            "bottom contact off the shelf on layer {}",
            layer.layer_idx
        );
        let overlap = clipper::intersection(&layer.bottom, &layer.base);
        assert!(
            clipper::area(&overlap) < 1e6,
            "bottom contact not carved from the body on layer {}",
            layer.layer_idx
        );
    }
}
