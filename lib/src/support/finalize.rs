//! Final composition of base, roof and bottom-contact layers.

use crate::clipper::{self, OffsetJoinType};
use crate::error::{CancellationToken, TreeSupportError};
use crate::geometry::ExPolygons;
use crate::support::settings::{InterfacePreference, TreeSupportSettings};
use crate::volumes::TreeModelVolumes;
use crate::{scale, unscale, CoordF};

/// One layer of generated support, ready for toolpath generation.
#[derive(Debug, Clone, Default)]
pub struct SupportLayer {
    pub layer_idx: usize,
    /// Top of the layer, millimeters.
    pub print_z: CoordF,
    /// Layer thickness, millimeters.
    pub height: CoordF,
    /// Intermediate support body.
    pub base: ExPolygons,
    /// Top contact (roof) interface.
    pub roof: ExPolygons,
    /// Bottom contact where supports land on the model.
    pub bottom: ExPolygons,
}

impl SupportLayer {
    pub fn is_empty(&self) -> bool {
        self.base.is_empty() && self.roof.is_empty() && self.bottom.is_empty()
    }
}

/// Combine the body and roof stashes into output layers, apply the interface
/// policy and carve out bottom contacts.
pub fn finalize_interface_and_support_areas(
    volumes: &TreeModelVolumes,
    config: &TreeSupportSettings,
    overhangs: &[ExPolygons],
    support_layer_storage: Vec<ExPolygons>,
    support_roof_storage: Vec<ExPolygons>,
    top_contacts: Vec<ExPolygons>,
    cancel: &CancellationToken,
) -> Result<Vec<SupportLayer>, TreeSupportError> {
    // Line-based preferences are recognized but resolved as Nothing here.
    let interface_pref = match config.interface_preference {
        InterfacePreference::InterfaceLinesOverwriteSupport
        | InterfacePreference::SupportLinesOverwriteInterface => InterfacePreference::Nothing,
        other => other,
    };

    let num_layers = support_layer_storage.len();
    let mut out = Vec::with_capacity(num_layers);
    for (layer_idx, base_raw) in support_layer_storage.into_iter().enumerate() {
        cancel.check()?;
        let mut support_roof_polygons = {
            let from_draw = support_roof_storage.get(layer_idx).cloned().unwrap_or_default();
            let from_tips = top_contacts.get(layer_idx).cloned().unwrap_or_default();
            clipper::union(&from_draw, &from_tips)
        };

        let mut base_layer_polygons = base_raw;
        if !base_layer_polygons.is_empty() {
            // Close gaps the branch circles leave between each other, then
            // keep the vertex count sane.
            let closing = config.support_line_width;
            base_layer_polygons = clipper::offset(
                &clipper::offset(
                    &clipper::union_all(&base_layer_polygons),
                    closing,
                    OffsetJoinType::Round,
                ),
                -closing,
                OffsetJoinType::Round,
            );
            base_layer_polygons =
                clipper::simplify(&base_layer_polygons, scale(0.03).min(config.resolution));
        }

        if !support_roof_polygons.is_empty() && !base_layer_polygons.is_empty() {
            match interface_pref {
                InterfacePreference::InterfaceAreaOverwritesSupport => {
                    base_layer_polygons =
                        clipper::difference(&base_layer_polygons, &support_roof_polygons);
                }
                InterfacePreference::SupportAreaOverwritesInterface => {
                    support_roof_polygons =
                        clipper::difference(&support_roof_polygons, &base_layer_polygons);
                }
                _ => {}
            }
        }

        // Where the support body rests on the model, sample the overhangs a
        // few layers down into a dense bottom interface.
        let mut bottom_contact: ExPolygons = Vec::new();
        if config.support_bottom_layers > 0 && !base_layer_polygons.is_empty() {
            let layer_outset = clipper::difference(
                &if config.support_bottom_offset > 0 {
                    clipper::offset(
                        &base_layer_polygons,
                        config.support_bottom_offset,
                        OffsetJoinType::Miter,
                    )
                } else {
                    base_layer_polygons.clone()
                },
                &volumes.get_collision(0, layer_idx, false),
            );
            let mut floor_layer: ExPolygons = Vec::new();
            let mut layers_below = 0usize;
            loop {
                let sample_layer = layer_idx
                    .saturating_sub(layers_below)
                    .saturating_sub(config.z_distance_bottom_layers);
                if let Some(overhang) = overhangs.get(sample_layer) {
                    floor_layer.extend(clipper::intersection(&layer_outset, overhang));
                }
                if layers_below < config.support_bottom_layers {
                    layers_below = (layers_below + config.performance_interface_skip_layers)
                        .min(config.support_bottom_layers);
                } else {
                    break;
                }
            }
            if !floor_layer.is_empty() {
                bottom_contact = clipper::union_all(&floor_layer);
                base_layer_polygons = clipper::difference(
                    &base_layer_polygons,
                    &clipper::offset(&bottom_contact, scale(0.01), OffsetJoinType::Miter),
                );
            }
        }

        out.push(SupportLayer {
            layer_idx,
            print_z: unscale(config.get_actual_z(layer_idx)),
            height: unscale(config.layer_height),
            base: clipper::union_all(&base_layer_polygons),
            roof: clipper::union_all(&support_roof_polygons),
            bottom: bottom_contact,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{ExPolygon, Point};
    use crate::volumes::{TreeModelVolumes, TreeModelVolumesConfig};

    fn empty_volumes(layers: usize) -> TreeModelVolumes {
        TreeModelVolumes::new(TreeModelVolumesConfig::default(), vec![Vec::new(); layers])
    }

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> ExPolygons {
        vec![ExPolygon::rectangle(
            Point::new_scale(x0, y0),
            Point::new_scale(x1, y1),
        )]
    }

    #[test]
    fn test_interface_overwrites_support() {
        let volumes = empty_volumes(1);
        let config = TreeSupportSettings::default();
        let base = vec![rect(0.0, 0.0, 10.0, 10.0)];
        let roof = vec![rect(5.0, 0.0, 15.0, 10.0)];
        let layers = finalize_interface_and_support_areas(
            &volumes,
            &config,
            &[],
            base,
            roof,
            Vec::new(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(layers.len(), 1);
        // Base was cut back by the roof.
        let overlap = clipper::intersection(&layers[0].base, &layers[0].roof);
        assert!(clipper::area(&overlap) < 1e6);
        assert!(!layers[0].roof.is_empty());
        assert!(!layers[0].base.is_empty());
    }

    #[test]
    fn test_support_overwrites_interface() {
        let volumes = empty_volumes(1);
        let mut config = TreeSupportSettings::default();
        config.interface_preference = InterfacePreference::SupportAreaOverwritesInterface;
        let base = vec![rect(0.0, 0.0, 10.0, 10.0)];
        let roof = vec![rect(5.0, 0.0, 15.0, 10.0)];
        let base_area_before = clipper::area(&base[0]);
        let layers = finalize_interface_and_support_areas(
            &volumes,
            &config,
            &[],
            base,
            roof,
            Vec::new(),
            &CancellationToken::new(),
        )
        .unwrap();
        // Base keeps (roughly) its area; the roof lost the overlap.
        assert!(clipper::area(&layers[0].base) > base_area_before * 0.95);
        let roof_area = clipper::area(&layers[0].roof);
        let expected = 50.0 * crate::SCALING_FACTOR * crate::SCALING_FACTOR;
        assert!((roof_area - expected).abs() < expected * 0.05);
    }

    #[test]
    fn test_nothing_preference_keeps_both() {
        let volumes = empty_volumes(1);
        let mut config = TreeSupportSettings::default();
        config.interface_preference = InterfacePreference::Nothing;
        let layers = finalize_interface_and_support_areas(
            &volumes,
            &config,
            &[],
            vec![rect(0.0, 0.0, 10.0, 10.0)],
            vec![rect(5.0, 0.0, 15.0, 10.0)],
            Vec::new(),
            &CancellationToken::new(),
        )
        .unwrap();
        let overlap = clipper::intersection(&layers[0].base, &layers[0].roof);
        assert!(clipper::area(&overlap) > 0.0);
    }

    #[test]
    fn test_tip_roofs_merged_into_output() {
        let volumes = empty_volumes(2);
        let config = TreeSupportSettings::default();
        let layers = finalize_interface_and_support_areas(
            &volumes,
            &config,
            &[],
            vec![Vec::new(), Vec::new()],
            vec![Vec::new(), rect(0.0, 0.0, 2.0, 2.0)],
            vec![Vec::new(), rect(1.0, 0.0, 3.0, 2.0)],
            &CancellationToken::new(),
        )
        .unwrap();
        // Both roof sources union into one region.
        assert_eq!(layers[1].roof.len(), 1);
        let expected = 6.0 * crate::SCALING_FACTOR * crate::SCALING_FACTOR;
        let area = clipper::area(&layers[1].roof);
        assert!((area - expected).abs() < expected * 0.05);
    }

    #[test]
    fn test_bottom_contact_generated() {
        // Model occupying the lower-left; support body resting over it.
        let outline = rect(0.0, 0.0, 10.0, 10.0);
        let volumes = TreeModelVolumes::new(
            TreeModelVolumesConfig::default(),
            vec![outline.clone(); 6],
        );
        let mut group = crate::support::settings::TreeSupportMeshGroupSettings::default();
        group.support_bottom_enable = true;
        let config = TreeSupportSettings::new(group);
        assert!(config.support_bottom_layers > 0);

        // Overhang polygons mark where the model's top surface is; pretend
        // layer 3 has one beneath the support at (12..20).
        let mut overhangs: Vec<ExPolygons> = vec![Vec::new(); 6];
        overhangs[3] = rect(12.0, 0.0, 20.0, 10.0);
        let mut storage: Vec<ExPolygons> = vec![Vec::new(); 6];
        storage[4] = rect(12.0, 0.0, 20.0, 10.0);

        let layers = finalize_interface_and_support_areas(
            &volumes,
            &config,
            &overhangs,
            storage,
            vec![Vec::new(); 6],
            Vec::new(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(
            !layers[4].bottom.is_empty(),
            "bottom contact expected where the body sits on the model top"
        );
        // The bottom interface was carved out of the base.
        let overlap = clipper::intersection(&layers[4].base, &layers[4].bottom);
        assert!(clipper::area(&overlap) < 1e6);
    }

    #[test]
    fn test_empty_everything() {
        let volumes = empty_volumes(3);
        let config = TreeSupportSettings::default();
        let layers = finalize_interface_and_support_areas(
            &volumes,
            &config,
            &[],
            vec![Vec::new(); 3],
            vec![Vec::new(); 3],
            Vec::new(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(layers.len(), 3);
        assert!(layers.iter().all(SupportLayer::is_empty));
    }
}
