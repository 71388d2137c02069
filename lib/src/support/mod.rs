//! Tree support generation.
//!
//! [`TreeSupportGenerator`] runs the whole pipeline over a sliced object:
//!
//! 1. Overhang detection ([`overhangs`])
//! 2. Tip placement with roof interfaces ([`tips`])
//! 3. Downward influence-area propagation ([`propagation`]) with in-layer
//!    merging ([`merge`])
//! 4. Node positioning ([`placement`])
//! 5. Materialization, classic ([`draw_classic`]) or organic
//!    ([`draw_organic`])
//! 6. Interface and bottom-contact composition ([`finalize`])
//!
//! The output is one [`SupportLayer`] per input layer with `base`, `roof`
//! and `bottom` polygon sets for the toolpath generator.

pub mod draw_classic;
pub mod draw_organic;
pub mod finalize;
pub mod merge;
pub mod overhangs;
pub mod placement;
pub mod propagation;
pub mod settings;
pub mod tips;

pub use finalize::SupportLayer;
pub use settings::{
    InterfacePreference, SupportElement, SupportElementState, SupportStyle,
    TreeSupportMeshGroupSettings, TreeSupportSettings,
};

use crate::error::{CancellationToken, TreeSupportError};
use crate::geometry::ExPolygons;
use crate::support::settings::SupportElements;
use crate::volumes::{TreeModelVolumes, TreeModelVolumesConfig};
use std::sync::Mutex;

/// Enforcer and blocker overlays, one polygon set per layer. Missing layers
/// count as empty.
#[derive(Debug, Clone, Default)]
pub struct SupportOverlays {
    pub enforcers: Vec<ExPolygons>,
    pub blockers: Vec<ExPolygons>,
}

/// The tree support generator: configuration plus style.
#[derive(Debug, Clone)]
pub struct TreeSupportGenerator {
    settings: TreeSupportMeshGroupSettings,
    style: SupportStyle,
    /// External perimeter width used by the automatic overhang threshold.
    external_perimeter_width: crate::Coord,
}

impl TreeSupportGenerator {
    pub fn new(settings: TreeSupportMeshGroupSettings, style: SupportStyle) -> Self {
        Self {
            settings,
            style,
            external_perimeter_width: crate::scale(0.45),
        }
    }

    pub fn with_external_perimeter_width(mut self, width: crate::Coord) -> Self {
        self.external_perimeter_width = width;
        self
    }

    pub fn settings(&self) -> &TreeSupportMeshGroupSettings {
        &self.settings
    }

    /// Generate supports for one object given its per-layer outlines.
    ///
    /// `layer_zs` carries the print Z of each layer in scaled units; pass an
    /// empty slice to assume uniform layers of the configured height.
    pub fn generate(
        &self,
        layer_outlines: &[ExPolygons],
        layer_zs: &[crate::Coord],
        overlays: &SupportOverlays,
        cancel: &CancellationToken,
    ) -> Result<Vec<SupportLayer>, TreeSupportError> {
        // The polygon engine is only trusted inside a bounded coordinate
        // range; a point beyond it is a fatal geometry error.
        for layer in layer_outlines {
            for ex in layer {
                for ring in std::iter::once(&ex.contour).chain(ex.holes.iter()) {
                    for &p in ring.points() {
                        crate::error::validate_range(p)?;
                    }
                }
            }
        }

        let num_layers = layer_outlines.len();
        let mut config = TreeSupportSettings::new(self.settings.clone());
        if !layer_zs.is_empty() {
            config.set_actual_z(layer_zs.to_vec());
        }

        let empty_result = |config: &TreeSupportSettings| {
            (0..num_layers)
                .map(|layer_idx| SupportLayer {
                    layer_idx,
                    print_z: crate::unscale(config.get_actual_z(layer_idx)),
                    height: crate::unscale(config.layer_height),
                    ..Default::default()
                })
                .collect::<Vec<_>>()
        };
        if num_layers <= config.z_distance_top_layers + 1 {
            return Ok(empty_result(&config));
        }

        let volumes_config = TreeModelVolumesConfig {
            max_move: config.maximum_move_distance,
            max_move_slow: config.maximum_move_distance_slow,
            xy_distance: config.xy_distance,
            xy_min_distance: config.xy_min_distance,
            support_rests_on_model: config.support_rests_on_model,
            min_radius: config.min_radius,
            min_resolution: config.resolution,
            ..Default::default()
        };
        let mut volumes = TreeModelVolumes::new(volumes_config, layer_outlines.to_vec());
        if !overlays.blockers.is_empty() {
            volumes.set_anti_overhang(overlays.blockers.clone());
        }

        let overhangs = overhangs::generate_overhangs(
            layer_outlines,
            &overlays.enforcers,
            &overlays.blockers,
            self.external_perimeter_width,
            &self.settings,
            cancel,
        )?;

        let max_overhang_layer = overhangs
            .iter()
            .enumerate()
            .rev()
            .find(|(_, o)| !o.is_empty())
            .map(|(idx, _)| idx);
        let Some(max_overhang_layer) = max_overhang_layer else {
            return Ok(empty_result(&config));
        };
        volumes.precalculate(max_overhang_layer.saturating_sub(config.z_distance_top_layers));

        let mut move_bounds: Vec<SupportElements> = vec![Vec::new(); num_layers];
        let top_contacts: tips::TopContacts = Mutex::new(vec![Vec::new(); num_layers]);
        tips::generate_initial_areas(
            &volumes,
            &config,
            &overhangs,
            &mut move_bounds,
            &top_contacts,
            cancel,
        )?;

        propagation::create_layer_pathing(&volumes, &config, &mut move_bounds, cancel)?;
        placement::create_nodes_from_area(&volumes, &config, &mut move_bounds, cancel)?;

        let (support_layer_storage, support_roof_storage) = match self.style {
            SupportStyle::Tree => {
                draw_classic::draw_areas(&volumes, &config, &mut move_bounds, cancel)?
            }
            SupportStyle::Organic => {
                let storage = draw_organic::draw_branches_and_slice(
                    &volumes,
                    &config,
                    &mut move_bounds,
                    cancel,
                )?;
                (storage, vec![Vec::new(); num_layers])
            }
        };

        finalize::finalize_interface_and_support_areas(
            &volumes,
            &config,
            &overhangs,
            support_layer_storage,
            support_roof_storage,
            top_contacts.into_inner().unwrap(),
            cancel,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{ExPolygon, Point};
    use crate::scale;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> ExPolygons {
        vec![ExPolygon::rectangle(
            Point::new_scale(x0, y0),
            Point::new_scale(x1, y1),
        )]
    }

    #[test]
    fn test_no_overhang_no_support() {
        let generator = TreeSupportGenerator::new(
            TreeSupportMeshGroupSettings::default(),
            SupportStyle::Tree,
        );
        let outlines = vec![rect(0.0, 0.0, 20.0, 20.0); 10];
        let layers = generator
            .generate(
                &outlines,
                &[],
                &SupportOverlays::default(),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(layers.len(), 10);
        assert!(layers.iter().all(SupportLayer::is_empty));
    }

    #[test]
    fn test_too_few_layers() {
        let generator = TreeSupportGenerator::new(
            TreeSupportMeshGroupSettings::default(),
            SupportStyle::Tree,
        );
        let outlines = vec![rect(0.0, 0.0, 20.0, 20.0); 2];
        let layers = generator
            .generate(
                &outlines,
                &[],
                &SupportOverlays::default(),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(layers.len(), 2);
        assert!(layers.iter().all(SupportLayer::is_empty));
    }

    #[test]
    fn test_generator_respects_known_z() {
        let generator = TreeSupportGenerator::new(
            TreeSupportMeshGroupSettings::default(),
            SupportStyle::Tree,
        );
        let outlines = vec![rect(0.0, 0.0, 20.0, 20.0); 3];
        let zs: Vec<crate::Coord> = vec![scale(0.3), scale(0.5), scale(0.7)];
        let layers = generator
            .generate(
                &outlines,
                &zs,
                &SupportOverlays::default(),
                &CancellationToken::new(),
            )
            .unwrap();
        assert!((layers[0].print_z - 0.3).abs() < 1e-9);
        assert!((layers[2].print_z - 0.7).abs() < 1e-9);
    }
}
