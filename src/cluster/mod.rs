//! Hierarchical clustering and dendrogram coloring.

pub mod color;
pub mod linkage;

use serde::Serialize;

pub use color::{leaf_colors, propagate_colors, ColorAssignment, Rgb};
pub use linkage::{Linkage, LinkageEdge, LinkageMethod};

use crate::error::{PipelineError, Result};

/// Self-contained dendrogram description for an external renderer.
#[derive(Debug, Clone, Serialize)]
pub struct DendrogramExport {
    pub leaf_names: Vec<String>,
    pub edges: Vec<LinkageEdge>,
    /// `#rrggbb` per node, leaves first.
    pub colors: Vec<String>,
}

impl DendrogramExport {
    pub fn new(
        leaf_names: &[String],
        linkage: &Linkage,
        colors: &ColorAssignment,
    ) -> Result<Self> {
        if leaf_names.len() != linkage.leaf_count() || colors.len() != linkage.node_count() {
            return Err(PipelineError::invalid_parameter(
                "dendrogram",
                format!(
                    "{} names and {} colors for {} leaves and {} nodes",
                    leaf_names.len(),
                    colors.len(),
                    linkage.leaf_count(),
                    linkage.node_count()
                ),
            ));
        }
        Ok(Self {
            leaf_names: leaf_names.to_vec(),
            edges: linkage.edges().to_vec(),
            colors: colors.to_hex(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linkage() -> Linkage {
        Linkage::new(
            2,
            vec![LinkageEdge {
                cluster1: 0,
                cluster2: 1,
                distance: 1.0,
                merged_size: 2,
            }],
        )
        .unwrap()
    }

    #[test]
    fn export_carries_hex_per_node() {
        let linkage = linkage();
        let colors = propagate_colors(
            &linkage,
            &[Rgb::new(1.0, 0.0, 0.0), Rgb::new(0.0, 0.0, 1.0)],
        )
        .unwrap();
        let names = vec!["a".to_string(), "b".to_string()];
        let export = DendrogramExport::new(&names, &linkage, &colors).unwrap();
        assert_eq!(export.colors, vec!["#ff0000", "#0000ff", "#800080"]);

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["edges"][0]["merged_size"], 2);
        assert_eq!(json["leaf_names"][1], "b");
    }

    #[test]
    fn export_rejects_mismatched_names() {
        let linkage = linkage();
        let colors =
            propagate_colors(&linkage, &[Rgb::new(0.0, 0.0, 0.0), Rgb::new(1.0, 1.0, 1.0)])
                .unwrap();
        let err = DendrogramExport::new(&["only".to_string()], &linkage, &colors).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter { name: "dendrogram", .. }));
    }
}
