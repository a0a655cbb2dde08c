//! Size-weighted color blending over a linkage.

use serde::{Deserialize, Serialize};

use super::linkage::Linkage;
use crate::error::{PipelineError, Result};
use crate::reduce::ReducedMatrix;

/// Color with channels nominally in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Rgb {
    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    /// `self * (1 - t) + other * t`, per channel.
    pub fn lerp(self, other: Rgb, t: f32) -> Rgb {
        let mix = |a: f32, b: f32| a * (1.0 - t) + b * t;
        Rgb::new(mix(self.r, other.r), mix(self.g, other.g), mix(self.b, other.b))
    }

    /// `#rrggbb`, channels clamped and rounded.
    pub fn to_hex(self) -> String {
        let byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", byte(self.r), byte(self.g), byte(self.b))
    }
}

/// One color per linkage node: leaves first, then merges in edge order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColorAssignment {
    leaf_count: usize,
    colors: Vec<Rgb>,
}

impl ColorAssignment {
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn colors(&self) -> &[Rgb] {
        &self.colors
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    /// Color of node `id` (leaf or synthetic).
    pub fn get(&self, id: usize) -> Option<Rgb> {
        self.colors.get(id).copied()
    }

    pub fn to_hex(&self) -> Vec<String> {
        self.colors.iter().map(|color| color.to_hex()).collect()
    }
}

/// Extends leaf colors to every merge of `linkage`.
///
/// Each merge blends its children with `t = size2 / (size1 + size2)`, so a
/// node's color is the mean of the leaf colors beneath it.
pub fn propagate_colors(linkage: &Linkage, leaf_colors: &[Rgb]) -> Result<ColorAssignment> {
    if leaf_colors.len() != linkage.leaf_count() {
        return Err(PipelineError::invalid_parameter(
            "leaf_colors",
            format!(
                "{} colors for {} leaves",
                leaf_colors.len(),
                linkage.leaf_count()
            ),
        ));
    }
    let mut colors = Vec::with_capacity(linkage.node_count());
    colors.extend_from_slice(leaf_colors);
    for (index, edge) in linkage.edges().iter().enumerate() {
        let size = |id: usize| {
            linkage.size_of(id).ok_or_else(|| {
                PipelineError::invalid_linkage(index, format!("unknown cluster {id}"))
            })
        };
        let (size1, size2) = (size(edge.cluster1)?, size(edge.cluster2)?);
        let color = |id: usize| {
            colors.get(id).copied().ok_or_else(|| {
                PipelineError::invalid_linkage(index, format!("no color for cluster {id}"))
            })
        };
        let (c1, c2) = (color(edge.cluster1)?, color(edge.cluster2)?);
        let t = size2 as f32 / (size1 + size2) as f32;
        colors.push(c1.lerp(c2, t));
    }
    Ok(ColorAssignment {
        leaf_count: linkage.leaf_count(),
        colors,
    })
}

/// Reads leaf colors from three consecutive reduced columns.
pub fn leaf_colors(reduced: &ReducedMatrix, first_column: usize) -> Result<Vec<Rgb>> {
    let columns = reduced.coordinates.ncols();
    if first_column + 3 > columns {
        return Err(PipelineError::invalid_parameter(
            "color_column",
            format!(
                "{} has {columns} columns, colors need {}..{}",
                reduced.method,
                first_column,
                first_column + 3
            ),
        ));
    }
    Ok(reduced
        .coordinates
        .rows()
        .into_iter()
        .map(|row| Rgb::new(row[first_column], row[first_column + 1], row[first_column + 2]))
        .collect())
}
