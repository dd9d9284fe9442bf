/*
  Copyright© 2023 Raúl Wolters(1)

  This file is part of rustronomy-grains.

  rustronomy is free software: you can redistribute it and/or modify it under
  the terms of the European Union Public License version 1.2 or later, as
  published by the European Commission.

  rustronomy is distributed in the hope that it will be useful, but WITHOUT ANY
  WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
  A PARTICULAR PURPOSE. See the European Union Public License for more details.

  You should have received a copy of the EUPL in an/all official language(s) of
  the European Union along with rustronomy.  If not, see
  <https://ec.europa.eu/info/european-union-public-licence_en/>.

  (1) Resident of the Kingdom of the Netherlands; agreement between licensor and
  licensee subject to Dutch law as per article 15 of the EUPL.
*/

//! Per-grain quantities and their distributions.
//!
//! All per-grain results are returned as a `Vec<f64>` indexed by grain
//! label: element `i` belongs to grain `i`, and element 0 (the background) is
//! always `0.0`. Values are given in physical units, derived from the pixel
//! size of the height field. Use [`GrainQuantity::value`] to find out which
//! units a quantity has.
//!
//! ```rust
//! # use rustronomy_grains::prelude::*;
//! # use ndarray as nd;
//! let mut mask = MaskField::new(4, 4, 4.0, 4.0).unwrap();
//! mask.area_fill(0, 0, 2, 2, 1.0).unwrap();
//! let height = ScalarField::new(4, 4, 4.0, 4.0).unwrap();
//!
//! let grains = GrainLabels::label_grains(&mask, Connectivity::Four);
//! let stats = GrainStatistics::new(&height, &grains).unwrap();
//! assert_eq!(stats.values(GrainQuantity::ProjectedArea), vec![0.0, 4.0]);
//! assert_eq!(stats.values(GrainQuantity::BoundaryEdges), vec![0.0, 4.0]);
//! ```

use std::f64::consts::{FRAC_PI_2, PI};

use ndarray as nd;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
  error::{GrainError, Result},
  field::{median_of, MaskField, ScalarField},
  filters,
  grains::{foreign_edges, BoundingBox, Connectivity, GrainLabels},
  neighbours_4con, UNLABELED,
};

/// Number of histogram bins used when the caller has no preference
pub const DEFAULT_BINS: usize = 10;

//Laplace background interpolation
const LAPLACE_FACTOR: f64 = 0.2;
const LAPLACE_MAX_STEPS: usize = 500;

////////////////////////////////////////////////////////////////////////////////
//                              QUANTITY METADATA                             //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrainValueGroup {
  Id,
  Position,
  Value,
  Area,
  Volume,
  Boundary,
  Slope,
  Curvature,
}

/// Quantities that can be computed for every grain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GrainQuantity {
  /// The grain label itself
  Id,
  PixelCount,
  ProjectedArea,
  /// Area of the triangulated grain surface
  SurfaceArea,
  /// Side of a square with the projected area of the grain
  EquivSquareSide,
  /// Radius of a disc with the projected area of the grain
  EquivDiscRadius,
  /// Projected area of the part of the grain above `(min + max) / 2`
  HalfHeightArea,
  Minimum,
  Maximum,
  Mean,
  Median,
  /// Minimum over the pixels on the grain boundary
  BoundaryMinimum,
  /// Maximum over the pixels on the grain boundary
  BoundaryMaximum,
  CenterX,
  CenterY,
  /// Volume between the grain surface and zero
  Volume0,
  /// Volume between the grain surface and the grain minimum
  VolumeMin,
  /// Number of pixel edges between the grain and the rest of the field
  BoundaryEdges,
  /// Length of the grain outline, with diagonal steps where the outline turns
  BoundaryLength,
  /// Inclination of the least-squares plane through the grain. For grains
  /// whose pixels lie on one line only the slope along that line is known,
  /// and single pixels are flat.
  SlopeTheta,
  /// Direction in which the least-squares plane falls off
  SlopePhi,
  /// Smallest width of the grain over all directions
  MinBoundSize,
  /// Direction in which the grain is narrowest
  MinBoundAngle,
  /// Largest distance between two points of the grain
  MaxBoundSize,
  /// Direction of the largest distance between two points of the grain
  MaxBoundAngle,
  /// Volume above a background interpolated from the pixels around the grain
  VolumeLaplace,
  /// Lateral position of the vertex of the quadratic surface fitted to the
  /// grain
  CurvatureCenterX,
  CurvatureCenterY,
  /// Height of the fitted quadratic surface at its vertex
  CurvatureCenterZ,
  /// Smaller principal curvature of the fitted surface
  Curvature1,
  /// Larger principal curvature of the fitted surface
  Curvature2,
  CurvatureAngle1,
  CurvatureAngle2,
}

/// Static description of a [`GrainQuantity`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrainValue {
  pub quantity: GrainQuantity,
  pub name: &'static str,
  pub symbol: &'static str,
  pub group: GrainValueGroup,
  /// Power of the lateral unit in the unit of the quantity
  pub power_xy: i32,
  /// Power of the value unit in the unit of the quantity
  pub power_z: i32,
  /// Whether the quantity only makes sense if lateral and value units agree
  pub same_units: bool,
  /// Angles are in radians and have no unit
  pub is_angle: bool,
}

impl GrainQuantity {
  pub const ALL: [GrainQuantity; 33] = [
    GrainQuantity::Id,
    GrainQuantity::PixelCount,
    GrainQuantity::ProjectedArea,
    GrainQuantity::SurfaceArea,
    GrainQuantity::EquivSquareSide,
    GrainQuantity::EquivDiscRadius,
    GrainQuantity::HalfHeightArea,
    GrainQuantity::Minimum,
    GrainQuantity::Maximum,
    GrainQuantity::Mean,
    GrainQuantity::Median,
    GrainQuantity::BoundaryMinimum,
    GrainQuantity::BoundaryMaximum,
    GrainQuantity::CenterX,
    GrainQuantity::CenterY,
    GrainQuantity::Volume0,
    GrainQuantity::VolumeMin,
    GrainQuantity::BoundaryEdges,
    GrainQuantity::BoundaryLength,
    GrainQuantity::SlopeTheta,
    GrainQuantity::SlopePhi,
    GrainQuantity::MinBoundSize,
    GrainQuantity::MinBoundAngle,
    GrainQuantity::MaxBoundSize,
    GrainQuantity::MaxBoundAngle,
    GrainQuantity::VolumeLaplace,
    GrainQuantity::CurvatureCenterX,
    GrainQuantity::CurvatureCenterY,
    GrainQuantity::CurvatureCenterZ,
    GrainQuantity::Curvature1,
    GrainQuantity::Curvature2,
    GrainQuantity::CurvatureAngle1,
    GrainQuantity::CurvatureAngle2,
  ];

  pub fn value(self) -> GrainValue {
    use GrainQuantity as Q;
    use GrainValueGroup as G;
    let (name, symbol, group, power_xy, power_z, same_units) = match self {
      Q::Id => ("Grain number", "#", G::Id, 0, 0, false),
      Q::PixelCount => ("Pixel count", "n_px", G::Area, 0, 0, false),
      Q::ProjectedArea => ("Projected area", "A_0", G::Area, 2, 0, false),
      Q::SurfaceArea => ("Surface area", "A_s", G::Area, 2, 0, true),
      Q::EquivSquareSide => ("Equivalent square side", "a_eq", G::Area, 1, 0, false),
      Q::EquivDiscRadius => ("Equivalent disc radius", "r_eq", G::Area, 1, 0, false),
      Q::HalfHeightArea => ("Area above half-height", "A_h", G::Area, 2, 0, false),
      Q::Minimum => ("Minimum value", "z_min", G::Value, 0, 1, false),
      Q::Maximum => ("Maximum value", "z_max", G::Value, 0, 1, false),
      Q::Mean => ("Mean value", "z_m", G::Value, 0, 1, false),
      Q::Median => ("Median value", "z_med", G::Value, 0, 1, false),
      Q::BoundaryMinimum => ("Minimum value on boundary", "b_min", G::Value, 0, 1, false),
      Q::BoundaryMaximum => ("Maximum value on boundary", "b_max", G::Value, 0, 1, false),
      Q::CenterX => ("Center x position", "x_c", G::Position, 1, 0, false),
      Q::CenterY => ("Center y position", "y_c", G::Position, 1, 0, false),
      Q::Volume0 => ("Zero basis volume", "V_0", G::Volume, 2, 1, false),
      Q::VolumeMin => ("Grain minimum basis volume", "V_min", G::Volume, 2, 1, false),
      Q::BoundaryEdges => ("Boundary edge count", "n_b", G::Boundary, 0, 0, false),
      Q::BoundaryLength => ("Projected boundary length", "L_b0", G::Boundary, 1, 0, false),
      Q::SlopeTheta => ("Inclination θ", "theta", G::Slope, 0, 0, true),
      Q::SlopePhi => ("Inclination φ", "phi", G::Slope, 0, 0, false),
      Q::MinBoundSize => ("Minimum bounding size", "D_min", G::Boundary, 1, 0, false),
      Q::MinBoundAngle => ("Minimum bounding direction", "phi_min", G::Boundary, 0, 0, false),
      Q::MaxBoundSize => ("Maximum bounding size", "D_max", G::Boundary, 1, 0, false),
      Q::MaxBoundAngle => ("Maximum bounding direction", "phi_max", G::Boundary, 0, 0, false),
      Q::VolumeLaplace => ("Laplacian background basis volume", "V_L", G::Volume, 2, 1, false),
      Q::CurvatureCenterX => ("Curvature center x position", "x_0", G::Curvature, 1, 0, false),
      Q::CurvatureCenterY => ("Curvature center y position", "y_0", G::Curvature, 1, 0, false),
      Q::CurvatureCenterZ => ("Curvature center z value", "z_0", G::Curvature, 0, 1, false),
      Q::Curvature1 => ("Curvature 1", "kappa_1", G::Curvature, -1, 0, true),
      Q::Curvature2 => ("Curvature 2", "kappa_2", G::Curvature, -1, 0, true),
      Q::CurvatureAngle1 => ("Curvature angle 1", "phi_1", G::Curvature, 0, 0, false),
      Q::CurvatureAngle2 => ("Curvature angle 2", "phi_2", G::Curvature, 0, 0, false),
    };
    let is_angle = matches!(
      self,
      Q::SlopeTheta
        | Q::SlopePhi
        | Q::MinBoundAngle
        | Q::MaxBoundAngle
        | Q::CurvatureAngle1
        | Q::CurvatureAngle2
    );
    GrainValue { quantity: self, name, symbol, group, power_xy, power_z, same_units, is_angle }
  }
}

impl std::fmt::Display for GrainQuantity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.value().name)
  }
}

////////////////////////////////////////////////////////////////////////////////
//                              GRAIN STATISTICS                              //
////////////////////////////////////////////////////////////////////////////////

/// Computes grain quantities for a height field and its labeled grains.
#[derive(Debug, Clone)]
pub struct GrainStatistics<'a> {
  field: &'a ScalarField,
  grains: &'a GrainLabels,
  sizes: Vec<usize>,
}

impl<'a> GrainStatistics<'a> {
  /// Returns an error if `grains` and `field` do not have the same shape.
  pub fn new(field: &'a ScalarField, grains: &'a GrainLabels) -> Result<Self> {
    grains.check_shape(field)?;
    Ok(GrainStatistics { field, grains, sizes: grains.sizes() })
  }

  /// Number of grains
  pub fn count(&self) -> usize {
    self.grains.count()
  }

  /// Pixel count per grain, indexed by label. Element 0 is 0.
  pub fn pixel_counts(&self) -> Vec<usize> {
    let mut sizes = self.sizes.clone();
    sizes[UNLABELED] = 0;
    sizes
  }

  /// Values of `quantity` for every grain, indexed by label
  pub fn values(&self, quantity: GrainQuantity) -> Vec<f64> {
    use GrainQuantity as Q;
    let area = self.field.pixel_area();
    let mut values = match quantity {
      Q::Id => (0..=self.count()).map(|label| label as f64).collect(),
      Q::PixelCount => self.per_size(|n| n),
      Q::ProjectedArea => self.per_size(|n| n * area),
      Q::SurfaceArea => self.surface_area(),
      Q::EquivSquareSide => self.per_size(|n| (n * area).sqrt()),
      Q::EquivDiscRadius => self.per_size(|n| (n * area / PI).sqrt()),
      Q::HalfHeightArea => self.half_height_area(),
      Q::Minimum => self.extrema().0,
      Q::Maximum => self.extrema().1,
      Q::Mean => self.means(),
      Q::Median => self.medians(),
      Q::BoundaryMinimum => self.boundary_extrema().0,
      Q::BoundaryMaximum => self.boundary_extrema().1,
      Q::CenterX => self.physical_centres().0,
      Q::CenterY => self.physical_centres().1,
      Q::Volume0 => self.volume(false),
      Q::VolumeMin => self.volume(true),
      Q::BoundaryEdges => self.boundary_edges(),
      Q::BoundaryLength => self.boundary_length(),
      Q::SlopeTheta => self.slopes().0,
      Q::SlopePhi => self.slopes().1,
      Q::MinBoundSize => self.bounds(Bound::Min).0,
      Q::MinBoundAngle => self.bounds(Bound::Min).1,
      Q::MaxBoundSize => self.bounds(Bound::Max).0,
      Q::MaxBoundAngle => self.bounds(Bound::Max).1,
      Q::VolumeLaplace => self.volume_laplace(),
      Q::CurvatureCenterX => self.curvatures().iter().map(|c| c.x).collect(),
      Q::CurvatureCenterY => self.curvatures().iter().map(|c| c.y).collect(),
      Q::CurvatureCenterZ => self.curvatures().iter().map(|c| c.z).collect(),
      Q::Curvature1 => self.curvatures().iter().map(|c| c.kappa1).collect(),
      Q::Curvature2 => self.curvatures().iter().map(|c| c.kappa2).collect(),
      Q::CurvatureAngle1 => self.curvatures().iter().map(|c| c.phi1).collect(),
      Q::CurvatureAngle2 => self.curvatures().iter().map(|c| c.phi2).collect(),
    };
    values[UNLABELED] = 0.0;
    values
  }

  /// Values of several quantities at once, in the order requested
  pub fn quantities(&self, quantities: &[GrainQuantity]) -> Vec<Vec<f64>> {
    quantities.iter().map(|&q| self.values(q)).collect()
  }

  /// Mean of `quantity` over all grains, 0 if there are none.
  pub fn average(&self, quantity: GrainQuantity) -> f64 {
    if self.count() == 0 {
      0.0
    } else {
      self.total(quantity) / self.count() as f64
    }
  }

  /// Sum of `quantity` over all grains
  pub fn total(&self, quantity: GrainQuantity) -> f64 {
    self.values(quantity).iter().skip(1).sum()
  }

  /// Normalised histogram of `quantity` over all grains
  pub fn distribution(&self, quantity: GrainQuantity, bins: usize) -> Result<Distribution> {
    let values = self.values(quantity);
    Distribution::from_values(&values[1..], bins)
  }

  /// Grain size distribution: projected areas in [`DEFAULT_BINS`] bins
  pub fn area_distribution(&self) -> Result<Distribution> {
    self.distribution(GrainQuantity::ProjectedArea, DEFAULT_BINS)
  }

  ////////////////////////////////////////////////////////////////////////////
  //                            ACCUMULATORS                                //
  ////////////////////////////////////////////////////////////////////////////

  fn per_size(&self, f: impl Fn(f64) -> f64) -> Vec<f64> {
    self.sizes.iter().map(|&n| f(n as f64)).collect()
  }

  //Calls `f(label, (row, col), z)` for every grain pixel in raster order
  fn for_each_grain_px(&self, mut f: impl FnMut(usize, (usize, usize), f64)) {
    let data = self.field.data();
    for (idx, &label) in self.grains.labels().indexed_iter() {
      if label != UNLABELED {
        f(label, idx, data[idx]);
      }
    }
  }

  fn extrema(&self) -> (Vec<f64>, Vec<f64>) {
    let mut min = vec![f64::INFINITY; self.count() + 1];
    let mut max = vec![f64::NEG_INFINITY; self.count() + 1];
    self.for_each_grain_px(|label, _idx, z| {
      min[label] = min[label].min(z);
      max[label] = max[label].max(z);
    });
    (min, max)
  }

  fn means(&self) -> Vec<f64> {
    let mut sum = vec![0.0; self.count() + 1];
    self.for_each_grain_px(|label, _idx, z| sum[label] += z);
    sum.iter().zip(&self.sizes).map(|(s, &n)| if n == 0 { 0.0 } else { s / n as f64 }).collect()
  }

  fn medians(&self) -> Vec<f64> {
    let mut members: Vec<Vec<f64>> =
      self.sizes.iter().map(|&n| Vec::with_capacity(n)).collect();
    self.for_each_grain_px(|label, _idx, z| members[label].push(z));
    members.iter_mut().map(|buf| median_of(buf)).collect()
  }

  /// Mean pixel coordinates `(col, row)` of every grain
  fn centres(&self) -> (Vec<f64>, Vec<f64>) {
    let mut x = vec![0.0; self.count() + 1];
    let mut y = vec![0.0; self.count() + 1];
    self.for_each_grain_px(|label, (row, col), _z| {
      x[label] += col as f64;
      y[label] += row as f64;
    });
    for (label, &n) in self.sizes.iter().enumerate().skip(1) {
      if n > 0 {
        x[label] /= n as f64;
        y[label] /= n as f64;
      }
    }
    (x, y)
  }

  /// Grain centres in physical coordinates, offsets included
  fn physical_centres(&self) -> (Vec<f64>, Vec<f64>) {
    let (dx, xoff) = (self.field.dx(), self.field.xoffset());
    let (dy, yoff) = (self.field.dy(), self.field.yoffset());
    let (x, y) = self.centres();
    (
      x.into_iter().map(|x| dx * (x + 0.5) + xoff).collect(),
      y.into_iter().map(|y| dy * (y + 0.5) + yoff).collect(),
    )
  }

  fn half_height_area(&self) -> Vec<f64> {
    let (min, max) = self.extrema();
    let mut count = vec![0usize; self.count() + 1];
    self.for_each_grain_px(|label, _idx, z| {
      if z >= 0.5 * (min[label] + max[label]) {
        count[label] += 1;
      }
    });
    let area = self.field.pixel_area();
    count.into_iter().map(|n| n as f64 * area).collect()
  }

  fn boundary_extrema(&self) -> (Vec<f64>, Vec<f64>) {
    let labels = self.grains.labels();
    let (rows, cols) = labels.dim();
    let mut min = vec![f64::INFINITY; self.count() + 1];
    let mut max = vec![f64::NEG_INFINITY; self.count() + 1];
    self.for_each_grain_px(|label, (row, col), z| {
      //Pixels on the field edge always count as boundary
      let inner = row > 0
        && col > 0
        && row + 1 < rows
        && col + 1 < cols
        && foreign_edges(labels, (row, col), label) == 0;
      if !inner {
        min[label] = min[label].min(z);
        max[label] = max[label].max(z);
      }
    });
    (min, max)
  }

  fn boundary_edges(&self) -> Vec<f64> {
    let labels = self.grains.labels();
    let mut edges = vec![0.0; self.count() + 1];
    self.for_each_grain_px(|label, idx, _z| {
      edges[label] += foreign_edges(labels, idx, label) as f64;
    });
    edges
  }

  fn boundary_length(&self) -> Vec<f64> {
    let labels = self.grains.labels();
    let (rows, cols) = labels.dim();
    let (dx, dy) = (self.field.dx(), self.field.dy());
    let diag = dx.hypot(dy);
    let mut length = vec![0.0; self.count() + 1];

    /*
      Walk over all pixel corners, including the ones on the field edge. The
      2x2 block of pixels around a corner decides how the outline of each grain
      passes through it:
        - 1 or 3 pixels of the grain: the outline cuts the corner diagonally
        - 2 diagonal pixels: two diagonal cuts
        - 2 adjacent pixels: a straight piece
      Pixels outside the field are background.
    */
    let at = |row: usize, col: usize| -> usize {
      if row == 0 || col == 0 || row > rows || col > cols {
        UNLABELED
      } else {
        labels[(row - 1, col - 1)]
      }
    };
    for row in 0..=rows {
      for col in 0..=cols {
        //Shifted by one so that the block above and left of the corner exists
        let block = [at(row, col), at(row, col + 1), at(row + 1, col), at(row + 1, col + 1)];
        for (i, &label) in block.iter().enumerate() {
          //Every grain is handled once, at its first cell in the block
          if label == UNLABELED || block[..i].contains(&label) {
            continue;
          }
          let own = block.map(|other| other == label);
          length[label] += match own.iter().filter(|&&o| o).count() {
            1 | 3 => 0.5 * diag,
            2 if own[0] == own[3] => diag,
            2 if own[0] == own[1] => dx,
            2 => dy,
            _ => 0.0,
          };
        }
      }
    }
    length
  }

  fn surface_area(&self) -> Vec<f64> {
    let data = self.field.data();
    let (rows, cols) = data.dim();
    let (dx2, dy2) = (self.field.dx().powi(2), self.field.dy().powi(2));
    let mut area = vec![0.0; self.count() + 1];

    //Twice the area of the two triangles in one corner of a pixel
    let corner = |z1: f64, z2: f64, z4: f64, c: f64| -> f64 {
      (1.0 + (z1 - z2).powi(2) / dx2 + (z1 + z2 - c).powi(2) / dy2).sqrt()
        + (1.0 + (z1 - z4).powi(2) / dy2 + (z1 + z4 - c).powi(2) / dx2).sqrt()
    };

    self.for_each_grain_px(|label, (row, col), z| {
      let up = row.saturating_sub(1);
      let down = (row + 1).min(rows - 1);
      let left = col.saturating_sub(1);
      let right = (col + 1).min(cols - 1);
      let mut sum = 0.0;
      for &r in &[up, down] {
        for &c in &[left, right] {
          let centre = (z + data[(row, c)] + data[(r, c)] + data[(r, col)]) / 2.0;
          sum += corner(z, data[(row, c)], data[(r, col)], centre);
        }
      }
      area[label] += sum;
    });
    let scale = self.field.pixel_area() / 8.0;
    area.into_iter().map(|a| a * scale).collect()
  }

  fn volume(&self, from_minimum: bool) -> Vec<f64> {
    let data = self.field.data();
    let min = if from_minimum { Some(self.extrema().0) } else { None };
    let mut volume = vec![0.0; self.count() + 1];

    self.for_each_grain_px(|label, idx, _z| {
      let mut v = volume_stencil(data, idx);
      if let Some(min) = &min {
        v -= 96.0 * min[label];
      }
      volume[label] += v;
    });
    let scale = self.field.pixel_area() / 96.0;
    volume.into_iter().map(|v| v * scale).collect()
  }

  fn volume_laplace(&self) -> Vec<f64> {
    let mut volume = vec![0.0; self.count() + 1];
    let (xres, yres) = self.field.shape();
    let boxes = self.grains.bounding_boxes();
    let whole = BoundingBox { col: 0, row: 0, width: xres, height: yres };
    if self.count() == 1 && boxes[1] == whole {
      log::warn!("grain 1 covers the whole field, there is no background to interpolate");
      return volume;
    }
    let scale = self.field.pixel_area() / 96.0;
    for (label, bbox) in boxes.iter().enumerate().skip(1) {
      volume[label] = scale * self.laplace_grain(label, bbox);
    }
    volume
  }

  /*
    The grain is cut out of the field with a margin of one pixel, filled with
    the mean of the background pixels around it, and relaxed until the Laplace
    equation holds within 1% of the spread of those background pixels. The
    volume is taken between the data and this basis.
  */
  fn laplace_grain(&self, label: usize, bbox: &BoundingBox) -> f64 {
    let labels = self.grains.labels();
    let (rows, cols) = labels.dim();
    let (row0, row1) = (bbox.row.saturating_sub(1), (bbox.row + bbox.height + 1).min(rows));
    let (col0, col1) = (bbox.col.saturating_sub(1), (bbox.col + bbox.width + 1).min(cols));
    let data = self.field.data().slice_move(nd::s![row0..row1, col0..col1]);
    let labels = labels.slice_move(nd::s![row0..row1, col0..col1]);
    let inside = labels.mapv(|l| l == label);
    let shape = inside.dim();

    let (mut sum, mut sum2, mut n) = (0.0, 0.0, 0usize);
    for (idx, _) in inside.indexed_iter().filter(|&(_, &own)| own) {
      for next in neighbours_4con(idx, shape) {
        if labels[next] == UNLABELED {
          sum += data[next];
          sum2 += data[next] * data[next];
          n += 1;
        }
      }
    }
    if n == 0 {
      log::warn!("grain {label} does not touch the background, its Laplace volume is 0");
      return 0.0;
    }
    let mean = sum / n as f64;
    let max_err = 0.01 * (sum2 / n as f64 - mean * mean).abs().sqrt();

    let mut basis = data.to_owned();
    nd::Zip::from(&mut basis).and(&inside).for_each(|b, &own| {
      if own {
        *b = mean
      }
    });
    if max_err > 0.0 {
      for _ in 0..LAPLACE_MAX_STEPS {
        if filters::laplace_relax(&mut basis, inside.view(), LAPLACE_FACTOR) <= max_err {
          break;
        }
      }
    }

    let above = &data - &basis;
    inside
      .indexed_iter()
      .filter(|&(_, &own)| own)
      .map(|(idx, _)| volume_stencil(above.view(), idx))
      .sum()
  }

  fn slopes(&self) -> (Vec<f64>, Vec<f64>) {
    let (xc, yc) = self.centres();
    //Sums of xx, xy, yy, xz, yz relative to the grain centre
    let mut sums = vec![[0.0; 5]; self.count() + 1];
    self.for_each_grain_px(|label, (row, col), z| {
      let x = col as f64 - xc[label];
      let y = row as f64 - yc[label];
      let s = &mut sums[label];
      s[0] += x * x;
      s[1] += x * y;
      s[2] += y * y;
      s[3] += x * z;
      s[4] += y * z;
    });

    let (dx, dy) = (self.field.dx(), self.field.dy());
    let mut theta = vec![0.0; self.count() + 1];
    let mut phi = vec![0.0; self.count() + 1];
    for (label, &[xx, xy, yy, xz, yz]) in sums.iter().enumerate().skip(1) {
      let det = xx * yy - xy * xy;
      let (gx, gy) = if det > 1e-12 * xx * yy {
        ((xz * yy - xy * yz) / det, (yz * xx - xy * xz) / det)
      } else if xx + yy > 0.0 {
        //Pixels on one line: only the slope along the line is defined
        (xz / (xx + yy), yz / (xx + yy))
      } else {
        //Single pixel
        continue;
      };
      let (bx, by) = (gx / dx, gy / dy);
      theta[label] = bx.hypot(by).atan();
      phi[label] = by.atan2(-bx);
    }
    (theta, phi)
  }

  /// Size and direction of the narrowest or widest extent of every grain,
  /// measured on the convex hull of its pixel corners.
  fn bounds(&self, bound: Bound) -> (Vec<f64>, Vec<f64>) {
    let mut corners: Vec<Vec<(i64, i64)>> =
      self.sizes.iter().map(|&n| Vec::with_capacity(4 * n)).collect();
    self.for_each_grain_px(|label, (row, col), _z| {
      let (x, y) = (col as i64, row as i64);
      corners[label].extend([(x, y), (x + 1, y), (x, y + 1), (x + 1, y + 1)]);
    });

    let (dx, dy) = (self.field.dx(), self.field.dy());
    let mut size = vec![0.0; self.count() + 1];
    let mut angle = vec![0.0; self.count() + 1];
    for (label, points) in corners.into_iter().enumerate().skip(1) {
      let hull = convex_hull(points);
      let (vx, vy) = match bound {
        Bound::Min => narrowest(&hull, dx, dy),
        Bound::Max => widest(&hull, dx, dy),
      };
      size[label] = vx.hypot(vy);
      //y grows downwards in the field, angles are counted with y upwards
      angle[label] = wrap_half_turn((-vy).atan2(vx));
    }
    (size, angle)
  }

  /*
    Least-squares fit of z = b0 + b1 x + b2 y + b3 x² + b4 xy + b5 y² in pixel
    coordinates around the grain centre. The principal curvatures are the
    eigenvalues of the Hessian of the fit; the centre is its stationary point,
    restricted to the curved directions.
  */
  fn curvatures(&self) -> Vec<Curvature> {
    let (xc, yc) = self.centres();
    let mut normal = vec![[[0.0; 6]; 6]; self.count() + 1];
    let mut rhs = vec![[0.0; 6]; self.count() + 1];
    self.for_each_grain_px(|label, (row, col), z| {
      let (x, y) = (col as f64 - xc[label], row as f64 - yc[label]);
      let f = [1.0, x, y, x * x, x * y, y * y];
      for i in 0..6 {
        rhs[label][i] += f[i] * z;
        for j in 0..6 {
          normal[label][i][j] += f[i] * f[j];
        }
      }
    });

    let (px, py) = self.physical_centres();
    let means = self.means();
    let (dx, dy) = (self.field.dx(), self.field.dy());
    let mut result = vec![Curvature::flat(0.0, 0.0, 0.0); self.count() + 1];
    for label in 1..=self.count() {
      let flat = Curvature::flat(px[label], py[label], means[label]);
      let mut b = rhs[label];
      if self.sizes[label] < 6 || !cholesky_solve(&mut normal[label], &mut b) {
        result[label] = flat;
        continue;
      }
      //Quadratic terms at the level of rounding noise belong to a plane
      let scale = b[1..].iter().fold(0.0f64, |m, v| m.max(v.abs()));
      for coeff in &mut b[3..] {
        if coeff.abs() <= 1e-10 * scale {
          *coeff = 0.0;
        }
      }
      //Coefficients in physical units
      let c = [b[0], b[1] / dx, b[2] / dy, b[3] / (dx * dx), b[4] / (dx * dy), b[5] / (dy * dy)];
      result[label] = Curvature::from_quadric(c, px[label], py[label]);
    }
    result
  }
}

#[derive(Debug, Clone, Copy)]
enum Bound {
  Min,
  Max,
}

#[derive(Debug, Clone, Copy)]
struct Curvature {
  kappa1: f64,
  kappa2: f64,
  phi1: f64,
  phi2: f64,
  x: f64,
  y: f64,
  z: f64,
}

impl Curvature {
  fn flat(x: f64, y: f64, z: f64) -> Self {
    Curvature { kappa1: 0.0, kappa2: 0.0, phi1: 0.0, phi2: FRAC_PI_2, x, y, z }
  }

  /// Principal curvatures and vertex of the quadric with coefficients `c`
  /// (1, x, y, x², xy, y²), whose origin lies at `(x0, y0)`.
  fn from_quadric(c: [f64; 6], x0: f64, y0: f64) -> Self {
    let (hxx, hxy, hyy) = (2.0 * c[3], c[4], 2.0 * c[5]);
    let mean = 0.5 * (hxx + hyy);
    let dev = (0.5 * (hxx - hyy)).hypot(hxy);
    let (kappa1, kappa2) = (mean - dev, mean + dev);

    //Direction of kappa2 in field coordinates (y downwards)
    let theta = if dev == 0.0 { FRAC_PI_2 } else { 0.5 * hxy.atan2(0.5 * (hxx - hyy)) };
    let e2 = (theta.cos(), theta.sin());
    let e1 = (-e2.1, e2.0);

    //Stationary point, only along directions that are curved
    let tiny = 1e-10 * kappa1.abs().max(kappa2.abs());
    let mut p = (0.0, 0.0);
    for (kappa, e) in [(kappa1, e1), (kappa2, e2)] {
      if kappa.abs() > tiny {
        let t = -(c[1] * e.0 + c[2] * e.1) / kappa;
        p = (p.0 + t * e.0, p.1 + t * e.1);
      }
    }
    let along = |e: (f64, f64)| p.0 * e.0 + p.1 * e.1;
    let z = c[0]
      + c[1] * p.0
      + c[2] * p.1
      + 0.5 * (kappa1 * along(e1).powi(2) + kappa2 * along(e2).powi(2));

    let (phi1, phi2) = if dev == 0.0 {
      (0.0, FRAC_PI_2)
    } else {
      //Angles are counted with y upwards
      (wrap_half_turn(-(theta + FRAC_PI_2)), wrap_half_turn(-theta))
    };
    Curvature { kappa1, kappa2, phi1, phi2, x: x0 + p.0, y: y0 + p.1, z }
  }
}

////////////////////////////////////////////////////////////////////////////////
//                              HELPER FUNCTIONS                              //
////////////////////////////////////////////////////////////////////////////////

/// Weighted 3x3 sum around `idx` with edge clamping. The weights (52 centre,
/// 10 edge, 1 corner) add up to 96.
fn volume_stencil(data: nd::ArrayView2<f64>, (row, col): (usize, usize)) -> f64 {
  let (rows, cols) = data.dim();
  let up = row.saturating_sub(1);
  let down = (row + 1).min(rows - 1);
  let left = col.saturating_sub(1);
  let right = (col + 1).min(cols - 1);
  let edges = data[(up, col)] + data[(row, left)] + data[(row, right)] + data[(down, col)];
  let corners = data[(up, left)] + data[(up, right)] + data[(down, left)] + data[(down, right)];
  52.0 * data[(row, col)] + 10.0 * edges + corners
}

//Maps an undirected angle into (-π/2, π/2]
fn wrap_half_turn(phi: f64) -> f64 {
  if phi <= -FRAC_PI_2 {
    phi + PI
  } else if phi > FRAC_PI_2 {
    phi - PI
  } else {
    phi
  }
}

/// Convex hull of lattice points (monotone chain), without collinear points.
fn convex_hull(mut points: Vec<(i64, i64)>) -> Vec<(i64, i64)> {
  points.sort_unstable();
  points.dedup();
  if points.len() < 3 {
    return points;
  }
  let cross = |o: (i64, i64), a: (i64, i64), b: (i64, i64)| {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
  };
  let mut hull: Vec<(i64, i64)> = Vec::with_capacity(points.len() + 1);
  //Lower chain left to right
  for &p in &points {
    while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0 {
      hull.pop();
    }
    hull.push(p);
  }
  //Upper chain right to left, starting from the last point of the lower one
  let lower = hull.len() + 1;
  for &p in points.iter().rev().skip(1) {
    while hull.len() >= lower && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0 {
      hull.pop();
    }
    hull.push(p);
  }
  //The first point was visited twice
  hull.pop();
  hull
}

//Vector between the two hull vertices that are furthest apart
fn widest(hull: &[(i64, i64)], dx: f64, dy: f64) -> (f64, f64) {
  let mut best = (-1.0, (0.0, 0.0));
  for (i, a) in hull.iter().enumerate() {
    for b in &hull[i + 1..] {
      let v = (dx * (b.0 - a.0) as f64, dy * (b.1 - a.1) as f64);
      let len2 = v.0 * v.0 + v.1 * v.1;
      if len2 > best.0 {
        best = (len2, v);
      }
    }
  }
  best.1
}

//Shortest of the widths measured perpendicular to each hull edge
fn narrowest(hull: &[(i64, i64)], dx: f64, dy: f64) -> (f64, f64) {
  let mut best = (f64::INFINITY, (0.0, 0.0));
  for (i, a) in hull.iter().enumerate() {
    let b = hull[(i + 1) % hull.len()];
    let edge = (dx * (b.0 - a.0) as f64, dy * (b.1 - a.1) as f64);
    let edge2 = edge.0 * edge.0 + edge.1 * edge.1;
    if edge2 == 0.0 {
      continue;
    }
    let mut width = (-1.0, (0.0, 0.0));
    for x in hull {
      let v = (dx * (x.0 - a.0) as f64, dy * (x.1 - a.1) as f64);
      let s = (v.0 * edge.0 + v.1 * edge.1) / edge2;
      let perp = (v.0 - s * edge.0, v.1 - s * edge.1);
      let len2 = perp.0 * perp.0 + perp.1 * perp.1;
      if len2 > width.0 {
        width = (len2, perp);
      }
    }
    if width.0 < best.0 {
      best = width;
    }
  }
  best.1
}

/// Solves the symmetric positive definite system `a x = b` by Cholesky
/// decomposition, leaving `x` in `b`. Returns `false` if `a` is singular.
fn cholesky_solve<const N: usize>(a: &mut [[f64; N]; N], b: &mut [f64; N]) -> bool {
  for k in 0..N {
    let scale = a[k][k];
    let mut s = a[k][k];
    for i in 0..k {
      s -= a[k][i] * a[k][i];
    }
    if s <= 1e-12 * scale {
      return false;
    }
    let s = s.sqrt();
    a[k][k] = s;
    for j in k + 1..N {
      let mut r = a[j][k];
      for i in 0..k {
        r -= a[k][i] * a[j][i];
      }
      a[j][k] = r / s;
    }
  }
  //Forward substitution with L, then back substitution with L^T
  for j in 0..N {
    for i in 0..j {
      b[j] -= a[j][i] * b[i];
    }
    b[j] /= a[j][j];
  }
  for j in (0..N).rev() {
    for i in j + 1..N {
      b[j] -= a[i][j] * b[i];
    }
    b[j] /= a[j][j];
  }
  true
}

////////////////////////////////////////////////////////////////////////////////
//                                DISTRIBUTION                                //
////////////////////////////////////////////////////////////////////////////////

/// Histogram normalised to a probability density: the bins times the bin
/// width add up to 1 (or to 0 if there was no data).
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
  /// Density per bin
  pub bins: Vec<f64>,
  /// Lower edge of the first bin
  pub min: f64,
  pub bin_width: f64,
}

impl Distribution {
  /// Builds a histogram of the finite elements of `values`. If all values are
  /// equal, the histogram covers a range of width 1 centred on that value.
  /// Without any finite values all bins are zero.
  pub fn from_values(values: &[f64], bins: usize) -> Result<Self> {
    if bins == 0 {
      return Err(GrainError::invalid("bins", "a distribution needs at least one bin"));
    }
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
      return Ok(Distribution { bins: vec![0.0; bins], min: 0.0, bin_width: 1.0 / bins as f64 });
    }

    let (mut lo, mut hi) =
      finite.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if hi <= lo {
      lo -= 0.5;
      hi = lo + 1.0;
    }
    let bin_width = (hi - lo) / bins as f64;

    let mut counts = vec![0usize; bins];
    for v in &finite {
      let bin = (((v - lo) / bin_width) as usize).min(bins - 1);
      counts[bin] += 1;
    }
    let norm = 1.0 / (finite.len() as f64 * bin_width);
    Ok(Distribution {
      bins: counts.into_iter().map(|n| n as f64 * norm).collect(),
      min: lo,
      bin_width,
    })
  }

  /// Centre of every bin
  pub fn centres(&self) -> Vec<f64> {
    (0..self.bins.len()).map(|i| self.min + (i as f64 + 0.5) * self.bin_width).collect()
  }

  /// Σ bins·width; 1 for a nonempty histogram, 0 for an empty one.
  pub fn integral(&self) -> f64 {
    self.bins.iter().sum::<f64>() * self.bin_width
  }
}

/// Labels `mask` and returns the distribution of `quantity` over its grains.
pub fn grain_distribution(
  field: &ScalarField,
  mask: &MaskField,
  quantity: GrainQuantity,
  bins: usize,
  connectivity: Connectivity,
) -> Result<Distribution> {
  field.check_same_shape(mask)?;
  let grains = GrainLabels::label_grains(mask, connectivity);
  GrainStatistics::new(field, &grains)?.distribution(quantity, bins)
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray as nd;

  fn single_pixel() -> (ScalarField, GrainLabels) {
    let field = ScalarField::new(3, 3, 3.0, 3.0).unwrap();
    let grains = GrainLabels::from_labels(nd::array![[0, 0, 0], [0, 1, 0], [0, 0, 0]]).unwrap();
    (field, grains)
  }

  #[test]
  fn single_pixel_outline_is_octagon_like() {
    let (field, grains) = single_pixel();
    let stats = GrainStatistics::new(&field, &grains).unwrap();
    let length = stats.values(GrainQuantity::BoundaryLength)[1];
    assert!((length - 2.0 * 2f64.sqrt()).abs() < 1e-12);
    assert_eq!(stats.values(GrainQuantity::BoundaryEdges)[1], 4.0);
  }

  #[test]
  fn flat_grain_has_no_slope_and_flat_surface() {
    let (mut field, _) = single_pixel();
    field.fill(2.0);
    let grains = GrainLabels::from_labels(nd::Array2::from_elem((3, 3), 1)).unwrap();
    let stats = GrainStatistics::new(&field, &grains).unwrap();
    assert!((stats.values(GrainQuantity::SurfaceArea)[1] - 9.0).abs() < 1e-12);
    assert!((stats.values(GrainQuantity::Volume0)[1] - 18.0).abs() < 1e-12);
    assert!(stats.values(GrainQuantity::VolumeMin)[1].abs() < 1e-12);
    assert_eq!(stats.values(GrainQuantity::SlopeTheta)[1], 0.0);
  }

  #[test]
  fn tilted_grain_slope() {
    //z = col, so the plane rises by 1 per unit of x
    let data = nd::Array2::from_shape_fn((4, 4), |(_r, c)| c as f64);
    let field = ScalarField::from_array(data, 4.0, 4.0).unwrap();
    let grains = GrainLabels::from_labels(nd::Array2::from_elem((4, 4), 1)).unwrap();
    let stats = GrainStatistics::new(&field, &grains).unwrap();
    let theta = stats.values(GrainQuantity::SlopeTheta)[1];
    assert!((theta - std::f64::consts::FRAC_PI_4).abs() < 1e-12);
    //The plane falls off towards -x
    let phi = stats.values(GrainQuantity::SlopePhi)[1];
    assert!((phi - PI).abs() < 1e-12);
  }

  #[test]
  fn single_row_grain_slope_follows_the_row() {
    let data = nd::Array2::from_shape_fn((3, 4), |(_r, c)| c as f64);
    let field = ScalarField::from_array(data, 4.0, 3.0).unwrap();
    let grains = GrainLabels::from_labels(nd::array![
      [0, 0, 0, 0],
      [1, 1, 1, 1],
      [0, 0, 0, 0]
    ])
    .unwrap();
    let stats = GrainStatistics::new(&field, &grains).unwrap();
    let theta = stats.values(GrainQuantity::SlopeTheta)[1];
    assert!((theta - std::f64::consts::FRAC_PI_4).abs() < 1e-12);
    assert!((stats.values(GrainQuantity::SlopePhi)[1] - PI).abs() < 1e-12);

    //A single column on the same field is flat along its own direction
    let grains = GrainLabels::from_labels(nd::array![[0, 1, 0, 0], [0, 1, 0, 0], [0, 1, 0, 0]]).unwrap();
    let stats = GrainStatistics::new(&field, &grains).unwrap();
    assert_eq!(stats.values(GrainQuantity::SlopeTheta)[1], 0.0);
  }

  #[test]
  fn hull_of_square_has_four_corners() {
    let hull = convex_hull(vec![(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1), (0, 2), (2, 2)]);
    assert_eq!(hull.len(), 4);
    for corner in [(0, 0), (2, 0), (0, 2), (2, 2)] {
      assert!(hull.contains(&corner));
    }
  }

  #[test]
  fn bounds_of_pixel_rows() {
    //1x3 pixels: narrowest across the row, widest along the diagonal
    let field = ScalarField::new(5, 3, 5.0, 3.0).unwrap();
    let grains = GrainLabels::from_labels(nd::array![
      [0, 0, 0, 0, 0],
      [0, 1, 1, 1, 0],
      [0, 0, 0, 0, 0]
    ])
    .unwrap();
    let stats = GrainStatistics::new(&field, &grains).unwrap();
    assert!((stats.values(GrainQuantity::MinBoundSize)[1] - 1.0).abs() < 1e-12);
    assert!((stats.values(GrainQuantity::MinBoundAngle)[1] - FRAC_PI_2).abs() < 1e-12);
    assert!((stats.values(GrainQuantity::MaxBoundSize)[1] - 10f64.sqrt()).abs() < 1e-12);
    assert!((stats.values(GrainQuantity::MaxBoundAngle)[1].abs() - 1f64.atan2(3.0)).abs() < 1e-12);
  }

  #[test]
  fn curvature_of_saddle() {
    //z = xy relative to any origin has curvatures -1 and 1 along the diagonals
    let data = nd::Array2::from_shape_fn((5, 5), |(r, c)| r as f64 * c as f64);
    let field = ScalarField::from_array(data, 5.0, 5.0).unwrap();
    let grains = GrainLabels::from_labels(nd::Array2::from_elem((5, 5), 1)).unwrap();
    let stats = GrainStatistics::new(&field, &grains).unwrap();
    assert!((stats.values(GrainQuantity::Curvature1)[1] + 1.0).abs() < 1e-9);
    assert!((stats.values(GrainQuantity::Curvature2)[1] - 1.0).abs() < 1e-9);
    let quarter = std::f64::consts::FRAC_PI_4;
    assert!((stats.values(GrainQuantity::CurvatureAngle1)[1] - quarter).abs() < 1e-9);
    assert!((stats.values(GrainQuantity::CurvatureAngle2)[1] + quarter).abs() < 1e-9);
  }

  #[test]
  fn small_grains_have_no_curvature() {
    let (mut field, grains) = single_pixel();
    field.fill(3.0);
    let stats = GrainStatistics::new(&field, &grains).unwrap();
    assert_eq!(stats.values(GrainQuantity::Curvature1), vec![0.0, 0.0]);
    assert_eq!(stats.values(GrainQuantity::CurvatureAngle2)[1], FRAC_PI_2);
    assert_eq!(stats.values(GrainQuantity::CurvatureCenterZ)[1], 3.0);
    assert_eq!(stats.values(GrainQuantity::CurvatureCenterX)[1], 1.5);
  }

  #[test]
  fn cholesky_rejects_singular_matrix() {
    let mut a = [[1.0, 1.0], [1.0, 1.0]];
    let mut b = [1.0, 1.0];
    assert!(!cholesky_solve(&mut a, &mut b));

    let mut a = [[4.0, 2.0], [2.0, 3.0]];
    let mut b = [2.0, 5.0];
    assert!(cholesky_solve(&mut a, &mut b));
    assert!((b[0] + 0.5).abs() < 1e-12 && (b[1] - 2.0).abs() < 1e-12);
  }

  #[test]
  fn identical_values_get_unit_range() {
    let dist = Distribution::from_values(&[3.0, 3.0], 4).unwrap();
    assert_eq!(dist.min, 2.5);
    assert!((dist.integral() - 1.0).abs() < 1e-12);
  }

  #[test]
  fn zero_bins_is_an_error() {
    assert!(Distribution::from_values(&[1.0], 0).is_err());
  }
}
