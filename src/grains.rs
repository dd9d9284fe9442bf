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

//! Grain labeling and grain marking.
//!
//! A grain is a maximal connected set of foreground pixels. [`GrainLabels`]
//! numbers the grains of a mask `1..=N` in the order in which a raster scan
//! (top to bottom, left to right) first encounters them, with 0 for the
//! background. Every operation that removes grains renumbers the survivors so
//! the labels stay contiguous, without changing their relative order.
//!
//! Besides the watershed transform, this module offers several simple markers
//! that threshold a height-derived quantity (height, curvature, slope) or pick
//! out local maxima. [`threshold_grain_counts`] reports how the number of
//! height-threshold grains changes with the threshold, without marking each
//! level separately.

use ndarray as nd;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
  backward_neighbours,
  error::{GrainError, Result},
  field::{MaskField, ScalarField},
  filters, neighbours_4con, neighbours_8con, recolour,
  watershed::{Watershed, WatershedState},
  UNLABELED,
};

/// Which neighbours are considered connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Connectivity {
  /// Pixels sharing an edge
  #[default]
  Four,
  /// Pixels sharing an edge or a corner
  Eight,
}

/// Side of a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ThresholdSide {
  Above,
  Below,
}

/// How two sets of grains are combined by [`merge_labels`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MergeMode {
  /// Pixels that are grain in either input
  Union,
  /// Pixels that are grain in both inputs
  Intersection,
}

/// Smallest rectangle of pixels that contains a grain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BoundingBox {
  /// Leftmost column
  pub col: usize,
  /// Topmost row
  pub row: usize,
  pub width: usize,
  pub height: usize,
}

////////////////////////////////////////////////////////////////////////////////
//                              CONNECTED LABELING                            //
////////////////////////////////////////////////////////////////////////////////

//Root of `x`, halving the path on the way up
#[inline]
fn find(parent: &mut [usize], mut x: usize) -> usize {
  while parent[x] != x {
    parent[x] = parent[parent[x]];
    x = parent[x];
  }
  x
}

//Joins two sets; the smaller root always wins
#[inline]
fn union(parent: &mut [usize], a: usize, b: usize) {
  let (ra, rb) = (find(parent, a), find(parent, b));
  if ra < rb {
    parent[rb] = ra;
  } else if rb < ra {
    parent[ra] = rb;
  }
}

/// Numbers the connected components of `foreground`. Returns the label array
/// and the number of components. Labels follow raster discovery order.
pub(crate) fn number_grains(
  foreground: nd::ArrayView2<bool>,
  connectivity: Connectivity,
) -> (nd::Array2<usize>, usize) {
  let shape = foreground.dim();
  let eight = connectivity == Connectivity::Eight;
  let mut labels = nd::Array2::<usize>::zeros(shape);
  //parent[0] is the background and never joins anything
  let mut parent: Vec<usize> = vec![UNLABELED];

  /*
    First pass: give every foreground pixel the smallest provisional label of
    its already visited neighbours (or a fresh one) and remember which
    provisional labels touch. A provisional label is always smaller than any
    label created after it, so set roots are the first label of each grain.
  */
  for row in 0..shape.0 {
    for col in 0..shape.1 {
      if !foreground[(row, col)] {
        continue;
      }
      let mut own = UNLABELED;
      for idx in backward_neighbours((row, col), shape, eight) {
        let other = labels[idx];
        if other == UNLABELED {
          continue;
        }
        if own == UNLABELED {
          own = other;
        } else {
          union(&mut parent, own, other);
        }
      }
      if own == UNLABELED {
        own = parent.len();
        parent.push(own);
      }
      labels[(row, col)] = own;
    }
  }

  //Compact set roots into 1..=n. Roots appear in discovery order.
  let mut colour_map = vec![UNLABELED; parent.len()];
  let mut count = 0;
  for provisional in 1..parent.len() {
    let root = find(&mut parent, provisional);
    if root == provisional {
      count += 1;
      colour_map[provisional] = count;
    } else {
      colour_map[provisional] = colour_map[root];
    }
  }

  //Second pass: relabel all pixels at once
  recolour(labels.view_mut(), &colour_map);
  (labels, count)
}

////////////////////////////////////////////////////////////////////////////////
//                                GRAIN LABELS                                //
////////////////////////////////////////////////////////////////////////////////

/// Numbered grains of a mask. Label 0 is the background; grains are numbered
/// `1..=count` without gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrainLabels {
  labels: nd::Array2<usize>,
  count: usize,
}

impl GrainLabels {
  /// Labels the foreground (values `> 0`) of `mask`.
  pub fn label_grains(mask: &MaskField, connectivity: Connectivity) -> Self {
    let foreground = mask.data().mapv(|m| m > 0.0);
    Self::label_bools(foreground.view(), connectivity)
  }

  fn label_bools(foreground: nd::ArrayView2<bool>, connectivity: Connectivity) -> Self {
    let (labels, count) = number_grains(foreground, connectivity);
    log::debug!("labeled {count} grains ({connectivity:?} connectivity)");
    GrainLabels { labels, count }
  }

  /// Wraps an existing label array. The nonzero labels must be exactly
  /// `1..=N` for some `N`.
  pub fn from_labels(labels: nd::Array2<usize>) -> Result<Self> {
    let count = labels.iter().copied().max().unwrap_or(UNLABELED);
    let mut seen = vec![false; count + 1];
    labels.iter().for_each(|&label| seen[label] = true);
    if let Some(missing) = (1..=count).find(|&label| !seen[label]) {
      return Err(GrainError::invalid(
        "labels",
        format!("grain numbers must be contiguous, {missing} is missing below {count}"),
      ));
    }
    Ok(GrainLabels { labels, count })
  }

  /// Number of grains
  pub fn count(&self) -> usize {
    self.count
  }

  /// Label array, shaped `(yres, xres)`
  pub fn labels(&self) -> nd::ArrayView2<usize> {
    self.labels.view()
  }

  pub fn into_labels(self) -> nd::Array2<usize> {
    self.labels
  }

  /// Resolution as `(xres, yres)`
  pub fn shape(&self) -> (usize, usize) {
    (self.labels.ncols(), self.labels.nrows())
  }

  pub fn get(&self, row: usize, col: usize) -> Result<usize> {
    let (xres, yres) = self.shape();
    self.labels.get((row, col)).copied().ok_or(GrainError::OutOfBounds { row, col, xres, yres })
  }

  /// Pixel count of every grain, indexed by label. Index 0 holds the number
  /// of background pixels.
  pub fn sizes(&self) -> Vec<usize> {
    let mut sizes = vec![0; self.count + 1];
    self.labels.iter().for_each(|&label| sizes[label] += 1);
    sizes
  }

  /// Bounding box of every grain, indexed by label. Index 0 is an empty box.
  pub fn bounding_boxes(&self) -> Vec<BoundingBox> {
    //(min col, min row, max col, max row)
    let mut extent = vec![(usize::MAX, usize::MAX, 0, 0); self.count + 1];
    for ((row, col), &label) in self.labels.indexed_iter() {
      if label == UNLABELED {
        continue;
      }
      let e = &mut extent[label];
      *e = (e.0.min(col), e.1.min(row), e.2.max(col), e.3.max(row));
    }
    let mut boxes = vec![BoundingBox::default(); self.count + 1];
    for (label, &(col0, row0, col1, row1)) in extent.iter().enumerate().skip(1) {
      boxes[label] =
        BoundingBox { col: col0, row: row0, width: col1 + 1 - col0, height: row1 + 1 - row0 };
    }
    boxes
  }

  /// Binary mask of all grain pixels
  pub fn to_mask(&self, xreal: f64, yreal: f64) -> Result<MaskField> {
    let foreground = self.labels.mapv(|label| label != UNLABELED);
    MaskField::from_bools(foreground.view(), xreal, yreal)
  }

  /// Binary mask of all grain pixels, with the physical size of `field`
  pub fn mask_like(&self, field: &ScalarField) -> Result<MaskField> {
    self.check_shape(field)?;
    let mut mask = MaskField::new_for(field);
    nd::Zip::from(mask.data_mut()).and(&self.labels).par_for_each(|m, &label| {
      if label != UNLABELED {
        *m = 1.0;
      }
    });
    Ok(mask)
  }

  /// The labels stored as doubles in a scalar field
  pub fn to_field(&self, xreal: f64, yreal: f64) -> Result<ScalarField> {
    ScalarField::from_array(self.labels.mapv(|label| label as f64), xreal, yreal)
  }

  pub(crate) fn check_shape(&self, field: &ScalarField) -> Result<()> {
    if self.shape() == field.shape() {
      Ok(())
    } else {
      Err(GrainError::ShapeMismatch { expected: field.shape(), found: self.shape() })
    }
  }

  /// Removes the grain containing pixel `(row, col)`. Returns `false` if the
  /// pixel is background, in which case nothing changes.
  pub fn remove_grain(&mut self, row: usize, col: usize) -> Result<bool> {
    let target = self.get(row, col)?;
    if target == UNLABELED {
      return Ok(false);
    }
    let keep: Vec<bool> = (0..=self.count).map(|label| label != target).collect();
    self.retain(&keep);
    Ok(true)
  }

  /// Removes every grain except the one containing pixel `(row, col)`.
  /// Returns `false` if the pixel is background, in which case nothing
  /// changes.
  pub fn extract_grain(&mut self, row: usize, col: usize) -> Result<bool> {
    let target = self.get(row, col)?;
    if target == UNLABELED {
      return Ok(false);
    }
    let keep: Vec<bool> = (0..=self.count).map(|label| label == target).collect();
    self.retain(&keep);
    Ok(true)
  }

  /// Removes grains of fewer than `min_size` pixels. Returns the number of
  /// removed grains.
  pub fn remove_by_size(&mut self, min_size: usize) -> usize {
    let keep: Vec<bool> = self.sizes().into_iter().map(|size| size >= min_size).collect();
    self.retain(&keep)
  }

  /// Removes grains by height. With [`ThresholdSide::Above`] only grains that
  /// reach `threshold` (maximum `>= threshold`) survive, with
  /// [`ThresholdSide::Below`] only grains that reach down to it (minimum
  /// `<= threshold`). Returns the number of removed grains.
  pub fn remove_by_height(
    &mut self,
    height: &ScalarField,
    threshold: f64,
    side: ThresholdSide,
  ) -> Result<usize> {
    self.check_shape(height)?;
    let mut min = vec![f64::INFINITY; self.count + 1];
    let mut max = vec![f64::NEG_INFINITY; self.count + 1];
    nd::Zip::from(&self.labels).and(height.data()).for_each(|&label, &z| {
      min[label] = min[label].min(z);
      max[label] = max[label].max(z);
    });
    let keep: Vec<bool> = (0..=self.count)
      .map(|label| match side {
        ThresholdSide::Above => max[label] >= threshold,
        ThresholdSide::Below => min[label] <= threshold,
      })
      .collect();
    Ok(self.retain(&keep))
  }

  /// Keeps grains with `keep[label] == true` and renumbers them in order.
  /// Returns the number of removed grains.
  fn retain(&mut self, keep: &[bool]) -> usize {
    let mut colour_map = vec![UNLABELED; self.count + 1];
    let mut count = 0;
    for label in 1..=self.count {
      if keep[label] {
        count += 1;
        colour_map[label] = count;
      }
    }
    let removed = self.count - count;
    if removed > 0 {
      recolour(self.labels.view_mut(), &colour_map);
      self.count = count;
      log::debug!("removed {removed} grains, {count} left");
    }
    removed
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                  MARKING                                   //
////////////////////////////////////////////////////////////////////////////////

/// Runs the watershed transform to completion and returns the grain mask.
///
/// This is the non-interactive counterpart of driving
/// [`WatershedStatus::iterate`](crate::watershed::WatershedStatus::iterate)
/// by hand. With the `progress` feature enabled, a progress bar is shown.
pub fn mark_watershed(
  height: &ScalarField,
  watershed: &Watershed,
  seeds: Option<&MaskField>,
) -> Result<MaskField> {
  let mut status = watershed.start(height, seeds)?;

  #[cfg(feature = "progress")]
  let bar = crate::set_up_bar(1000);

  while status.iterate() != WatershedState::Finished {
    #[cfg(feature = "progress")]
    {
      bar.set_message(status.description());
      bar.set_position((1000.0 * status.fraction()) as u64);
    }
  }

  #[cfg(feature = "progress")]
  bar.finish_and_clear();

  status
    .into_mask()
    .ok_or_else(|| GrainError::invalid("watershed", "run ended without producing a mask"))
}

fn check_percent(percent: f64) -> Result<()> {
  if percent.is_finite() {
    Ok(())
  } else {
    Err(GrainError::invalid("percent", format!("threshold must be finite, got {percent}")))
  }
}

//Thresholds `quantity` at `percent` % of its range and labels the result
fn mark_relative(
  quantity: &ScalarField,
  percent: f64,
  side: ThresholdSide,
  connectivity: Connectivity,
) -> Result<GrainLabels> {
  check_percent(percent)?;
  let level = quantity.relative_level(percent);
  let foreground = match side {
    ThresholdSide::Above => quantity.data().mapv(|z| z >= level),
    ThresholdSide::Below => quantity.data().mapv(|z| z < level),
  };
  Ok(GrainLabels::label_bools(foreground.view(), connectivity))
}

/// Marks pixels above or below `percent` % of the height range.
pub fn mark_by_height(
  height: &ScalarField,
  percent: f64,
  side: ThresholdSide,
  connectivity: Connectivity,
) -> Result<GrainLabels> {
  mark_relative(height, percent, side, connectivity)
}

/// Marks pixels whose curvature (discrete Laplacian) lies above or below
/// `percent` % of its range.
pub fn mark_by_curvature(
  height: &ScalarField,
  percent: f64,
  side: ThresholdSide,
  connectivity: Connectivity,
) -> Result<GrainLabels> {
  check_percent(percent)?;
  mark_relative(&filters::laplacian(height), percent, side, connectivity)
}

/// Marks pixels whose slope (Sobel gradient magnitude) lies above or below
/// `percent` % of its range.
pub fn mark_by_slope(
  height: &ScalarField,
  percent: f64,
  side: ThresholdSide,
  connectivity: Connectivity,
) -> Result<GrainLabels> {
  check_percent(percent)?;
  mark_relative(&filters::slope_magnitude(height), percent, side, connectivity)
}

/// Marks local maxima: pixels strictly higher than all of their 8-connected
/// neighbours whose height reaches `percent` % of the height range. Each
/// maximum becomes its own grain unless two of them touch.
pub fn mark_local_maxima(
  height: &ScalarField,
  percent: f64,
  connectivity: Connectivity,
) -> Result<GrainLabels> {
  check_percent(percent)?;
  let level = height.relative_level(percent);
  let data = height.data();
  let shape = data.dim();

  let mut foreground = nd::Array2::from_elem(shape, false);
  nd::Zip::indexed(&mut foreground).par_for_each(|idx, px| {
    let z = data[idx];
    *px = z >= level && neighbours_8con(idx, shape).all(|next| data[next] < z);
  });
  Ok(GrainLabels::label_bools(foreground.view(), connectivity))
}

/// Combines the foregrounds of two label sets and labels the result from
/// scratch. The numbering of the inputs plays no role.
pub fn merge_labels(
  a: &GrainLabels,
  b: &GrainLabels,
  mode: MergeMode,
  connectivity: Connectivity,
) -> Result<GrainLabels> {
  if a.shape() != b.shape() {
    return Err(GrainError::ShapeMismatch { expected: a.shape(), found: b.shape() });
  }
  let mut foreground = nd::Array2::from_elem(a.labels.dim(), false);
  nd::Zip::from(&mut foreground).and(&a.labels).and(&b.labels).par_for_each(|px, &la, &lb| {
    *px = match mode {
      MergeMode::Union => la != UNLABELED || lb != UNLABELED,
      MergeMode::Intersection => la != UNLABELED && lb != UNLABELED,
    }
  });
  Ok(GrainLabels::label_bools(foreground.view(), connectivity))
}

////////////////////////////////////////////////////////////////////////////////
//                        THRESHOLD GRAIN NUMBER CURVE                        //
////////////////////////////////////////////////////////////////////////////////

/// Number of grains found by height thresholding, for a series of
/// equidistant thresholds between `min` and `max`.
///
/// Level 0 marks (almost) nothing and the last level marks the whole range.
/// Grains are 4-connected. With [`ThresholdSide::Below`] the grains are the
/// valleys below each threshold and the thresholds rise from `min`; with
/// [`ThresholdSide::Above`] they are the mountains above it and the
/// thresholds fall from `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct GrainCountCurve {
  /// Grain count per threshold level
  pub counts: Vec<usize>,
  pub min: f64,
  pub max: f64,
  pub side: ThresholdSide,
}

impl GrainCountCurve {
  /// Threshold height of every level
  pub fn thresholds(&self) -> Vec<f64> {
    let levels = self.counts.len();
    let step = if levels > 1 { (self.max - self.min) / (levels - 1) as f64 } else { 0.0 };
    (0..levels)
      .map(|h| match self.side {
        ThresholdSide::Below => self.min + h as f64 * step,
        ThresholdSide::Above => self.max - h as f64 * step,
      })
      .collect()
  }
}

//Levels used when the caller has no preference
fn default_levels(pixels: usize) -> usize {
  ((3.49 * (pixels as f64).cbrt() + 0.5).floor() as usize).max(2)
}

/// Grain number curve over the full height range of `height`. `levels`
/// defaults to a value that grows with the cube root of the pixel count.
pub fn threshold_grain_counts(
  height: &ScalarField,
  side: ThresholdSide,
  levels: Option<usize>,
) -> Result<GrainCountCurve> {
  threshold_grain_counts_range(height, height.min(), height.max(), side, levels)
}

/// Grain number curve for thresholds between `min` and `max`. Pixels outside
/// the range are clamped to the first or last level. If `min == max` all
/// counts are zero.
pub fn threshold_grain_counts_range(
  height: &ScalarField,
  min: f64,
  max: f64,
  side: ThresholdSide,
  levels: Option<usize>,
) -> Result<GrainCountCurve> {
  if !(min.is_finite() && max.is_finite() && min <= max) {
    return Err(GrainError::invalid("range", format!("need finite min <= max, got {min}..{max}")));
  }
  let data = height.data();
  let (rows, cols) = data.dim();
  let npx = rows * cols;
  let levels = match levels {
    Some(0) => return Err(GrainError::invalid("levels", "at least one level is needed")),
    Some(levels) => levels,
    None => default_levels(npx),
  };
  let mut curve = GrainCountCurve { counts: vec![0; levels], min, max, side };
  if max == min || npx == 0 {
    return Ok(curve);
  }

  /*
    Discrete level of every pixel. A pixel belongs to the grains of level h
    and all higher levels. Buckets are shifted by one so that the curve is
    symmetric between both sides: level 0 only holds pixels beyond the range.
  */
  let q = (levels - 1) as f64 / (max - min);
  let top = levels as i64 - 1;
  let level_of = |z: f64| -> usize {
    let k = match side {
      ThresholdSide::Below => (z - min) * q + 1.0,
      ThresholdSide::Above => (max - z) * q + 1.0,
    };
    (k as i64).clamp(0, top) as usize
  };

  //Pixels grouped by level, raster order within a level
  let mut by_level: Vec<Vec<usize>> = vec![Vec::new(); levels];
  for (i, &z) in data.iter().enumerate() {
    by_level[level_of(z)].push(i);
  }

  //Grow the grains level by level, tracking the number of components
  const ABSENT: usize = usize::MAX;
  let mut parent = vec![ABSENT; npx];
  let mut components = 0usize;
  for (h, pixels) in by_level.iter().enumerate() {
    for &i in pixels {
      parent[i] = i;
      components += 1;
    }
    for &i in pixels {
      for (r, c) in neighbours_4con((i / cols, i % cols), (rows, cols)) {
        let next = r * cols + c;
        if parent[next] == ABSENT {
          continue;
        }
        if find(&mut parent, i) != find(&mut parent, next) {
          union(&mut parent, i, next);
          components -= 1;
        }
      }
    }
    curve.counts[h] = components;
  }
  log::debug!("threshold grain curve over {levels} levels, at most {:?} grains", curve.counts.iter().max());
  Ok(curve)
}

/// Number of 4-connected neighbours of `idx` that carry a label other than
/// `label`. Used for boundary statistics.
#[inline]
pub(crate) fn foreign_edges(labels: nd::ArrayView2<usize>, idx: (usize, usize), label: usize) -> usize {
  neighbours_4con(idx, labels.dim()).filter(|&next| labels[next] != label).count()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn u_shape_is_one_grain() {
    //Both arms are discovered first as separate provisional labels
    let mask = nd::array![[true, false, true], [true, false, true], [true, true, true]];
    let (labels, count) = number_grains(mask.view(), Connectivity::Four);
    assert_eq!(count, 1);
    assert!(labels.iter().zip(mask.iter()).all(|(&l, &m)| (l == 1) == m));
  }

  #[test]
  fn diagonal_pixels_depend_on_connectivity() {
    let mask = nd::array![[true, false], [false, true]];
    assert_eq!(number_grains(mask.view(), Connectivity::Four).1, 2);
    assert_eq!(number_grains(mask.view(), Connectivity::Eight).1, 1);
  }

  #[test]
  fn labels_follow_discovery_order() {
    let mask = nd::array![[false, false, true], [true, false, false], [true, false, true]];
    let (labels, count) = number_grains(mask.view(), Connectivity::Four);
    assert_eq!(count, 3);
    assert_eq!(labels, nd::array![[0, 0, 1], [2, 0, 0], [2, 0, 3]]);
  }

  #[test]
  fn from_labels_rejects_gaps() {
    assert!(GrainLabels::from_labels(nd::array![[1, 0], [0, 3]]).is_err());
    assert_eq!(GrainLabels::from_labels(nd::array![[2, 0], [0, 1]]).unwrap().count(), 2);
  }

  #[test]
  fn bounding_boxes_cover_each_grain() {
    let grains = GrainLabels::from_labels(nd::array![
      [0, 1, 1, 0],
      [2, 0, 1, 0],
      [2, 0, 0, 3],
      [2, 2, 0, 0]
    ])
    .unwrap();
    let boxes = grains.bounding_boxes();
    assert_eq!(boxes.len(), 4);
    assert_eq!(boxes[0], BoundingBox::default());
    assert_eq!(boxes[1], BoundingBox { col: 1, row: 0, width: 2, height: 2 });
    assert_eq!(boxes[2], BoundingBox { col: 0, row: 1, width: 2, height: 3 });
    assert_eq!(boxes[3], BoundingBox { col: 3, row: 2, width: 1, height: 1 });
  }

  #[test]
  fn default_level_count_grows_with_size() {
    assert_eq!(default_levels(1), 2);
    //3.49 * 4 + 0.5 = 14.46
    assert_eq!(default_levels(64), 14);
  }

  #[test]
  fn foreign_edges_ignore_field_border() {
    let labels = nd::array![[1, 0], [0, 0]];
    assert_eq!(foreign_edges(labels.view(), (0, 0), 1), 2);
  }
}
