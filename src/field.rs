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

//! Dense two-dimensional height fields and masks.
//!
//! A [`ScalarField`] is a row-major grid of `f64` values with a physical size
//! attached to it. Aggregate statistics (minimum, maximum, sum, rms and median)
//! are computed lazily and cached on the field. Every method that mutates the
//! data clears the cache before it returns, so a cached value is always equal
//! to the value one would get by recomputing it from scratch.
//!
//! A [`MaskField`] is a `ScalarField` restricted (by convention) to the values
//! `0.0` (background) and `1.0` (grain). It derefs to `ScalarField`, so all of
//! the field machinery is available on masks as well.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};

use ndarray as nd;
use num_traits::ToPrimitive;
use rayon::prelude::*;

use crate::error::{GrainError, Result};

////////////////////////////////////////////////////////////////////////////////
//                              STATISTICS CACHE                              //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Default)]
struct StatCache {
  min: Cell<Option<f64>>,
  max: Cell<Option<f64>>,
  sum: Cell<Option<f64>>,
  rms: Cell<Option<f64>>,
  median: Cell<Option<f64>>,
}

impl StatCache {
  fn clear(&self) {
    self.min.set(None);
    self.max.set(None);
    self.sum.set(None);
    self.rms.set(None);
    self.median.set(None);
  }
}

#[inline]
fn cached(cell: &Cell<Option<f64>>, compute: impl FnOnce() -> f64) -> f64 {
  match cell.get() {
    Some(value) => value,
    None => {
      let value = compute();
      cell.set(Some(value));
      value
    }
  }
}

/// Returns the element of sorted index `n/2` (the upper median for even `n`).
/// The buffer is reordered in the process. Returns 0 for an empty buffer.
pub(crate) fn median_of(buf: &mut [f64]) -> f64 {
  if buf.is_empty() {
    return 0.0;
  }
  let mid = buf.len() / 2;
  let (_, median, _) = buf.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
  *median
}

fn check_resolution(xres: usize, yres: usize) -> Result<()> {
  if xres == 0 || yres == 0 {
    Err(GrainError::InvalidResolution { xres, yres })
  } else {
    Ok(())
  }
}

fn check_extent(xreal: f64, yreal: f64) -> Result<()> {
  if xreal.is_finite() && yreal.is_finite() && xreal > 0.0 && yreal > 0.0 {
    Ok(())
  } else {
    Err(GrainError::InvalidExtent { xreal, yreal })
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                SCALAR FIELD                                //
////////////////////////////////////////////////////////////////////////////////

/// Dense 2D grid of `f64` values with a physical size.
///
/// Data is indexed as `[row, col]`, so the underlying array has the shape
/// `(yres, xres)`. Resolution and physical size are fixed at creation.
#[derive(Debug, Clone)]
pub struct ScalarField {
  data: nd::Array2<f64>,
  xreal: f64,
  yreal: f64,
  xoff: f64,
  yoff: f64,
  cache: StatCache,
}

impl PartialEq for ScalarField {
  fn eq(&self, other: &Self) -> bool {
    self.xreal == other.xreal
      && self.yreal == other.yreal
      && self.xoff == other.xoff
      && self.yoff == other.yoff
      && self.data == other.data
  }
}

impl ScalarField {
  /// Creates a new zero-filled field of `xres` columns and `yres` rows that
  /// covers a physical area of `xreal` by `yreal`.
  pub fn new(xres: usize, yres: usize, xreal: f64, yreal: f64) -> Result<Self> {
    check_resolution(xres, yres)?;
    check_extent(xreal, yreal)?;
    Ok(ScalarField {
      data: nd::Array2::zeros((yres, xres)),
      xreal,
      yreal,
      xoff: 0.0,
      yoff: 0.0,
      cache: StatCache::default(),
    })
  }

  /// Wraps an existing `(yres, xres)` array.
  pub fn from_array(data: nd::Array2<f64>, xreal: f64, yreal: f64) -> Result<Self> {
    let (yres, xres) = data.dim();
    check_resolution(xres, yres)?;
    check_extent(xreal, yreal)?;
    Ok(ScalarField { data, xreal, yreal, xoff: 0.0, yoff: 0.0, cache: StatCache::default() })
  }

  /// Builds a field from an array of any numeric type. Values that cannot be
  /// represented as `f64` become `NaN`.
  pub fn from_array_of<T>(data: nd::ArrayView2<T>, xreal: f64, yreal: f64) -> Result<Self>
  where
    T: ToPrimitive + Copy,
  {
    Self::from_array(data.mapv(|x| x.to_f64().unwrap_or(f64::NAN)), xreal, yreal)
  }

  /// Builds a field from row-major raw data of length `xres * yres`.
  pub fn from_vec(
    xres: usize,
    yres: usize,
    xreal: f64,
    yreal: f64,
    data: Vec<f64>,
  ) -> Result<Self> {
    check_resolution(xres, yres)?;
    let len = data.len();
    let array = nd::Array2::from_shape_vec((yres, xres), data)
      .map_err(|_| GrainError::DataLength { len, xres, yres })?;
    Self::from_array(array, xreal, yreal)
  }

  /// Creates a zero-filled field with the same resolution, physical size and
  /// offsets as `self`.
  pub fn new_alike(&self) -> Self {
    ScalarField {
      data: nd::Array2::zeros(self.data.dim()),
      xreal: self.xreal,
      yreal: self.yreal,
      xoff: self.xoff,
      yoff: self.yoff,
      cache: StatCache::default(),
    }
  }

  #[inline]
  pub fn xres(&self) -> usize {
    self.data.ncols()
  }

  #[inline]
  pub fn yres(&self) -> usize {
    self.data.nrows()
  }

  /// Resolution as `(xres, yres)`
  #[inline]
  pub fn shape(&self) -> (usize, usize) {
    (self.xres(), self.yres())
  }

  pub fn xreal(&self) -> f64 {
    self.xreal
  }

  pub fn yreal(&self) -> f64 {
    self.yreal
  }

  pub fn xoffset(&self) -> f64 {
    self.xoff
  }

  pub fn yoffset(&self) -> f64 {
    self.yoff
  }

  /// Sets the physical position of the top-left corner of the field.
  pub fn set_offsets(&mut self, xoff: f64, yoff: f64) {
    self.xoff = xoff;
    self.yoff = yoff;
  }

  /// Physical width of one pixel
  pub fn dx(&self) -> f64 {
    self.xreal / self.xres() as f64
  }

  /// Physical height of one pixel
  pub fn dy(&self) -> f64 {
    self.yreal / self.yres() as f64
  }

  pub fn pixel_area(&self) -> f64 {
    self.dx() * self.dy()
  }

  pub(crate) fn check_same_shape(&self, other: &ScalarField) -> Result<()> {
    if self.shape() == other.shape() {
      Ok(())
    } else {
      Err(GrainError::ShapeMismatch { expected: self.shape(), found: other.shape() })
    }
  }

  #[inline]
  fn check_index(&self, row: usize, col: usize) -> Result<()> {
    if row < self.yres() && col < self.xres() {
      Ok(())
    } else {
      Err(GrainError::OutOfBounds { row, col, xres: self.xres(), yres: self.yres() })
    }
  }

  pub fn get(&self, row: usize, col: usize) -> Result<f64> {
    self.check_index(row, col)?;
    Ok(self.data[(row, col)])
  }

  pub fn set(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
    self.check_index(row, col)?;
    self.data[(row, col)] = value;
    self.invalidate();
    Ok(())
  }

  /// Read-only view of the data, shaped `(yres, xres)`
  pub fn data(&self) -> nd::ArrayView2<f64> {
    self.data.view()
  }

  /// Mutable view of the data. The statistics cache is cleared up front; the
  /// exclusive borrow guarantees nobody can query the field while the view is
  /// alive.
  pub fn data_mut(&mut self) -> nd::ArrayViewMut2<f64> {
    self.invalidate();
    self.data.view_mut()
  }

  pub fn into_array(self) -> nd::Array2<f64> {
    self.data
  }

  /// Clears all cached statistics.
  pub fn invalidate(&self) {
    self.cache.clear();
  }

  ////////////////////////////////////////////////////////////////////////////
  //                             STATISTICS                                 //
  ////////////////////////////////////////////////////////////////////////////

  pub fn min(&self) -> f64 {
    cached(&self.cache.min, || {
      self.data.view().into_par_iter().copied().reduce(|| f64::INFINITY, f64::min)
    })
  }

  pub fn max(&self) -> f64 {
    cached(&self.cache.max, || {
      self.data.view().into_par_iter().copied().reduce(|| f64::NEG_INFINITY, f64::max)
    })
  }

  pub fn sum(&self) -> f64 {
    cached(&self.cache.sum, || self.data.iter().sum())
  }

  pub fn mean(&self) -> f64 {
    self.sum() / self.data.len() as f64
  }

  /// Root mean square of the deviations from the mean, i.e. the population
  /// standard deviation of the data.
  pub fn rms(&self) -> f64 {
    cached(&self.cache.rms, || {
      let n = self.data.len() as f64;
      let sum = self.sum();
      let sum2: f64 = self.data.iter().map(|z| z * z).sum();
      ((sum2 - sum * sum / n).abs() / n).sqrt()
    })
  }

  pub fn median(&self) -> f64 {
    cached(&self.cache.median, || {
      let mut buf: Vec<f64> = self.data.iter().copied().collect();
      median_of(&mut buf)
    })
  }

  /// Value lying `percent` % of the way from the minimum to the maximum
  pub fn relative_level(&self, percent: f64) -> f64 {
    let min = self.min();
    min + percent * (self.max() - min) / 100.0
  }

  /// Mean of all nonzero values. Works on masks as well as on double-encoded
  /// grain label fields. Returns 0 if every value is zero.
  pub fn foreground_mean(&self) -> f64 {
    let (sum, n) = self
      .data
      .iter()
      .filter(|&&z| z != 0.0)
      .fold((0.0, 0usize), |(sum, n), &z| (sum + z, n + 1));
    if n == 0 {
      0.0
    } else {
      sum / n as f64
    }
  }

  /// Mean of the values under the foreground of `mask`. Returns 0 for an
  /// empty mask.
  pub fn mean_under_mask(&self, mask: &MaskField) -> Result<f64> {
    self.check_same_shape(mask)?;
    let mut sum = 0.0;
    let mut n = 0usize;
    nd::Zip::from(&self.data).and(mask.data()).for_each(|&z, &m| {
      if m > 0.0 {
        sum += z;
        n += 1;
      }
    });
    Ok(if n == 0 { 0.0 } else { sum / n as f64 })
  }

  ////////////////////////////////////////////////////////////////////////////
  //                             AREA ACCESS                                //
  ////////////////////////////////////////////////////////////////////////////

  /// Intersects a rectangle with the field. A rectangle without any overlap
  /// is an error; one sticking out of the field is truncated.
  fn clip_area(
    &self,
    col: usize,
    row: usize,
    width: usize,
    height: usize,
  ) -> Result<(usize, usize, usize, usize)> {
    let (xres, yres) = self.shape();
    if width == 0 || height == 0 || col >= xres || row >= yres {
      return Err(GrainError::AreaOutside { col, row, width, height, xres, yres });
    }
    Ok((col, row, width.min(xres - col), height.min(yres - row)))
  }

  /// Copies a rectangular part of the field into a new field. The new field
  /// has the same pixel size as `self` and is offset accordingly.
  pub fn area_extract(
    &self,
    col: usize,
    row: usize,
    width: usize,
    height: usize,
  ) -> Result<ScalarField> {
    let (col, row, width, height) = self.clip_area(col, row, width, height)?;
    let data = self.data.slice(nd::s![row..row + height, col..col + width]).to_owned();
    let mut area = ScalarField::from_array(data, self.dx() * width as f64, self.dy() * height as f64)?;
    area.set_offsets(self.xoff + self.dx() * col as f64, self.yoff + self.dy() * row as f64);
    Ok(area)
  }

  /// Fills a rectangular part of the field with `value`.
  pub fn area_fill(
    &mut self,
    col: usize,
    row: usize,
    width: usize,
    height: usize,
    value: f64,
  ) -> Result<()> {
    let (col, row, width, height) = self.clip_area(col, row, width, height)?;
    self.data.slice_mut(nd::s![row..row + height, col..col + width]).fill(value);
    self.invalidate();
    Ok(())
  }

  ////////////////////////////////////////////////////////////////////////////
  //                              ARITHMETIC                                //
  ////////////////////////////////////////////////////////////////////////////

  pub fn fill(&mut self, value: f64) {
    self.data.fill(value);
    self.invalidate();
  }

  pub fn clear(&mut self) {
    self.fill(0.0);
  }

  pub fn add(&mut self, value: f64) {
    self.data.mapv_inplace(|z| z + value);
    self.invalidate();
  }

  pub fn multiply(&mut self, factor: f64) {
    self.data.mapv_inplace(|z| z * factor);
    self.invalidate();
  }

  /// Applies `f` to every value in place.
  pub fn map_inplace(&mut self, f: impl Fn(f64) -> f64) {
    self.data.mapv_inplace(f);
    self.invalidate();
  }

  /// Replaces values below `level` with `below` and all others with `above`.
  pub fn threshold(&mut self, level: f64, below: f64, above: f64) {
    self.data.mapv_inplace(|z| if z < level { below } else { above });
    self.invalidate();
  }

  /// Copies the data of `other` into `self`. Physical size is left untouched.
  pub fn copy_from(&mut self, other: &ScalarField) -> Result<()> {
    self.check_same_shape(other)?;
    self.data.assign(&other.data);
    self.invalidate();
    Ok(())
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                 MASK FIELD                                 //
////////////////////////////////////////////////////////////////////////////////

/// A [`ScalarField`] holding `1.0` for grain pixels and `0.0` for background.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskField(ScalarField);

impl Deref for MaskField {
  type Target = ScalarField;
  fn deref(&self) -> &ScalarField {
    &self.0
  }
}

impl DerefMut for MaskField {
  fn deref_mut(&mut self) -> &mut ScalarField {
    &mut self.0
  }
}

impl MaskField {
  /// Creates an empty (all-background) mask.
  pub fn new(xres: usize, yres: usize, xreal: f64, yreal: f64) -> Result<Self> {
    Ok(MaskField(ScalarField::new(xres, yres, xreal, yreal)?))
  }

  /// Creates an empty mask matching the shape and physical size of `field`.
  pub fn new_for(field: &ScalarField) -> Self {
    MaskField(field.new_alike())
  }

  /// Reinterprets a field as a mask. The values are taken as they are.
  pub fn from_field(field: ScalarField) -> Self {
    MaskField(field)
  }

  /// Builds a mask from a boolean `(yres, xres)` array.
  pub fn from_bools(mask: nd::ArrayView2<bool>, xreal: f64, yreal: f64) -> Result<Self> {
    let data = mask.mapv(|m| if m { 1.0 } else { 0.0 });
    Ok(MaskField(ScalarField::from_array(data, xreal, yreal)?))
  }

  pub fn as_field(&self) -> &ScalarField {
    &self.0
  }

  pub fn into_field(self) -> ScalarField {
    self.0
  }

  pub fn is_foreground(&self, row: usize, col: usize) -> Result<bool> {
    Ok(self.get(row, col)? == 1.0)
  }

  /// Number of pixels that are exactly `1.0`
  pub fn count_foreground(&self) -> usize {
    self.data().iter().filter(|&&m| m == 1.0).count()
  }

  /// Swaps grain and background. Only meaningful for proper {0, 1} masks.
  pub fn invert(&mut self) {
    self.0.map_inplace(|m| 1.0 - m);
  }

  /// Pointwise maximum with `other`: grains of either mask are kept.
  pub fn union(&mut self, other: &MaskField) -> Result<()> {
    self.check_same_shape(other)?;
    nd::Zip::from(self.0.data_mut()).and(other.data()).for_each(|a, &b| *a = a.max(b));
    Ok(())
  }

  /// Pointwise minimum with `other`: only pixels marked in both masks remain.
  pub fn intersect(&mut self, other: &MaskField) -> Result<()> {
    self.check_same_shape(other)?;
    nd::Zip::from(self.0.data_mut()).and(other.data()).for_each(|a, &b| *a = a.min(b));
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn median_picks_upper_middle() {
    let mut even = vec![4.0, 1.0, 3.0, 2.0];
    assert_eq!(median_of(&mut even), 3.0);
    let mut odd = vec![5.0, 1.0, 3.0];
    assert_eq!(median_of(&mut odd), 3.0);
    assert_eq!(median_of(&mut []), 0.0);
  }

  #[test]
  fn cache_is_refreshed_after_set() {
    let mut field = ScalarField::new(3, 2, 3.0, 2.0).unwrap();
    assert_eq!(field.max(), 0.0);
    field.set(1, 2, 5.0).unwrap();
    assert_eq!(field.max(), 5.0);
    assert_eq!(field.sum(), 5.0);
  }
}
