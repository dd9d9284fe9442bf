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

//! Error type shared by all fallible operations in this crate.
//!
//! Every error is a precondition violation that is reported before any
//! caller-owned field is touched. Degenerate inputs (empty masks, zero grains)
//! are *not* errors and produce well-defined empty results instead.

use thiserror::Error;

/// Result type used throughout `rustronomy-grains`
pub type Result<T> = std::result::Result<T, GrainError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GrainError {
  /// Two fields that take part in one operation have different resolutions.
  /// Shapes are given as `(xres, yres)`.
  #[error("field shape mismatch: expected {expected:?} (xres, yres), found {found:?}")]
  ShapeMismatch { expected: (usize, usize), found: (usize, usize) },

  /// Pixel coordinates outside the field
  #[error("pixel (row {row}, col {col}) lies outside a field of {xres}x{yres} pixels")]
  OutOfBounds { row: usize, col: usize, xres: usize, yres: usize },

  /// A rectangular area that does not overlap the field at all
  #[error(
    "area of {width}x{height} pixels at (col {col}, row {row}) lies outside a field of {xres}x{yres} pixels"
  )]
  AreaOutside { col: usize, row: usize, width: usize, height: usize, xres: usize, yres: usize },

  /// A configuration parameter with an unusable value
  #[error("invalid value for `{name}`: {reason}")]
  InvalidParameter { name: &'static str, reason: String },

  /// Fields must have at least one pixel
  #[error("field resolution must be non-zero, got {xres}x{yres}")]
  InvalidResolution { xres: usize, yres: usize },

  /// Physical dimensions must be positive and finite
  #[error("physical field size must be positive and finite, got {xreal}x{yreal}")]
  InvalidExtent { xreal: f64, yreal: f64 },

  /// Raw data does not have `xres * yres` elements
  #[error("data of length {len} cannot back a field of {xres}x{yres} pixels")]
  DataLength { len: usize, xres: usize, yres: usize },
}

impl GrainError {
  pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
    GrainError::InvalidParameter { name, reason: reason.into() }
  }
}
