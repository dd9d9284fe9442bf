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

#![doc(
  html_logo_url = "https://raw.githubusercontent.com/smups/rustronomy/main/logos/Rustronomy_ferris.png?raw=true"
)]
//! Rustronomy-grains is a pure-rust implementation of grain segmentation and
//! grain statistics for height fields, as produced by scanning
//! microscopes (AFM, STM, ...).
//!
//! # Features
//! The crate is built around four steps:
//! 1. A [`ScalarField`](field::ScalarField) holds the height data. Aggregate
//! statistics are cached on the field and refreshed after every mutation.
//! 2. Grains are *marked*, producing a [`MaskField`](field::MaskField). Masks
//! can be made with an iterative watershed transform (see [`watershed`]), or
//! with one of the threshold-based markers in [`grains`] (height, curvature,
//! slope, local maxima).
//! 3. The mask is *labeled*: every connected grain receives a number, starting
//! at 1 in raster-scan order. Grains can be filtered by size or height, and
//! masks from different markers can be merged.
//! 4. Per-grain quantities (area, volume, boundary length, slope, ...) and
//! their distributions are computed by [`GrainStatistics`](statistics::GrainStatistics).
//!
//! Everything in this crate is deterministic: running the same operation twice
//! on the same input produces bit-identical output.
//!
//! # Quickstart
//! To use the latest release of Rustronomy-grains in a cargo project, add
//! the rustronomy-grains crate as a dependency to your `Cargo.toml` file:
//! ```toml
//! [dependencies]
//! rustronomy-grains = "0.1.0"
//! ```
//!
//! ## Short example: counting the grains on a surface
//! The simplest way to find grains is to mark everything above a height
//! threshold. Thresholds are given in percent of the height range.
//! ```rust
//! use rustronomy_grains::prelude::*;
//! use ndarray as nd;
//!
//! //Two bumps on a flat surface
//! let data = nd::Array2::from_shape_fn((32, 32), |(r, c)| {
//!   let bump = |r0: f64, c0: f64| (-((r as f64 - r0).powi(2) + (c as f64 - c0).powi(2)) / 8.0).exp();
//!   bump(10.0, 10.0) + bump(22.0, 22.0)
//! });
//! let field = ScalarField::from_array(data, 1e-6, 1e-6).unwrap();
//!
//! //Mark everything above half of the height range, then number the grains
//! let grains = mark_by_height(&field, 50.0, ThresholdSide::Above, Connectivity::Four).unwrap();
//! assert_eq!(grains.count(), 2);
//!
//! //Compute the projected area of both grains
//! let stats = GrainStatistics::new(&field, &grains).unwrap();
//! let areas = stats.values(GrainQuantity::ProjectedArea);
//! assert_eq!(areas.len(), 3); //index 0 is the background
//! ```
//!
//! ## Interactive watershed
//! The watershed transform is configured with the `WatershedBuilder` struct,
//! following the same builder pattern as `rustronomy-watershed`. The transform
//! itself is a state machine that performs one bounded unit of work per call,
//! so that a caller can show progress or abort in between:
//! ```rust
//! # use rustronomy_grains::prelude::*;
//! # let field = ScalarField::new(16, 16, 1.0, 1.0).unwrap();
//! let watershed = WatershedBuilder::new_valleys().set_locate_steps(5).build().unwrap();
//! let mut status = watershed.start(&field, None).unwrap();
//! while status.iterate() != WatershedState::Finished {
//!   println!("{}: {:.0}%", status.description(), 100.0 * status.fraction());
//! }
//! let mask = status.into_mask().unwrap();
//! ```
//!
//! # Cargo feature gates
//! *By default, all features behind cargo feature gates are **disabled***
//! - `jemalloc`: this feature enables the [jemalloc allocator](https://jemalloc.net).
//! To compile `rustronomy-grains` with the `jemalloc` feature, jemalloc must be
//! installed on the host system.
//! - `progress`: with this feature enabled, `mark_watershed` displays a progress
//! bar while it drives the watershed transform. Enabling this feature adds the
//! `indicatif` crate as a dependency.
//! - `serde`: derives `Serialize` and `Deserialize` for the configuration types
//! (watershed parameters and the various option enums).
//!
//! # Logging
//! `rustronomy-grains` reports state transitions and per-pass details through
//! the [`log`](https://docs.rs/log) facade. No logger is installed by this crate.

//Set Jemalloc as the global allocator for this crate
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

use ndarray as nd;
use rayon::prelude::*;

pub mod error;
pub mod field;
pub mod filters;
pub mod grains;
pub mod statistics;
pub mod watershed;

//Label of pixels that do not belong to any grain or basin
pub(crate) const UNLABELED: usize = 0;

//Utility prelude for batch import
pub mod prelude {
  pub use crate::error::{GrainError, Result};
  pub use crate::field::{MaskField, ScalarField};
  pub use crate::grains::{
    mark_by_curvature, mark_by_height, mark_by_slope, mark_local_maxima, mark_watershed,
    merge_labels, threshold_grain_counts, threshold_grain_counts_range, BoundingBox, Connectivity,
    GrainCountCurve, GrainLabels, MergeMode, ThresholdSide,
  };
  pub use crate::statistics::{
    grain_distribution, Distribution, GrainQuantity, GrainStatistics, GrainValue, GrainValueGroup,
    DEFAULT_BINS,
  };
  pub use crate::watershed::{
    GrainFeature, Watershed, WatershedBuilder, WatershedParams, WatershedState, WatershedStatus,
  };
}

////////////////////////////////////////////////////////////////////////////////
//                              HELPER FUNCTIONS                              //
////////////////////////////////////////////////////////////////////////////////

/*
  Neighbour offsets are listed in raster-scan order (top to bottom, left to
  right). Several algorithms resolve ties by taking the *first* neighbour that
  qualifies, so this order is part of their output.
*/
const OFFSETS_4CON: [(isize, isize); 4] = [(-1, 0), (0, -1), (0, 1), (1, 0)];
const OFFSETS_8CON: [(isize, isize); 8] =
  [(-1, -1), (-1, 0), (-1, 1), (0, -1), (0, 1), (1, -1), (1, 0), (1, 1)];
//Neighbours that precede a pixel in raster-scan order
const BACKWARD_4CON: [(isize, isize); 2] = [(-1, 0), (0, -1)];
const BACKWARD_8CON: [(isize, isize); 4] = [(-1, -1), (-1, 0), (-1, 1), (0, -1)];

#[inline]
fn neighbours(
  index: (usize, usize),
  shape: (usize, usize),
  offsets: &'static [(isize, isize)],
) -> impl Iterator<Item = (usize, usize)> {
  let (row, col) = (index.0 as isize, index.1 as isize);
  offsets.iter().filter_map(move |&(dr, dc)| {
    let (r, c) = (row + dr, col + dc);
    if r < 0 || c < 0 || r as usize >= shape.0 || c as usize >= shape.1 {
      None
    } else {
      Some((r as usize, c as usize))
    }
  })
}

/// In-bounds 4-connected neighbours of `index` in raster order. `shape` is the
/// `(rows, cols)` dimension of the array.
#[inline]
pub(crate) fn neighbours_4con(
  index: (usize, usize),
  shape: (usize, usize),
) -> impl Iterator<Item = (usize, usize)> {
  neighbours(index, shape, &OFFSETS_4CON)
}

/// In-bounds 8-connected neighbours of `index` in raster order.
#[inline]
pub(crate) fn neighbours_8con(
  index: (usize, usize),
  shape: (usize, usize),
) -> impl Iterator<Item = (usize, usize)> {
  neighbours(index, shape, &OFFSETS_8CON)
}

/// In-bounds neighbours of `index` that were already visited by a raster scan.
#[inline]
pub(crate) fn backward_neighbours(
  index: (usize, usize),
  shape: (usize, usize),
  eight_connected: bool,
) -> impl Iterator<Item = (usize, usize)> {
  let offsets: &'static [(isize, isize)] =
    if eight_connected { &BACKWARD_8CON } else { &BACKWARD_4CON };
  neighbours(index, shape, offsets)
}

/// Maps every label in `canvas` through `colour_map`, in parallel.
#[inline(always)]
pub(crate) fn recolour(canvas: nd::ArrayViewMut2<usize>, colour_map: &[usize]) {
  canvas.into_par_iter().for_each(|col| *col = colour_map[*col])
}

#[cfg(feature = "progress")]
pub(crate) fn set_up_bar(len: u64) -> indicatif::ProgressBar {
  const TEMPLATE: &str = "{spinner}[{elapsed}/{duration}] {msg} {pos}/{len}{bar:60}";
  let bar = indicatif::ProgressBar::new(len);
  if let Ok(style) = indicatif::ProgressStyle::with_template(TEMPLATE) {
    bar.set_style(style);
  }
  bar
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn neighbours_respect_bounds_and_order() {
    let corner: Vec<_> = neighbours_4con((0, 0), (3, 3)).collect();
    assert_eq!(corner, vec![(0, 1), (1, 0)]);
    let centre: Vec<_> = neighbours_4con((1, 1), (3, 3)).collect();
    assert_eq!(centre, vec![(0, 1), (1, 0), (1, 2), (2, 1)]);
    assert_eq!(neighbours_8con((1, 1), (3, 3)).count(), 8);
    assert_eq!(neighbours_8con((2, 2), (3, 3)).count(), 3);
  }

  #[test]
  fn backward_neighbours_precede_pixel() {
    let back: Vec<_> = backward_neighbours((1, 1), (3, 3), true).collect();
    assert_eq!(back, vec![(0, 0), (0, 1), (0, 2), (1, 0)]);
    let back: Vec<_> = backward_neighbours((0, 2), (3, 3), false).collect();
    assert_eq!(back, vec![(0, 1)]);
  }
}
