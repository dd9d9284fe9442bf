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

//! Iterative watershed grain marking.
//!
//! The transform is split into five phases that are executed in a fixed order:
//!
//! 1. **init**: working copies of the height field are made (optionally
//! median-filtered to suppress noise minima).
//! 2. **locate**: drops of water are released on every pixel. Each drop rolls
//! downhill until it comes to rest in a pit, where it raises the surface a
//! little. Shallow pits fill up quickly and start to overflow, while real
//! minima keep catching drops pass after pass.
//! 3. **min**: the wet areas that kept catching drops for at least
//! `locate_thresh` consecutive passes become the seeds of numbered basins.
//! 4. **watershed**: the water level is raised step by step. Every flooded
//! pixel that touches a basin joins it.
//! 5. **mark**: pixels on the ridge between two basins are cleared, all other
//! basin pixels become grain pixels in the output mask. Ridges are wide enough
//! that neighbouring basins never touch, not even diagonally.
//!
//! Each call to [`WatershedStatus::iterate`] performs one locate pass, one
//! watershed pass, or one of the single-step phases. The caller decides when
//! to call it again, which makes it easy to update a progress bar or abort the
//! computation in between. Abandoning a run simply means dropping the status.
//!
//! Whenever several candidates are equally good, the first one in raster-scan
//! order wins. There is no randomness anywhere in the transform.

use ndarray as nd;
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
  error::{GrainError, Result},
  field::{MaskField, ScalarField},
  filters,
  grains::{number_grains, Connectivity},
  neighbours_4con, UNLABELED,
};

//Size of the median window used for prefiltering
const PREFILTER_SIZE: usize = 5;

//Progress fractions reported at the phase boundaries
const LOCATE_SPAN: f64 = 0.4;
const MIN_DONE: f64 = 0.45;
const WSHED_START: f64 = 0.5;
const WSHED_SPAN: f64 = 0.45;

////////////////////////////////////////////////////////////////////////////////
//                              CONFIGURATION                                 //
////////////////////////////////////////////////////////////////////////////////

/// Which features of the surface become grains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GrainFeature {
  /// Basins around local minima (pits, valleys)
  #[default]
  Valleys,
  /// Hills around local maxima (particles, mountains)
  Mountains,
}

/// Parameters of the watershed transform.
///
/// Drop sizes are fractions of the height range of the field that is being
/// segmented, so the same parameters can be used for data of any scale.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WatershedParams {
  /// Maximum number of drop passes used to locate the minima
  pub locate_steps: u32,
  /// Number of consecutive passes a pit must keep catching drops
  pub locate_thresh: u32,
  /// Height a pit is raised by per caught drop
  pub locate_dropsize: f64,
  /// Maximum number of flooding passes
  pub wshed_steps: u32,
  /// Increase of the water level per flooding pass
  pub wshed_dropsize: f64,
  /// Median-filter the surface before locating minima
  pub prefilter: bool,
  pub feature: GrainFeature,
}

impl Default for WatershedParams {
  fn default() -> Self {
    WatershedParams {
      locate_steps: 10,
      locate_thresh: 3,
      locate_dropsize: 0.001,
      wshed_steps: 20,
      wshed_dropsize: 0.05,
      prefilter: false,
      feature: GrainFeature::Valleys,
    }
  }
}

impl WatershedParams {
  /// Checks that all step counts and drop sizes are positive.
  pub fn validate(&self) -> Result<()> {
    if self.locate_steps == 0 {
      return Err(GrainError::invalid("locate_steps", "must be at least 1"));
    }
    if self.wshed_steps == 0 {
      return Err(GrainError::invalid("wshed_steps", "must be at least 1"));
    }
    if !(self.locate_dropsize.is_finite() && self.locate_dropsize > 0.0) {
      return Err(GrainError::invalid(
        "locate_dropsize",
        format!("must be positive and finite, got {}", self.locate_dropsize),
      ));
    }
    if !(self.wshed_dropsize.is_finite() && self.wshed_dropsize > 0.0) {
      return Err(GrainError::invalid(
        "wshed_dropsize",
        format!("must be positive and finite, got {}", self.wshed_dropsize),
      ));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Default)]
/// Builder for configuring a watershed transform.
///
/// Use the `new_valleys()` associated function to start configuring a transform
/// that marks valleys, or `new_mountains()` for one that marks hills. Once all
/// options are set, a [`Watershed`] object is generated with the `build()`
/// associated function, which validates the configuration.
pub struct WatershedBuilder {
  params: WatershedParams,
}

impl WatershedBuilder {
  /// creates a new `WatershedBuilder` that marks valleys
  pub fn new_valleys() -> Self {
    WatershedBuilder { params: WatershedParams::default() }
  }

  /// creates a new `WatershedBuilder` that marks mountains
  pub fn new_mountains() -> Self {
    WatershedBuilder {
      params: WatershedParams { feature: GrainFeature::Mountains, ..Default::default() },
    }
  }

  /// creates a new `WatershedBuilder` from a complete set of parameters
  pub fn from_params(params: WatershedParams) -> Self {
    WatershedBuilder { params }
  }

  pub fn set_locate_steps(mut self, steps: u32) -> Self {
    self.params.locate_steps = steps;
    self
  }

  pub fn set_locate_thresh(mut self, thresh: u32) -> Self {
    self.params.locate_thresh = thresh;
    self
  }

  pub fn set_locate_dropsize(mut self, dropsize: f64) -> Self {
    self.params.locate_dropsize = dropsize;
    self
  }

  pub fn set_wshed_steps(mut self, steps: u32) -> Self {
    self.params.wshed_steps = steps;
    self
  }

  pub fn set_wshed_dropsize(mut self, dropsize: f64) -> Self {
    self.params.wshed_dropsize = dropsize;
    self
  }

  pub fn set_prefilter(mut self, prefilter: bool) -> Self {
    self.params.prefilter = prefilter;
    self
  }

  /// Build a `Watershed` from the current builder configuration. This function
  /// returns an `Err` if any step count or drop size is not positive.
  pub fn build(self) -> Result<Watershed> {
    self.params.validate()?;
    Ok(Watershed { params: self.params })
  }
}

/// A validated watershed configuration. One `Watershed` can be used to start
/// any number of independent runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Watershed {
  params: WatershedParams,
}

impl Watershed {
  pub fn params(&self) -> &WatershedParams {
    &self.params
  }

  /// Starts a new watershed run on `height`. If `seeds` is given, each of its
  /// connected grains is used as a pre-labeled basin.
  ///
  /// The run is returned in the [`WatershedState::Init`] state; no work has
  /// been done yet.
  pub fn start<'a>(
    &self,
    height: &'a ScalarField,
    seeds: Option<&'a MaskField>,
  ) -> Result<WatershedStatus<'a>> {
    self.params.validate()?;
    if let Some(seeds) = seeds {
      height.check_same_shape(seeds)?;
    }
    Ok(WatershedStatus {
      height,
      seeds,
      params: self.params.clone(),
      state: WatershedState::Init,
      iteration: 0,
      fraction: 0.0,
      surface: nd::Array2::zeros((0, 0)),
      water: nd::Array2::zeros((0, 0)),
      persistence: nd::Array2::zeros((0, 0)),
      termini: nd::Array2::from_elem((0, 0), false),
      marks: nd::Array2::zeros((0, 0)),
      locate_drop: 0.0,
      wshed_drop: 0.0,
      level_base: 0.0,
      level_top: 0.0,
      basins: 0,
      output: None,
    })
  }
}

////////////////////////////////////////////////////////////////////////////////
//                              STATE MACHINE                                 //
////////////////////////////////////////////////////////////////////////////////

/// Phases of a watershed run, in the order they are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatershedState {
  Init,
  Locate,
  Min,
  Watershed,
  Mark,
  Finished,
}

impl WatershedState {
  pub fn description(&self) -> &'static str {
    match self {
      WatershedState::Init => "Initializing",
      WatershedState::Locate => "Locating minima",
      WatershedState::Min => "Selecting basins",
      WatershedState::Watershed => "Flooding basins",
      WatershedState::Mark => "Marking grain boundaries",
      WatershedState::Finished => "Finished",
    }
  }
}

impl std::fmt::Display for WatershedState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.description())
  }
}

/// A watershed run in progress. Created by [`Watershed::start`].
#[derive(Debug)]
pub struct WatershedStatus<'a> {
  height: &'a ScalarField,
  seeds: Option<&'a MaskField>,
  params: WatershedParams,
  state: WatershedState,
  iteration: u32,
  fraction: f64,
  //Working surface: oriented so that grains are basins
  surface: nd::Array2<f64>,
  //Drops caught per pixel during the locate phase
  water: nd::Array2<u32>,
  //Consecutive locate passes in which a pixel caught a drop
  persistence: nd::Array2<u32>,
  termini: nd::Array2<bool>,
  //Basin label of every claimed pixel
  marks: nd::Array2<usize>,
  locate_drop: f64,
  wshed_drop: f64,
  level_base: f64,
  level_top: f64,
  basins: usize,
  output: Option<MaskField>,
}

impl<'a> WatershedStatus<'a> {
  pub fn state(&self) -> WatershedState {
    self.state
  }

  /// Estimated progress of the whole run, in `[0, 1]`. Never decreases.
  pub fn fraction(&self) -> f64 {
    self.fraction
  }

  pub fn description(&self) -> &'static str {
    self.state.description()
  }

  /// Number of passes done in the current phase
  pub fn iteration(&self) -> u32 {
    self.iteration
  }

  /// Number of basins; known once the min phase has completed.
  pub fn basin_count(&self) -> usize {
    self.basins
  }

  pub fn is_finished(&self) -> bool {
    self.state == WatershedState::Finished
  }

  /// The resulting mask, once the run is finished.
  pub fn mask(&self) -> Option<&MaskField> {
    self.output.as_ref()
  }

  /// Consumes the run and returns the resulting mask, or `None` if the run
  /// was not finished.
  pub fn into_mask(self) -> Option<MaskField> {
    self.output
  }

  /// Performs one unit of work and returns the state the run is in
  /// afterwards. Calling this on a finished run does nothing.
  pub fn iterate(&mut self) -> WatershedState {
    match self.state {
      WatershedState::Init => self.init(),
      WatershedState::Locate => self.locate_pass(),
      WatershedState::Min => self.select_basins(),
      WatershedState::Watershed => self.flood_pass(),
      WatershedState::Mark => self.mark(),
      WatershedState::Finished => {}
    }
    self.state
  }

  fn enter(&mut self, state: WatershedState) {
    log::debug!("watershed: {} -> {}", self.state, state);
    self.state = state;
    self.iteration = 0;
  }

  /// Copy of the height field, negated if hills have to be marked
  fn oriented_surface(&self) -> nd::Array2<f64> {
    match self.params.feature {
      GrainFeature::Valleys => self.height.data().to_owned(),
      GrainFeature::Mountains => self.height.data().mapv(|z| -z),
    }
  }

  fn init(&mut self) {
    let mut surface = self.oriented_surface();
    if self.params.prefilter {
      surface = filters::median_array(surface.view(), PREFILTER_SIZE);
    }

    //Drop sizes are relative to the height range; a flat field gets unit scale
    let range = self.height.max() - self.height.min();
    let scale = if range.is_finite() && range > 0.0 { range } else { 1.0 };
    self.locate_drop = self.params.locate_dropsize * scale;
    self.wshed_drop = self.params.wshed_dropsize * scale;

    let dim = surface.dim();
    self.surface = surface;
    self.water = nd::Array2::zeros(dim);
    self.persistence = nd::Array2::zeros(dim);
    self.termini = nd::Array2::from_elem(dim, false);
    self.marks = nd::Array2::zeros(dim);
    self.fraction = 0.0;
    self.enter(WatershedState::Locate);
  }

  fn locate_pass(&mut self) {
    let (rows, cols) = self.surface.dim();
    let mut termini = nd::Array2::from_elem((rows, cols), false);

    //Drops are released in raster order, each one sees the pits raised by
    //all drops before it
    for row in 0..rows {
      for col in 0..cols {
        let end = roll_down(self.surface.view(), (row, col));
        self.water[end] += 1;
        self.surface[end] += self.locate_drop;
        termini[end] = true;
      }
    }

    //Update persistence counters: consecutive passes as a terminus
    nd::Zip::from(&mut self.persistence).and(&termini).and(&self.termini).for_each(
      |count, &now, &before| {
        *count = match (now, before) {
          (true, true) => *count + 1,
          (true, false) => 1,
          (false, _) => 0,
        }
      },
    );

    //Fixed point: same pits as last pass and all of them already accepted
    let thresh = self.params.locate_thresh.max(1);
    let fixed_point = termini == self.termini
      && nd::Zip::from(&termini).and(&self.persistence).all(|&t, &p| !t || p >= thresh);

    self.termini = termini;
    self.iteration += 1;
    self.fraction = LOCATE_SPAN * self.iteration as f64 / self.params.locate_steps as f64;
    log::trace!(
      "watershed locate pass {}/{}: {} pits",
      self.iteration,
      self.params.locate_steps,
      self.termini.iter().filter(|&&t| t).count()
    );

    if fixed_point || self.iteration >= self.params.locate_steps {
      if fixed_point {
        log::debug!("watershed locate reached a fixed point after {} passes", self.iteration);
      }
      self.fraction = LOCATE_SPAN;
      self.enter(WatershedState::Min);
    }
  }

  fn select_basins(&mut self) {
    let thresh = self.params.locate_thresh.max(1);
    let dim = self.water.dim();

    //Markers that met during the locate phase form one wet region
    let wet = self.water.mapv(|w| w > 0);
    let (regions, nregions) = number_grains(wet.view(), Connectivity::Four);

    let mut accepted = vec![false; nregions + 1];
    let mut seed: Vec<Option<(usize, usize)>> = vec![None; nregions + 1];
    for (idx, &region) in regions.indexed_iter() {
      if region == UNLABELED {
        continue;
      }
      if self.persistence[idx] >= thresh {
        accepted[region] = true;
      }
      //Wettest pixel of the region; the first one wins ties
      match seed[region] {
        Some(best) if self.water[best] >= self.water[idx] => {}
        _ => seed[region] = Some(idx),
      }
    }

    //Grains of the seed mask are pre-labeled basins
    let mut minima = nd::Array2::<usize>::zeros(dim);
    let mut basins = 0;
    if let Some(seeds) = self.seeds {
      let foreground = seeds.data().mapv(|m| m > 0.0);
      let (seed_labels, nseeds) = number_grains(foreground.view(), Connectivity::Four);
      minima = seed_labels;
      basins = nseeds;
    }
    for region in 1..=nregions {
      if !accepted[region] {
        continue;
      }
      if let Some(pos) = seed[region] {
        if minima[pos] == UNLABELED {
          basins += 1;
          minima[pos] = basins;
        }
      }
    }

    log::debug!(
      "watershed: {} of {} wet regions accepted, {} basins in total",
      accepted.iter().filter(|&&a| a).count(),
      nregions,
      basins
    );

    //Flooding works on the unfiltered surface
    self.surface = self.oriented_surface();
    let (base, top) = self
      .surface
      .iter()
      .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &z| (lo.min(z), hi.max(z)));
    self.level_base = base;
    self.level_top = top;
    self.marks = minima;
    self.basins = basins;
    self.fraction = MIN_DONE;
    self.enter(WatershedState::Watershed);
  }

  fn flood_pass(&mut self) {
    if self.basins == 0 {
      log::debug!("watershed: no basins to flood");
      self.fraction = WSHED_START + WSHED_SPAN;
      self.enter(WatershedState::Mark);
      return;
    }

    self.iteration += 1;
    let level = self.level_base + self.iteration as f64 * self.wshed_drop;

    /*
      Claim flooded pixels next to a basin. Plateaus may require several
      sweeps at the same level, so we keep sweeping until nothing changes.
      Every sweep decides on a snapshot of the marks and applies all of its
      claims afterwards, so the result does not depend on thread scheduling.
    */
    let mut claimed = 0;
    'sweep: loop {
      let claims = find_claims(self.surface.view(), self.marks.view(), level);
      if claims.is_empty() {
        break 'sweep;
      }
      claimed += claims.len();
      for (idx, basin) in claims {
        self.marks[idx] = basin;
      }
    }

    let unclaimed = self.marks.iter().filter(|&&m| m == UNLABELED).count();
    self.fraction =
      WSHED_START + WSHED_SPAN * self.iteration as f64 / self.params.wshed_steps as f64;
    log::trace!(
      "watershed flood pass {}/{} at level {level:.3e}: {claimed} claimed, {unclaimed} left",
      self.iteration,
      self.params.wshed_steps
    );

    //Nothing claimed while the water is above every pixel: a fixed point
    let stagnant = claimed == 0 && level >= self.level_top;
    if unclaimed == 0 || stagnant || self.iteration >= self.params.wshed_steps {
      self.fraction = WSHED_START + WSHED_SPAN;
      self.enter(WatershedState::Mark);
    }
  }

  fn mark(&mut self) {
    let mut output = MaskField::new_for(self.height);
    {
      let mut data = output.data_mut();
      for (idx, &basin) in self.marks.indexed_iter() {
        if basin != UNLABELED && !is_ridge(self.marks.view(), idx) {
          data[idx] = 1.0;
        }
      }
    }
    log::debug!("watershed: marked {} grain pixels", output.count_foreground());
    self.output = Some(output);
    self.fraction = 1.0;
    self.enter(WatershedState::Finished);
  }
}

////////////////////////////////////////////////////////////////////////////////
//                              HELPER FUNCTIONS                              //
////////////////////////////////////////////////////////////////////////////////

/// Follows the steepest descent from `start` until no 4-connected neighbour is
/// strictly lower. Among equally low neighbours the first one in raster order
/// is taken.
fn roll_down(surface: nd::ArrayView2<f64>, start: (usize, usize)) -> (usize, usize) {
  let shape = surface.dim();
  let mut pos = start;
  loop {
    let mut lowest = pos;
    let mut z = surface[pos];
    for next in neighbours_4con(pos, shape) {
      if surface[next] < z {
        z = surface[next];
        lowest = next;
      }
    }
    if lowest == pos {
      return pos;
    }
    pos = lowest;
  }
}

/// A basin pixel is a ridge pixel if a *later* pixel in raster order (right,
/// lower left, down, lower right) belongs to a different basin. Every pair of
/// 8-adjacent pixels in different basins loses at least one of them, so basins
/// stay apart under both connectivities.
fn is_ridge(marks: nd::ArrayView2<usize>, (row, col): (usize, usize)) -> bool {
  let (rows, cols) = marks.dim();
  let basin = marks[(row, col)];
  let differs = |idx: (usize, usize)| {
    let other = marks[idx];
    other != UNLABELED && other != basin
  };
  let right = col + 1 < cols && differs((row, col + 1));
  let below = row + 1 < rows
    && ((col > 0 && differs((row + 1, col - 1)))
      || differs((row + 1, col))
      || (col + 1 < cols && differs((row + 1, col + 1))));
  right || below
}

fn find_claims(
  surface: nd::ArrayView2<f64>,
  marks: nd::ArrayView2<usize>,
  level: f64,
) -> Vec<((usize, usize), usize)> {
  let shape = marks.dim();

  /*
    For each pixel we:
      1. Check if it is flooded: YES -> continue, NO -> ignore px
      2. Check if it is unclaimed: YES -> continue, NO -> ignore px
      3. Take the basin of the first claimed neighbour in raster order, if
        there is one
  */
  nd::Zip::indexed(surface)
    .and(marks)
    .into_par_iter()
    //(1) Ignore unflooded pixels
    .filter(|&(_idx, &z, _mark)| z <= level)
    //(2) Ignore already claimed pixels
    .filter(|&(_idx, _z, &mark)| mark == UNLABELED)
    //(3) Find the basin to join
    .filter_map(|(idx, _z, _mark)| {
      neighbours_4con(idx, shape)
        .map(|next| marks[next])
        .find(|&basin| basin != UNLABELED)
        .map(|basin| (idx, basin))
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn drop_rolls_to_lowest_point() {
    let surface = nd::array![[3.0, 2.0, 3.0], [2.0, 1.0, 0.5], [3.0, 2.0, 3.0]];
    assert_eq!(roll_down(surface.view(), (0, 0)), (1, 2));
    assert_eq!(roll_down(surface.view(), (1, 1)), (1, 2));
    assert_eq!(roll_down(surface.view(), (1, 2)), (1, 2));
  }

  #[test]
  fn drop_ignores_diagonal_neighbours() {
    let surface = nd::array![[3.0, 3.0, 3.0], [3.0, 1.0, 3.0], [3.0, 3.0, 0.5]];
    assert_eq!(roll_down(surface.view(), (1, 1)), (1, 1));
  }

  #[test]
  fn ridges_separate_diagonal_basins() {
    let marks = nd::array![[1, 1, 0], [1, 0, 2], [0, 2, 2]];
    //(0, 1) touches basin 2 only through its lower right corner
    assert!(is_ridge(marks.view(), (0, 1)));
    //(1, 0) touches basin 2 only through its lower right corner
    assert!(is_ridge(marks.view(), (1, 0)));
    assert!(!is_ridge(marks.view(), (0, 0)));
    assert!(!is_ridge(marks.view(), (2, 2)));

    let marks = nd::array![[0, 1], [2, 0]];
    //lower left diagonal
    assert!(is_ridge(marks.view(), (0, 1)));
    assert!(!is_ridge(marks.view(), (1, 0)));
  }

  #[test]
  fn drop_ties_go_to_first_neighbour() {
    let surface = nd::array![[1.0, 0.0, 1.0], [0.0, 2.0, 0.0], [1.0, 0.0, 1.0]];
    //up comes first in raster order
    assert_eq!(roll_down(surface.view(), (1, 1)), (0, 1));
  }

  #[test]
  fn claims_take_first_labeled_neighbour() {
    let surface = nd::Array2::<f64>::zeros((3, 3));
    let marks = nd::array![[0, 1, 0], [2, 0, 3], [0, 4, 0]];
    let claims = find_claims(surface.view(), marks.view(), 0.0);
    let centre = claims.iter().find(|(idx, _)| *idx == (1, 1)).unwrap();
    assert_eq!(centre.1, 1);
  }

  #[test]
  fn builder_rejects_non_positive_parameters() {
    assert!(WatershedBuilder::new_valleys().set_locate_steps(0).build().is_err());
    assert!(WatershedBuilder::new_valleys().set_wshed_dropsize(0.0).build().is_err());
    assert!(WatershedBuilder::new_mountains().set_locate_dropsize(-1.0).build().is_err());
    assert!(WatershedBuilder::new_mountains().build().is_ok());
  }
}
