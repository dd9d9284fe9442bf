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

//! Small-kernel filters used by the grain markers: a median filter (watershed
//! prefiltering), a discrete Laplacian (curvature marking) and the Sobel
//! gradient magnitude (slope marking). The Laplace relaxation step used to
//! interpolate grain backgrounds lives here as well.
//!
//! Pixels outside the field are replaced by the nearest edge pixel. Every
//! output pixel only depends on the input, so all filters run in parallel
//! without affecting the result.

use ndarray as nd;

use crate::{
  field::{median_of, ScalarField},
  neighbours_4con,
};

const LAPLACE: [[f64; 3]; 3] = [[0.0, 1.0, 0.0], [1.0, -4.0, 1.0], [0.0, 1.0, 0.0]];
//Sobel kernels, normalised to a derivative per pixel
const SOBEL_H: [[f64; 3]; 3] = [[0.125, 0.0, -0.125], [0.25, 0.0, -0.25], [0.125, 0.0, -0.125]];
const SOBEL_V: [[f64; 3]; 3] = [[0.125, 0.25, 0.125], [0.0, 0.0, 0.0], [-0.125, -0.25, -0.125]];

#[inline(always)]
fn clamp_offset(centre: usize, k: usize, len: usize) -> usize {
  //k runs over 0..3, with 1 being the centre of the kernel
  (centre + k).saturating_sub(1).min(len - 1)
}

fn convolve_3x3(data: nd::ArrayView2<f64>, kernel: &[[f64; 3]; 3]) -> nd::Array2<f64> {
  let (rows, cols) = data.dim();
  let mut out = nd::Array2::<f64>::zeros((rows, cols));
  nd::Zip::indexed(&mut out).par_for_each(|(row, col), px| {
    let mut acc = 0.0;
    for (ki, kernel_row) in kernel.iter().enumerate() {
      let r = clamp_offset(row, ki, rows);
      for (kj, &weight) in kernel_row.iter().enumerate() {
        if weight != 0.0 {
          acc += weight * data[(r, clamp_offset(col, kj, cols))];
        }
      }
    }
    *px = acc;
  });
  out
}

/// Median of every `size`x`size` window. The window of pixel `i` spans
/// `i - (size-1)/2 ..= i + size/2`, truncated at the field edges.
pub(crate) fn median_array(data: nd::ArrayView2<f64>, size: usize) -> nd::Array2<f64> {
  let (rows, cols) = data.dim();
  let size = size.max(1);
  let mut out = nd::Array2::<f64>::zeros((rows, cols));
  nd::Zip::indexed(&mut out).par_for_each(|(row, col), px| {
    let rows_in = row.saturating_sub((size - 1) / 2)..=(row + size / 2).min(rows - 1);
    let cols_in = col.saturating_sub((size - 1) / 2)..=(col + size / 2).min(cols - 1);
    let mut window: Vec<f64> = data.slice(nd::s![rows_in, cols_in]).iter().copied().collect();
    *px = median_of(&mut window);
  });
  out
}

/// Returns a copy of `field` smoothed with a `size`x`size` median filter.
pub fn median(field: &ScalarField, size: usize) -> ScalarField {
  let mut out = field.clone();
  out.data_mut().assign(&median_array(field.data(), size));
  out
}

/// Discrete Laplacian (second derivative estimate) of `field`, in value units
/// per pixel².
pub fn laplacian(field: &ScalarField) -> ScalarField {
  let mut out = field.clone();
  out.data_mut().assign(&convolve_3x3(field.data(), &LAPLACE));
  out
}

/// Magnitude of the Sobel gradient of `field`, in value units per pixel.
pub fn slope_magnitude(field: &ScalarField) -> ScalarField {
  let horizontal = convolve_3x3(field.data(), &SOBEL_H);
  let vertical = convolve_3x3(field.data(), &SOBEL_V);
  let mut out = field.clone();
  nd::Zip::from(out.data_mut()).and(&horizontal).and(&vertical).par_for_each(|px, &h, &v| {
    *px = h.hypot(v);
  });
  out
}

/// One Jacobi step of Laplace interpolation. Every pixel under `mask` moves
/// `factor` times the difference between the sum of its in-field 4-neighbours
/// and its own value times their number; other pixels are fixed. Returns the
/// largest change.
pub(crate) fn laplace_relax(
  values: &mut nd::Array2<f64>,
  mask: nd::ArrayView2<bool>,
  factor: f64,
) -> f64 {
  let shape = values.dim();
  let mut delta = nd::Array2::<f64>::zeros(shape);
  {
    let current = values.view();
    nd::Zip::indexed(&mut delta).and(mask).par_for_each(|idx, d, &free| {
      if free {
        let (sum, n) =
          neighbours_4con(idx, shape).fold((0.0, 0usize), |(s, n), next| (s + current[next], n + 1));
        *d = factor * (sum - n as f64 * current[idx]);
      }
    });
  }
  *values += &delta;
  delta.iter().fold(0.0, |err: f64, d| err.max(d.abs()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn laplacian_of_plane_vanishes_inside() {
    let data = nd::Array2::from_shape_fn((5, 5), |(r, c)| 2.0 * r as f64 + c as f64);
    let field = ScalarField::from_array(data, 5.0, 5.0).unwrap();
    let lap = laplacian(&field);
    for r in 1..4 {
      for c in 1..4 {
        assert!(lap.get(r, c).unwrap().abs() < 1e-12);
      }
    }
  }

  #[test]
  fn median_removes_single_spike() {
    let mut field = ScalarField::new(5, 5, 1.0, 1.0).unwrap();
    field.set(2, 2, 100.0).unwrap();
    let smooth = median(&field, 3);
    assert_eq!(smooth.max(), 0.0);
  }

  #[test]
  fn laplace_relaxation_fills_hole_in_plane() {
    let plane = nd::Array2::from_shape_fn((5, 5), |(r, c)| r as f64 - 2.0 * c as f64);
    let mut values = plane.clone();
    let hole = nd::Array2::from_shape_fn((5, 5), |(r, c)| (1..4).contains(&r) && (1..4).contains(&c));
    values.slice_mut(nd::s![1..4, 1..4]).fill(0.0);

    let mut err = f64::INFINITY;
    for _ in 0..200 {
      err = laplace_relax(&mut values, hole.view(), 0.2);
    }
    assert!(err < 1e-9);
    assert!(values.iter().zip(&plane).all(|(v, p)| (v - p).abs() < 1e-8));
  }

  #[test]
  fn slope_of_ramp_is_constant_inside() {
    let data = nd::Array2::from_shape_fn((4, 6), |(_r, c)| c as f64);
    let field = ScalarField::from_array(data, 6.0, 4.0).unwrap();
    let slope = slope_magnitude(&field);
    assert!((slope.get(1, 2).unwrap() - 1.0).abs() < 1e-12);
  }
}
