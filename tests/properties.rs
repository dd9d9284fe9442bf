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

use ndarray as nd;
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;
use rustronomy_grains::prelude::*;

//Random boolean masks of 1x1 up to 12x12 pixels
fn bool_mask() -> impl Strategy<Value = nd::Array2<bool>> {
  (1usize..=12, 1usize..=12).prop_flat_map(|(rows, cols)| {
    proptest::collection::vec(any::<bool>(), rows * cols)
      .prop_map(move |v| nd::Array2::from_shape_vec((rows, cols), v).unwrap())
  })
}

fn height_field() -> impl Strategy<Value = nd::Array2<f64>> {
  (2usize..=10, 2usize..=10).prop_flat_map(|(rows, cols)| {
    proptest::collection::vec(-100.0f64..100.0, rows * cols)
      .prop_map(move |v| nd::Array2::from_shape_vec((rows, cols), v).unwrap())
  })
}

fn connectivity() -> impl Strategy<Value = Connectivity> {
  prop_oneof![Just(Connectivity::Four), Just(Connectivity::Eight)]
}

fn mask_of(bools: &nd::Array2<bool>) -> MaskField {
  MaskField::from_bools(bools.view(), 1.0, 1.0).unwrap()
}

fn assert_contiguous(grains: &GrainLabels) -> TestCaseResult {
  let mut seen = vec![false; grains.count() + 1];
  for &label in grains.labels().iter() {
    prop_assert!(label <= grains.count());
    seen[label] = true;
  }
  prop_assert!(seen.iter().skip(1).all(|&s| s), "labels have gaps");
  Ok(())
}

proptest! {
  #[test]
  fn cache_matches_recomputation(
    data in height_field(),
    edits in proptest::collection::vec((0usize..10, 0usize..10, -50.0f64..50.0), 0..8)
  ) {
    let (yres, xres) = data.dim();
    let mut field = ScalarField::from_array(data, 1.0, 1.0).unwrap();
    for (row, col, value) in edits {
      //Warm the cache before every edit
      let _ = (field.min(), field.max(), field.sum(), field.rms(), field.median());
      if row < yres && col < xres {
        field.set(row, col, value).unwrap();
      } else {
        field.area_fill(col % xres, row % yres, 2, 2, value).unwrap();
      }
    }

    let fresh = ScalarField::from_array(field.data().to_owned(), 1.0, 1.0).unwrap();
    prop_assert_eq!(field.min(), fresh.min());
    prop_assert_eq!(field.max(), fresh.max());
    prop_assert_eq!(field.sum(), fresh.sum());
    prop_assert_eq!(field.rms(), fresh.rms());
    prop_assert_eq!(field.median(), fresh.median());
  }

  #[test]
  fn labels_are_contiguous(bools in bool_mask(), conn in connectivity(), min_size in 0usize..6) {
    let mut grains = GrainLabels::label_grains(&mask_of(&bools), conn);
    assert_contiguous(&grains)?;
    grains.remove_by_size(min_size);
    assert_contiguous(&grains)?;
  }

  #[test]
  fn mask_survives_labeling(bools in bool_mask(), conn in connectivity()) {
    let mask = mask_of(&bools);
    let grains = GrainLabels::label_grains(&mask, conn);
    prop_assert_eq!(grains.mask_like(&mask).unwrap(), mask);
  }

  #[test]
  fn remove_by_size_extremes(bools in bool_mask(), conn in connectivity()) {
    let grains = GrainLabels::label_grains(&mask_of(&bools), conn);

    let mut same = grains.clone();
    prop_assert_eq!(same.remove_by_size(0), 0);
    prop_assert_eq!(&same, &grains);

    let mut none = grains.clone();
    none.remove_by_size(bools.len() + 1);
    prop_assert_eq!(none.count(), 0);
    prop_assert!(none.labels().iter().all(|&label| label == 0));
  }

  #[test]
  fn eight_connectivity_never_splits(bools in bool_mask()) {
    let four = GrainLabels::label_grains(&mask_of(&bools), Connectivity::Four);
    let eight = GrainLabels::label_grains(&mask_of(&bools), Connectivity::Eight);
    prop_assert!(eight.count() <= four.count());
  }

  #[test]
  fn distribution_is_normalised(bools in bool_mask(), bins in 1usize..20) {
    let mask = mask_of(&bools);
    let field = ScalarField::new(mask.xres(), mask.yres(), 1.0, 1.0).unwrap();
    let dist = grain_distribution(&field, &mask, GrainQuantity::PixelCount, bins, Connectivity::Four)
      .unwrap();
    prop_assert_eq!(dist.bins.len(), bins);
    if bools.iter().any(|&b| b) {
      prop_assert!((dist.integral() - 1.0).abs() < 1e-9);
    } else {
      prop_assert!(dist.bins.iter().all(|&b| b == 0.0));
    }
  }

  #[test]
  fn boundary_edges_are_symmetric(bools in bool_mask()) {
    //Every edge between two grains is counted once from either side
    let mask = mask_of(&bools);
    let mut inverted = mask.clone();
    inverted.invert();
    let field = ScalarField::new(mask.xres(), mask.yres(), 1.0, 1.0).unwrap();
    let fg = GrainLabels::label_grains(&mask, Connectivity::Four);
    let bg = GrainLabels::label_grains(&inverted, Connectivity::Four);
    let fg_edges = GrainStatistics::new(&field, &fg).unwrap().total(GrainQuantity::BoundaryEdges);
    let bg_edges = GrainStatistics::new(&field, &bg).unwrap().total(GrainQuantity::BoundaryEdges);
    prop_assert_eq!(fg_edges, bg_edges);
  }
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(32))]

  #[test]
  fn watershed_is_reproducible(data in height_field(), mountains in any::<bool>()) {
    let field = ScalarField::from_array(data, 1.0, 1.0).unwrap();
    let builder = if mountains { WatershedBuilder::new_mountains() } else { WatershedBuilder::new_valleys() };
    let watershed = builder.set_wshed_steps(10).build().unwrap();
    let first = mark_watershed(&field, &watershed, None).unwrap();
    let second = mark_watershed(&field, &watershed, None).unwrap();
    prop_assert_eq!(&first, &second);
    prop_assert!(first.data().iter().all(|&m| m == 0.0 || m == 1.0));
  }
}
