//! Tensor-product B-spline function spaces.
//!
//! A [`BSplineSpace`] owns one knot vector per parametric dimension and is
//! shared read-only by everything that needs that basis. Functions bound to a
//! space are created through [`BSplineSpace::create_function`] and hold a
//! plain reference back to it; the space never owns its functions.

use faer::sparse::SparseColMat;
use ndarray::{Array1, Array2, ArrayView2};

use crate::basis::{BasisError, apply_evaluation_map, build_open_uniform, evaluate_tensor_basis};

/// A tensor-product B-spline function space: per-dimension orders, the
/// coefficient-grid shape, and one knot vector per dimension.
///
/// Immutable once constructed; build one per distinct `(order, shape)` pair
/// and share it.
#[derive(Debug, Clone)]
pub struct BSplineSpace {
    name: String,
    order: Vec<usize>,
    coefficients_shape: Vec<usize>,
    knots: Vec<Array1<f64>>,
}

impl BSplineSpace {
    /// Creates a space with open-uniform knot vectors built per dimension.
    pub fn new(
        name: impl Into<String>,
        order: &[usize],
        coefficients_shape: &[usize],
    ) -> Result<Self, BasisError> {
        if order.len() != coefficients_shape.len() || order.is_empty() {
            return Err(BasisError::DimensionMismatch(format!(
                "order has {} entries but the coefficient grid shape has {}",
                order.len(),
                coefficients_shape.len()
            )));
        }
        let knots = order
            .iter()
            .zip(coefficients_shape)
            .map(|(&p, &n)| build_open_uniform(p, n))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.into(),
            order: order.to_vec(),
            coefficients_shape: coefficients_shape.to_vec(),
            knots,
        })
    }

    /// Creates a space from caller-supplied knot vectors.
    ///
    /// Each vector must have `order[i] + coefficients_shape[i]` entries and be
    /// finite and non-decreasing.
    pub fn with_knots(
        name: impl Into<String>,
        order: &[usize],
        coefficients_shape: &[usize],
        knots: Vec<Array1<f64>>,
    ) -> Result<Self, BasisError> {
        if order.len() != coefficients_shape.len()
            || order.len() != knots.len()
            || order.is_empty()
        {
            return Err(BasisError::DimensionMismatch(format!(
                "order ({}), coefficient grid shape ({}), and knots ({}) must describe the same dimensions",
                order.len(),
                coefficients_shape.len(),
                knots.len()
            )));
        }
        for (d, knot_vector) in knots.iter().enumerate() {
            if order[d] < 1 {
                return Err(BasisError::InvalidOrder(order[d]));
            }
            if coefficients_shape[d] < order[d] {
                return Err(BasisError::TooFewCoefficients {
                    order: order[d],
                    num_coefficients: coefficients_shape[d],
                });
            }
            let expected = order[d] + coefficients_shape[d];
            if knot_vector.len() != expected {
                return Err(BasisError::KnotCountMismatch {
                    dimension: d,
                    order: order[d],
                    num_coefficients: coefficients_shape[d],
                    expected,
                    found: knot_vector.len(),
                });
            }
            for pair in knot_vector.windows(2) {
                if !pair[0].is_finite() || !pair[1].is_finite() {
                    return Err(BasisError::InvalidKnotVector {
                        dimension: d,
                        reason: "contains a non-finite value".to_string(),
                    });
                }
                if pair[1] < pair[0] {
                    return Err(BasisError::InvalidKnotVector {
                        dimension: d,
                        reason: format!("decreases from {} to {}", pair[0], pair[1]),
                    });
                }
            }
        }
        Ok(Self {
            name: name.into(),
            order: order.to_vec(),
            coefficients_shape: coefficients_shape.to_vec(),
            knots,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn coefficients_shape(&self) -> &[usize] {
        &self.coefficients_shape
    }

    pub fn knots(&self) -> &[Array1<f64>] {
        &self.knots
    }

    pub fn num_parametric_dimensions(&self) -> usize {
        self.order.len()
    }

    pub fn num_coefficient_elements(&self) -> usize {
        self.coefficients_shape.iter().product()
    }

    /// Computes the sparse evaluation map from this space's flattened
    /// coefficients to values (or parametric derivatives) at
    /// `parametric_coordinates`, one point per row.
    ///
    /// `derivative_order` follows broadcast rules: `None` means value
    /// evaluation in every dimension, a single entry applies to every
    /// dimension, and a full-length slice is taken per dimension. Maps are
    /// rebuilt on every call; nothing is cached across derivative orders.
    pub fn compute_evaluation_map(
        &self,
        parametric_coordinates: ArrayView2<f64>,
        derivative_order: Option<&[usize]>,
        expansion_factor: usize,
    ) -> Result<SparseColMat<usize, f64>, BasisError> {
        let num_dims = self.num_parametric_dimensions();
        let derivative_orders = match derivative_order {
            None => vec![0; num_dims],
            Some([single]) => vec![*single; num_dims],
            Some(orders) if orders.len() == num_dims => orders.to_vec(),
            Some(orders) => {
                return Err(BasisError::DimensionMismatch(format!(
                    "derivative order has {} entries; expected 1 or {}",
                    orders.len(),
                    num_dims
                )));
            }
        };
        evaluate_tensor_basis(
            &self.order,
            &self.coefficients_shape,
            &derivative_orders,
            &self.knots,
            parametric_coordinates,
            expansion_factor,
        )
    }

    /// Binds a coefficient array to this space, producing a function owned by
    /// the caller. The function borrows the space; the space retains nothing.
    pub fn create_function(
        &self,
        name: impl Into<String>,
        coefficients: Array2<f64>,
        num_physical_dimensions: usize,
    ) -> Result<BSplineFunction<'_>, BasisError> {
        let name = name.into();
        if coefficients.nrows() != self.num_coefficient_elements()
            || coefficients.ncols() != num_physical_dimensions
        {
            return Err(BasisError::DimensionMismatch(format!(
                "function '{}' needs coefficients of shape ({}, {}), but got ({}, {})",
                name,
                self.num_coefficient_elements(),
                num_physical_dimensions,
                coefficients.nrows(),
                coefficients.ncols()
            )));
        }
        Ok(BSplineFunction {
            name,
            space: self,
            coefficients,
            num_physical_dimensions,
        })
    }
}

/// A B-spline function: a coefficient array bound to a borrowed
/// [`BSplineSpace`].
#[derive(Debug, Clone)]
pub struct BSplineFunction<'a> {
    pub name: String,
    pub space: &'a BSplineSpace,
    pub coefficients: Array2<f64>,
    pub num_physical_dimensions: usize,
}

impl BSplineFunction<'_> {
    /// Evaluates the function at the given parametric coordinates, returning
    /// physical points of shape `(num_points, num_physical_dimensions)`.
    pub fn evaluate(&self, parametric_coordinates: ArrayView2<f64>) -> Result<Array2<f64>, BasisError> {
        let map = self
            .space
            .compute_evaluation_map(parametric_coordinates, None, 0)?;
        apply_evaluation_map(&map, self.coefficients.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn space_builds_one_knot_vector_per_dimension() {
        let space = BSplineSpace::new("surface", &[4, 3], &[10, 7]).unwrap();
        assert_eq!(space.num_parametric_dimensions(), 2);
        assert_eq!(space.num_coefficient_elements(), 70);
        assert_eq!(space.knots()[0].len(), 14);
        assert_eq!(space.knots()[1].len(), 10);
    }

    #[test]
    fn supplied_knots_must_match_declared_lengths() {
        let short = vec![Array1::zeros(5), Array1::zeros(5)];
        let result = BSplineSpace::with_knots("bad", &[4, 4], &[10, 10], short);
        assert!(matches!(result, Err(BasisError::KnotCountMismatch { .. })));
    }

    #[test]
    fn derivative_order_broadcast_rules() {
        let space = BSplineSpace::new("surface", &[4, 4], &[10, 10]).unwrap();
        let coords = arr2(&[[0.3, 0.6]]);

        // Scalar broadcast and explicit per-dimension agree entry for entry.
        let single = space
            .compute_evaluation_map(coords.view(), Some(&[1]), 0)
            .unwrap();
        let pair = space
            .compute_evaluation_map(coords.view(), Some(&[1, 1]), 0)
            .unwrap();
        let mut coefficients = Array2::<f64>::zeros((100, 1));
        for (i, c) in coefficients.iter_mut().enumerate() {
            *c = (i as f64 * 0.37).sin();
        }
        let from_single = apply_evaluation_map(&single, coefficients.view()).unwrap();
        let from_pair = apply_evaluation_map(&pair, coefficients.view()).unwrap();
        assert_abs_diff_eq!(from_single[[0, 0]], from_pair[[0, 0]], epsilon = 1e-14);

        let result = space.compute_evaluation_map(coords.view(), Some(&[1, 1, 1]), 0);
        assert!(matches!(result, Err(BasisError::DimensionMismatch(_))));
    }

    #[test]
    fn created_function_interpolates_grid_corners() {
        let space = BSplineSpace::new("patch", &[2, 2], &[2, 2]).unwrap();
        // Bilinear patch over the unit square, embedded in 3-D.
        let coefficients = arr2(&[
            [0.0, 0.0, 0.0],
            [0.0, 1.0, 0.5],
            [1.0, 0.0, 0.5],
            [1.0, 1.0, 2.0],
        ]);
        let surface = space.create_function("patch", coefficients, 3).unwrap();

        let points = surface
            .evaluate(arr2(&[[0.0, 0.0], [1.0, 1.0], [0.5, 0.5]]).view())
            .unwrap();
        assert_abs_diff_eq!(points[[0, 2]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(points[[1, 2]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(points[[2, 0]], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(points[[2, 1]], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(points[[2, 2]], 0.75, epsilon = 1e-12);
    }

    #[test]
    fn create_function_rejects_mismatched_coefficients() {
        let space = BSplineSpace::new("patch", &[2, 2], &[3, 3]).unwrap();
        let coefficients = Array2::<f64>::zeros((4, 3));
        assert!(matches!(
            space.create_function("patch", coefficients, 3),
            Err(BasisError::DimensionMismatch(_))
        ));
    }
}
