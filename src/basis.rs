use faer::sparse::{SparseColMat, Triplet};
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::OnceLock;
use thiserror::Error;

#[cfg(test)]
use approx::assert_abs_diff_eq;

fn basis_thread_pool() -> &'static ThreadPool {
    static POOL: OnceLock<ThreadPool> = OnceLock::new();
    POOL.get_or_init(|| {
        ThreadPoolBuilder::new()
            .build()
            .expect("basis thread pool initialization should succeed")
    })
}

/// Errors raised by knot construction and basis evaluation.
///
/// All of these are detected by precondition checks before any numeric work
/// starts; no input is silently clamped.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("B-spline order must be at least 1, but was {0}.")]
    InvalidOrder(usize),

    #[error(
        "An order-{order} basis needs at least {order} coefficients, but only {num_coefficients} were requested."
    )]
    TooFewCoefficients {
        order: usize,
        num_coefficients: usize,
    },

    #[error(
        "Knot vector for dimension {dimension} has {found} knots; order {order} with {num_coefficients} coefficients requires {expected}."
    )]
    KnotCountMismatch {
        dimension: usize,
        order: usize,
        num_coefficients: usize,
        expected: usize,
        found: usize,
    },

    #[error(
        "Knot vector for dimension {dimension} is invalid: {reason}. Knots must be finite and non-decreasing."
    )]
    InvalidKnotVector { dimension: usize, reason: String },

    #[error("Parametric coordinate {value} in dimension {dimension} falls outside [0, 1].")]
    CoordinateOutOfDomain { dimension: usize, value: f64 },

    #[error(
        "Derivative order {derivative_order} in dimension {dimension} is not defined for an order-{order} basis."
    )]
    DerivativeOrderTooHigh {
        dimension: usize,
        derivative_order: usize,
        order: usize,
    },

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Failed to build sparse evaluation map: {0}")]
    SparseCreation(String),
}

/// Builds an open-uniform knot vector for an order-`order` basis with
/// `num_coefficients` coefficients.
///
/// The result has length `order + num_coefficients`: the first and last
/// `order` knots are clamped to 0.0 and 1.0, and the
/// `num_coefficients - order` interior knots are uniformly spaced in the
/// open interval.
pub fn build_open_uniform(
    order: usize,
    num_coefficients: usize,
) -> Result<Array1<f64>, BasisError> {
    if order < 1 {
        return Err(BasisError::InvalidOrder(order));
    }
    if num_coefficients < order {
        return Err(BasisError::TooFewCoefficients {
            order,
            num_coefficients,
        });
    }

    let mut knots = Vec::with_capacity(order + num_coefficients);
    let denominator = (num_coefficients - order + 1) as f64;
    for _ in 0..order {
        knots.push(0.0);
    }
    for i in order..num_coefficients {
        knots.push((i - order + 1) as f64 / denominator);
    }
    for _ in 0..order {
        knots.push(1.0);
    }
    Ok(Array1::from_vec(knots))
}

/// Locates the knot span containing `u`: the index `span` with
/// `knots[span] <= u < knots[span + 1]`, clamped into `[degree, num_basis - 1]`
/// so the boundary spans are selected at the domain ends.
fn find_span(u: f64, degree: usize, num_basis: usize, knots: &[f64]) -> usize {
    if u >= knots[num_basis] {
        num_basis - 1
    } else if u < knots[degree] {
        degree
    } else {
        let mut span = degree;
        while span < num_basis && u >= knots[span + 1] {
            span += 1;
        }
        span
    }
}

/// Evaluates the `degree + 1` basis functions that are nonzero on `span` at
/// `u` into `out[..=degree]`, using the stable Cox-de Boor triangular
/// recurrence (Piegl & Tiller, Algorithm A2.2).
fn local_basis_values(u: f64, degree: usize, span: usize, knots: &[f64], out: &mut [f64]) {
    debug_assert!(out.len() > degree);

    let mut left = vec![0.0; degree + 1];
    let mut right = vec![0.0; degree + 1];

    out[0] = 1.0;
    for d in 1..=degree {
        left[d] = u - knots[span + 1 - d];
        right[d] = knots[span + d] - u;

        let mut saved = 0.0;
        for r in 0..d {
            let den = right[r + 1] + left[d - r];
            let temp = if den.abs() > 1e-12 { out[r] / den } else { 0.0 };

            out[r] = saved + right[r + 1] * temp;
            saved = left[d - r] * temp;
        }
        out[d] = saved;
    }
}

/// Evaluates the `deriv`-th parametric derivative of the local nonzero basis
/// functions at `u`, returning `degree + 1` values for basis indices
/// `span - degree ..= span`.
///
/// Uses the analytic de Boor derivative recurrence
/// `B'_{i,p}(u) = p * (B_{i,p-1}(u)/(t_{i+p}-t_i) - B_{i+1,p-1}(u)/(t_{i+p+1}-t_{i+1}))`
/// applied `deriv` times down the degree ladder. Requires `deriv <= degree`,
/// which the public entry point enforces as `derivative_order < order`.
fn local_basis_derivatives(
    u: f64,
    degree: usize,
    deriv: usize,
    span: usize,
    knots: &[f64],
) -> Vec<f64> {
    let mut out = vec![0.0; degree + 1];
    if deriv == 0 {
        local_basis_values(u, degree, span, knots, &mut out);
        return out;
    }

    // Lower-degree values cover basis indices span - degree + 1 ..= span.
    let lower = local_basis_derivatives(u, degree - 1, deriv - 1, span, knots);
    let p = degree as f64;
    for (j, slot) in out.iter_mut().enumerate() {
        let i = span - degree + j;
        let denom_left = knots[i + degree] - knots[i];
        let denom_right = knots[i + degree + 1] - knots[i + 1];

        let left_term = if j >= 1 && denom_left.abs() > 1e-12 {
            lower[j - 1] / denom_left
        } else {
            0.0
        };
        let right_term = if j < degree && denom_right.abs() > 1e-12 {
            lower[j] / denom_right
        } else {
            0.0
        };
        *slot = p * (left_term - right_term);
    }
    out
}

/// Reusable per-thread buffers for one query point's tensor-product weights.
struct PointScratch {
    starts: Vec<usize>,
    weights: Vec<Vec<f64>>,
    odometer: Vec<usize>,
}

impl PointScratch {
    fn new(orders: &[usize]) -> Self {
        Self {
            starts: vec![0; orders.len()],
            weights: orders.iter().map(|&p| vec![0.0; p]).collect(),
            odometer: vec![0; orders.len()],
        }
    }
}

/// Evaluates one dimension's local basis (or derivative) weights for a single
/// parametric value, recording the first covered coefficient index.
fn evaluate_dimension(
    u: f64,
    order: usize,
    num_coefficients: usize,
    derivative_order: usize,
    knots: &[f64],
    start: &mut usize,
    weights: &mut Vec<f64>,
) {
    let degree = order - 1;
    let span = find_span(u, degree, num_coefficients, knots);
    *start = span - degree;
    if derivative_order == 0 {
        local_basis_values(u, degree, span, knots, weights);
    } else {
        *weights = local_basis_derivatives(u, degree, derivative_order, span, knots);
    }
}

/// Emits the tensor-product weights of one query point into `sink` as
/// `(row, flattened_column, value)` entries, odometer-style over the local
/// support of every dimension.
fn scatter_point<F: FnMut(usize, usize, f64)>(
    row: usize,
    point: ArrayView1<f64>,
    orders: &[usize],
    grid_shape: &[usize],
    derivative_orders: &[usize],
    knots: &[Array1<f64>],
    strides: &[usize],
    scratch: &mut PointScratch,
    sink: &mut F,
) {
    let num_dims = orders.len();
    for d in 0..num_dims {
        evaluate_dimension(
            point[d],
            orders[d],
            grid_shape[d],
            derivative_orders[d],
            knots[d]
                .as_slice()
                .expect("knot vectors are owned contiguous arrays"),
            &mut scratch.starts[d],
            &mut scratch.weights[d],
        );
    }

    scratch.odometer.fill(0);
    loop {
        let mut column = 0;
        let mut value = 1.0;
        for d in 0..num_dims {
            column += (scratch.starts[d] + scratch.odometer[d]) * strides[d];
            value *= scratch.weights[d][scratch.odometer[d]];
        }
        sink(row, column, value);

        let mut d = num_dims;
        let mut advanced = false;
        while d > 0 {
            d -= 1;
            scratch.odometer[d] += 1;
            if scratch.odometer[d] < orders[d] {
                advanced = true;
                break;
            }
            scratch.odometer[d] = 0;
        }
        if !advanced {
            return;
        }
    }
}

fn validate_inputs(
    orders: &[usize],
    grid_shape: &[usize],
    derivative_orders: &[usize],
    knots: &[Array1<f64>],
    coords: ArrayView2<f64>,
) -> Result<(), BasisError> {
    let num_dims = orders.len();
    if num_dims == 0 {
        return Err(BasisError::DimensionMismatch(
            "at least one parametric dimension is required".to_string(),
        ));
    }
    if grid_shape.len() != num_dims
        || derivative_orders.len() != num_dims
        || knots.len() != num_dims
    {
        return Err(BasisError::DimensionMismatch(format!(
            "orders ({}), grid shape ({}), derivative orders ({}), and knot vectors ({}) must all describe the same number of dimensions",
            num_dims,
            grid_shape.len(),
            derivative_orders.len(),
            knots.len()
        )));
    }
    if coords.ncols() != num_dims {
        return Err(BasisError::DimensionMismatch(format!(
            "query coordinates have {} components per point but the basis has {} parametric dimensions",
            coords.ncols(),
            num_dims
        )));
    }

    for d in 0..num_dims {
        if orders[d] < 1 {
            return Err(BasisError::InvalidOrder(orders[d]));
        }
        if grid_shape[d] < orders[d] {
            return Err(BasisError::TooFewCoefficients {
                order: orders[d],
                num_coefficients: grid_shape[d],
            });
        }
        if derivative_orders[d] >= orders[d] {
            return Err(BasisError::DerivativeOrderTooHigh {
                dimension: d,
                derivative_order: derivative_orders[d],
                order: orders[d],
            });
        }
        let expected = orders[d] + grid_shape[d];
        if knots[d].len() != expected {
            return Err(BasisError::KnotCountMismatch {
                dimension: d,
                order: orders[d],
                num_coefficients: grid_shape[d],
                expected,
                found: knots[d].len(),
            });
        }
        for pair in knots[d].windows(2) {
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

    for point in coords.axis_iter(Axis(0)) {
        for (d, &value) in point.iter().enumerate() {
            if !(0.0..=1.0).contains(&value) {
                return Err(BasisError::CoordinateOutOfDomain {
                    dimension: d,
                    value,
                });
            }
        }
    }
    Ok(())
}

const PAR_THRESHOLD: usize = 512;
const CHUNK_SIZE: usize = 256;

/// Assembles the sparse linear map from flattened control coefficients to the
/// evaluated tensor-product basis (or partial derivative) at every query point.
///
/// Rows follow the query-point order; columns follow row-major flattening of
/// the coefficient grid. Each row carries at most `orders.iter().product()`
/// nonzero entries. With `expansion_factor = k > 0`, each entry `(r, c, v)`
/// is block-replicated to `(k*r + j, k*c + j, v)` for `j in 0..k` so the map
/// applies to interleaved `k`-component coefficient arrays;
/// `expansion_factor = 0` returns the unreplicated scalar map.
pub fn evaluate_tensor_basis(
    orders: &[usize],
    grid_shape: &[usize],
    derivative_orders: &[usize],
    knots: &[Array1<f64>],
    coords: ArrayView2<f64>,
    expansion_factor: usize,
) -> Result<SparseColMat<usize, f64>, BasisError> {
    validate_inputs(orders, grid_shape, derivative_orders, knots, coords)?;

    let num_dims = orders.len();
    let num_points = coords.nrows();
    let num_columns: usize = grid_shape.iter().product();
    let support: usize = orders.iter().product();
    let replicas = expansion_factor.max(1);

    let mut strides = vec![1usize; num_dims];
    for d in (0..num_dims.saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * grid_shape[d + 1];
    }

    let triplets: Vec<Triplet<usize, usize, f64>> = if num_points >= PAR_THRESHOLD {
        let chunks: Vec<Vec<Triplet<usize, usize, f64>>> = basis_thread_pool().install(|| {
            coords
                .axis_chunks_iter(Axis(0), CHUNK_SIZE)
                .into_par_iter()
                .enumerate()
                .map_init(
                    || PointScratch::new(orders),
                    |scratch, (chunk_idx, chunk)| {
                        let base_row = chunk_idx * CHUNK_SIZE;
                        let mut local =
                            Vec::with_capacity(chunk.nrows().saturating_mul(support * replicas));
                        for (i, point) in chunk.axis_iter(Axis(0)).enumerate() {
                            let mut sink = |r: usize, c: usize, v: f64| {
                                push_replicated(&mut local, r, c, v, expansion_factor);
                            };
                            scatter_point(
                                base_row + i,
                                point,
                                orders,
                                grid_shape,
                                derivative_orders,
                                knots,
                                &strides,
                                scratch,
                                &mut sink,
                            );
                        }
                        local
                    },
                )
                .collect()
        });

        let mut flattened = Vec::with_capacity(num_points.saturating_mul(support * replicas));
        for mut chunk in chunks {
            flattened.append(&mut chunk);
        }
        flattened
    } else {
        let mut scratch = PointScratch::new(orders);
        let mut triplets = Vec::with_capacity(num_points.saturating_mul(support * replicas));
        for (row, point) in coords.axis_iter(Axis(0)).enumerate() {
            let mut sink = |r: usize, c: usize, v: f64| {
                push_replicated(&mut triplets, r, c, v, expansion_factor);
            };
            scatter_point(
                row,
                point,
                orders,
                grid_shape,
                derivative_orders,
                knots,
                &strides,
                &mut scratch,
                &mut sink,
            );
        }
        triplets
    };

    let (nrows, ncols) = if expansion_factor > 0 {
        (
            num_points * expansion_factor,
            num_columns * expansion_factor,
        )
    } else {
        (num_points, num_columns)
    };
    SparseColMat::try_new_from_triplets(nrows, ncols, &triplets)
        .map_err(|err| BasisError::SparseCreation(format!("{err:?}")))
}

fn push_replicated(
    triplets: &mut Vec<Triplet<usize, usize, f64>>,
    row: usize,
    column: usize,
    value: f64,
    expansion_factor: usize,
) {
    if expansion_factor == 0 {
        triplets.push(Triplet::new(row, column, value));
    } else {
        for j in 0..expansion_factor {
            triplets.push(Triplet::new(
                expansion_factor * row + j,
                expansion_factor * column + j,
                value,
            ));
        }
    }
}

/// Applies a sparse evaluation map to a dense coefficient array, returning
/// the evaluated values `(map.nrows(), coefficients.ncols())`.
pub fn apply_evaluation_map(
    map: &SparseColMat<usize, f64>,
    coefficients: ArrayView2<f64>,
) -> Result<Array2<f64>, BasisError> {
    if map.ncols() != coefficients.nrows() {
        return Err(BasisError::DimensionMismatch(format!(
            "evaluation map has {} columns but {} coefficients were supplied",
            map.ncols(),
            coefficients.nrows()
        )));
    }

    let mut out = Array2::<f64>::zeros((map.nrows(), coefficients.ncols()));
    let (symbolic, values) = map.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..map.ncols() {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            let row = row_idx[idx];
            let weight = values[idx];
            for (o, &c) in out.row_mut(row).iter_mut().zip(coefficients.row(col)) {
                *o += weight * c;
            }
        }
    }
    Ok(out)
}
