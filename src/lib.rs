//! B-spline function spaces and free-form deformation (FFD) of control
//! lattices.
//!
//! The crate builds open-uniform knot vectors, evaluates tensor-product
//! B-spline bases (and their parametric derivatives) as sparse linear maps
//! from control coefficients to query points, and composes sectional FFD
//! deformations across independently framed blocks sharing one global
//! coefficient numbering.

#![deny(dead_code)]
#![deny(unused_imports)]

pub mod basis;
pub mod ffd_block;
pub mod ffd_set;
pub mod space;

pub use basis::{BasisError, apply_evaluation_map, build_open_uniform, evaluate_tensor_basis};
pub use ffd_block::{DofAxis, FfdBlock, FfdError, SectionDof};
pub use ffd_set::{FfdSet, SectionProperties, SetIndexing};
pub use space::{BSplineFunction, BSplineSpace};
