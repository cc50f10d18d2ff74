//! Free-form deformation blocks.
//!
//! An [`FfdBlock`] wraps one B-spline volume's control lattice (local frame)
//! together with the sectional degrees of freedom registered on it. Sections
//! partition the lattice along parametric u; each dof is a 1-D B-spline curve
//! over u whose interpolated values drive per-section translations or
//! rotations.

use ndarray::{Array1, Array2, ArrayView2, Axis, arr2, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::basis::BasisError;
use crate::space::BSplineSpace;

/// Errors raised by FFD block and set operations.
#[derive(Error, Debug)]
pub enum FfdError {
    #[error("A degree of freedom named '{name}' is already registered on block '{block}'.")]
    DuplicateDof { block: String, name: String },

    #[error("Invalid degree of freedom '{name}' on block '{block}': {reason}")]
    InvalidDof {
        block: String,
        name: String,
        reason: String,
    },

    #[error("Invalid FFD block '{block}': {reason}")]
    InvalidBlock { block: String, reason: String },

    #[error("A block named '{0}' is already present in the set.")]
    DuplicateBlock(String),

    #[error("No block named '{0}' exists in this set.")]
    UnknownBlock(String),

    #[error("The FFD set has not been set up; call setup() before evaluating.")]
    NotSetUp,

    #[error("Array shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error(transparent)]
    Basis(#[from] BasisError),
}

/// The parametric axis and operation a sectional degree of freedom acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DofAxis {
    RotationU,
    RotationV,
    TranslationU,
    TranslationV,
    TranslationW,
}

impl DofAxis {
    /// Local-frame component a translation dof adds into, if any.
    pub fn translation_component(self) -> Option<usize> {
        match self {
            DofAxis::TranslationU => Some(0),
            DofAxis::TranslationV => Some(1),
            DofAxis::TranslationW => Some(2),
            _ => None,
        }
    }

    /// Column of the rotational section-property array this dof feeds, if any.
    pub fn rotation_slot(self) -> Option<usize> {
        match self {
            DofAxis::RotationU => Some(0),
            DofAxis::RotationV => Some(1),
            _ => None,
        }
    }
}

/// One sectional degree of freedom: `num_dof` discrete control values
/// interpolated along parametric u by a 1-D B-spline of the given order.
///
/// `num_dof == 0` is the inactive sentinel: the dof is registered but
/// contributes no deformation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionDof {
    pub axis: DofAxis,
    pub order: usize,
    pub num_dof: usize,
    pub values: Array1<f64>,
}

/// One deformable control lattice in its own local frame, plus the rigid map
/// to the shared global frame.
///
/// `coefficients` holds `shape[0] * shape[1] * shape[2]` control points in
/// u-major row-major order; `local_to_global_rotation` is stored as the
/// global-to-local rotation, so its transpose maps local back to global.
#[derive(Debug, Clone)]
pub struct FfdBlock {
    name: String,
    coefficients_shape: [usize; 3],
    coefficients: Array2<f64>,
    local_to_global_rotation: Array2<f64>,
    local_to_global_translations: Array1<f64>,
    dofs: Vec<(String, SectionDof)>,
}

impl FfdBlock {
    pub fn new(
        name: impl Into<String>,
        coefficients_shape: [usize; 3],
        coefficients: Array2<f64>,
        local_to_global_rotation: Array2<f64>,
        local_to_global_translations: Array1<f64>,
    ) -> Result<Self, FfdError> {
        let name = name.into();
        let num_coefficients: usize = coefficients_shape.iter().product();
        if coefficients_shape.contains(&0) {
            return Err(FfdError::InvalidBlock {
                block: name,
                reason: format!("coefficient grid shape {coefficients_shape:?} has a zero extent"),
            });
        }
        if coefficients.dim() != (num_coefficients, 3) {
            return Err(FfdError::InvalidBlock {
                block: name,
                reason: format!(
                    "coefficients have shape {:?}; grid {:?} requires ({}, 3)",
                    coefficients.dim(),
                    coefficients_shape,
                    num_coefficients
                ),
            });
        }
        if local_to_global_rotation.dim() != (3, 3) {
            return Err(FfdError::InvalidBlock {
                block: name,
                reason: format!(
                    "local_to_global_rotation has shape {:?}; expected (3, 3)",
                    local_to_global_rotation.dim()
                ),
            });
        }
        if local_to_global_translations.len() != 3 {
            return Err(FfdError::InvalidBlock {
                block: name,
                reason: format!(
                    "local_to_global_translations has {} entries; expected 3",
                    local_to_global_translations.len()
                ),
            });
        }
        Ok(Self {
            name,
            coefficients_shape,
            coefficients,
            local_to_global_rotation,
            local_to_global_translations,
            dofs: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coefficients_shape(&self) -> [usize; 3] {
        self.coefficients_shape
    }

    /// Undeformed control points in the local frame, `(num_coefficients, 3)`.
    pub fn coefficients(&self) -> &Array2<f64> {
        &self.coefficients
    }

    pub fn local_to_global_rotation(&self) -> &Array2<f64> {
        &self.local_to_global_rotation
    }

    pub fn local_to_global_translations(&self) -> &Array1<f64> {
        &self.local_to_global_translations
    }

    pub fn num_coefficients(&self) -> usize {
        self.coefficients_shape.iter().product()
    }

    /// Sections partition the lattice along parametric u.
    pub fn num_sections(&self) -> usize {
        self.coefficients_shape[0]
    }

    /// Registered dofs in registration order.
    pub fn dofs(&self) -> impl Iterator<Item = (&str, &SectionDof)> {
        self.dofs.iter().map(|(n, d)| (n.as_str(), d))
    }

    /// Total active dof count across every axis.
    pub fn num_dof(&self) -> usize {
        self.dofs.iter().map(|(_, d)| d.num_dof).sum()
    }

    pub fn is_active(&self) -> bool {
        self.num_dof() > 0
    }

    pub fn add_rotation_u(
        &mut self,
        name: impl Into<String>,
        order: usize,
        num_dof: usize,
        values: Array1<f64>,
    ) -> Result<(), FfdError> {
        self.register(name.into(), DofAxis::RotationU, order, num_dof, values)
    }

    pub fn add_rotation_v(
        &mut self,
        name: impl Into<String>,
        order: usize,
        num_dof: usize,
        values: Array1<f64>,
    ) -> Result<(), FfdError> {
        self.register(name.into(), DofAxis::RotationV, order, num_dof, values)
    }

    pub fn add_translation_u(
        &mut self,
        name: impl Into<String>,
        order: usize,
        num_dof: usize,
        values: Array1<f64>,
    ) -> Result<(), FfdError> {
        self.register(name.into(), DofAxis::TranslationU, order, num_dof, values)
    }

    pub fn add_translation_v(
        &mut self,
        name: impl Into<String>,
        order: usize,
        num_dof: usize,
        values: Array1<f64>,
    ) -> Result<(), FfdError> {
        self.register(name.into(), DofAxis::TranslationV, order, num_dof, values)
    }

    pub fn add_translation_w(
        &mut self,
        name: impl Into<String>,
        order: usize,
        num_dof: usize,
        values: Array1<f64>,
    ) -> Result<(), FfdError> {
        self.register(name.into(), DofAxis::TranslationW, order, num_dof, values)
    }

    fn register(
        &mut self,
        name: String,
        axis: DofAxis,
        order: usize,
        num_dof: usize,
        values: Array1<f64>,
    ) -> Result<(), FfdError> {
        if self.dofs.iter().any(|(existing, _)| *existing == name) {
            return Err(FfdError::DuplicateDof {
                block: self.name.clone(),
                name,
            });
        }
        if values.len() != num_dof {
            return Err(FfdError::InvalidDof {
                block: self.name.clone(),
                name,
                reason: format!(
                    "declared num_dof {} but {} values were supplied",
                    num_dof,
                    values.len()
                ),
            });
        }
        if num_dof > 0 && (order < 1 || num_dof < order) {
            return Err(FfdError::InvalidDof {
                block: self.name.clone(),
                name,
                reason: format!("interpolation order {order} needs at least {order} control values, got {num_dof}"),
            });
        }
        if num_dof == 0 {
            log::debug!(
                "dof '{}' on block '{}' registered inactive (num_dof = 0)",
                name,
                self.name
            );
        }
        self.dofs.push((
            name,
            SectionDof {
                axis,
                order,
                num_dof,
                values,
            },
        ));
        Ok(())
    }

    /// Uniform section parameters along u: `num_sections` values spanning
    /// `[0, 1]`.
    fn section_parameters(&self) -> Array2<f64> {
        let ns = self.num_sections();
        let mut params = Array2::<f64>::zeros((ns, 1));
        if ns > 1 {
            for (i, mut row) in params.axis_iter_mut(Axis(0)).enumerate() {
                row[0] = i as f64 / (ns - 1) as f64;
            }
        }
        params
    }

    /// Interpolates one dof's control values at every section parameter.
    fn interpolate_dof(&self, name: &str, dof: &SectionDof) -> Result<Array1<f64>, FfdError> {
        let space = BSplineSpace::new(
            format!("{}_{}_curve", self.name, name),
            &[dof.order],
            &[dof.num_dof],
        )?;
        let map = space.compute_evaluation_map(self.section_parameters().view(), None, 0)?;
        let column = dof.values.view().insert_axis(Axis(1));
        let interpolated = crate::basis::apply_evaluation_map(&map, column)?;
        Ok(interpolated.column(0).to_owned())
    }

    /// Sectional translations `(num_sections, 3)`: every active translation
    /// dof interpolated along u and summed into its local-frame component.
    pub fn evaluate_affine_section_properties(&self) -> Result<Array2<f64>, FfdError> {
        let mut translations = Array2::<f64>::zeros((self.num_sections(), 3));
        for (name, dof) in &self.dofs {
            let Some(component) = dof.axis.translation_component() else {
                continue;
            };
            if dof.num_dof == 0 {
                continue;
            }
            let sectional = self.interpolate_dof(name, dof)?;
            for (mut row, &value) in translations.axis_iter_mut(Axis(0)).zip(sectional.iter()) {
                row[component] += value;
            }
        }
        Ok(translations)
    }

    /// Sectional rotation angles `(num_sections, 2)`, columns `[θ_u, θ_v]`.
    pub fn evaluate_rotational_section_properties(&self) -> Result<Array2<f64>, FfdError> {
        let mut angles = Array2::<f64>::zeros((self.num_sections(), 2));
        for (name, dof) in &self.dofs {
            let Some(slot) = dof.axis.rotation_slot() else {
                continue;
            };
            if dof.num_dof == 0 {
                continue;
            }
            let sectional = self.interpolate_dof(name, dof)?;
            for (mut row, &value) in angles.axis_iter_mut(Axis(0)).zip(sectional.iter()) {
                row[slot] += value;
            }
        }
        Ok(angles)
    }

    /// Applies sectional translations to the primitive coefficients, yielding
    /// the affine-deformed lattice in the local frame.
    pub fn evaluate_affine_block_deformations(
        &self,
        sectional_translations: ArrayView2<f64>,
    ) -> Result<Array2<f64>, FfdError> {
        let ns = self.num_sections();
        if sectional_translations.dim() != (ns, 3) {
            return Err(FfdError::ShapeMismatch(format!(
                "block '{}' expects sectional translations of shape ({}, 3), got {:?}",
                self.name,
                ns,
                sectional_translations.dim()
            )));
        }

        let section_len = self.coefficients_shape[1] * self.coefficients_shape[2];
        let mut deformed = self.coefficients.clone();
        for section in 0..ns {
            let rows = section * section_len..(section + 1) * section_len;
            let mut slice = deformed.slice_mut(s![rows, ..]);
            slice += &sectional_translations.row(section);
        }
        Ok(deformed)
    }

    /// Applies sectional rotations to the affine-deformed lattice: each
    /// section rotates rigidly about its own centroid, first by `θ_u` about
    /// the local u-axis, then by `θ_v` about the local v-axis.
    pub fn evaluate_rotational_block_deformations(
        &self,
        affine_coefficients: ArrayView2<f64>,
        sectional_angles: ArrayView2<f64>,
    ) -> Result<Array2<f64>, FfdError> {
        let ns = self.num_sections();
        if affine_coefficients.dim() != (self.num_coefficients(), 3) {
            return Err(FfdError::ShapeMismatch(format!(
                "block '{}' expects affine coefficients of shape ({}, 3), got {:?}",
                self.name,
                self.num_coefficients(),
                affine_coefficients.dim()
            )));
        }
        if sectional_angles.dim() != (ns, 2) {
            return Err(FfdError::ShapeMismatch(format!(
                "block '{}' expects sectional angles of shape ({}, 2), got {:?}",
                self.name,
                ns,
                sectional_angles.dim()
            )));
        }

        let has_rotation_dofs = self
            .dofs
            .iter()
            .any(|(_, d)| d.axis.rotation_slot().is_some() && d.num_dof > 0);
        if !has_rotation_dofs {
            return Ok(affine_coefficients.to_owned());
        }

        let section_len = self.coefficients_shape[1] * self.coefficients_shape[2];
        let mut rotated = affine_coefficients.to_owned();
        for section in 0..ns {
            let rows = section * section_len..(section + 1) * section_len;
            let slice = affine_coefficients.slice(s![rows.clone(), ..]);

            let centroid = slice
                .mean_axis(Axis(0))
                .expect("section slices are non-empty");
            let rotation = section_rotation(
                sectional_angles[[section, 0]],
                sectional_angles[[section, 1]],
            );

            // Row-vector points: p' = c + (p - c) R^T.
            let relative = &slice - &centroid;
            let turned = relative.dot(&rotation.t()) + &centroid;
            rotated.slice_mut(s![rows, ..]).assign(&turned);
        }
        Ok(rotated)
    }
}

/// Combined section rotation: about the local u-axis by `theta_u`, then about
/// the local v-axis by `theta_v`.
fn section_rotation(theta_u: f64, theta_v: f64) -> Array2<f64> {
    let (su, cu) = theta_u.sin_cos();
    let (sv, cv) = theta_v.sin_cos();
    let rot_u = arr2(&[[1.0, 0.0, 0.0], [0.0, cu, -su], [0.0, su, cu]]);
    let rot_v = arr2(&[[cv, 0.0, sv], [0.0, 1.0, 0.0], [-sv, 0.0, cv]]);
    rot_v.dot(&rot_u)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, arr1};

    fn lattice(nu: usize, nv: usize, nw: usize) -> Array2<f64> {
        let mut points = Array2::<f64>::zeros((nu * nv * nw, 3));
        let mut row = 0;
        for iu in 0..nu {
            for iv in 0..nv {
                for iw in 0..nw {
                    points[[row, 0]] = iu as f64 / (nu - 1).max(1) as f64;
                    points[[row, 1]] = iv as f64;
                    points[[row, 2]] = iw as f64;
                    row += 1;
                }
            }
        }
        points
    }

    fn identity_block(name: &str, nu: usize, nv: usize, nw: usize) -> FfdBlock {
        FfdBlock::new(
            name,
            [nu, nv, nw],
            lattice(nu, nv, nw),
            Array2::eye(3),
            arr1(&[0.0, 0.0, 0.0]),
        )
        .expect("valid block")
    }

    #[test]
    fn duplicate_dof_names_are_rejected() {
        let mut block = identity_block("wing", 11, 2, 2);
        block
            .add_rotation_u("twist", 4, 10, Array1::zeros(10))
            .unwrap();
        let result = block.add_rotation_u("twist", 4, 10, Array1::zeros(10));
        assert!(matches!(result, Err(FfdError::DuplicateDof { .. })));
    }

    #[test]
    fn dof_value_count_must_match_declaration() {
        let mut block = identity_block("wing", 11, 2, 2);
        let result = block.add_translation_w("lift", 4, 10, Array1::zeros(7));
        assert!(matches!(result, Err(FfdError::InvalidDof { .. })));
    }

    #[test]
    fn zero_dof_registration_is_inactive() {
        let mut block = identity_block("wing", 11, 2, 2);
        block
            .add_rotation_v("unused", 4, 0, Array1::zeros(0))
            .unwrap();
        assert_eq!(block.num_dof(), 0);
        assert!(!block.is_active());

        let translations = block.evaluate_affine_section_properties().unwrap();
        assert_abs_diff_eq!(translations.sum(), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn constant_translation_shifts_every_section() {
        let mut block = identity_block("wing", 5, 2, 2);
        block
            .add_translation_w("lift", 1, 1, arr1(&[2.5]))
            .unwrap();

        let translations = block.evaluate_affine_section_properties().unwrap();
        for section in 0..5 {
            assert_abs_diff_eq!(translations[[section, 2]], 2.5, epsilon = 1e-12);
            assert_abs_diff_eq!(translations[[section, 0]], 0.0, epsilon = 1e-15);
        }

        let deformed = block
            .evaluate_affine_block_deformations(translations.view())
            .unwrap();
        let expected = block.coefficients().column(2).to_owned() + 2.5;
        for (got, want) in deformed.column(2).iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-12);
        }
    }

    #[test]
    fn sectional_rotation_is_rigid_about_the_centroid() {
        let mut block = identity_block("wing", 3, 2, 2);
        let angle = std::f64::consts::FRAC_PI_3;
        block
            .add_rotation_u("twist", 1, 1, arr1(&[angle]))
            .unwrap();

        let affine = block.coefficients().clone();
        let angles = block.evaluate_rotational_section_properties().unwrap();
        for section in 0..3 {
            assert_abs_diff_eq!(angles[[section, 0]], angle, epsilon = 1e-12);
        }

        let rotated = block
            .evaluate_rotational_block_deformations(affine.view(), angles.view())
            .unwrap();

        let section_len = 4;
        for section in 0..3 {
            let before = affine.slice(s![section * section_len..(section + 1) * section_len, ..]);
            let after = rotated.slice(s![section * section_len..(section + 1) * section_len, ..]);
            let centroid_before = before.mean_axis(Axis(0)).unwrap();
            let centroid_after = after.mean_axis(Axis(0)).unwrap();

            // Centroid is a fixed point; distances to it are preserved; the
            // u-axis component never moves under a rotation about u.
            for k in 0..3 {
                assert_abs_diff_eq!(centroid_after[k], centroid_before[k], epsilon = 1e-12);
            }
            for row in 0..section_len {
                let db: f64 = (0..3)
                    .map(|k| (before[[row, k]] - centroid_before[k]).powi(2))
                    .sum();
                let da: f64 = (0..3)
                    .map(|k| (after[[row, k]] - centroid_after[k]).powi(2))
                    .sum();
                assert_abs_diff_eq!(da, db, epsilon = 1e-10);
                assert_abs_diff_eq!(after[[row, 0]], before[[row, 0]], epsilon = 1e-12);

                // Explicit rotation of the (y, z) offsets.
                let dy = before[[row, 1]] - centroid_before[1];
                let dz = before[[row, 2]] - centroid_before[2];
                let expected_y = centroid_before[1] + dy * angle.cos() - dz * angle.sin();
                let expected_z = centroid_before[2] + dy * angle.sin() + dz * angle.cos();
                assert_abs_diff_eq!(after[[row, 1]], expected_y, epsilon = 1e-10);
                assert_abs_diff_eq!(after[[row, 2]], expected_z, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn rotation_free_block_passes_affine_coefficients_through() {
        let mut block = identity_block("fuselage", 4, 2, 2);
        block
            .add_translation_v("sweep", 2, 3, arr1(&[0.0, 0.5, 1.0]))
            .unwrap();

        let affine = block.coefficients().clone();
        let angles = block.evaluate_rotational_section_properties().unwrap();
        let rotated = block
            .evaluate_rotational_block_deformations(affine.view(), angles.view())
            .unwrap();
        for (got, want) in rotated.iter().zip(affine.iter()) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-15);
        }
    }
}
