//! Aggregation of FFD blocks under one global coefficient numbering.
//!
//! An [`FfdSet`] owns the ordered block mapping and the index layout computed
//! by [`FfdSet::setup`]. Every evaluation stage is a pure function: per-block
//! results are concatenated in block insertion order, and the final stage maps
//! each block's local-frame coefficients into the shared global frame.

use ndarray::{Array2, ArrayView2, s};
use std::ops::Range;

use crate::ffd_block::{FfdBlock, FfdError};

/// Index layout derived by [`FfdSet::setup`]; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetIndexing {
    /// Total control coefficients across every block, active or not.
    pub total_coefficients: usize,
    /// Contiguous half-open coefficient range per block, insertion order.
    pub block_ranges: Vec<Range<usize>>,
    /// Aggregate active dof count across all blocks.
    pub num_dof: usize,
}

/// Per-section property values concatenated across active blocks, with the
/// section-row range each block occupies.
#[derive(Debug, Clone)]
pub struct SectionProperties {
    values: Array2<f64>,
    block_ranges: Vec<(String, Range<usize>)>,
}

impl SectionProperties {
    /// Concatenated values: one row per section, active blocks in order.
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// The named block's slice of sections, if it contributed any.
    pub fn block_slice(&self, name: &str) -> Option<ArrayView2<'_, f64>> {
        self.block_ranges
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, range)| self.values.slice(s![range.clone(), ..]))
    }
}

/// A collection of FFD blocks sharing one global coefficient numbering.
#[derive(Debug, Clone)]
pub struct FfdSet {
    name: String,
    blocks: Vec<FfdBlock>,
    indexing: Option<SetIndexing>,
}

impl FfdSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocks: Vec::new(),
            indexing: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a block; insertion order defines the global numbering. Any
    /// existing index layout is invalidated and `setup()` must be re-run.
    pub fn add_block(&mut self, block: FfdBlock) -> Result<(), FfdError> {
        if self.blocks.iter().any(|b| b.name() == block.name()) {
            return Err(FfdError::DuplicateBlock(block.name().to_string()));
        }
        self.indexing = None;
        self.blocks.push(block);
        Ok(())
    }

    pub fn blocks(&self) -> impl Iterator<Item = &FfdBlock> {
        self.blocks.iter()
    }

    /// Blocks with at least one active dof, in insertion order.
    pub fn active_blocks(&self) -> impl Iterator<Item = &FfdBlock> {
        self.blocks.iter().filter(|b| b.is_active())
    }

    pub fn block(&self, name: &str) -> Result<&FfdBlock, FfdError> {
        self.blocks
            .iter()
            .find(|b| b.name() == name)
            .ok_or_else(|| FfdError::UnknownBlock(name.to_string()))
    }

    /// Assigns every block a contiguous coefficient range in insertion order
    /// and tallies the aggregate dof count. Inactive blocks still occupy a
    /// slot in the numbering.
    pub fn setup(&mut self) {
        let mut block_ranges = Vec::with_capacity(self.blocks.len());
        let mut next = 0usize;
        for block in &self.blocks {
            block_ranges.push(next..next + block.num_coefficients());
            next += block.num_coefficients();
        }
        let num_dof = self.blocks.iter().map(|b| b.num_dof()).sum();
        log::debug!(
            "ffd set '{}': {} blocks, {} coefficients, {} dof",
            self.name,
            self.blocks.len(),
            next,
            num_dof
        );
        self.indexing = Some(SetIndexing {
            total_coefficients: next,
            block_ranges,
            num_dof,
        });
    }

    pub fn indexing(&self) -> Result<&SetIndexing, FfdError> {
        self.indexing.as_ref().ok_or(FfdError::NotSetUp)
    }

    pub fn total_coefficients(&self) -> Result<usize, FfdError> {
        Ok(self.indexing()?.total_coefficients)
    }

    pub fn num_dof(&self) -> Result<usize, FfdError> {
        Ok(self.indexing()?.num_dof)
    }

    /// The named block's coefficient range in the global numbering.
    pub fn coefficient_range(&self, name: &str) -> Result<Range<usize>, FfdError> {
        let indexing = self.indexing()?;
        let position = self
            .blocks
            .iter()
            .position(|b| b.name() == name)
            .ok_or_else(|| FfdError::UnknownBlock(name.to_string()))?;
        Ok(indexing.block_ranges[position].clone())
    }

    /// Sectional translations of every active block, concatenated.
    pub fn evaluate_affine_section_properties(&self) -> Result<SectionProperties, FfdError> {
        self.indexing()?;
        self.collect_section_properties(|block| block.evaluate_affine_section_properties())
    }

    /// Sectional rotation angles of every active block, concatenated.
    pub fn evaluate_rotational_section_properties(&self) -> Result<SectionProperties, FfdError> {
        self.indexing()?;
        self.collect_section_properties(|block| block.evaluate_rotational_section_properties())
    }

    fn collect_section_properties(
        &self,
        evaluate: impl Fn(&FfdBlock) -> Result<Array2<f64>, FfdError>,
    ) -> Result<SectionProperties, FfdError> {
        let mut per_block = Vec::new();
        let mut total_sections = 0usize;
        let mut columns = 0usize;
        for block in self.active_blocks() {
            let values = evaluate(block)?;
            total_sections += values.nrows();
            columns = values.ncols();
            per_block.push((block.name().to_string(), values));
        }

        let mut values = Array2::<f64>::zeros((total_sections, columns.max(1)));
        let mut block_ranges = Vec::with_capacity(per_block.len());
        let mut next = 0usize;
        for (name, block_values) in per_block {
            let range = next..next + block_values.nrows();
            values
                .slice_mut(s![range.clone(), ..])
                .assign(&block_values);
            next = range.end;
            block_ranges.push((name, range));
        }
        Ok(SectionProperties {
            values,
            block_ranges,
        })
    }

    /// Affine-deformed local-frame coefficients of every block, concatenated
    /// into `(total_coefficients, 3)`. Inactive blocks contribute their
    /// undeformed primitives.
    pub fn evaluate_affine_block_deformations(
        &self,
        affine_section_properties: &SectionProperties,
    ) -> Result<Array2<f64>, FfdError> {
        let indexing = self.indexing()?;
        let mut out = Array2::<f64>::zeros((indexing.total_coefficients, 3));
        for (block, range) in self.blocks.iter().zip(&indexing.block_ranges) {
            let deformed = if block.is_active() {
                let translations = affine_section_properties
                    .block_slice(block.name())
                    .ok_or_else(|| {
                        FfdError::ShapeMismatch(format!(
                            "section properties carry no slice for active block '{}'",
                            block.name()
                        ))
                    })?;
                block.evaluate_affine_block_deformations(translations)?
            } else {
                block.coefficients().clone()
            };
            out.slice_mut(s![range.clone(), ..]).assign(&deformed);
        }
        Ok(out)
    }

    /// Rotated local-frame coefficients of every block, concatenated. This is
    /// the array the local-to-global composition consumes.
    pub fn evaluate_rotational_block_deformations(
        &self,
        affine_coefficients: ArrayView2<f64>,
        rotational_section_properties: &SectionProperties,
    ) -> Result<Array2<f64>, FfdError> {
        let indexing = self.indexing()?;
        if affine_coefficients.dim() != (indexing.total_coefficients, 3) {
            return Err(FfdError::ShapeMismatch(format!(
                "affine coefficients have shape {:?}; expected ({}, 3)",
                affine_coefficients.dim(),
                indexing.total_coefficients
            )));
        }

        let mut out = Array2::<f64>::zeros((indexing.total_coefficients, 3));
        for (block, range) in self.blocks.iter().zip(&indexing.block_ranges) {
            let local = affine_coefficients.slice(s![range.clone(), ..]);
            let rotated = if block.is_active() {
                let angles = rotational_section_properties
                    .block_slice(block.name())
                    .ok_or_else(|| {
                        FfdError::ShapeMismatch(format!(
                            "section properties carry no slice for active block '{}'",
                            block.name()
                        ))
                    })?;
                block.evaluate_rotational_block_deformations(local, angles)?
            } else {
                local.to_owned()
            };
            out.slice_mut(s![range.clone(), ..]).assign(&rotated);
        }
        Ok(out)
    }

    /// Maps every block's rotated local-frame coefficients into the shared
    /// global frame: right-multiply by the transpose of the stored
    /// global-to-local rotation, then add the block's translation.
    /// Rotate-then-translate order is required for the rigid map to compose
    /// correctly.
    pub fn evaluate_coefficients(
        &self,
        rotated_coefficients: ArrayView2<f64>,
    ) -> Result<Array2<f64>, FfdError> {
        let indexing = self.indexing()?;
        if rotated_coefficients.dim() != (indexing.total_coefficients, 3) {
            return Err(FfdError::ShapeMismatch(format!(
                "rotated coefficients have shape {:?}; expected ({}, 3)",
                rotated_coefficients.dim(),
                indexing.total_coefficients
            )));
        }

        let mut out = Array2::<f64>::zeros((indexing.total_coefficients, 3));
        for (block, range) in self.blocks.iter().zip(&indexing.block_ranges) {
            let local = rotated_coefficients.slice(s![range.clone(), ..]);
            let global = local.dot(&block.local_to_global_rotation().t())
                + block.local_to_global_translations();
            out.slice_mut(s![range.clone(), ..]).assign(&global);
        }
        Ok(out)
    }

    /// Runs the full pipeline: affine and rotational section properties,
    /// block deformations, then the local-to-global composition.
    pub fn evaluate(&self) -> Result<Array2<f64>, FfdError> {
        let affine = self.evaluate_affine_section_properties()?;
        let rotational = self.evaluate_rotational_section_properties()?;
        let affine_coefficients = self.evaluate_affine_block_deformations(&affine)?;
        let rotated = self.evaluate_rotational_block_deformations(
            affine_coefficients.view(),
            &rotational,
        )?;
        self.evaluate_coefficients(rotated.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, arr1};

    fn block(name: &str, nu: usize) -> FfdBlock {
        let mut points = Array2::<f64>::zeros((nu * 4, 3));
        for (row, mut point) in points.outer_iter_mut().enumerate() {
            point[0] = row as f64;
        }
        FfdBlock::new(
            name,
            [nu, 2, 2],
            points,
            Array2::eye(3),
            arr1(&[0.0, 0.0, 0.0]),
        )
        .unwrap()
    }

    #[test]
    fn setup_assigns_contiguous_ranges() {
        let mut set = FfdSet::new("aircraft");
        set.add_block(block("wing", 11)).unwrap();
        set.add_block(block("tail", 5)).unwrap();
        set.setup();

        let indexing = set.indexing().unwrap();
        assert_eq!(indexing.total_coefficients, 44 + 20);
        assert_eq!(indexing.block_ranges, vec![0..44, 44..64]);
        assert_eq!(set.coefficient_range("tail").unwrap(), 44..64);

        let block_total: usize = set.blocks().map(|b| b.num_coefficients()).sum();
        assert_eq!(block_total, indexing.total_coefficients);
    }

    #[test]
    fn adding_a_block_invalidates_the_layout() {
        let mut set = FfdSet::new("aircraft");
        set.add_block(block("wing", 11)).unwrap();
        set.setup();
        assert!(set.indexing().is_ok());

        set.add_block(block("tail", 5)).unwrap();
        assert!(matches!(set.indexing(), Err(FfdError::NotSetUp)));
    }

    #[test]
    fn evaluation_requires_setup() {
        let set = FfdSet::new("aircraft");
        assert!(matches!(
            set.evaluate_affine_section_properties(),
            Err(FfdError::NotSetUp)
        ));
        assert!(matches!(set.total_coefficients(), Err(FfdError::NotSetUp)));
    }

    #[test]
    fn duplicate_and_unknown_block_names_are_rejected() {
        let mut set = FfdSet::new("aircraft");
        set.add_block(block("wing", 11)).unwrap();
        assert!(matches!(
            set.add_block(block("wing", 5)),
            Err(FfdError::DuplicateBlock(_))
        ));
        set.setup();
        assert!(matches!(
            set.block("canard"),
            Err(FfdError::UnknownBlock(_))
        ));
        assert!(matches!(
            set.coefficient_range("canard"),
            Err(FfdError::UnknownBlock(_))
        ));
    }

    #[test]
    fn inactive_blocks_pass_their_primitives_through() {
        let mut set = FfdSet::new("aircraft");
        set.add_block(block("wing", 11)).unwrap();
        set.setup();
        assert_eq!(set.num_dof().unwrap(), 0);

        let coefficients = set.evaluate().unwrap();
        let wing = set.block("wing").unwrap();
        assert_eq!(coefficients, *wing.coefficients());
    }

    #[test]
    fn active_dof_registers_in_the_aggregate_count() {
        let mut wing = block("wing", 11);
        wing.add_rotation_u("twist", 4, 10, Array1::zeros(10))
            .unwrap();
        let mut set = FfdSet::new("aircraft");
        set.add_block(wing).unwrap();
        set.add_block(block("tail", 5)).unwrap();
        set.setup();
        assert_eq!(set.num_dof().unwrap(), 10);

        let props = set.evaluate_affine_section_properties().unwrap();
        assert!(props.block_slice("wing").is_some());
        assert!(props.block_slice("tail").is_none());
    }
}
