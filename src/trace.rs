//! Recording and export of the visited states.

use std::sync::Arc;

use arrow::array::{Array, ArrayBuilder, FixedSizeListBuilder, PrimitiveBuilder};
use arrow::datatypes::Float64Type;

/// Append-only record of the walk, one row per step.
///
/// A row holds the parameter vector the chain sat at after the step plus
/// its negative log-likelihood in the trailing slot, so rejected steps
/// duplicate the previous row. The buffer only ever grows; burn-in and
/// thinning are downstream concerns.
#[derive(Debug, Clone, Default)]
pub struct JumpBuffer {
    data: Vec<f64>,
    row: usize,
}

impl JumpBuffer {
    pub(crate) fn new(nparams: usize) -> Self {
        Self {
            data: Vec::new(),
            row: nparams + 1,
        }
    }

    pub(crate) fn append(&mut self, params: &[f64], nll: f64) {
        debug_assert_eq!(params.len() + 1, self.row);
        self.data.extend_from_slice(params);
        self.data.push(nll);
    }

    /// Number of recorded steps.
    pub fn rows(&self) -> usize {
        if self.row == 0 {
            return 0;
        }
        self.data.len() / self.row
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Row width, the parameter count plus one for the likelihood.
    pub fn row_len(&self) -> usize {
        self.row
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        let start = index.checked_mul(self.row)?;
        self.data.get(start..start + self.row)
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        self.data.chunks_exact(self.row)
    }

    /// The flat row-major storage.
    pub fn as_flat(&self) -> &[f64] {
        &self.data
    }

    /// Hand the recorded rows to external storage and keep appending
    /// from an empty buffer.
    pub fn drain_rows(&mut self) -> Vec<f64> {
        std::mem::take(&mut self.data)
    }

    /// The recorded rows as a fixed-size-list array of `row_len` floats.
    pub fn to_arrow(&self) -> Arc<dyn Array> {
        let mut builder =
            FixedSizeListBuilder::new(PrimitiveBuilder::<Float64Type>::new(), self.row as i32);
        for row in self.iter_rows() {
            builder.values().append_slice(row);
            builder.append(true);
        }
        ArrayBuilder::finish(&mut builder)
    }
}

/// Everything one chain produced.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub chain_id: u64,
    /// The jump rows, finalized as arrow data.
    pub draws: Arc<dyn Array>,
    pub accepted: u64,
    pub steps: u64,
}

impl ChainOutput {
    pub fn acceptance_rate(&self) -> f64 {
        if self.steps == 0 {
            return 0.0;
        }
        self.accepted as f64 / self.steps as f64
    }
}

/// The combined output of an ensemble, ordered by chain id.
#[derive(Debug, Clone)]
pub struct Trace {
    pub chains: Vec<ChainOutput>,
}

impl<I: IntoIterator<Item = ChainOutput>> From<I> for Trace {
    fn from(value: I) -> Self {
        let mut chains: Vec<_> = value.into_iter().collect();
        chains.sort_by_key(|chain| chain.chain_id);
        Self { chains }
    }
}
