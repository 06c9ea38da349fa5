//! Execution backends for the likelihood kernels.
//!
//! A backend decides how the per-event work is partitioned into lanes and
//! at which width the partial sums are reduced; the arithmetic itself
//! lives in [`crate::kernels`] and is shared. Two implementations exist:
//! [`crate::HostBackend`] spreads the lanes over a thread pool, and
//! [`crate::GridBackend`] emulates a device grid of blocks so that fits
//! tuned for accelerator geometry reproduce exactly on ordinary machines.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::kernels;
use crate::table::LookupTable;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend needs at least one lane")]
    NoLanes,
    #[error("grid block size must be a power of two, got {0}")]
    BlockSizeNotPowerOfTwo(usize),
    #[error("grid needs at least one block")]
    NoBlocks,
}

/// How one chain executes the likelihood pipeline.
///
/// Implementations only choose a partition; the proposal and acceptance
/// stages are provided here so that every backend consumes the random
/// streams identically and chains agree step for step across backends.
pub trait Backend: Send {
    /// Number of lanes the event partition is strided over, which is also
    /// the length of the partial-sum buffer.
    fn lanes(&self) -> usize;

    /// Power-of-two accumulator count of the reduction tree. Equal widths
    /// reduce equal partial-sum arrays to bitwise equal totals.
    fn reduce_width(&self) -> usize;

    /// Fill `partials` with the per-lane event sums for `rates`.
    ///
    /// Lanes whose sum came out NaN are left at zero, so the buffer is
    /// always finite as long as at least the idle lanes behave; the NaN
    /// condition resurfaces through the rate sign check in the total.
    fn event_sums(
        &mut self,
        table: &LookupTable,
        weights: &[i32],
        rates: &[f64],
        partials: &mut [f64],
    );

    /// Reduce the partial sums to the scalar event term.
    fn reduce(&mut self, partials: &[f64]) -> f64 {
        kernels::reduce_block(partials, self.reduce_width())
    }

    /// Draw the next proposal, one Gaussian step per parameter from that
    /// parameter's own stream.
    fn propose<R: Rng>(
        &mut self,
        rngs: &mut [R],
        widths: &[f64],
        current: &[f64],
        proposed: &mut [f64],
    ) {
        kernels::propose(rngs, widths, current, proposed);
    }
}

/// The per-chain family of counter-based random streams.
///
/// Stream `i` of a pool belongs to parameter `i`; stream 0 doubles as the
/// lead stream that decides acceptance. All streams share one seed and are
/// separated by the stream number, with the chain id in the high bits, so
/// ensembles of chains never overlap and a fit is reproducible from
/// `(seed, chain)` alone.
pub struct RngPool {
    states: Vec<ChaCha8Rng>,
}

impl RngPool {
    pub fn new(seed: u64, chain: u64, streams: usize) -> Self {
        debug_assert!(streams < u32::MAX as usize);
        let states = (0..streams as u64)
            .map(|stream| {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                rng.set_stream((chain << 32) | stream);
                rng
            })
            .collect();
        Self { states }
    }

    pub fn streams(&self) -> usize {
        self.states.len()
    }

    /// All parameter streams, index-aligned with the parameter vector.
    pub fn states_mut(&mut self) -> &mut [ChaCha8Rng] {
        &mut self.states
    }

    /// The lead stream used by the acceptance test.
    pub fn lead(&mut self) -> &mut ChaCha8Rng {
        &mut self.states[0]
    }
}
