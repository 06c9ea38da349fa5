//! Host backend: likelihood lanes on the CPU thread pool.

use rayon::prelude::*;

use crate::backend::{Backend, BackendError};
use crate::kernels;
use crate::table::LookupTable;

/// Runs the event partition as `lanes` strided lanes in parallel on the
/// current rayon pool, one partial sum per lane.
///
/// The reduction width is the lane count rounded up to a power of two, so
/// two host backends with the same lane count agree bitwise while the
/// thread count, scheduling and machine load stay irrelevant.
#[derive(Clone, Copy)]
pub struct HostBackend {
    lanes: usize,
    arch: pulp::Arch,
}

impl HostBackend {
    pub fn new(lanes: usize) -> Result<Self, BackendError> {
        if lanes == 0 {
            return Err(BackendError::NoLanes);
        }
        Ok(Self {
            lanes,
            arch: pulp::Arch::new(),
        })
    }
}

impl Backend for HostBackend {
    fn lanes(&self) -> usize {
        self.lanes
    }

    fn reduce_width(&self) -> usize {
        self.lanes.next_power_of_two()
    }

    fn event_sums(
        &mut self,
        table: &LookupTable,
        weights: &[i32],
        rates: &[f64],
        partials: &mut [f64],
    ) {
        debug_assert_eq!(partials.len(), self.lanes);
        let nlanes = self.lanes;
        let arch = self.arch;
        partials
            .par_iter_mut()
            .enumerate()
            .for_each(|(lane, slot)| {
                let sum =
                    arch.dispatch(|| kernels::event_sum_lane(lane, nlanes, table, weights, rates));
                *slot = if sum.is_nan() { 0.0 } else { sum };
            });
    }
}
