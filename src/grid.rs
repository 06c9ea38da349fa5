//! Grid backend: device-style execution on blocks of virtual lanes.

use rayon::prelude::*;

use crate::backend::{Backend, BackendError};
use crate::kernels;
use crate::table::LookupTable;

/// Emulates a one-dimensional launch grid of `blocks` blocks with
/// `block_size` lanes each.
///
/// Global lane `b * block_size + l` walks the events with the full grid
/// stride, exactly like a grid-stride loop on an accelerator, and the
/// reduction runs per block at width `block_size`. Blocks execute in
/// parallel; lanes within a block run in sequence, which is legitimate
/// because the lanes of the partition never communicate before the
/// reduction barrier. Fits tuned against a device launch geometry can be
/// replayed here lane for lane.
#[derive(Debug, Clone, Copy)]
pub struct GridBackend {
    blocks: usize,
    block_size: usize,
}

impl GridBackend {
    pub fn new(blocks: usize, block_size: usize) -> Result<Self, BackendError> {
        if blocks == 0 {
            return Err(BackendError::NoBlocks);
        }
        if !block_size.is_power_of_two() {
            return Err(BackendError::BlockSizeNotPowerOfTwo(block_size));
        }
        Ok(Self { blocks, block_size })
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl Backend for GridBackend {
    fn lanes(&self) -> usize {
        self.blocks * self.block_size
    }

    fn reduce_width(&self) -> usize {
        self.block_size
    }

    fn event_sums(
        &mut self,
        table: &LookupTable,
        weights: &[i32],
        rates: &[f64],
        partials: &mut [f64],
    ) {
        debug_assert_eq!(partials.len(), self.lanes());
        let grid_stride = self.lanes();
        let block_size = self.block_size;
        partials
            .par_chunks_mut(block_size)
            .enumerate()
            .for_each(|(block, chunk)| {
                for (lane, slot) in chunk.iter_mut().enumerate() {
                    let global = block * block_size + lane;
                    let sum = kernels::event_sum_lane(global, grid_stride, table, weights, rates);
                    *slot = if sum.is_nan() { 0.0 } else { sum };
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostBackend;
    use approx::assert_relative_eq;

    fn table() -> LookupTable {
        LookupTable::from_event_rows(2, &[&[1.0, f32::NAN], &[0.5, 0.5], &[2.0, 1.0]]).unwrap()
    }

    #[test]
    fn geometry_is_validated() {
        assert!(matches!(
            GridBackend::new(0, 8),
            Err(BackendError::NoBlocks)
        ));
        assert!(matches!(
            GridBackend::new(2, 6),
            Err(BackendError::BlockSizeNotPowerOfTwo(6))
        ));
        assert!(GridBackend::new(2, 1).is_ok());
    }

    #[test]
    fn grid_matches_host_within_tolerance() {
        let table = table();
        let weights = [1, 1, 1];
        let rates = [3.0, 1.0];

        let mut host = HostBackend::new(5).unwrap();
        let mut host_partials = vec![0.0; host.lanes()];
        host.event_sums(&table, &weights, &rates, &mut host_partials);
        let host_total = host.reduce(&host_partials);

        let mut grid = GridBackend::new(4, 8).unwrap();
        let mut grid_partials = vec![0.0; grid.lanes()];
        grid.event_sums(&table, &weights, &rates, &mut grid_partials);
        let grid_total = grid.reduce(&grid_partials);

        assert_relative_eq!(grid_total, host_total, max_relative = 1e-9);
    }

    #[test]
    fn matched_geometry_is_bitwise_equal_to_host() {
        // One block of width n is the same partition and the same tree as
        // a host backend with n lanes, n a power of two.
        let table = table();
        let weights = [2, 5, 1];
        let rates = [1.25, 0.5];

        let mut host = HostBackend::new(4).unwrap();
        let mut host_partials = vec![0.0; 4];
        host.event_sums(&table, &weights, &rates, &mut host_partials);

        let mut grid = GridBackend::new(1, 4).unwrap();
        let mut grid_partials = vec![0.0; 4];
        grid.event_sums(&table, &weights, &rates, &mut grid_partials);

        for (a, b) in host_partials.iter().zip(&grid_partials) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        assert_eq!(
            host.reduce(&host_partials).to_bits(),
            grid.reduce(&grid_partials).to_bits()
        );
    }

    #[test]
    fn wide_grids_leave_idle_lanes_at_zero() {
        let table = table();
        let mut grid = GridBackend::new(8, 16).unwrap();
        let mut partials = vec![f64::NAN; grid.lanes()];
        grid.event_sums(&table, &[1, 1, 1], &[3.0, 1.0], &mut partials);
        assert!(partials.iter().all(|p| p.is_finite()));
        assert!(partials[3..].iter().filter(|p| **p != 0.0).count() == 0);
    }
}
