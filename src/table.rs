//! Dense per-event density lookup table.
//!
//! The table holds precomputed density values for every (signal, event)
//! pair, as produced by external PDF evaluators. Several independent
//! evaluators can fill one shared table: each signal occupies a strided
//! region of the storage, exposed here as a checked view instead of raw
//! offset arithmetic into a flat buffer.

use faer::Mat;
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TableError {
    #[error("lookup table needs at least one signal and one event")]
    Empty,
    #[error("expected {expected} values for {what}, got {got}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("signal index {signal} out of range, table has {nsignals} signals")]
    SignalOutOfRange { signal: usize, nsignals: usize },
}

/// Precomputed single-precision density values, one per (signal, event).
///
/// Storage is event-major: the densities of all signals at one event are
/// contiguous, which is what the per-event kernel reads. A density of NaN
/// means "no estimate available" (for instance an empty histogram bin) and
/// is treated as exactly zero by the kernels.
#[derive(Debug, Clone)]
pub struct LookupTable {
    /// `nsignals` rows by `nevents` columns; column j is event j.
    densities: Mat<f32>,
}

impl LookupTable {
    /// Create a zero-filled table for `nsignals` signals and `nevents` events.
    pub fn zeros(nsignals: usize, nevents: usize) -> Result<Self, TableError> {
        if nsignals == 0 || nevents == 0 {
            return Err(TableError::Empty);
        }
        Ok(Self {
            densities: Mat::zeros(nsignals, nevents),
        })
    }

    /// Build a table from event-major rows, one row of `nsignals` densities
    /// per event.
    pub fn from_event_rows(nsignals: usize, rows: &[&[f32]]) -> Result<Self, TableError> {
        let mut table = Self::zeros(nsignals, rows.len())?;
        for (event, row) in rows.iter().enumerate() {
            if row.len() != nsignals {
                return Err(TableError::LengthMismatch {
                    what: "event row",
                    expected: nsignals,
                    got: row.len(),
                });
            }
            table.densities.col_as_slice_mut(event).copy_from_slice(row);
        }
        Ok(table)
    }

    /// Build a table from a flat event-major buffer of length
    /// `nsignals * nevents`.
    pub fn from_event_major(nsignals: usize, values: &[f32]) -> Result<Self, TableError> {
        if nsignals == 0 || values.len() % nsignals != 0 {
            return Err(TableError::LengthMismatch {
                what: "event-major buffer",
                expected: nsignals.max(1),
                got: values.len(),
            });
        }
        let nevents = values.len() / nsignals;
        let mut table = Self::zeros(nsignals, nevents)?;
        for (event, row) in values.chunks_exact(nsignals).enumerate() {
            table.densities.col_as_slice_mut(event).copy_from_slice(row);
        }
        Ok(table)
    }

    pub fn nsignals(&self) -> usize {
        self.densities.nrows()
    }

    pub fn nevents(&self) -> usize {
        self.densities.ncols()
    }

    /// The densities of all signals at one event, contiguous.
    #[inline]
    pub fn event_densities(&self, event: usize) -> &[f32] {
        self.densities.col_as_slice(event)
    }

    /// Overwrite one signal's densities across all events.
    ///
    /// This is the placement contract for external evaluators: signal `j`
    /// owns the strided region with offset `j` and stride `nsignals` of the
    /// conceptual flat buffer, checked here instead of handed out as a raw
    /// pointer.
    pub fn fill_signal(&mut self, signal: usize, values: &[f32]) -> Result<(), TableError> {
        let nsignals = self.nsignals();
        if signal >= nsignals {
            return Err(TableError::SignalOutOfRange { signal, nsignals });
        }
        if values.len() != self.nevents() {
            return Err(TableError::LengthMismatch {
                what: "signal densities",
                expected: self.nevents(),
                got: values.len(),
            });
        }
        for (event, &value) in values.iter().enumerate() {
            self.densities.col_as_slice_mut(event)[signal] = value;
        }
        Ok(())
    }

    /// Iterate over one signal's densities in event order.
    pub fn signal_view(&self, signal: usize) -> Result<impl Iterator<Item = f32> + '_, TableError> {
        let nsignals = self.nsignals();
        if signal >= nsignals {
            return Err(TableError::SignalOutOfRange { signal, nsignals });
        }
        Ok((0..self.nevents()).map(move |event| self.densities.col_as_slice(event)[signal]))
    }
}
