//! The interface a fit problem presents to the chains.

use anyhow::Result;
use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

use crate::table::LookupTable;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("expected {expected} values for {what}, got {got}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("model has {nparams} parameters but {nsignals} signals")]
    FewerParamsThanSignals { nparams: usize, nsignals: usize },
}

/// Per-parameter Gaussian constraint terms.
///
/// A parameter with `sigma > 0` pulls the likelihood by the squared
/// deviation from its mean; any other sigma leaves it unconstrained. The
/// means double as the default starting point of a chain.
#[derive(Debug, Clone)]
pub struct Constraints {
    means: Box<[f64]>,
    sigmas: Box<[f64]>,
}

impl Constraints {
    pub fn new(means: Vec<f64>, sigmas: Vec<f64>) -> Result<Self, ModelError> {
        if means.len() != sigmas.len() {
            return Err(ModelError::LengthMismatch {
                what: "constraint sigmas",
                expected: means.len(),
                got: sigmas.len(),
            });
        }
        Ok(Self {
            means: means.into(),
            sigmas: sigmas.into(),
        })
    }

    /// Constraints that never pull, with the given starting means.
    pub fn unconstrained(means: Vec<f64>) -> Self {
        let sigmas = vec![-1.0; means.len()];
        Self {
            means: means.into(),
            sigmas: sigmas.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    pub fn means(&self) -> &[f64] {
        &self.means
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }
}

/// A fit problem: a density table over observed events plus the parameter
/// layout that interprets a point of the walk.
///
/// The first [`nsignals`](FitModel::nsignals) parameters are signal event
/// rates; the rest are systematics that only enter through constraints
/// and through [`refresh_table`](FitModel::refresh_table). Models are
/// shared by all chains of a fit, so the methods take `&self` and any
/// mutable state belongs in the per-chain table copy.
pub trait FitModel {
    fn nsignals(&self) -> usize;

    fn nparams(&self) -> usize;

    fn nevents(&self) -> usize;

    /// Build one chain's private copy of the lookup table.
    fn build_table(&self) -> Result<LookupTable>;

    /// Per-event multiplicities, index-aligned with the table's events.
    fn weights(&self) -> &[i32];

    fn constraints(&self) -> &Constraints;

    /// Proposal step widths, one per parameter.
    fn proposal_widths(&self) -> &[f64];

    /// Choose a starting point for one chain.
    fn init_position<R: Rng + ?Sized>(&self, rng: &mut R, position: &mut [f64]) -> Result<()>;

    /// Recompute table entries that depend on the non-rate parameters.
    ///
    /// Called before every evaluation with the point about to be scored.
    /// Models whose densities do not move with the systematics keep the
    /// default no-op.
    fn refresh_table(&self, _params: &[f64], _table: &mut LookupTable) -> Result<()> {
        Ok(())
    }
}

impl<M: FitModel + ?Sized> FitModel for &M {
    fn nsignals(&self) -> usize {
        (**self).nsignals()
    }

    fn nparams(&self) -> usize {
        (**self).nparams()
    }

    fn nevents(&self) -> usize {
        (**self).nevents()
    }

    fn build_table(&self) -> Result<LookupTable> {
        (**self).build_table()
    }

    fn weights(&self) -> &[i32] {
        (**self).weights()
    }

    fn constraints(&self) -> &Constraints {
        (**self).constraints()
    }

    fn proposal_widths(&self) -> &[f64] {
        (**self).proposal_widths()
    }

    fn init_position<R: Rng + ?Sized>(&self, rng: &mut R, position: &mut [f64]) -> Result<()> {
        (**self).init_position(rng, position)
    }

    fn refresh_table(&self, params: &[f64], table: &mut LookupTable) -> Result<()> {
        (**self).refresh_table(params, table)
    }
}

/// A model over a fixed, precomputed density table.
///
/// This covers the common case where all PDF shapes were evaluated up
/// front and only the rates float. Chains start at the constraint means,
/// optionally smeared by a Gaussian jitter.
#[derive(Debug, Clone)]
pub struct TableModel {
    table: LookupTable,
    weights: Box<[i32]>,
    constraints: Constraints,
    widths: Box<[f64]>,
    start: Box<[f64]>,
    jitter: f64,
}

impl TableModel {
    pub fn new(
        table: LookupTable,
        weights: Vec<i32>,
        constraints: Constraints,
        widths: Vec<f64>,
    ) -> Result<Self, ModelError> {
        if weights.len() != table.nevents() {
            return Err(ModelError::LengthMismatch {
                what: "event weights",
                expected: table.nevents(),
                got: weights.len(),
            });
        }
        let nparams = constraints.len();
        if nparams < table.nsignals() {
            return Err(ModelError::FewerParamsThanSignals {
                nparams,
                nsignals: table.nsignals(),
            });
        }
        if widths.len() != nparams {
            return Err(ModelError::LengthMismatch {
                what: "proposal widths",
                expected: nparams,
                got: widths.len(),
            });
        }
        let start = constraints.means().into();
        Ok(Self {
            table,
            weights: weights.into(),
            constraints,
            widths: widths.into(),
            start,
            jitter: 0.0,
        })
    }

    /// Replace the default starting point.
    pub fn with_start(mut self, start: Vec<f64>) -> Result<Self, ModelError> {
        if start.len() != self.constraints.len() {
            return Err(ModelError::LengthMismatch {
                what: "starting point",
                expected: self.constraints.len(),
                got: start.len(),
            });
        }
        self.start = start.into();
        Ok(self)
    }

    /// Smear each chain's starting point by a Gaussian of this width.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }
}

impl FitModel for TableModel {
    fn nsignals(&self) -> usize {
        self.table.nsignals()
    }

    fn nparams(&self) -> usize {
        self.constraints.len()
    }

    fn nevents(&self) -> usize {
        self.table.nevents()
    }

    fn build_table(&self) -> Result<LookupTable> {
        Ok(self.table.clone())
    }

    fn weights(&self) -> &[i32] {
        &self.weights
    }

    fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    fn proposal_widths(&self) -> &[f64] {
        &self.widths
    }

    fn init_position<R: Rng + ?Sized>(&self, rng: &mut R, position: &mut [f64]) -> Result<()> {
        if position.len() != self.start.len() {
            anyhow::bail!(
                "position buffer has length {}, model has {} parameters",
                position.len(),
                self.start.len()
            );
        }
        position.copy_from_slice(&self.start);
        if self.jitter > 0.0 {
            for value in position.iter_mut() {
                let step: f64 = rng.sample(StandardNormal);
                *value += self.jitter * step;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn model() -> TableModel {
        let table =
            LookupTable::from_event_rows(2, &[&[1.0, 0.2], &[0.5, 0.5], &[2.0, 1.0]]).unwrap();
        TableModel::new(
            table,
            vec![1, 1, 1],
            Constraints::new(vec![3.0, 1.0, 0.0], vec![-1.0, -1.0, 1.0]).unwrap(),
            vec![0.5, 0.5, 0.1],
        )
        .unwrap()
    }

    #[test]
    fn constraint_lengths_must_agree() {
        assert!(matches!(
            Constraints::new(vec![0.0, 1.0], vec![1.0]),
            Err(ModelError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn layout_is_validated() {
        let table = LookupTable::zeros(3, 4).unwrap();
        let err = TableModel::new(
            table.clone(),
            vec![1; 4],
            Constraints::unconstrained(vec![0.0, 0.0]),
            vec![1.0, 1.0],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ModelError::FewerParamsThanSignals {
                nparams: 2,
                nsignals: 3
            }
        ));

        let err = TableModel::new(
            table,
            vec![1; 3],
            Constraints::unconstrained(vec![0.0; 3]),
            vec![1.0; 3],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ModelError::LengthMismatch {
                expected: 4,
                got: 3,
                ..
            }
        ));
    }

    #[test]
    fn default_start_is_the_constraint_means() {
        let model = model();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut position = vec![0.0; 3];
        model.init_position(&mut rng, &mut position).unwrap();
        assert_eq!(position, vec![3.0, 1.0, 0.0]);
    }

    #[test]
    fn jitter_moves_the_start() {
        let model = model().with_jitter(0.1);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut position = vec![0.0; 3];
        model.init_position(&mut rng, &mut position).unwrap();
        assert_ne!(position, vec![3.0, 1.0, 0.0]);
        assert!((position[0] - 3.0).abs() < 2.0);
    }

    #[test]
    fn shared_reference_is_a_model_too() {
        let model = model();
        let by_ref = &model;
        assert_eq!(by_ref.nsignals(), 2);
        assert_eq!(by_ref.nparams(), 3);
        assert_eq!(by_ref.weights(), &[1, 1, 1]);
    }
}
