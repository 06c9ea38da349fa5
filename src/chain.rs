//! A single Metropolis random-walk chain.

use thiserror::Error;

use crate::backend::{Backend, RngPool};
use crate::kernels;
use crate::model::FitModel;
use crate::table::LookupTable;
use crate::trace::{ChainOutput, JumpBuffer};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("model failed: {0}")]
    Model(anyhow::Error),
    #[error("expected {expected} values for {what}, got {got}")]
    Shape {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("model has no parameters")]
    NoParameters,
    #[error("model has {nsignals} signals but only {nparams} parameters")]
    SignalsExceedParams { nsignals: usize, nparams: usize },
    #[error("chain has no position yet, call set_position first")]
    NotInitialized,
}

/// Chain-level knobs that are not part of the model.
#[derive(Debug, Clone, Copy)]
pub struct ChainOptions {
    /// Shared base seed of the fit.
    pub seed: u64,
    /// Index of this chain within the ensemble; selects the stream family.
    pub chain: u64,
    /// Accept every proposal, turning the sampler into a plain random
    /// walk for step-size diagnostics.
    pub accept_all: bool,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            chain: 0,
            accept_all: false,
        }
    }
}

/// What one step did.
#[derive(Debug, Clone, Copy)]
pub struct StepOutcome {
    /// Whether the proposal was taken.
    pub accepted: bool,
    /// The likelihood of the state the chain now sits at.
    pub nll: f64,
}

/// Metropolis random-walk sampler over one model and one backend.
///
/// A step scores the pending proposal through the backend's likelihood
/// pipeline, runs the acceptance test on the lead stream, records the
/// resulting state in the jump buffer and immediately draws the next
/// proposal. Proposals and the acceptance draw never depend on the event
/// partition, so two chains with the same seed and chain index take
/// bitwise identical decisions whenever their backends agree on the lane
/// partition and reduction width, and decisions stay equal in
/// distribution across any other geometry.
pub struct MetropolisChain<M, B>
where
    M: FitModel,
    B: Backend,
{
    model: M,
    backend: B,
    table: LookupTable,
    weights: Box<[i32]>,
    means: Box<[f64]>,
    sigmas: Box<[f64]>,
    widths: Box<[f64]>,
    nsignals: usize,
    rngs: RngPool,
    current: Box<[f64]>,
    proposed: Box<[f64]>,
    partials: Box<[f64]>,
    nll_current: f64,
    jumps: JumpBuffer,
    chain: u64,
    accepted: u64,
    steps: u64,
    accept_all: bool,
    initialized: bool,
}

impl<M, B> MetropolisChain<M, B>
where
    M: FitModel,
    B: Backend,
{
    pub fn new(model: M, backend: B, options: ChainOptions) -> Result<Self, ChainError> {
        let nparams = model.nparams();
        let nsignals = model.nsignals();
        if nparams == 0 {
            return Err(ChainError::NoParameters);
        }
        if nsignals == 0 || nsignals > nparams {
            return Err(ChainError::SignalsExceedParams { nsignals, nparams });
        }

        let table = model.build_table().map_err(ChainError::Model)?;
        if table.nsignals() != nsignals {
            return Err(ChainError::Shape {
                what: "table signals",
                expected: nsignals,
                got: table.nsignals(),
            });
        }
        if table.nevents() != model.nevents() {
            return Err(ChainError::Shape {
                what: "table events",
                expected: model.nevents(),
                got: table.nevents(),
            });
        }

        let weights: Box<[i32]> = model.weights().into();
        if weights.len() != table.nevents() {
            return Err(ChainError::Shape {
                what: "event weights",
                expected: table.nevents(),
                got: weights.len(),
            });
        }
        let constraints = model.constraints();
        if constraints.len() != nparams {
            return Err(ChainError::Shape {
                what: "constraints",
                expected: nparams,
                got: constraints.len(),
            });
        }
        let widths: Box<[f64]> = model.proposal_widths().into();
        if widths.len() != nparams {
            return Err(ChainError::Shape {
                what: "proposal widths",
                expected: nparams,
                got: widths.len(),
            });
        }

        let means: Box<[f64]> = constraints.means().into();
        let sigmas: Box<[f64]> = constraints.sigmas().into();
        let rngs = RngPool::new(options.seed, options.chain, nparams);
        let partials = vec![0.0; backend.lanes()].into_boxed_slice();

        Ok(Self {
            model,
            backend,
            table,
            weights,
            means,
            sigmas,
            widths,
            nsignals,
            rngs,
            current: vec![0.0; nparams].into(),
            proposed: vec![0.0; nparams].into(),
            partials,
            nll_current: kernels::SENTINEL_NLL,
            jumps: JumpBuffer::new(nparams),
            chain: options.chain,
            accepted: 0,
            steps: 0,
            accept_all: options.accept_all,
            initialized: false,
        })
    }

    /// Score an arbitrary point through this chain's backend.
    ///
    /// Refreshes the table for the point first, like a step would.
    pub fn evaluate(&mut self, params: &[f64]) -> Result<f64, ChainError> {
        if params.len() != self.current.len() {
            return Err(ChainError::Shape {
                what: "parameters",
                expected: self.current.len(),
                got: params.len(),
            });
        }
        self.model
            .refresh_table(params, &mut self.table)
            .map_err(ChainError::Model)?;
        self.backend.event_sums(
            &self.table,
            &self.weights,
            &params[..self.nsignals],
            &mut self.partials,
        );
        let event_term = self.backend.reduce(&self.partials);
        Ok(kernels::total_nll(
            event_term,
            params,
            self.nsignals,
            &self.means,
            &self.sigmas,
        ))
    }

    /// Put the chain at a starting point and draw the first proposal.
    pub fn set_position(&mut self, position: &[f64]) -> Result<(), ChainError> {
        self.nll_current = self.evaluate(position)?;
        self.current.copy_from_slice(position);
        self.backend.propose(
            self.rngs.states_mut(),
            &self.widths,
            &self.current,
            &mut self.proposed,
        );
        self.initialized = true;
        Ok(())
    }

    /// Advance by one step: score the pending proposal, decide, record,
    /// and draw the next proposal.
    pub fn step(&mut self) -> Result<StepOutcome, ChainError> {
        if !self.initialized {
            return Err(ChainError::NotInitialized);
        }

        self.model
            .refresh_table(&self.proposed, &mut self.table)
            .map_err(ChainError::Model)?;
        self.backend.event_sums(
            &self.table,
            &self.weights,
            &self.proposed[..self.nsignals],
            &mut self.partials,
        );
        let event_term = self.backend.reduce(&self.partials);
        let nll_proposed = kernels::total_nll(
            event_term,
            &self.proposed,
            self.nsignals,
            &self.means,
            &self.sigmas,
        );

        let accepted = kernels::metropolis_accept(
            self.rngs.lead(),
            self.nll_current,
            nll_proposed,
            self.accept_all,
        );
        if accepted {
            self.current.copy_from_slice(&self.proposed);
            self.nll_current = nll_proposed;
            self.accepted += 1;
        }

        self.jumps.append(&self.current, self.nll_current);
        self.steps += 1;

        self.backend.propose(
            self.rngs.states_mut(),
            &self.widths,
            &self.current,
            &mut self.proposed,
        );

        Ok(StepOutcome {
            accepted,
            nll: self.nll_current,
        })
    }

    pub fn nparams(&self) -> usize {
        self.current.len()
    }

    pub fn nsignals(&self) -> usize {
        self.nsignals
    }

    /// The state the chain currently sits at.
    pub fn position(&self) -> &[f64] {
        &self.current
    }

    pub fn nll(&self) -> f64 {
        self.nll_current
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn jumps(&self) -> &JumpBuffer {
        &self.jumps
    }

    /// Flush the recorded rows, leaving the chain free to keep walking.
    pub fn drain_rows(&mut self) -> Vec<f64> {
        self.jumps.drain_rows()
    }

    /// Finalize the chain into its output record.
    pub fn into_output(self) -> ChainOutput {
        ChainOutput {
            chain_id: self.chain,
            draws: self.jumps.to_arrow(),
            accepted: self.accepted,
            steps: self.steps,
        }
    }
}
