pub(crate) mod backend;
pub(crate) mod chain;
pub(crate) mod grid;
pub(crate) mod host;
pub(crate) mod kernels;
pub(crate) mod model;
pub(crate) mod sampler;
pub(crate) mod table;
pub(crate) mod trace;

pub use backend::{Backend, BackendError, RngPool};
pub use chain::{ChainError, ChainOptions, MetropolisChain, StepOutcome};
pub use grid::GridBackend;
pub use host::HostBackend;
pub use kernels::SENTINEL_NLL;
pub use model::{Constraints, FitModel, ModelError, TableModel};
pub use sampler::{
    sample_ensemble, BackendConfig, ChainProgress, MetropolisSettings, ProgressCallback, Sampler,
    SamplerWaitResult,
};
pub use table::{LookupTable, TableError};
pub use trace::{ChainOutput, JumpBuffer, Trace};
