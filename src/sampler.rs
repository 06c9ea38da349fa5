//! Running an ensemble of chains on a thread pool.

use anyhow::{bail, Context, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{ScopeFifo, ThreadPoolBuilder};
use std::{
    sync::{
        mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread::{spawn, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    backend::Backend,
    chain::{ChainOptions, MetropolisChain, StepOutcome},
    grid::GridBackend,
    host::HostBackend,
    kernels::SENTINEL_NLL,
    model::FitModel,
    trace::{ChainOutput, Trace},
};

/// Which backend every chain of the fit runs on.
#[derive(Debug, Clone, Copy)]
pub enum BackendConfig {
    /// Strided lanes on the worker pool.
    Host { lanes: usize },
    /// An emulated launch grid of `blocks` blocks with `block_size`
    /// lanes each; `block_size` must be a power of two.
    Grid { blocks: usize, block_size: usize },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Host { lanes: 64 }
    }
}

/// Settings for a Metropolis ensemble fit.
#[derive(Debug, Clone, Copy)]
pub struct MetropolisSettings {
    /// Steps each chain records, including any burn-in.
    pub num_steps: u64,
    pub num_chains: usize,
    /// Base seed shared by all chains; the chain index picks the streams.
    pub seed: u64,
    /// Skip the acceptance comparison and take every proposal.
    pub accept_all: bool,
    pub backend: BackendConfig,
}

impl Default for MetropolisSettings {
    fn default() -> Self {
        Self {
            num_steps: 1000,
            num_chains: 4,
            seed: 0,
            accept_all: false,
            backend: BackendConfig::default(),
        }
    }
}

/// Live statistics of one chain, as shown to progress callbacks.
#[derive(Debug, Clone)]
pub struct ChainProgress {
    pub finished_steps: u64,
    pub total_steps: u64,
    pub accepted: u64,
    pub started: bool,
    /// Likelihood of the state the chain sat at after its latest step.
    pub latest_nll: f64,
    pub runtime: Duration,
}

impl ChainProgress {
    fn new(total: u64) -> Self {
        Self {
            finished_steps: 0,
            total_steps: total,
            accepted: 0,
            started: false,
            latest_nll: f64::NAN,
            runtime: Duration::ZERO,
        }
    }

    fn update(&mut self, outcome: &StepOutcome, step_duration: Duration) {
        self.finished_steps += 1;
        self.accepted += u64::from(outcome.accepted);
        self.latest_nll = outcome.nll;
        self.runtime += step_duration;
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.finished_steps == 0 {
            return 0.0;
        }
        self.accepted as f64 / self.finished_steps as f64
    }
}

pub struct ProgressCallback {
    pub callback: Box<dyn FnMut(Duration, Box<[ChainProgress]>) + Send>,
    pub rate: Duration,
}

fn run_chain<M: FitModel, B: Backend>(
    model: &M,
    backend: B,
    settings: MetropolisSettings,
    chain_id: u64,
    progress: &Mutex<ChainProgress>,
    stop_marker: &Receiver<()>,
) -> Result<ChainOutput> {
    let mut chain = MetropolisChain::new(
        model,
        backend,
        ChainOptions {
            seed: settings.seed,
            chain: chain_id,
            accept_all: settings.accept_all,
        },
    )
    .context("Failed to set up the chain")?;

    // The init draws come from a stream of their own so that retries
    // cannot shift the proposal or decider streams.
    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
    rng.set_stream((chain_id << 32) | u64::from(u32::MAX));

    progress.lock().expect("Poisoned mutex").started = true;

    let mut position = vec![0f64; chain.nparams()];
    // TODO make the number of init retries configurable
    let mut placed = false;
    let mut last_error: Option<anyhow::Error> = None;
    for _ in 0..500 {
        model
            .init_position(&mut rng, &mut position)
            .context("Failed to generate a new initial position")?;
        match chain.set_position(&position) {
            Ok(()) if chain.nll() < SENTINEL_NLL => {
                placed = true;
                break;
            }
            Ok(()) => {
                last_error = None;
            }
            Err(err) => {
                last_error = Some(err.into());
            }
        }
    }
    if !placed {
        let error = last_error
            .unwrap_or_else(|| anyhow::anyhow!("Likelihood was invalid at every starting point"));
        return Err(error.context("All initialization points failed"));
    }

    for _ in 0..settings.num_steps {
        match stop_marker.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        let now = Instant::now();
        let outcome = chain.step()?;
        progress
            .lock()
            .expect("Poisoned mutex")
            .update(&outcome, now.elapsed());
    }

    Ok(chain.into_output())
}

struct ChainProcess {
    stop_marker: Sender<()>,
    progress: Arc<Mutex<ChainProgress>>,
}

impl ChainProcess {
    fn progress(&self) -> ChainProgress {
        self.progress.lock().expect("Poisoned lock").clone()
    }

    fn stop(&self) {
        // Fails when the chain already finished, which is fine.
        let _ = self.stop_marker.send(());
    }

    fn start<'model, 'scope, M>(
        model: &'model M,
        chain_id: u64,
        settings: MetropolisSettings,
        scope: &ScopeFifo<'scope>,
        results: Sender<Result<()>>,
        outputs: Sender<ChainOutput>,
    ) -> Self
    where
        M: FitModel + Sync,
        'model: 'scope,
    {
        let (stop_marker_tx, stop_marker_rx) = channel();
        let progress = Arc::new(Mutex::new(ChainProgress::new(settings.num_steps)));
        let progress_inner = progress.clone();

        scope.spawn_fifo(move |_| {
            let progress = progress_inner;
            let mut sample = move || match settings.backend {
                BackendConfig::Host { lanes } => {
                    let backend =
                        HostBackend::new(lanes).context("Failed to configure the host backend")?;
                    run_chain(
                        model,
                        backend,
                        settings,
                        chain_id,
                        &progress,
                        &stop_marker_rx,
                    )
                }
                BackendConfig::Grid { blocks, block_size } => {
                    let backend = GridBackend::new(blocks, block_size)
                        .context("Failed to configure the grid backend")?;
                    run_chain(
                        model,
                        backend,
                        settings,
                        chain_id,
                        &progress,
                        &stop_marker_rx,
                    )
                }
            };

            let result = match sample() {
                Ok(output) => {
                    // The controller may already be gone on abort.
                    let _ = outputs.send(output);
                    Ok(())
                }
                Err(err) => Err(err),
            };
            let _ = results.send(result);
        });

        Self {
            stop_marker: stop_marker_tx,
            progress,
        }
    }
}

pub enum SamplerWaitResult {
    Trace(Trace),
    Timeout(Sampler),
    Err(anyhow::Error, Option<Trace>),
}

/// A running ensemble fit.
///
/// Dropping the sampler, or calling [`abort`](Sampler::abort), stops the
/// chains at their next step; rows recorded up to that point are kept.
pub struct Sampler {
    main_thread: JoinHandle<Result<Trace>>,
    stop_marker: Sender<()>,
    results: Receiver<Result<()>>,
}

impl Sampler {
    pub fn new<M>(
        model: M,
        settings: MetropolisSettings,
        num_cores: usize,
        callback: Option<ProgressCallback>,
    ) -> Result<Self>
    where
        M: FitModel + Send + Sync + 'static,
    {
        if settings.num_chains == 0 {
            bail!("Ensemble needs at least one chain");
        }
        if num_cores == 0 {
            bail!("Ensemble needs at least one worker core");
        }
        // Validate the geometry up front instead of once per chain.
        match settings.backend {
            BackendConfig::Host { lanes } => {
                HostBackend::new(lanes)?;
            }
            BackendConfig::Grid { blocks, block_size } => {
                GridBackend::new(blocks, block_size)?;
            }
        }

        let (stop_tx, stop_rx) = channel::<()>();
        let (results_tx, results_rx) = channel();

        let main_thread = spawn(move || {
            let pool = ThreadPoolBuilder::new()
                // One extra thread because the controller occupies one.
                .num_threads(num_cores + 1)
                .thread_name(|i| format!("sigex-worker-{}", i))
                .build()
                .context("Could not start thread pool")?;

            let model_ref = &model;
            let mut callback = callback;

            pool.scope_fifo(move |scope| {
                let results = results_tx;
                let (outputs_tx, outputs_rx) = channel();

                let chains: Vec<ChainProcess> = (0..settings.num_chains)
                    .map(|chain_id| {
                        ChainProcess::start(
                            model_ref,
                            chain_id as u64,
                            settings,
                            scope,
                            results.clone(),
                            outputs_tx.clone(),
                        )
                    })
                    .collect();
                drop(results);
                drop(outputs_tx);

                let start_time = Instant::now();
                let tick = callback
                    .as_ref()
                    .map(|cb| cb.rate)
                    .unwrap_or(Duration::from_millis(100));

                let snapshot = |chains: &[ChainProcess]| -> Box<[ChainProgress]> {
                    chains.iter().map(|chain| chain.progress()).collect()
                };

                if let Some(ProgressCallback { callback, .. }) = &mut callback {
                    callback(start_time.elapsed(), snapshot(&chains));
                }
                let mut last_progress = Instant::now();

                let mut outputs = Vec::with_capacity(settings.num_chains);
                loop {
                    if matches!(stop_rx.try_recv(), Err(TryRecvError::Disconnected)) {
                        break;
                    }
                    match outputs_rx.recv_timeout(tick) {
                        Ok(output) => outputs.push(output),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if let Some(ProgressCallback { callback, rate }) = &mut callback {
                        if last_progress.elapsed() >= *rate {
                            callback(start_time.elapsed(), snapshot(&chains));
                            last_progress = Instant::now();
                        }
                    }
                }

                // Stop any chains that still run and wait for their rows.
                chains.iter().for_each(|chain| chain.stop());
                let progress_handles: Vec<_> =
                    chains.iter().map(|chain| chain.progress.clone()).collect();
                drop(chains);
                while let Ok(output) = outputs_rx.recv() {
                    outputs.push(output);
                }

                if let Some(ProgressCallback { callback, .. }) = &mut callback {
                    let progress: Box<[ChainProgress]> = progress_handles
                        .iter()
                        .map(|progress| progress.lock().expect("Poisoned lock").clone())
                        .collect();
                    callback(start_time.elapsed(), progress);
                }

                Ok(Trace::from(outputs))
            })
        });

        Ok(Self {
            main_thread,
            stop_marker: stop_tx,
            results: results_rx,
        })
    }

    /// Stop all chains at their next step and collect what they recorded.
    pub fn abort(self) -> (Result<()>, Option<Trace>) {
        drop(self.stop_marker);
        match self.main_thread.join() {
            Err(payload) => std::panic::resume_unwind(payload),
            Ok(Ok(trace)) => (Ok(()), Some(trace)),
            Ok(Err(err)) => (Err(err), None),
        }
    }

    /// Block until the fit finishes, a chain fails, or the timeout runs out.
    pub fn wait_timeout(self, timeout: Duration) -> SamplerWaitResult {
        let start = Instant::now();
        let mut remaining = Some(timeout);
        while let Some(wait) = remaining {
            match self.results.recv_timeout(wait) {
                Ok(Ok(())) => {
                    remaining = timeout.checked_sub(start.elapsed());
                }
                Ok(Err(err)) => return SamplerWaitResult::Err(err, None),
                Err(RecvTimeoutError::Disconnected) => {
                    let (result, trace) = self.abort();
                    if let Err(err) = result {
                        return SamplerWaitResult::Err(err, trace);
                    }
                    return SamplerWaitResult::Trace(trace.expect("No chains available"));
                }
                Err(RecvTimeoutError::Timeout) => break,
            }
        }
        SamplerWaitResult::Timeout(self)
    }
}

/// Run a whole ensemble to completion and return the combined trace.
pub fn sample_ensemble<M>(model: M, settings: MetropolisSettings, num_cores: usize) -> Result<Trace>
where
    M: FitModel + Send + Sync + 'static,
{
    let mut sampler = Sampler::new(model, settings, num_cores, None)?;
    loop {
        match sampler.wait_timeout(Duration::from_secs(3600)) {
            SamplerWaitResult::Trace(trace) => return Ok(trace),
            SamplerWaitResult::Timeout(inner) => sampler = inner,
            SamplerWaitResult::Err(err, _) => return Err(err),
        }
    }
}
