//! The likelihood and Metropolis kernels shared by all backends.
//!
//! Every backend evaluates the same extended negative log-likelihood
//!
//! ```text
//! nll = -sum_e w_e * ln( sum_j N_j * p_j(x_e) ) + sum_j N_j + constraints
//! ```
//!
//! split into the three stages of the evaluation pipeline: per-event
//! partial sums over a lane partition, a two-phase tree reduction of the
//! partials, and the scalar total with rate and constraint terms. The
//! functions here are deliberately free of any threading so that host and
//! grid backends produce identical arithmetic for identical partitions.

use itertools::izip;
use multiversion::multiversion;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::table::LookupTable;

/// Placeholder likelihood for states outside the support of the fit:
/// a negative signal rate, or an event term that reduced to NaN.
///
/// The value is large enough that the Metropolis test rejects such a
/// state against any finite alternative, yet finite so that comparisons
/// and the acceptance ratio stay well defined.
pub const SENTINEL_NLL: f64 = 1e18;

/// Weighted dot product of signal rates with one event's densities.
///
/// NaN densities mark table entries with no estimate and count as zero.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn weighted_density_dot(rates: &[f64], densities: &[f32]) -> f64 {
    assert_eq!(rates.len(), densities.len());
    izip!(rates, densities)
        .map(|(&rate, &density)| {
            let density = if density.is_nan() { 0.0 } else { f64::from(density) };
            rate * density
        })
        .sum()
}

/// Strided sum of `values[offset], values[offset + stride], ..`.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn strided_sum(values: &[f64], offset: usize, stride: usize) -> f64 {
    values.iter().skip(offset).step_by(stride).sum()
}

/// Partial event sum for one lane of a strided partition.
///
/// Lane `lane` of `nlanes` owns events `lane, lane + nlanes, ..` and
/// accumulates `w_e * ln(sum_j N_j * p_j(x_e))` over them. A lane with no
/// events returns 0. The result is NaN when any owned event produced a
/// NaN log term (for instance a negative mixture sum under a sign-flipped
/// proposal); callers discard such lanes.
pub(crate) fn event_sum_lane(
    lane: usize,
    nlanes: usize,
    table: &LookupTable,
    weights: &[i32],
    rates: &[f64],
) -> f64 {
    debug_assert_eq!(weights.len(), table.nevents());
    let mut sum = 0.0;
    for event in (lane..table.nevents()).step_by(nlanes) {
        let mixture = weighted_density_dot(rates, table.event_densities(event));
        sum += f64::from(weights[event]) * mixture.ln();
    }
    sum
}

/// Reduce a slice of partial sums with the fixed two-phase scheme.
///
/// Phase one folds the partials into `width` accumulators by stride
/// (accumulator `r` takes `partials[r], partials[r + width], ..`), phase
/// two halves the accumulators as a binary tree. `width` must be a power
/// of two; it fixes the association order, so equal widths give bitwise
/// equal totals no matter how the partials were produced.
pub(crate) fn reduce_block(partials: &[f64], width: usize) -> f64 {
    debug_assert!(width.is_power_of_two());
    let mut block: Vec<f64> = (0..width)
        .map(|lane| strided_sum(partials, lane, width))
        .collect();
    let mut half = width / 2;
    while half > 0 {
        for lane in 0..half {
            block[lane] += block[lane + half];
        }
        half /= 2;
    }
    block[0]
}

/// Assemble the total negative log-likelihood from the reduced event term.
///
/// The first `nsignals` parameters are event rates: any negative rate, or
/// a NaN event term, yields [`SENTINEL_NLL`] outright. Otherwise the rates
/// are added for the extended-likelihood normalization and every parameter
/// with a positive constraint width contributes its squared pull.
pub(crate) fn total_nll(
    event_term: f64,
    params: &[f64],
    nsignals: usize,
    means: &[f64],
    sigmas: &[f64],
) -> f64 {
    debug_assert_eq!(params.len(), means.len());
    debug_assert_eq!(params.len(), sigmas.len());
    let mut sum = -event_term;
    if sum.is_nan() {
        return SENTINEL_NLL;
    }
    for (i, (&param, (&mean, &sigma))) in params.iter().zip(izip!(means, sigmas)).enumerate() {
        if i < nsignals {
            if param < 0.0 {
                return SENTINEL_NLL;
            }
            sum += param;
        }
        if sigma > 0.0 {
            let pull = (param - mean) / sigma;
            sum += pull * pull;
        }
    }
    sum
}

/// The Metropolis acceptance test for a proposed state.
///
/// One uniform draw is consumed from `rng` on every call, whether or not
/// the comparison needs it, so the decider stream advances at a fixed
/// rate. The draw is mapped to (0, 1], which keeps a proposal with
/// vanishing acceptance ratio from ever being taken. With `accept_all`
/// the test short-circuits to true (but still draws), which turns the
/// chain into a plain random walk for diagnostics.
pub(crate) fn metropolis_accept<R: Rng + ?Sized>(
    rng: &mut R,
    nll_current: f64,
    nll_proposed: f64,
    accept_all: bool,
) -> bool {
    let u = 1.0 - rng.random::<f64>();
    accept_all || nll_proposed < nll_current || u <= (nll_current - nll_proposed).exp()
}

/// Draw the next proposal as an independent Gaussian step per parameter.
///
/// Parameter `i` consumes exactly one normal variate from `rngs[i]`, so
/// the proposal sequence is a function of the streams alone and does not
/// depend on how the event kernel was partitioned.
pub(crate) fn propose<R: Rng>(
    rngs: &mut [R],
    widths: &[f64],
    current: &[f64],
    proposed: &mut [f64],
) {
    assert_eq!(rngs.len(), current.len());
    assert_eq!(widths.len(), current.len());
    assert_eq!(proposed.len(), current.len());
    izip!(proposed.iter_mut(), current, widths, rngs.iter_mut()).for_each(
        |(out, &value, &width, rng)| {
            let step: f64 = rng.sample(StandardNormal);
            *out = value + width * step;
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn example_table() -> LookupTable {
        LookupTable::from_event_rows(2, &[&[1.0, f32::NAN], &[0.5, 0.5], &[2.0, 1.0]]).unwrap()
    }

    #[test]
    fn dot_treats_nan_as_zero() {
        let result = weighted_density_dot(&[3.0, 1.0], &[1.0, f32::NAN]);
        assert_eq!(result, 3.0);
        assert_eq!(weighted_density_dot(&[], &[]), 0.0);
    }

    #[test]
    fn single_lane_matches_hand_sum() {
        let table = example_table();
        let sum = event_sum_lane(0, 1, &table, &[1, 1, 1], &[3.0, 1.0]);
        let expected = 3.0f64.ln() + 2.0f64.ln() + 7.0f64.ln();
        assert_relative_eq!(sum, expected, max_relative = 1e-15);
    }

    #[test]
    fn lanes_partition_events_disjointly() {
        let table = example_table();
        let weights = [2, 1, 3];
        let rates = [3.0, 1.0];
        let serial = event_sum_lane(0, 1, &table, &weights, &rates);
        for nlanes in [2usize, 3, 4, 8] {
            let split: f64 = (0..nlanes)
                .map(|lane| event_sum_lane(lane, nlanes, &table, &weights, &rates))
                .sum();
            assert_relative_eq!(split, serial, max_relative = 1e-12);
        }
    }

    #[test]
    fn idle_lane_sums_to_zero() {
        let table = example_table();
        assert_eq!(event_sum_lane(5, 8, &table, &[1, 1, 1], &[3.0, 1.0]), 0.0);
    }

    #[test]
    fn negative_mixture_poisons_the_lane() {
        let table = example_table();
        let sum = event_sum_lane(0, 1, &table, &[1, 1, 1], &[-3.0, 1.0]);
        assert!(sum.is_nan());
    }

    #[test]
    fn reduce_width_one_is_a_serial_sum() {
        let partials = [1.5, -2.0, 0.25, 8.0, -1.0];
        assert_eq!(reduce_block(&partials, 1), partials.iter().sum::<f64>());
    }

    #[test]
    fn reduce_ignores_missing_tail() {
        // Fewer partials than accumulators leaves the tail lanes at zero.
        let partials = [1.0, 2.0, 3.0];
        assert_eq!(reduce_block(&partials, 8), 6.0);
    }

    #[test]
    fn equal_widths_reduce_bitwise_equal() {
        let partials: Vec<f64> = (0..23).map(|i| (i as f64).sin() * 1e3).collect();
        let a = reduce_block(&partials, 8);
        let b = reduce_block(&partials, 8);
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn worked_example_total() {
        let table = example_table();
        let params = [3.0, 1.0];
        let event_term = event_sum_lane(0, 1, &table, &[1, 1, 1], &params);
        let nll = total_nll(event_term, &params, 2, &[0.0, 0.0], &[-1.0, -1.0]);
        let expected = -(3.0f64.ln() + 2.0f64.ln() + 7.0f64.ln()) + 4.0;
        assert_relative_eq!(nll, expected, max_relative = 1e-14);
    }

    #[test]
    fn negative_rate_hits_sentinel() {
        let nll = total_nll(1.0, &[-0.5, 2.0], 2, &[0.0, 0.0], &[-1.0, -1.0]);
        assert_eq!(nll, SENTINEL_NLL);
        // A negative value past the rate block is a systematic, not a rate.
        let ok = total_nll(1.0, &[0.5, -2.0], 1, &[0.0, 0.0], &[-1.0, -1.0]);
        assert!(ok < SENTINEL_NLL);
    }

    #[test]
    fn nan_event_term_hits_sentinel() {
        let nll = total_nll(f64::NAN, &[1.0], 1, &[0.0], &[-1.0]);
        assert_eq!(nll, SENTINEL_NLL);
    }

    #[test]
    fn sentinel_is_absolute_not_additive() {
        let constrained = total_nll(f64::NAN, &[4.0], 1, &[0.0], &[0.1]);
        assert_eq!(constrained, SENTINEL_NLL);
    }

    #[test]
    fn constraint_pulls_enter_quadratically() {
        let base = total_nll(0.0, &[2.0, 1.0], 1, &[2.0, 0.0], &[-1.0, -1.0]);
        let pulled = total_nll(0.0, &[2.0, 1.0], 1, &[2.0, 0.0], &[-1.0, 0.5]);
        assert_relative_eq!(pulled - base, 4.0, max_relative = 1e-14);
        // Width zero disables the pull just like a negative width.
        let zeroed = total_nll(0.0, &[2.0, 1.0], 1, &[2.0, 0.0], &[0.0, 0.0]);
        assert_eq!(zeroed, base);
    }

    #[test]
    fn downhill_moves_always_accepted() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..100 {
            assert!(metropolis_accept(&mut rng, 10.0, 9.0, false));
        }
    }

    #[test]
    fn sentinel_proposal_rejected_from_finite_state() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..100 {
            assert!(!metropolis_accept(&mut rng, 10.0, SENTINEL_NLL, false));
        }
    }

    #[test]
    fn accept_all_still_consumes_the_stream() {
        let mut a = ChaCha8Rng::seed_from_u64(3);
        let mut b = ChaCha8Rng::seed_from_u64(3);
        assert!(metropolis_accept(&mut a, 1.0, SENTINEL_NLL, true));
        let _ = metropolis_accept(&mut b, 1.0, 0.0, false);
        assert_eq!(a.random::<u64>(), b.random::<u64>());
    }

    #[test]
    fn proposal_is_per_parameter_stream_indexed() {
        let make = || {
            (0..3u64)
                .map(|stream| {
                    let mut rng = ChaCha8Rng::seed_from_u64(42);
                    rng.set_stream(stream);
                    rng
                })
                .collect::<Vec<_>>()
        };
        let current = [1.0, 2.0, 3.0];
        let widths = [0.5, 0.5, 0.5];
        let mut first = [0.0; 3];
        let mut second = [0.0; 3];
        propose(&mut make(), &widths, &current, &mut first);
        propose(&mut make(), &widths, &current, &mut second);
        assert_eq!(first, second);
        assert!(izip!(&first, &current).all(|(a, b)| a != b));
    }

    proptest! {
        #[test]
        fn dot_matches_scalar_reference(
            pairs in prop::collection::vec((-1e3f64..1e3, prop::num::f32::NORMAL | prop::num::f32::ZERO), 0..40)
        ) {
            let rates: Vec<f64> = pairs.iter().map(|p| p.0).collect();
            let densities: Vec<f32> = pairs.iter().map(|p| p.1).collect();
            let reference: f64 = izip!(&rates, &densities)
                .map(|(&r, &d)| r * f64::from(d))
                .sum();
            let scale: f64 = izip!(&rates, &densities)
                .map(|(&r, &d)| (r * f64::from(d)).abs())
                .sum();
            let result = weighted_density_dot(&rates, &densities);
            prop_assert!((result - reference).abs() <= 1e-12 * scale.max(1.0));
        }

        #[test]
        fn reduce_matches_serial_sum(
            partials in prop::collection::vec(-1e6f64..1e6, 1..200),
            width_pow in 0u32..8,
        ) {
            let width = 1usize << width_pow;
            let serial: f64 = partials.iter().sum();
            let scale: f64 = partials.iter().map(|p| p.abs()).sum();
            let reduced = reduce_block(&partials, width);
            prop_assert!((reduced - serial).abs() <= 1e-12 * scale.max(1.0));
        }

        #[test]
        fn uphill_acceptance_is_monotone_in_the_gap(gap in 0.0f64..50.0) {
            // Replaying the same stream, a smaller uphill gap accepts
            // whenever the larger one did.
            let mut small = ChaCha8Rng::seed_from_u64(99);
            let mut large = ChaCha8Rng::seed_from_u64(99);
            let took_large = metropolis_accept(&mut large, 0.0, gap + 1.0, false);
            let took_small = metropolis_accept(&mut small, 0.0, gap, false);
            prop_assert!(!took_large || took_small);
        }
    }
}
