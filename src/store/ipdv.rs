//! Inter-packet delay variation.

use std::collections::HashMap;

use crate::latency::{Circuit, EpochKey, LatencySample};

use super::backend::{LatencyRow, PreviousRtt};

/// Sorts a batch into `(circuit, epoch, sample_index)` order.
pub fn sort_samples<S: LatencySample>(samples: &mut [S]) {
    samples.sort_by(|a, b| {
        a.circuit_parts()
            .cmp(&b.circuit_parts())
            .then_with(|| a.epoch().cmp(&b.epoch()))
            .then_with(|| a.sample_index().cmp(&b.sample_index()))
    });
}

/// First `(epoch, sample_index)` of every circuit + epoch run in a sorted
/// batch, in batch order. These bound the previous-RTT lookup so a batch
/// never seeds from its own rows.
pub fn run_starts<S: LatencySample>(sorted: &[S]) -> Vec<(S::Circuit, u64, u32)> {
    let mut starts: Vec<(S::Circuit, u64, u32)> = Vec::new();
    for sample in sorted {
        let same_run = starts.last().is_some_and(|(c, e, _)| {
            *e == sample.epoch() && c.parts() == sample.circuit_parts()
        });
        if !same_run {
            starts.push((sample.circuit(), sample.epoch(), sample.sample_index()));
        }
    }
    starts
}

/// Derives IPDV for a batch already in [`sort_samples`] order.
///
/// `seeds` holds, per circuit + epoch run, the last non-zero RTT stored
/// before the run's first sample. Entering a run, the seed replaces the
/// running previous value when it sits later in the stream, so rows
/// already stored between two runs of the batch are taken into account.
/// A zero RTT is a loss: it gets no IPDV and does not move the running
/// previous value.
pub fn compute_ipdv<S: LatencySample>(
    sorted: Vec<S>,
    mut seeds: HashMap<EpochKey<S::Circuit>, PreviousRtt>,
) -> Vec<LatencyRow<S>> {
    let mut rows = Vec::with_capacity(sorted.len());
    let mut run: Option<(S::Circuit, u64)> = None;
    let mut previous: Option<PreviousRtt> = None;

    for sample in sorted {
        let epoch = sample.epoch();
        let same_circuit = run
            .as_ref()
            .is_some_and(|(c, _)| c.parts() == sample.circuit_parts());

        if !same_circuit {
            previous = None;
        }
        if !same_circuit || run.as_ref().is_some_and(|(_, e)| *e != epoch) {
            let circuit = sample.circuit();
            let seed = seeds.remove(&EpochKey::new(circuit.clone(), epoch));
            if let Some(seed) = seed {
                if !previous.is_some_and(|p| p.position() >= seed.position()) {
                    previous = Some(seed);
                }
            }
            run = Some((circuit, epoch));
        }

        let rtt = sample.rtt_us();
        let ipdv_us = if rtt > 0 {
            let ipdv = previous.map(|p| rtt.abs_diff(p.rtt_us));
            previous = Some(PreviousRtt {
                epoch,
                sample_index: sample.sample_index(),
                rtt_us: rtt,
            });
            ipdv
        } else {
            None
        };

        rows.push(LatencyRow { sample, ipdv_us });
    }

    rows
}
