//! Drives one synthesis pass and hands finished batches to a consumer.
//!
//! With `prefetch > 0` synthesis runs on a producer thread connected to the
//! consumer by a bounded crossbeam channel, so at most `prefetch` batches wait
//! in memory. With `prefetch == 0` everything runs on the calling thread.
//! Either way the consumer sees the same batches in the same order.

use crate::batch::{BatchAssembler, HostBatch};
use crate::synth::{pass_rng, ExampleSynthesizer, PassStats};
use crossbeam::channel;
use mixverify_core::{Phase, Result, VerifierError};
use std::path::PathBuf;

/// Stream used by the batch shuffler, distinct from the synthesis stream.
const SHUFFLE_STREAM: u64 = 1;

/// Inputs for one pass.
#[derive(Debug, Clone)]
pub struct PassPlan {
    pub files: Vec<PathBuf>,
    pub batch_size: usize,
    pub seed: u64,
    pub epoch: usize,
    pub phase: Phase,
    pub prefetch: usize,
}

/// Result of a completed pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOutcome {
    pub stats: PassStats,
    pub batches: usize,
    /// Examples left in the partial batch at the end of the pass.
    pub dropped: usize,
}

fn assembler_for(plan: &PassPlan) -> BatchAssembler {
    let mut rng = pass_rng(plan.seed, plan.epoch, plan.phase);
    rng.set_stream(SHUFFLE_STREAM);
    BatchAssembler::new(plan.batch_size, rng)
}

/// Synthesize every batch of `plan` and pass each to `consume`.
pub fn drive_pass<F>(synth: &ExampleSynthesizer, plan: &PassPlan, consume: F) -> Result<PassOutcome>
where
    F: FnMut(HostBatch) -> Result<()>,
{
    if plan.prefetch == 0 {
        run_inline(synth, plan, consume)
    } else {
        run_prefetched(synth, plan, consume)
    }
}

fn run_inline<F>(synth: &ExampleSynthesizer, plan: &PassPlan, mut consume: F) -> Result<PassOutcome>
where
    F: FnMut(HostBatch) -> Result<()>,
{
    let mut rng = pass_rng(plan.seed, plan.epoch, plan.phase);
    let mut assembler = assembler_for(plan);
    let mut batches = 0;
    let stats = synth.run(&plan.files, &mut rng, |pair| {
        if let Some(batch) = assembler.push_pair(pair) {
            batches += 1;
            consume(batch)?;
        }
        Ok(())
    })?;
    Ok(PassOutcome {
        stats,
        batches,
        dropped: assembler.discard_remainder(),
    })
}

fn run_prefetched<F>(
    synth: &ExampleSynthesizer,
    plan: &PassPlan,
    mut consume: F,
) -> Result<PassOutcome>
where
    F: FnMut(HostBatch) -> Result<()>,
{
    let (tx, rx) = channel::bounded::<HostBatch>(plan.prefetch);

    let scoped = crossbeam::scope(|scope| {
        let producer = scope.spawn(move |_| -> Result<PassOutcome> {
            let mut rng = pass_rng(plan.seed, plan.epoch, plan.phase);
            let mut assembler = assembler_for(plan);
            let mut batches = 0;
            let stats = synth.run(&plan.files, &mut rng, |pair| {
                if let Some(batch) = assembler.push_pair(pair) {
                    batches += 1;
                    tx.send(batch).map_err(|_| {
                        VerifierError::Pipeline("batch consumer hung up".to_string())
                    })?;
                }
                Ok(())
            })?;
            Ok(PassOutcome {
                stats,
                batches,
                dropped: assembler.discard_remainder(),
            })
        });

        let mut consumed = Ok(());
        for batch in rx.iter() {
            if let Err(e) = consume(batch) {
                consumed = Err(e);
                break;
            }
        }
        // Unblocks a producer waiting on a full channel.
        drop(rx);

        let produced = producer
            .join()
            .map_err(|_| VerifierError::Pipeline("batch producer panicked".to_string()))?;
        consumed?;
        produced
    });

    scoped.map_err(|_| VerifierError::Pipeline("batch producer panicked".to_string()))?
}
