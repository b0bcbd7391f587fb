//! Training loop: epochs of TRAIN and VALIDATE, TEST after the last epoch,
//! a checkpoint at the end of every epoch.

use crate::audio::{list_corpus, ClipReader};
use crate::batch::Minibatch;
use crate::checkpoint::{checkpoint_path, load_checkpoint, save_checkpoint};
use crate::device::device_label;
use crate::loader::{drive_pass, PassPlan};
use crate::metrics::{progress_line, BatchMetrics, PhaseTally, RunLogs, ScalarRecord};
use crate::model::{correct_predictions, NetworkConfig, VerificationNetwork};
use crate::phase::RunState;
use crate::synth::{ExampleSynthesizer, PassStats};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Optimizer, VarBuilder, VarMap, SGD};
use mixverify_core::{Phase, Result, TrainConfig, VerifierError};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Totals for one phase of one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub batches: usize,
    pub rows: usize,
    pub correct: usize,
    pub mean_loss: f64,
    pub accuracy_pct: f64,
    pub stats: PassStats,
    /// Examples discarded in the final partial batch.
    pub dropped: usize,
}

/// Everything one epoch produced.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub phases: Vec<PhaseSummary>,
    pub checkpoint: PathBuf,
}

impl EpochSummary {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseSummary> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

/// Network plus optimizer; the only place parameters change.
struct Engine {
    network: VerificationNetwork,
    optimizer: SGD,
}

impl Engine {
    fn step(&mut self, batch: &Minibatch, phase: Phase) -> Result<BatchMetrics> {
        let logits = self.network.forward(&batch.a, &batch.b, phase)?;
        let loss = self.network.loss(&logits, &batch.labels)?;
        if phase.is_training() {
            self.optimizer.backward_step(&loss)?;
        }
        Ok(BatchMetrics {
            loss: f64::from(loss.to_scalar::<f32>()?),
            correct: correct_predictions(&logits, &batch.labels)?,
            rows: batch.rows(),
        })
    }
}

/// Owns the network, its parameters and the run logs for one training run.
pub struct Trainer<'a> {
    config: &'a TrainConfig,
    device: Device,
    varmap: VarMap,
    engine: Engine,
    synth: ExampleSynthesizer,
    logs: RunLogs,
}

impl<'a> Trainer<'a> {
    pub fn new(
        config: &'a TrainConfig,
        network_config: NetworkConfig,
        reader: Arc<dyn ClipReader>,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let synth = ExampleSynthesizer::from_config(reader, config);
        let image_size = synth.geometry().image_size();
        if network_config.input_size != image_size {
            return Err(VerifierError::Config(format!(
                "network expects {:?} inputs, extractor yields {:?}",
                network_config.input_size, image_size
            )));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let network = VerificationNetwork::new(network_config, vb)?;
        let optimizer = SGD::new(varmap.all_vars(), config.learning_rate)?;
        let logs = RunLogs::open(config)?;

        tracing::info!(
            run = %config.run_name(),
            device = device_label(&device),
            parameters = varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            "Trainer ready"
        );

        Ok(Self {
            config,
            device,
            varmap,
            engine: Engine { network, optimizer },
            synth,
            logs,
        })
    }

    /// Load a checkpoint over the freshly initialized parameters.
    pub fn resume(&mut self, path: &Path) -> Result<()> {
        load_checkpoint(&mut self.varmap, path)
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn network(&self) -> &VerificationNetwork {
        &self.engine.network
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Logits for `batch` without touching parameters.
    pub fn predict(&self, batch: &Minibatch) -> Result<Tensor> {
        self.engine.network.forward(&batch.a, &batch.b, Phase::Validate)
    }

    /// One optimizer step (TRAIN) or evaluation (otherwise) on a prepared batch.
    pub fn step(&mut self, batch: &Minibatch, phase: Phase) -> Result<BatchMetrics> {
        self.engine.step(batch, phase)
    }

    /// Run every epoch and return their summaries.
    pub fn run(&mut self) -> Result<Vec<EpochSummary>> {
        let num_epochs = self.config.num_epochs;
        let mut summaries = Vec::with_capacity(num_epochs);
        let mut phases = Vec::new();
        let mut state = RunState::initial(num_epochs);

        while state != RunState::Done {
            match state {
                RunState::EpochStart(epoch) => {
                    tracing::info!(epoch, "Epoch started");
                    phases.clear();
                }
                RunState::Train(epoch) | RunState::Validate(epoch) | RunState::Test(epoch) => {
                    if let Some(phase) = state.phase() {
                        phases.push(self.run_phase(epoch, phase)?);
                    }
                }
                RunState::EpochEnd(epoch) => {
                    let checkpoint = checkpoint_path(&self.config.checkpoint_dir(), epoch);
                    save_checkpoint(&self.varmap, &checkpoint)?;
                    let summary = EpochSummary {
                        epoch,
                        phases: std::mem::take(&mut phases),
                        checkpoint,
                    };
                    log_epoch(&summary);
                    summaries.push(summary);
                }
                RunState::Done => {}
            }
            state = state.next(num_epochs);
        }

        self.logs.flush()?;
        Ok(summaries)
    }

    fn run_phase(&mut self, epoch: usize, phase: Phase) -> Result<PhaseSummary> {
        let dir = self.config.corpus_dir(phase);
        let files = list_corpus(dir)?;
        if files.is_empty() {
            tracing::warn!(%phase, dir = %dir.display(), "Corpus directory has no audio files");
        }
        tracing::info!(epoch, %phase, files = files.len(), "Phase started");

        let plan = PassPlan {
            files,
            batch_size: self.config.batch_size,
            seed: self.config.seed,
            epoch,
            phase,
            prefetch: self.config.prefetch_batches,
        };
        let log_every = self.config.log_every;
        let device = &self.device;
        let engine = &mut self.engine;
        let logs = &mut self.logs;
        let mut tally = PhaseTally::default();

        let outcome = drive_pass(&self.synth, &plan, |host| {
            let batch = host.to_device(device)?;
            let metrics = engine.step(&batch, phase)?;
            tally.record(&metrics);
            logs.write_scalar(&ScalarRecord {
                phase,
                epoch,
                step: tally.batches,
                loss: metrics.loss,
                accuracy: metrics.accuracy_pct(),
            })?;
            if tally.batches % log_every == 0 {
                let line = progress_line(epoch, phase, &metrics, &tally);
                tracing::info!("{line}");
                logs.write_progress(&line)?;
            }
            Ok(())
        })?;
        self.logs.flush()?;

        if outcome.dropped > 0 {
            tracing::debug!(epoch, %phase, dropped = outcome.dropped, "Partial batch discarded");
        }

        Ok(PhaseSummary {
            phase,
            batches: tally.batches,
            rows: tally.rows,
            correct: tally.correct,
            mean_loss: tally.mean_loss(),
            accuracy_pct: tally.accuracy_pct(),
            stats: outcome.stats,
            dropped: outcome.dropped,
        })
    }
}

fn log_epoch(summary: &EpochSummary) {
    for p in &summary.phases {
        tracing::info!(
            epoch = summary.epoch,
            phase = %p.phase,
            batches = p.batches,
            loss = p.mean_loss,
            accuracy = p.accuracy_pct,
            "Phase finished"
        );
    }
    tracing::info!(
        epoch = summary.epoch,
        checkpoint = %summary.checkpoint.display(),
        "Epoch finished"
    );
}

/// Build the production network on `device`, optionally resume from a
/// checkpoint, and train per `config`.
pub fn train(
    config: &TrainConfig,
    reader: Arc<dyn ClipReader>,
    device: Device,
    resume: Option<&Path>,
) -> Result<Vec<EpochSummary>> {
    let mut trainer = Trainer::new(config, NetworkConfig::production(), reader, device)?;
    if let Some(path) = resume {
        trainer.resume(path)?;
    }
    trainer.run()
}
