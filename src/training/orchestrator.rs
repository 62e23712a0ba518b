//! The epoch state machine.

use std::time::Instant;

use tracing::{info, warn};

use super::checkpoint::{CheckpointPolicy, CheckpointStore};
use super::history::ValidationHistory;
use super::sink::TrainingSink;
use super::EpochSummary;
use crate::config::TrainingConfig;
use crate::dataset::{BatchSource, PixelBatch};
use crate::error::{PixelClError, Result};
use crate::loss::{LossCall, LossFunction, LossKind};
use crate::model::{ModelOutput, NetworkKind, Optimizer, TrainableModel};
use crate::utils::logging::EpochLogger;
use crate::utils::metrics::BatchScorer;

/// Final figures for a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub epochs: usize,
    pub best_validation_overlap: f64,
}

/// Drives repeated train/eval passes over the collaborator seams and owns
/// the validation history.
pub struct EpochOrchestrator {
    model: Box<dyn TrainableModel>,
    loss: Box<dyn LossFunction>,
    optimizer: Box<dyn Optimizer>,
    scorer: Box<dyn BatchScorer>,
    sink: Box<dyn TrainingSink>,
    history: ValidationHistory,
}

impl EpochOrchestrator {
    pub fn new(
        model: Box<dyn TrainableModel>,
        loss: Box<dyn LossFunction>,
        optimizer: Box<dyn Optimizer>,
        scorer: Box<dyn BatchScorer>,
        sink: Box<dyn TrainingSink>,
    ) -> Self {
        Self {
            model,
            loss,
            optimizer,
            scorer,
            sink,
            history: ValidationHistory::new(),
        }
    }

    pub fn history(&self) -> &ValidationHistory {
        &self.history
    }

    pub fn model(&self) -> &dyn TrainableModel {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> &mut dyn TrainableModel {
        self.model.as_mut()
    }

    /// One full pass over `source`.
    ///
    /// In training mode every batch backpropagates and applies exactly one
    /// optimizer step; in evaluation mode gradients are never touched and
    /// model parameters stay as they were. Evaluation passes append their
    /// total overlap to the validation history.
    pub fn run_epoch(
        &mut self,
        training: bool,
        epoch_idx: usize,
        learning_rate: f64,
        source: &mut dyn BatchSource,
    ) -> Result<EpochSummary> {
        self.model.set_training(training);
        EpochLogger::epoch_start(training, epoch_idx);
        let epoch_start = Instant::now();
        source.reset();

        let mut batch_losses: Vec<f64> = Vec::new();
        let mut overlap_rows: Vec<Vec<f64>> = Vec::new();
        let mut batch_idx = 0usize;

        while let Some(batch) = source.next_batch()? {
            let batch_start = Instant::now();

            let output = self.model.forward(&batch)?;
            let call = build_loss_call(self.loss.kind(), &output, &batch)?;
            let score = self.loss.compute(call)?;

            if training {
                self.optimizer.zero_grad(self.model.as_mut());
                self.model.backward(&score.grad_scores)?;
                self.optimizer.step(learning_rate, self.model.as_mut())?;
            }

            let (_post_processed, overlap) =
                self.scorer.score_batch(output.scores(), &batch.labels)?;
            batch_losses.push(score.value);
            overlap_rows.push(overlap);

            EpochLogger::batch_done(
                epoch_idx,
                batch_idx,
                score.value,
                batch_start.elapsed().as_secs_f64(),
            );
            if let Err(err) = self.sink.record_batch(training, epoch_idx, batch_idx, score.value)
            {
                warn!("progress sink failed on batch {batch_idx}: {err}");
            }
            batch_idx += 1;
        }

        if batch_losses.is_empty() {
            return Err(PixelClError::shape("epoch ran over zero batches"));
        }

        let summary = aggregate(&batch_losses, &overlap_rows);
        if !training {
            self.history.append(summary.total_overlap);
        }

        EpochLogger::epoch_done(
            training,
            epoch_idx,
            summary.loss,
            epoch_start.elapsed().as_secs_f64(),
        );
        if let Err(err) = self.sink.record_epoch(training, epoch_idx, &summary) {
            warn!("progress sink failed on epoch {epoch_idx}: {err}");
        }

        Ok(summary)
    }

    /// The full run: `num_epochs` (train, eval) pairs with step-decayed
    /// learning rate, checkpoints gated by `policy`.
    pub fn run(
        &mut self,
        config: &TrainingConfig,
        train_source: &mut dyn BatchSource,
        val_source: &mut dyn BatchSource,
        store: &CheckpointStore,
        policy: &CheckpointPolicy,
    ) -> Result<RunReport> {
        config.validate()?;
        if self.loss.kind() == LossKind::AttentionWeighted
            && self.model.network() != NetworkKind::AttentionSegmenter
        {
            return Err(PixelClError::config(
                "the attention-weighted loss requires the attention segmenter network",
            ));
        }

        let mut learning_rate = config.learning_rate;
        for epoch_idx in 0..config.num_epochs {
            self.run_epoch(true, epoch_idx, learning_rate, train_source)?;
            self.run_epoch(false, epoch_idx, learning_rate, val_source)?;

            // Decay once per completed (train, eval) pair.
            if (epoch_idx + 1) % config.lr_step_size == 0 {
                learning_rate *= config.lr_gamma;
                info!("learning rate decayed to {learning_rate:.6}");
            }

            let decision = policy.on_epoch_end(epoch_idx, &self.history);
            if decision.periodic {
                store.save_periodic(self.model.as_ref(), epoch_idx)?;
            }
            if decision.best {
                store.save_best(self.model.as_ref(), epoch_idx)?;
            }
        }

        let best = self.history.running_max().unwrap_or(0.0);
        info!("the best dice on the validation set is {best:.4}");
        Ok(RunReport {
            epochs: config.num_epochs,
            best_validation_overlap: best,
        })
    }
}

/// Exhaustive pairing of loss kind and model output; unsupported pairings
/// are configuration errors rather than implicit branches.
fn build_loss_call<'a>(
    kind: LossKind,
    output: &'a ModelOutput,
    batch: &'a PixelBatch,
) -> Result<LossCall<'a>> {
    match (kind, output) {
        (LossKind::CrossEntropy, output) => Ok(LossCall::CrossEntropy {
            scores: output.scores(),
            labels: &batch.labels,
        }),
        (LossKind::ConfidenceSmoothed, output) => {
            let confidence = batch.confidence.as_ref().ok_or_else(|| {
                PixelClError::config(
                    "the confidence-smoothed loss needs confidence maps in the batch",
                )
            })?;
            Ok(LossCall::ConfidenceSmoothed {
                scores: output.scores(),
                labels: &batch.labels,
                confidence,
            })
        }
        (LossKind::AttentionWeighted, ModelOutput::WithAttention { scores, weights }) => {
            Ok(LossCall::AttentionWeighted {
                scores,
                labels: &batch.labels,
                weights,
            })
        }
        (LossKind::AttentionWeighted, ModelOutput::Plain { .. }) => Err(PixelClError::config(
            "the attention-weighted loss requires a network that produces attention weights",
        )),
    }
}

fn aggregate(batch_losses: &[f64], overlap_rows: &[Vec<f64>]) -> EpochSummary {
    let batches = batch_losses.len() as f64;
    let loss = batch_losses.iter().sum::<f64>() / batches;

    let classes = overlap_rows.first().map(|row| row.len()).unwrap_or(0);
    let mut per_class_overlap = vec![0.0f64; classes];
    for row in overlap_rows {
        for (sum, &value) in per_class_overlap.iter_mut().zip(row) {
            *sum += value;
        }
    }
    for value in &mut per_class_overlap {
        *value /= batches;
    }
    let total_overlap = if classes == 0 {
        0.0
    } else {
        per_class_overlap.iter().sum::<f64>() / classes as f64
    };

    EpochSummary {
        loss,
        per_class_overlap,
        total_overlap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::path::Path;
    use std::rc::Rc;

    use ndarray::{Array3, Array4};

    use crate::loss::LossScore;
    use crate::model::NetworkKind;
    use crate::training::sink::{NullSink, SinkError};

    /// Fixed-size batches with constant content.
    struct FixedBatches {
        batches: usize,
        served: usize,
    }

    impl FixedBatches {
        fn new(batches: usize) -> Self {
            Self { batches, served: 0 }
        }
    }

    impl BatchSource for FixedBatches {
        fn reset(&mut self) {
            self.served = 0;
        }

        fn next_batch(&mut self) -> Result<Option<PixelBatch>> {
            if self.served >= self.batches {
                return Ok(None);
            }
            self.served += 1;
            Ok(Some(PixelBatch {
                images: Array4::<f32>::zeros((1, 1, 2, 2)),
                labels: Array3::<u8>::zeros((1, 2, 2)),
                confidence: None,
                filenames: vec!["f.png".to_string()],
            }))
        }

        fn num_batches(&self) -> usize {
            self.batches
        }
    }

    /// Model stub that counts parameter mutations.
    struct CountingModel {
        steps: Rc<Cell<usize>>,
        backwards: Rc<Cell<usize>>,
    }

    impl TrainableModel for CountingModel {
        fn network(&self) -> NetworkKind {
            NetworkKind::Segmenter
        }

        fn set_training(&mut self, _training: bool) {}

        fn forward(&mut self, batch: &PixelBatch) -> Result<ModelOutput> {
            let (b, _, h, w) = batch.images.dim();
            Ok(ModelOutput::Plain {
                scores: Array4::<f32>::zeros((b, 2, h, w)),
            })
        }

        fn backward(&mut self, _grad: &Array4<f32>) -> Result<()> {
            self.backwards.set(self.backwards.get() + 1);
            Ok(())
        }

        fn zero_grad(&mut self) {}

        fn apply_step(&mut self, _learning_rate: f64) {
            self.steps.set(self.steps.get() + 1);
        }

        fn save(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        fn load(&mut self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    /// Loss stub replaying a scripted sequence of scalars.
    struct ScriptedLoss {
        values: RefCell<std::vec::IntoIter<f64>>,
    }

    impl ScriptedLoss {
        fn new(values: Vec<f64>) -> Self {
            Self {
                values: RefCell::new(values.into_iter()),
            }
        }
    }

    impl LossFunction for ScriptedLoss {
        fn kind(&self) -> LossKind {
            LossKind::CrossEntropy
        }

        fn compute(&self, call: LossCall<'_>) -> Result<LossScore> {
            let scores = match call {
                LossCall::CrossEntropy { scores, .. } => scores,
                _ => unreachable!(),
            };
            Ok(LossScore {
                value: self.values.borrow_mut().next().unwrap_or(0.0),
                grad_scores: Array4::<f32>::zeros(scores.raw_dim()),
            })
        }
    }

    /// Scorer stub replaying scripted per-class overlap rows.
    struct ScriptedScorer {
        rows: RefCell<std::vec::IntoIter<Vec<f64>>>,
    }

    impl ScriptedScorer {
        fn new(rows: Vec<Vec<f64>>) -> Self {
            Self {
                rows: RefCell::new(rows.into_iter()),
            }
        }
    }

    impl BatchScorer for ScriptedScorer {
        fn score_batch(
            &self,
            _scores: &Array4<f32>,
            labels: &Array3<u8>,
        ) -> Result<(Array3<u8>, Vec<f64>)> {
            Ok((
                labels.clone(),
                self.rows.borrow_mut().next().unwrap_or_default(),
            ))
        }
    }

    fn orchestrator(
        steps: Rc<Cell<usize>>,
        losses: Vec<f64>,
        overlaps: Vec<Vec<f64>>,
    ) -> EpochOrchestrator {
        EpochOrchestrator::new(
            Box::new(CountingModel {
                steps,
                backwards: Rc::new(Cell::new(0)),
            }),
            Box::new(ScriptedLoss::new(losses)),
            Box::new(crate::model::Sgd),
            Box::new(ScriptedScorer::new(overlaps)),
            Box::new(NullSink),
        )
    }

    #[test]
    fn epoch_aggregation_uses_arithmetic_means() {
        let steps = Rc::new(Cell::new(0));
        let mut orch = orchestrator(
            steps,
            vec![1.0, 2.0, 3.0],
            vec![vec![0.9, 0.1], vec![0.8, 0.2], vec![0.7, 0.3]],
        );
        let mut source = FixedBatches::new(3);

        let summary = orch.run_epoch(false, 0, 0.1, &mut source).unwrap();
        assert!((summary.loss - 2.0).abs() < 1e-9);
        assert!((summary.per_class_overlap[0] - 0.8).abs() < 1e-9);
        assert!((summary.per_class_overlap[1] - 0.2).abs() < 1e-9);
        assert!((summary.total_overlap - 0.5).abs() < 1e-9);
    }

    #[test]
    fn evaluation_never_steps_the_optimizer() {
        let steps = Rc::new(Cell::new(0));
        let mut orch = orchestrator(Rc::clone(&steps), vec![1.0; 3], vec![vec![0.5]; 3]);
        let mut source = FixedBatches::new(3);

        orch.run_epoch(false, 0, 0.1, &mut source).unwrap();
        assert_eq!(steps.get(), 0);
    }

    #[test]
    fn training_steps_once_per_batch() {
        let steps = Rc::new(Cell::new(0));
        let mut orch = orchestrator(Rc::clone(&steps), vec![1.0; 4], vec![vec![0.5]; 4]);
        let mut source = FixedBatches::new(4);

        orch.run_epoch(true, 0, 0.1, &mut source).unwrap();
        assert_eq!(steps.get(), 4);
    }

    #[test]
    fn evaluation_epochs_extend_the_history() {
        let steps = Rc::new(Cell::new(0));
        let mut orch = orchestrator(
            Rc::clone(&steps),
            vec![1.0; 6],
            vec![vec![0.4], vec![0.4], vec![0.6], vec![0.6], vec![0.2], vec![0.2]],
        );

        for _ in 0..3 {
            let mut source = FixedBatches::new(2);
            orch.run_epoch(false, 0, 0.1, &mut source).unwrap();
        }
        assert_eq!(orch.history().len(), 3);
        assert_eq!(orch.history().running_max(), Some(0.6));

        // A training epoch must not extend it.
        let mut source = FixedBatches::new(1);
        let _ = orch.run_epoch(true, 0, 0.1, &mut source);
        assert_eq!(orch.history().len(), 3);
    }

    #[test]
    fn attention_loss_with_plain_network_is_rejected() {
        struct AttentionLoss;
        impl LossFunction for AttentionLoss {
            fn kind(&self) -> LossKind {
                LossKind::AttentionWeighted
            }
            fn compute(&self, _call: LossCall<'_>) -> Result<LossScore> {
                unreachable!("the pairing is rejected before compute")
            }
        }

        let mut orch = EpochOrchestrator::new(
            Box::new(CountingModel {
                steps: Rc::new(Cell::new(0)),
                backwards: Rc::new(Cell::new(0)),
            }),
            Box::new(AttentionLoss),
            Box::new(crate::model::Sgd),
            Box::new(ScriptedScorer::new(vec![])),
            Box::new(NullSink),
        );
        let mut source = FixedBatches::new(1);
        assert!(matches!(
            orch.run_epoch(true, 0, 0.1, &mut source),
            Err(PixelClError::Configuration(_))
        ));
    }

    #[test]
    fn full_run_gates_periodic_and_best_checkpoints() {
        use crate::loss::CrossEntropyLoss;
        use crate::model::LinearPixelModel;
        use crate::training::checkpoint::CheckpointPolicy;
        use crate::utils::metrics::OverlapMetrics;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::create(dir.path().join("ckpt")).unwrap();
        let policy = CheckpointPolicy::new(2);
        let config = TrainingConfig {
            num_epochs: 3,
            save_epochs: 2,
            lr_step_size: 2,
            batch_size: 1,
            ..Default::default()
        };

        let mut orch = EpochOrchestrator::new(
            Box::new(LinearPixelModel::new(2)),
            Box::new(CrossEntropyLoss),
            Box::new(crate::model::Sgd),
            Box::new(OverlapMetrics::new(2)),
            Box::new(NullSink),
        );
        let mut train = FixedBatches::new(2);
        let mut val = FixedBatches::new(2);

        let report = orch
            .run(&config, &mut train, &mut val, &store, &policy)
            .unwrap();
        assert_eq!(report.epochs, 3);
        assert_eq!(orch.history().len(), 3);

        // Periodic snapshots at epochs 0 and 2, none at 1.
        assert!(store.periodic_path(0).exists());
        assert!(!store.periodic_path(1).exists());
        assert!(store.periodic_path(2).exists());

        // Exactly one best checkpoint remains, from the last best epoch.
        let best_files: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains("best_on_validation"))
            .collect();
        assert_eq!(best_files.len(), 1);
    }

    #[test]
    fn failing_sink_does_not_abort_the_epoch() {
        struct FailingSink;
        impl TrainingSink for FailingSink {
            fn record_batch(
                &mut self,
                _: bool,
                _: usize,
                _: usize,
                _: f64,
            ) -> std::result::Result<(), SinkError> {
                Err(SinkError::Render(std::io::Error::other("backend down")))
            }
            fn record_epoch(
                &mut self,
                _: bool,
                _: usize,
                _: &EpochSummary,
            ) -> std::result::Result<(), SinkError> {
                Err(SinkError::Render(std::io::Error::other("backend down")))
            }
        }

        let mut orch = EpochOrchestrator::new(
            Box::new(CountingModel {
                steps: Rc::new(Cell::new(0)),
                backwards: Rc::new(Cell::new(0)),
            }),
            Box::new(ScriptedLoss::new(vec![1.0, 1.0])),
            Box::new(crate::model::Sgd),
            Box::new(ScriptedScorer::new(vec![vec![0.5], vec![0.5]])),
            Box::new(FailingSink),
        );
        let mut source = FixedBatches::new(2);
        let summary = orch.run_epoch(false, 0, 0.1, &mut source).unwrap();
        assert!((summary.loss - 1.0).abs() < 1e-9);
    }
}
