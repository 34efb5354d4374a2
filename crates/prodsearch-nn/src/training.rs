//! Mini-batch training with Adagrad.
//!
//! One epoch shuffles the training interactions, cuts them into batches
//! (drop-last), and for every batch computes the model's loss and applies
//! one [`Adagrad`] step. Evaluation runs every `eval_every` epochs and
//! after the last one.

use crate::error::{Error, Result};
use crate::evaluation::{evaluate, EvalConfig, RankingMetrics};
use crate::model::SearchModel;
use crate::optim::{Adagrad, AdagradConfig};
use candle_nn::Optimizer;
use prodsearch_core::sampling::batch_indices;
use prodsearch_core::{NegativeSampler, PreparedData};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of epochs (default: 20).
    pub epochs: usize,
    /// Batch size (default: 256).
    pub batch_size: usize,
    /// Adagrad learning rate (default: 0.1).
    pub learning_rate: f64,
    /// Negative items per interaction (default: 5).
    pub neg_sample_num: usize,
    /// Random seed for shuffling and sampling (default: 42).
    pub seed: u64,
    /// Evaluation settings.
    pub eval: EvalConfig,
    /// Evaluate every this many epochs, 0 to evaluate only at the end (default: 1).
    pub eval_every: usize,
    /// Stop after this many evaluations without MRR improvement (default: None).
    pub early_stopping: Option<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 256,
            learning_rate: 0.1,
            neg_sample_num: 5,
            seed: 42,
            eval: EvalConfig::default(),
            eval_every: 1,
            early_stopping: None,
        }
    }
}

impl TrainingConfig {
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_neg_sample_num(mut self, n: usize) -> Self {
        self.neg_sample_num = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_eval(mut self, eval: EvalConfig) -> Self {
        self.eval = eval;
        self
    }

    pub fn with_eval_every(mut self, every: usize) -> Self {
        self.eval_every = every;
        self
    }

    pub fn with_early_stopping(mut self, patience: Option<usize>) -> Self {
        self.early_stopping = patience;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".to_string()));
        }
        if self.neg_sample_num == 0 {
            return Err(Error::InvalidConfig(
                "neg_sample_num must be positive".to_string(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "invalid learning rate {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// What happened in one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    /// 0-based epoch index.
    pub epoch: usize,
    pub epochs: usize,
    /// Mean batch loss.
    pub loss: f64,
    /// Loss of the last batch.
    pub last_loss: f64,
    pub batches: usize,
    /// Present on evaluation epochs.
    pub metrics: Option<RankingMetrics>,
    pub elapsed_secs: f64,
}

impl fmt::Display for EpochReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch {}/{} | loss {:.4} | {:.1}s",
            self.epoch + 1,
            self.epochs,
            self.loss,
            self.elapsed_secs
        )?;
        if let Some(metrics) = &self.metrics {
            write!(f, " | {metrics}")?;
        }
        Ok(())
    }
}

/// Training results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs: Vec<EpochReport>,
    /// Epoch with the best MRR among evaluated epochs.
    pub best_epoch: Option<usize>,
}

impl TrainingReport {
    /// Metrics of the last evaluated epoch.
    pub fn final_metrics(&self) -> Option<&RankingMetrics> {
        self.epochs.iter().rev().find_map(|e| e.metrics.as_ref())
    }
}

/// Drives a [`SearchModel`] through its epochs.
pub struct Trainer {
    config: TrainingConfig,
    on_epoch: Option<Box<dyn FnMut(&EpochReport)>>,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            on_epoch: None,
        }
    }

    /// Call `callback` with every epoch report.
    pub fn with_callback(mut self, callback: impl FnMut(&EpochReport) + 'static) -> Self {
        self.on_epoch = Some(Box::new(callback));
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Train `model` on `data.train`, evaluating on `data.test`.
    pub fn fit(&mut self, model: &dyn SearchModel, data: &PreparedData) -> Result<TrainingReport> {
        self.config.validate()?;
        if data.train.is_empty() {
            return Err(Error::Training("no training interactions".to_string()));
        }

        let config = self.config.clone();
        let mut optimizer = Adagrad::new(
            model.varmap().all_vars(),
            AdagradConfig::default().with_lr(config.learning_rate),
        )?;
        let mut sampler = NegativeSampler::new(data.num_items(), config.seed);

        tracing::info!(
            model = %model.kind(),
            epochs = config.epochs,
            batch_size = config.batch_size,
            interactions = data.train.len(),
            "starting training"
        );

        let mut reports = Vec::with_capacity(config.epochs);
        let mut best: Option<(usize, f64)> = None;
        let mut stale = 0usize;

        for epoch in 0..config.epochs {
            let start = Instant::now();
            let batches = batch_indices(data.train.len(), config.batch_size, sampler.rng());

            let mut total = 0.0;
            let mut last_loss = 0.0;
            for batch in &batches {
                let loss = model.batch_loss(data, batch, &mut sampler, config.neg_sample_num)?;
                let value = f64::from(loss.to_scalar::<f32>()?);
                if !value.is_finite() {
                    return Err(Error::Training(format!(
                        "non-finite loss {value} in epoch {}",
                        epoch + 1
                    )));
                }
                optimizer.backward_step(&loss)?;
                total += value;
                last_loss = value;
            }

            let is_last = epoch + 1 == config.epochs;
            let due = config.eval_every > 0 && (epoch + 1) % config.eval_every == 0;
            let metrics = if due || is_last {
                Some(evaluate(model, data, &config.eval)?)
            } else {
                None
            };

            let report = EpochReport {
                epoch,
                epochs: config.epochs,
                loss: total / batches.len().max(1) as f64,
                last_loss,
                batches: batches.len(),
                metrics,
                elapsed_secs: start.elapsed().as_secs_f64(),
            };
            tracing::info!("{report}");
            if let Some(callback) = self.on_epoch.as_mut() {
                callback(&report);
            }

            let mut stop = false;
            if let Some(metrics) = &report.metrics {
                if best.map_or(true, |(_, mrr)| metrics.mrr > mrr) {
                    best = Some((epoch, metrics.mrr));
                    stale = 0;
                } else {
                    stale += 1;
                    if config.early_stopping.is_some_and(|patience| stale >= patience) {
                        tracing::info!(epoch = epoch + 1, "early stopping");
                        stop = true;
                    }
                }
            }
            reports.push(report);
            if stop {
                break;
            }
        }

        Ok(TrainingReport {
            epochs: reports,
            best_epoch: best.map(|(epoch, _)| epoch),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Lse, LseConfig};
    use candle_core::Device;
    use prodsearch_core::{prepare, DataConfig, Review};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn data() -> PreparedData {
        let records = vec![
            Review::new("alice", "case", "red phone case", vec!["phone case".into()], 1),
            Review::new("alice", "cable", "usb cable", vec!["usb cable".into()], 2),
            Review::new("bob", "case", "red case", vec!["red case".into()], 1),
            Review::new("bob", "stand", "phone stand", vec!["phone stand".into()], 2),
            Review::new("carol", "stand", "solid stand", vec!["stand".into()], 1),
            Review::new("carol", "cable", "long cable", vec!["cable".into()], 2),
        ];
        prepare(&records, &DataConfig::default()).unwrap()
    }

    fn lse(data: &PreparedData) -> Lse {
        Lse::new(
            LseConfig::default().with_embedding_size(8),
            data.num_words(),
            data.num_items(),
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_fit_reports_every_epoch() {
        let data = data();
        let model = lse(&data);
        let seen = Rc::new(RefCell::new(0usize));
        let counter = Rc::clone(&seen);

        let config = TrainingConfig::default().with_epochs(3).with_batch_size(2).with_eval_every(2);
        let mut trainer = Trainer::new(config).with_callback(move |_| *counter.borrow_mut() += 1);
        let report = trainer.fit(&model, &data).unwrap();

        assert_eq!(report.epochs.len(), 3);
        assert_eq!(*seen.borrow(), 3);
        // epoch 2 (eval_every) and the last epoch are evaluated
        assert!(report.epochs[0].metrics.is_none());
        assert!(report.epochs[1].metrics.is_some());
        assert!(report.epochs[2].metrics.is_some());
        assert!(report.epochs.iter().all(|e| e.loss.is_finite() && e.batches == 1));
        assert!(report.best_epoch.is_some());
    }

    #[test]
    fn test_training_lowers_loss() {
        let data = data();
        let model = lse(&data);
        let config = TrainingConfig::default().with_epochs(15).with_batch_size(8).with_eval_every(0);
        let report = Trainer::new(config).fit(&model, &data).unwrap();

        let first = report.epochs.first().unwrap().loss;
        let last = report.epochs.last().unwrap().loss;
        assert!(last < first, "loss went from {first} to {last}");
        let metrics = report.final_metrics().unwrap();
        assert!((0.0..=1.0).contains(&metrics.mrr));
    }

    #[test]
    fn test_invalid_training_config() {
        let data = data();
        let model = lse(&data);
        let config = TrainingConfig::default().with_neg_sample_num(0);
        assert!(matches!(
            Trainer::new(config).fit(&model, &data),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_epoch_report_display() {
        let report = EpochReport {
            epoch: 0,
            epochs: 2,
            loss: 1.5,
            last_loss: 1.0,
            batches: 1,
            metrics: None,
            elapsed_secs: 0.25,
        };
        assert_eq!(report.to_string(), "epoch 1/2 | loss 1.5000 | 0.2s");
    }
}
