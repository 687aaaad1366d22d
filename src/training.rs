// Training loop controller.
//
// One full replacement model per invocation: vectorize the static corpus,
// build the network, run mini-batch epochs with early stopping and
// learning-rate decay, then hand everything to the codec. Nothing is
// persisted unless the whole run succeeds.

use std::collections::HashMap;
use std::sync::OnceLock;

use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

use crate::codec::{write_bundle, MetadataDoc, BUNDLE_VERSION};
use crate::errors::EngineError;
use crate::network::{IntentNet, Topology};
use crate::store::BundleStore;
use crate::vectorizer::{build_corpus, Corpus, SimpleRng, SEQUENCE_LEN};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub max_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Consecutive non-improving epochs before the run stops.
    pub max_patience: usize,
    /// Once patience exceeds this, the learning rate halves each stale epoch.
    pub decay_patience: usize,
    pub validation_fraction: f64,
    pub seed: u64,
}

impl TrainConfig {
    pub fn full() -> Self {
        Self {
            max_epochs: 100,
            batch_size: 32,
            learning_rate: 1e-3,
            max_patience: 5,
            decay_patience: 2,
            validation_fraction: 0.2,
            seed: 42,
        }
    }

    /// Fast tier for tests.
    pub fn test() -> Self {
        Self {
            max_epochs: 3,
            batch_size: 8,
            learning_rate: 1e-2,
            max_patience: 5,
            decay_patience: 2,
            validation_fraction: 0.2,
            seed: 42,
        }
    }
}

/// One progress report per epoch, plus start/save/finish markers.
#[derive(Debug, Clone)]
pub struct TrainStatus {
    pub status: String,
    pub progress_percent: u8,
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub epochs_run: usize,
    pub final_loss: f32,
    pub best_loss: f32,
    pub stopped_early: bool,
}

// ---------------------------------------------------------------------------
// Convergence bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub enum GateAction {
    Improved,
    Continue,
    DecayLr,
    Stop,
}

/// Best-loss/patience tracker driving early stopping and LR decay.
pub struct ConvergenceGate {
    best_loss: f32,
    patience: usize,
    max_patience: usize,
    decay_patience: usize,
}

impl ConvergenceGate {
    pub fn new(max_patience: usize, decay_patience: usize) -> Self {
        Self {
            best_loss: f32::INFINITY,
            patience: 0,
            max_patience,
            decay_patience,
        }
    }

    pub fn check(&mut self, loss: f32) -> GateAction {
        if loss < self.best_loss {
            self.best_loss = loss;
            self.patience = 0;
            return GateAction::Improved;
        }
        self.patience += 1;
        if self.patience >= self.max_patience {
            return GateAction::Stop;
        }
        if self.patience > self.decay_patience {
            return GateAction::DecayLr;
        }
        GateAction::Continue
    }

    pub fn best_loss(&self) -> f32 {
        self.best_loss
    }

    pub fn patience(&self) -> usize {
        self.patience
    }
}

// ---------------------------------------------------------------------------
// Static training corpus
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct IntentEntry {
    intent: String,
    patterns: Vec<String>,
    responses: Vec<String>,
}

static CORPUS: OnceLock<Vec<IntentEntry>> = OnceLock::new();

/// The fixed source `train` reads: hand-written portal intents embedded at
/// compile time, parsed once.
fn intent_corpus() -> &'static [IntentEntry] {
    CORPUS.get_or_init(|| {
        serde_json::from_str(include_str!("../data/intents.json"))
            .expect("intents.json parse failed")
    })
}

/// Train a replacement model from the built-in corpus and persist it.
pub fn train(
    store: &dyn BundleStore,
    config: &TrainConfig,
    device: &Device,
    observer: &mut dyn FnMut(TrainStatus),
) -> Result<TrainReport, EngineError> {
    let entries = intent_corpus();
    let examples: Vec<(String, String)> = entries
        .iter()
        .flat_map(|e| {
            e.patterns
                .iter()
                .map(|p| (p.clone(), e.intent.clone()))
                .collect::<Vec<_>>()
        })
        .collect();
    let responses: HashMap<String, Vec<String>> = entries
        .iter()
        .map(|e| (e.intent.clone(), e.responses.clone()))
        .collect();
    run_training(&examples, &responses, config, store, device, observer)
}

// ---------------------------------------------------------------------------
// Training run
// ---------------------------------------------------------------------------

/// Run one full training invocation over the given examples. Any failure
/// surfaces both as a `Failed` status to the observer and as the returned
/// error; no partial bundle is ever written.
pub fn run_training(
    examples: &[(String, String)],
    responses: &HashMap<String, Vec<String>>,
    config: &TrainConfig,
    store: &dyn BundleStore,
    device: &Device,
    observer: &mut dyn FnMut(TrainStatus),
) -> Result<TrainReport, EngineError> {
    let result = train_inner(examples, responses, config, store, device, observer);
    if let Err(ref err) = result {
        observer(TrainStatus {
            status: format!("training failed: {err}"),
            progress_percent: 100,
        });
        eprintln!("[train] failed: {err}");
    }
    result
}

fn train_inner(
    examples: &[(String, String)],
    responses: &HashMap<String, Vec<String>>,
    config: &TrainConfig,
    store: &dyn BundleStore,
    device: &Device,
    observer: &mut dyn FnMut(TrainStatus),
) -> Result<TrainReport, EngineError> {
    observer(TrainStatus {
        status: "preparing corpus".to_string(),
        progress_percent: 0,
    });

    let mut rng = SimpleRng::new(config.seed);
    let corpus = build_corpus(examples, &mut rng);
    if corpus.sequences.is_empty() || corpus.vocabulary.is_empty() {
        return Err(EngineError::Corpus(
            "no training examples produced a non-empty vocabulary".to_string(),
        ));
    }

    let vocab_size = corpus.vocabulary.len();
    let intent_count = corpus.intents.len();
    let topology = Topology::for_model(vocab_size, intent_count);
    let varmap = VarMap::new();
    let net = IntentNet::build(&topology, &varmap, device)?;

    let mut learning_rate = config.learning_rate;
    let mut optimizer = new_optimizer(&varmap, learning_rate)?;
    let mut gate = ConvergenceGate::new(config.max_patience, config.decay_patience);

    let n = corpus.sequences.len();
    let mut order: Vec<usize> = (0..n).collect();
    let mut epochs_run = 0usize;
    let mut final_loss = 0.0f32;
    let mut stopped_early = false;

    eprintln!(
        "[train] {n} examples, vocab={vocab_size}, intents={intent_count}, batch={}, lr={:.1e}",
        config.batch_size, learning_rate
    );

    for epoch in 0..config.max_epochs {
        // Fresh 20% holdout each epoch, used for validation loss only.
        shuffle(&mut order, &mut rng);
        let val_count = ((n as f64) * config.validation_fraction).round() as usize;
        let val_count = val_count.min(n.saturating_sub(1));
        let (val_idx, train_idx) = order.split_at(val_count);

        let mut total = 0.0f64;
        let mut batches = 0usize;
        for chunk in train_idx.chunks(config.batch_size) {
            let (input, target) = batch_tensors(&corpus, chunk, device)?;
            let logits = net.forward(&input, true)?;
            let loss = candle_nn::loss::cross_entropy(&logits, &target)?;
            total += loss.to_scalar::<f32>()? as f64;
            optimizer.backward_step(&loss)?;
            batches += 1;
        }
        if batches == 0 {
            return Err(EngineError::Corpus(
                "no examples left to train on after the validation split".to_string(),
            ));
        }
        let current_loss = (total / batches as f64) as f32;

        let val_loss = if val_idx.is_empty() {
            None
        } else {
            let mut vtotal = 0.0f64;
            let mut vbatches = 0usize;
            for chunk in val_idx.chunks(config.batch_size) {
                let (input, target) = batch_tensors(&corpus, chunk, device)?;
                let logits = net.forward(&input, false)?;
                vtotal += candle_nn::loss::cross_entropy(&logits, &target)?.to_scalar::<f32>()?
                    as f64;
                vbatches += 1;
            }
            Some((vtotal / vbatches as f64) as f32)
        };

        epochs_run = epoch + 1;
        final_loss = current_loss;

        match gate.check(current_loss) {
            GateAction::Stop => stopped_early = true,
            GateAction::DecayLr => {
                learning_rate /= 2.0;
                // Fresh optimizer state at the halved rate; weights, patience
                // and best loss carry over.
                optimizer = new_optimizer(&varmap, learning_rate)?;
                eprintln!("[train] halving learning rate to {learning_rate:.2e}");
            }
            GateAction::Improved | GateAction::Continue => {}
        }

        let val_str = val_loss
            .map(|v| format!(" val_loss={v:.4}"))
            .unwrap_or_default();
        eprintln!(
            "[train] epoch {}/{} loss={current_loss:.4}{val_str} patience={} lr={learning_rate:.2e}",
            epoch + 1,
            config.max_epochs,
            gate.patience()
        );
        observer(TrainStatus {
            status: format!(
                "epoch {}/{} loss={current_loss:.4}{val_str}",
                epoch + 1,
                config.max_epochs
            ),
            progress_percent: (((epoch + 1) * 100) / config.max_epochs).min(100) as u8,
        });

        if stopped_early {
            eprintln!(
                "[train] converged: {} consecutive epochs without improvement",
                config.max_patience
            );
            break;
        }
    }

    observer(TrainStatus {
        status: "saving model bundle".to_string(),
        progress_percent: 100,
    });
    let metadata = MetadataDoc {
        vocabulary: corpus.vocabulary,
        intents: corpus.intents,
        responses: responses.clone(),
        version: BUNDLE_VERSION.to_string(),
    };
    write_bundle(store, &topology, &varmap, &metadata)?;

    let report = TrainReport {
        epochs_run,
        final_loss,
        best_loss: gate.best_loss(),
        stopped_early,
    };
    observer(TrainStatus {
        status: format!(
            "training complete: {} epochs, best_loss={:.4}",
            report.epochs_run, report.best_loss
        ),
        progress_percent: 100,
    });
    Ok(report)
}

fn new_optimizer(varmap: &VarMap, learning_rate: f64) -> Result<AdamW, EngineError> {
    let params = ParamsAdamW {
        lr: learning_rate,
        ..Default::default()
    };
    AdamW::new(varmap.all_vars(), params).map_err(Into::into)
}

fn shuffle(indices: &mut [usize], rng: &mut SimpleRng) {
    for i in (1..indices.len()).rev() {
        let j = rng.next_usize(i + 1);
        indices.swap(i, j);
    }
}

fn batch_tensors(
    corpus: &Corpus,
    indices: &[usize],
    device: &Device,
) -> Result<(Tensor, Tensor), EngineError> {
    let batch = indices.len();
    let mut ids = Vec::with_capacity(batch * SEQUENCE_LEN);
    let mut labels = Vec::with_capacity(batch);
    for &i in indices {
        ids.extend_from_slice(&corpus.sequences[i]);
        labels.push(corpus.labels[i]);
    }
    Ok((
        Tensor::from_vec(ids, (batch, SEQUENCE_LEN), device)?,
        Tensor::from_vec(labels, batch, device)?,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemBundleStore;

    #[test]
    fn test_gate_stops_after_five_stale_epochs() {
        let mut gate = ConvergenceGate::new(5, 2);
        assert_eq!(gate.check(1.0), GateAction::Improved);
        assert_eq!(gate.check(1.1), GateAction::Continue);
        assert_eq!(gate.check(1.1), GateAction::Continue);
        assert_eq!(gate.check(1.1), GateAction::DecayLr);
        assert_eq!(gate.check(1.1), GateAction::DecayLr);
        assert_eq!(gate.check(1.1), GateAction::Stop);
    }

    #[test]
    fn test_gate_improvement_resets_patience() {
        let mut gate = ConvergenceGate::new(5, 2);
        gate.check(1.0);
        gate.check(1.2);
        gate.check(1.2);
        assert_eq!(gate.check(0.5), GateAction::Improved);
        assert_eq!(gate.patience(), 0);
        assert_eq!(gate.best_loss(), 0.5);
    }

    #[test]
    fn test_gate_equal_loss_is_stale() {
        // Only strict improvement resets patience.
        let mut gate = ConvergenceGate::new(5, 2);
        gate.check(1.0);
        assert_eq!(gate.check(1.0), GateAction::Continue);
    }

    #[test]
    fn test_empty_corpus_is_rejected_before_building_the_net() {
        let store = MemBundleStore::new();
        let mut statuses = Vec::new();
        let err = run_training(
            &[],
            &HashMap::new(),
            &TrainConfig::test(),
            &store,
            &Device::Cpu,
            &mut |s| statuses.push(s),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Corpus(_)));
        // Nothing may be persisted on failure.
        assert!(store.get(crate::store::WEIGHTS_ARTIFACT).is_err());
        assert!(statuses
            .iter()
            .any(|s| s.status.starts_with("training failed")));
    }

    #[test]
    fn test_training_never_exceeds_max_epochs_and_writes_bundle() {
        let store = MemBundleStore::new();
        let examples = vec![
            ("hello".to_string(), "greeting".to_string()),
            ("hi there".to_string(), "greeting".to_string()),
            ("good morning".to_string(), "greeting".to_string()),
            ("pay my bill".to_string(), "pay_bill".to_string()),
            ("i want to pay".to_string(), "pay_bill".to_string()),
            ("settle my invoice".to_string(), "pay_bill".to_string()),
        ];
        let mut responses = HashMap::new();
        responses.insert("greeting".to_string(), vec!["Hi!".to_string()]);
        responses.insert("pay_bill".to_string(), vec!["Sure.".to_string()]);

        let config = TrainConfig::test();
        let mut epochs_seen = 0usize;
        let report = run_training(
            &examples,
            &responses,
            &config,
            &store,
            &Device::Cpu,
            &mut |s| {
                if s.status.starts_with("epoch") {
                    epochs_seen += 1;
                }
                assert!(s.progress_percent <= 100);
            },
        )
        .unwrap();

        assert!(report.epochs_run <= config.max_epochs);
        assert_eq!(epochs_seen, report.epochs_run);
        assert!(report.best_loss.is_finite());
        assert!(store.get(crate::store::WEIGHTS_ARTIFACT).is_ok());
        assert!(store.get(crate::store::TOPOLOGY_ARTIFACT).is_ok());
        assert!(store.get(crate::store::METADATA_ARTIFACT).is_ok());
    }

    #[test]
    fn test_static_corpus_parses() {
        let entries = intent_corpus();
        assert!(entries.len() >= 8, "portal corpus should cover its intents");
        for entry in entries {
            assert!(!entry.patterns.is_empty(), "{} has no patterns", entry.intent);
            assert!(
                !entry.responses.is_empty(),
                "{} has no responses",
                entry.intent
            );
        }
    }
}
