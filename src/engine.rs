// Inference engine.
//
// Featurizes one query the same way the vectorizer encodes training text
// (plus adjacent-pair bigrams), runs it through the codec-reconstructed
// model and picks a response. The reconstructed model is process-wide
// state behind a mutex-guarded slot: the first caller loads, concurrent
// first callers block on the same load, and everybody after that shares
// the cached Arc. Load and transport failures never reach the resident as
// raw errors; `respond` degrades to an apology and logs the detail.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use candle_core::{Device, Tensor};
use rand::Rng;

use crate::codec::{read_bundle, ReadyModel};
use crate::errors::EngineError;
use crate::store::BundleStore;
use crate::vectorizer::SEQUENCE_LEN;

/// Used when a predicted intent has no configured responses.
pub const FALLBACK_RESPONSES: [&str; 3] = [
    "I'm not sure I understood that. Could you rephrase?",
    "Sorry, I don't have an answer for that yet.",
    "Could you try asking that a different way?",
];

const APOLOGY: &str =
    "Sorry, the assistant is temporarily unavailable. Please try again shortly.";

/// Tokens the vocabulary does not know fall back to this entry when the
/// bundle carries one, and to the reserved index 0 otherwise.
const UNKNOWN_TOKEN: &str = "<unk>";

#[derive(Debug, Clone)]
pub struct IntentScore {
    pub intent: String,
    pub probability: f32,
}

#[derive(Debug, Clone)]
pub struct Prediction {
    pub intent: String,
    pub confidence: f32,
    pub response: String,
    /// One entry per known intent, in the model's intent order. Sorting is
    /// the caller's concern.
    pub all_probabilities: Vec<IntentScore>,
}

// ---------------------------------------------------------------------------
// Featurization
// ---------------------------------------------------------------------------

/// Lower-case, strip `.,!?`, collapse whitespace runs, trim.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped: String = lowered
        .chars()
        .filter(|c| !matches!(c, '.' | ',' | '!' | '?'))
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Unigrams followed by adjacent-pair bigrams, mapped through the
/// vocabulary, padded or truncated to the fixed sequence length.
pub fn featurize(text: &str, vocabulary: &HashMap<String, u32>) -> Vec<u32> {
    let normalized = normalize(text);
    let tokens: Vec<&str> = normalized.split_whitespace().collect();

    let mut features: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
    for pair in tokens.windows(2) {
        features.push(format!("{} {}", pair[0], pair[1]));
    }

    let unknown = vocabulary.get(UNKNOWN_TOKEN).copied().unwrap_or(0);
    let mut ids: Vec<u32> = features
        .iter()
        .map(|f| vocabulary.get(f).copied().unwrap_or(unknown))
        .take(SEQUENCE_LEN)
        .collect();
    ids.resize(SEQUENCE_LEN, 0);
    ids
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct IntentEngine<S: BundleStore> {
    store: S,
    device: Device,
    model: Mutex<Option<Arc<ReadyModel>>>,
}

impl<S: BundleStore> IntentEngine<S> {
    pub fn new(store: S, device: Device) -> Self {
        Self {
            store,
            device,
            model: Mutex::new(None),
        }
    }

    /// Explicit cache warm. Idempotent; failure leaves the slot empty.
    pub fn preload(&self) -> Result<(), EngineError> {
        self.model()?;
        Ok(())
    }

    /// Drop any cached model and read the bundle again. The only way a
    /// freshly trained bundle is picked up without a process restart.
    pub fn reload(&self) -> Result<(), EngineError> {
        let fresh = Arc::new(read_bundle(&self.store, &self.device)?);
        *self.model.lock().unwrap() = Some(fresh);
        Ok(())
    }

    /// The cached model, if a load has ever succeeded.
    pub fn cached(&self) -> Result<Arc<ReadyModel>, EngineError> {
        self.model
            .lock()
            .unwrap()
            .clone()
            .ok_or(EngineError::ModelNotLoaded)
    }

    fn model(&self) -> Result<Arc<ReadyModel>, EngineError> {
        let mut slot = self.model.lock().unwrap();
        if let Some(model) = slot.as_ref() {
            return Ok(model.clone());
        }
        // First caller loads; racers block on the mutex and reuse the
        // cached result instead of issuing duplicate reads.
        let loaded = Arc::new(read_bundle(&self.store, &self.device)?);
        *slot = Some(loaded.clone());
        Ok(loaded)
    }

    /// Classify one query. Loads the bundle lazily on first use; never
    /// mutates the cached model.
    pub fn predict(&self, text: &str) -> Result<Prediction, EngineError> {
        let model = self.model()?;
        predict_with(&model, text, &self.device)
    }

    /// The user-facing boundary: any failure becomes a fixed apology while
    /// the underlying error is logged in full.
    pub fn respond(&self, text: &str) -> String {
        match self.predict(text) {
            Ok(prediction) => prediction.response,
            Err(err) => {
                eprintln!("[engine] prediction failed: {err}");
                APOLOGY.to_string()
            }
        }
    }
}

/// Run one forward pass over an already-loaded model.
pub fn predict_with(
    model: &ReadyModel,
    text: &str,
    device: &Device,
) -> Result<Prediction, EngineError> {
    let ids = featurize(text, &model.vocabulary);
    let input = Tensor::from_vec(ids, (1, SEQUENCE_LEN), device)?;
    let logits: Vec<f32> = model.net.forward(&input, false)?.squeeze(0)?.to_vec1()?;

    let probs = softmax(&logits);
    let (best, confidence) = argmax(&probs);
    let intent = model.intents[best].clone();

    let all_probabilities = model
        .intents
        .iter()
        .zip(&probs)
        .map(|(name, &probability)| IntentScore {
            intent: name.clone(),
            probability,
        })
        .collect();

    let response = pick_response(
        model
            .responses
            .get(&intent)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
    );

    Ok(Prediction {
        intent,
        confidence,
        response,
        all_probabilities,
    })
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

fn argmax(probs: &[f32]) -> (usize, f32) {
    let mut best = 0usize;
    let mut best_p = f32::NEG_INFINITY;
    for (i, &p) in probs.iter().enumerate() {
        if p > best_p {
            best_p = p;
            best = i;
        }
    }
    (best, best_p)
}

fn pick_response(responses: &[String]) -> String {
    let mut rng = rand::thread_rng();
    if responses.is_empty() {
        return FALLBACK_RESPONSES[rng.gen_range(0..FALLBACK_RESPONSES.len())].to_string();
    }
    responses[rng.gen_range(0..responses.len())].clone()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{write_bundle, MetadataDoc, BUNDLE_VERSION};
    use crate::network::{IntentNet, Topology};
    use crate::store::MemBundleStore;
    use candle_nn::VarMap;

    fn seeded_store(vocab: &[&str], intents: &[&str]) -> MemBundleStore {
        let device = Device::Cpu;
        let vocabulary: HashMap<String, u32> = vocab
            .iter()
            .enumerate()
            .map(|(i, t)| (t.to_string(), i as u32 + 1))
            .collect();
        let responses: HashMap<String, Vec<String>> = intents
            .iter()
            .map(|i| (i.to_string(), vec![format!("response for {i}")]))
            .collect();
        let metadata = MetadataDoc {
            vocabulary,
            intents: intents.iter().map(|s| s.to_string()).collect(),
            responses,
            version: BUNDLE_VERSION.to_string(),
        };
        let topology = Topology::for_model(vocab.len(), intents.len());
        let varmap = VarMap::new();
        let _net = IntentNet::build(&topology, &varmap, &device).unwrap();
        let store = MemBundleStore::new();
        write_bundle(&store, &topology, &varmap, &metadata).unwrap();
        store
    }

    #[test]
    fn test_normalize_strips_and_collapses() {
        assert_eq!(normalize("  Hello,   THERE!  "), "hello there");
        assert_eq!(normalize("what?is. this"), "whatis this");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_featurize_unigrams_then_bigrams() {
        let mut vocabulary = HashMap::new();
        vocabulary.insert("hello".to_string(), 1);
        vocabulary.insert("there".to_string(), 2);

        let ids = featurize("hello unknownword", &vocabulary);
        assert_eq!(ids.len(), SEQUENCE_LEN);
        // unigrams [hello, unknownword] then the bigram "hello unknownword",
        // everything unseen mapping to 0, zero-padded to 20.
        assert_eq!(&ids[..3], &[1, 0, 0]);
        assert!(ids[3..].iter().all(|&id| id == 0));
    }

    #[test]
    fn test_featurize_known_bigram() {
        let mut vocabulary = HashMap::new();
        vocabulary.insert("hello".to_string(), 1);
        vocabulary.insert("there".to_string(), 2);
        vocabulary.insert("hello there".to_string(), 3);

        let ids = featurize("Hello there!", &vocabulary);
        assert_eq!(&ids[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_featurize_honors_explicit_unknown_token() {
        let mut vocabulary = HashMap::new();
        vocabulary.insert("hello".to_string(), 1);
        vocabulary.insert(UNKNOWN_TOKEN.to_string(), 9);

        let ids = featurize("hello mystery", &vocabulary);
        // "mystery" and the bigram both map to the <unk> entry.
        assert_eq!(&ids[..3], &[1, 9, 9]);
    }

    #[test]
    fn test_featurize_empty_text() {
        let ids = featurize("", &HashMap::new());
        assert_eq!(ids, vec![0; SEQUENCE_LEN]);
    }

    #[test]
    fn test_predict_returns_well_formed_result() {
        let store = seeded_store(&["hello", "bill", "pay"], &["greeting", "pay_bill"]);
        let engine = IntentEngine::new(store, Device::Cpu);

        let prediction = engine.predict("hello").unwrap();
        assert!(["greeting", "pay_bill"].contains(&prediction.intent.as_str()));
        assert!((0.0..=1.0).contains(&prediction.confidence));
        assert!(!prediction.response.is_empty());
        assert_eq!(prediction.all_probabilities.len(), 2);
        assert_eq!(prediction.all_probabilities[0].intent, "greeting");
        let sum: f32 = prediction
            .all_probabilities
            .iter()
            .map(|s| s.probability)
            .sum();
        assert!((sum - 1.0).abs() < 1e-4, "probabilities must sum to 1, got {sum}");
    }

    #[test]
    fn test_predict_empty_query_is_legal() {
        let store = seeded_store(&["hello"], &["greeting"]);
        let engine = IntentEngine::new(store, Device::Cpu);

        let prediction = engine.predict("").unwrap();
        assert!((0.0..=1.0).contains(&prediction.confidence));
        assert!(!prediction.response.is_empty());
    }

    #[test]
    fn test_fallback_response_when_intent_has_none() {
        let picked = pick_response(&[]);
        assert!(FALLBACK_RESPONSES.contains(&picked.as_str()));
    }

    #[test]
    fn test_cached_before_any_load_is_model_not_loaded() {
        let engine = IntentEngine::new(MemBundleStore::new(), Device::Cpu);
        let err = engine.cached().unwrap_err();
        assert!(matches!(err, EngineError::ModelNotLoaded));
    }

    #[test]
    fn test_predict_on_empty_store_propagates_bundle_missing() {
        let engine = IntentEngine::new(MemBundleStore::new(), Device::Cpu);
        let err = engine.predict("hello").unwrap_err();
        assert!(matches!(err, EngineError::BundleMissing(_)));
    }

    #[test]
    fn test_respond_degrades_to_apology() {
        let engine = IntentEngine::new(MemBundleStore::new(), Device::Cpu);
        assert_eq!(engine.respond("hello"), APOLOGY);
    }

    #[test]
    fn test_preload_is_idempotent_and_shares_the_model() {
        let store = seeded_store(&["hello"], &["greeting"]);
        let engine = IntentEngine::new(store, Device::Cpu);

        engine.preload().unwrap();
        engine.preload().unwrap();
        let a = engine.cached().unwrap();
        let b = engine.cached().unwrap();
        assert!(Arc::ptr_eq(&a, &b), "both callers must see one model");
    }

    #[test]
    fn test_reload_swaps_the_cached_model() {
        let store = seeded_store(&["hello"], &["greeting"]);
        let engine = IntentEngine::new(store, Device::Cpu);

        engine.preload().unwrap();
        let before = engine.cached().unwrap();
        engine.reload().unwrap();
        let after = engine.cached().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }
}
