// Text vectorization for intent training.
//
// Turns raw labeled patterns into an augmented, padded integer corpus plus
// the vocabulary that encodes it. Augmentation perturbs each pattern three
// ways (typo, word dropout, synonym) so the tiny hand-written corpus covers
// more of what residents actually type.

use std::collections::HashMap;

/// Every encoded pattern is exactly this many token ids; shorter inputs are
/// right-padded with 0, longer ones truncated.
pub const SEQUENCE_LEN: usize = 20;

// ---------------------------------------------------------------------------
// Deterministic RNG
// ---------------------------------------------------------------------------

/// Small LCG so augmentation and shuffling are reproducible under a seed.
pub struct SimpleRng(u64);

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0
    }

    pub fn next_usize(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }

    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

// ---------------------------------------------------------------------------
// Augmentation tables
// ---------------------------------------------------------------------------

// Misspellings residents commonly produce for municipal-services words.
static MISSPELLINGS: &[(&str, &[&str])] = &[
    ("account", &["acount", "accont"]),
    ("address", &["adress", "addres"]),
    ("balance", &["balence", "ballance"]),
    ("garbage", &["garbge", "garbadge"]),
    ("invoice", &["invioce"]),
    ("password", &["pasword", "passwrd"]),
    ("payment", &["payement", "paymet"]),
    ("please", &["plese", "pls"]),
    ("receive", &["recieve"]),
    ("schedule", &["schedual", "shedule"]),
    ("statement", &["statment"]),
    ("upload", &["uplaod"]),
];

static SYNONYMS: &[(&str, &[&str])] = &[
    ("account", &["profile"]),
    ("bill", &["invoice", "charge"]),
    ("change", &["update", "modify"]),
    ("hello", &["hi", "hey"]),
    ("help", &["assist", "support"]),
    ("pay", &["settle"]),
    ("problem", &["issue", "trouble"]),
    ("show", &["display", "view"]),
    ("statement", &["summary"]),
    ("upload", &["submit", "send"]),
];

const WORD_DROPOUT_RATE: f64 = 0.2;

fn table_lookup<'a>(table: &'a [(&str, &[&str])], word: &str) -> Option<&'a [&'a str]> {
    table
        .iter()
        .find(|(key, _)| *key == word)
        .map(|(_, subs)| *subs)
}

/// Replace each word found in `table` with a randomly chosen substitute;
/// words absent from the table pass through unchanged.
fn substitute(pattern: &str, table: &[(&str, &[&str])], rng: &mut SimpleRng) -> String {
    pattern
        .split_whitespace()
        .map(|word| match table_lookup(table, word) {
            Some(subs) => subs[rng.next_usize(subs.len())].to_string(),
            None => word.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drop each word independently with probability 0.2. Patterns of two or
/// fewer words come back untouched. Dropping every word yields an empty
/// string, which downstream encoding tolerates.
fn drop_words(pattern: &str, rng: &mut SimpleRng) -> String {
    let words: Vec<&str> = pattern.split_whitespace().collect();
    if words.len() <= 2 {
        return pattern.to_string();
    }
    words
        .into_iter()
        .filter(|_| rng.next_f64() >= WORD_DROPOUT_RATE)
        .collect::<Vec<_>>()
        .join(" ")
}

/// The lower-cased original plus its typo, dropout, and synonym variants.
/// Variants that collapse back onto an already-emitted string are dropped.
pub fn augment(pattern: &str, rng: &mut SimpleRng) -> Vec<String> {
    let original = pattern.to_lowercase();
    let mut variants = vec![original.clone()];
    for variant in [
        substitute(&original, MISSPELLINGS, rng),
        drop_words(&original, rng),
        substitute(&original, SYNONYMS, rng),
    ] {
        if !variants.contains(&variant) {
            variants.push(variant);
        }
    }
    variants
}

// ---------------------------------------------------------------------------
// Corpus construction
// ---------------------------------------------------------------------------

/// The vectorized training corpus: parallel sequences/labels, the
/// vocabulary that produced them, and the intent list labels index into.
pub struct Corpus {
    pub sequences: Vec<Vec<u32>>,
    pub labels: Vec<u32>,
    pub vocabulary: HashMap<String, u32>,
    pub intents: Vec<String>,
}

/// Build the augmented corpus from `(pattern, intent)` examples.
///
/// Vocabulary ids start at 1 in first-encounter order; 0 stays reserved for
/// padding and unknown tokens. Intents are collected in first-encounter
/// order and each label is the intent's position in that list. Empty input
/// yields empty output; rejecting that is the trainer's job.
pub fn build_corpus(examples: &[(String, String)], rng: &mut SimpleRng) -> Corpus {
    let mut emitted: Vec<(String, String)> = Vec::new();
    for (pattern, intent) in examples {
        for variant in augment(pattern, rng) {
            emitted.push((variant, intent.clone()));
        }
    }

    let mut vocabulary: HashMap<String, u32> = HashMap::new();
    for (text, _) in &emitted {
        for token in text.split_whitespace() {
            if !vocabulary.contains_key(token) {
                let next = vocabulary.len() as u32 + 1;
                vocabulary.insert(token.to_string(), next);
            }
        }
    }

    let mut intents: Vec<String> = Vec::new();
    let mut labels = Vec::with_capacity(emitted.len());
    let mut sequences = Vec::with_capacity(emitted.len());
    for (text, intent) in &emitted {
        let class = match intents.iter().position(|known| known == intent) {
            Some(idx) => idx,
            None => {
                intents.push(intent.clone());
                intents.len() - 1
            }
        };
        labels.push(class as u32);
        sequences.push(encode_sequence(text, &vocabulary));
    }

    Corpus {
        sequences,
        labels,
        vocabulary,
        intents,
    }
}

/// Encode one pattern as exactly `SEQUENCE_LEN` vocabulary ids, 0 for
/// unknown tokens, right-padded with 0.
pub fn encode_sequence(text: &str, vocabulary: &HashMap<String, u32>) -> Vec<u32> {
    let mut ids: Vec<u32> = text
        .split_whitespace()
        .map(|token| vocabulary.get(token).copied().unwrap_or(0))
        .take(SEQUENCE_LEN)
        .collect();
    ids.resize(SEQUENCE_LEN, 0);
    ids
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_augment_keeps_lowercased_original_once() {
        let mut rng = SimpleRng::new(7);
        let variants = augment("Check My Account Balance", &mut rng);
        assert_eq!(variants[0], "check my account balance");
        let originals = variants
            .iter()
            .filter(|v| *v == "check my account balance")
            .count();
        assert_eq!(originals, 1, "original must appear exactly once");
    }

    #[test]
    fn test_dropout_short_pattern_unchanged() {
        let mut rng = SimpleRng::new(7);
        assert_eq!(drop_words("hello there", &mut rng), "hello there");
        assert_eq!(drop_words("hello", &mut rng), "hello");
    }

    #[test]
    fn test_dropout_can_empty_long_pattern() {
        // Scan seeds until every word of a 4-word pattern is dropped; the
        // LCG makes this deterministic and quick. An empty variant is legal
        // and must encode to an all-zero sequence.
        let saw_empty = (0..10_000u64).any(|seed| {
            let mut rng = SimpleRng::new(seed);
            drop_words("pay my water bill", &mut rng).is_empty()
        });
        assert!(saw_empty, "an all-dropped pattern must be reachable");
        assert_eq!(encode_sequence("", &HashMap::new()), vec![0; SEQUENCE_LEN]);
    }

    #[test]
    fn test_typo_substitution_uses_table() {
        let mut rng = SimpleRng::new(3);
        let variant = substitute("my account balance", MISSPELLINGS, &mut rng);
        let words: Vec<&str> = variant.split_whitespace().collect();
        assert_eq!(words[0], "my");
        assert!(["acount", "accont"].contains(&words[1]));
        assert!(["balence", "ballance"].contains(&words[2]));
    }

    #[test]
    fn test_build_corpus_single_intent() {
        let mut rng = SimpleRng::new(42);
        let examples = vec![
            ("hello".to_string(), "greeting".to_string()),
            ("hi".to_string(), "greeting".to_string()),
        ];
        let corpus = build_corpus(&examples, &mut rng);
        assert_eq!(corpus.intents, vec!["greeting".to_string()]);
        assert!(corpus.labels.iter().all(|&label| label == 0));
        for seq in &corpus.sequences {
            assert_eq!(seq.len(), SEQUENCE_LEN);
        }
    }

    #[test]
    fn test_vocabulary_ids_unique_and_positive() {
        let mut rng = SimpleRng::new(42);
        let examples = vec![
            ("pay my water bill".to_string(), "pay_bill".to_string()),
            ("show my statement".to_string(), "view_statement".to_string()),
        ];
        let corpus = build_corpus(&examples, &mut rng);

        let mut seen = std::collections::HashSet::new();
        for (token, &id) in &corpus.vocabulary {
            assert!(id > 0, "token '{token}' got reserved id 0");
            assert!(seen.insert(id), "id {id} assigned twice");
        }
        assert_eq!(seen.len(), corpus.vocabulary.len());
    }

    #[test]
    fn test_vocabulary_first_encounter_order() {
        let mut rng = SimpleRng::new(1);
        let examples = vec![("report a problem".to_string(), "report_issue".to_string())];
        let corpus = build_corpus(&examples, &mut rng);
        // The first emitted variant is always the lower-cased original, so
        // its tokens claim the first ids.
        assert_eq!(corpus.vocabulary.get("report"), Some(&1));
        assert_eq!(corpus.vocabulary.get("a"), Some(&2));
        assert_eq!(corpus.vocabulary.get("problem"), Some(&3));
    }

    #[test]
    fn test_build_corpus_empty_input() {
        let mut rng = SimpleRng::new(1);
        let corpus = build_corpus(&[], &mut rng);
        assert!(corpus.sequences.is_empty());
        assert!(corpus.vocabulary.is_empty());
        assert!(corpus.intents.is_empty());
    }

    #[test]
    fn test_encode_sequence_truncates() {
        let mut vocabulary = HashMap::new();
        vocabulary.insert("w".to_string(), 1);
        let long = vec!["w"; 30].join(" ");
        let seq = encode_sequence(&long, &vocabulary);
        assert_eq!(seq.len(), SEQUENCE_LEN);
        assert!(seq.iter().all(|&id| id == 1));
    }
}
