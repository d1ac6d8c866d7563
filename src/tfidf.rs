//! TF-IDF feature extraction for the label trainer.
//!
//! Vocabulary over unigrams and bigrams of stopword-filtered tokens with a
//! document-frequency floor; sublinear term frequency, smoothed inverse
//! document frequency, l2-normalized output vectors.

use std::collections::{HashMap, HashSet};

use crate::stopwords;
use crate::text;

/// Sparse feature vector: (feature index, value) pairs, ascending index.
pub type SparseVec = Vec<(usize, f64)>;

/// Fitted TF-IDF vectorizer.
pub struct TfidfVectorizer {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
    stop: HashSet<&'static str>,
}

impl TfidfVectorizer {
    /// Fit vocabulary and idf weights on the training texts.
    ///
    /// Terms appearing in fewer than `min_df` texts are dropped. The
    /// vocabulary may legitimately end up empty on tiny corpora; transform
    /// then yields empty vectors and the classifier sees only intercepts.
    pub fn fit(texts: &[String], language: &str, min_df: usize) -> Self {
        let stop: HashSet<&'static str> =
            stopwords::for_language(language).iter().copied().collect();

        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        for text in texts {
            let mut seen: HashSet<String> = HashSet::new();
            for feature in extract_features(text, &stop) {
                seen.insert(feature);
            }
            for feature in seen {
                *document_frequency.entry(feature).or_insert(0) += 1;
            }
        }

        let mut kept: Vec<(String, usize)> = document_frequency
            .into_iter()
            .filter(|(_, df)| *df >= min_df)
            .collect();
        // Deterministic feature order regardless of hash iteration.
        kept.sort_by(|a, b| a.0.cmp(&b.0));

        let n = texts.len() as f64;
        let mut vocabulary = HashMap::with_capacity(kept.len());
        let mut idf = Vec::with_capacity(kept.len());
        for (index, (feature, df)) in kept.into_iter().enumerate() {
            vocabulary.insert(feature, index);
            idf.push(((1.0 + n) / (1.0 + df as f64)).ln() + 1.0);
        }

        Self {
            vocabulary,
            idf,
            stop,
        }
    }

    /// Number of features in the fitted vocabulary.
    pub fn n_features(&self) -> usize {
        self.vocabulary.len()
    }

    /// Transform one text into a l2-normalized sparse vector.
    pub fn transform(&self, text: &str) -> SparseVec {
        let mut counts: HashMap<usize, f64> = HashMap::new();
        for feature in extract_features(text, &self.stop) {
            if let Some(&index) = self.vocabulary.get(&feature) {
                *counts.entry(index).or_insert(0.0) += 1.0;
            }
        }

        let mut vec: SparseVec = counts
            .into_iter()
            .map(|(index, tf)| (index, (1.0 + tf.ln()) * self.idf[index]))
            .collect();
        vec.sort_by_key(|(index, _)| *index);

        let norm: f64 = vec.iter().map(|(_, v)| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (_, v) in vec.iter_mut() {
                *v /= norm;
            }
        }
        vec
    }
}

/// Unigrams plus bigrams of stopword-filtered tokens.
fn extract_features(text: &str, stop: &HashSet<&'static str>) -> Vec<String> {
    let tokens: Vec<String> = text::tokenize(text)
        .into_iter()
        .filter(|t| !stop.contains(t.as_str()))
        .collect();

    let mut features = Vec::with_capacity(tokens.len() * 2);
    for window in tokens.windows(2) {
        features.push(format!("{} {}", window[0], window[1]));
    }
    features.extend(tokens);
    features
}
