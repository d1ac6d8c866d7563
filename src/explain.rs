//! Prediction Explainer.
//!
//! Brute-force leave-k-out counterfactual search: find the smallest word
//! subsets whose removal from a span flips the classifier's prediction.
//! Exponential in token count but bounded by the size cap, which is
//! acceptable only because spans are short.

use crate::text;

/// Rendered when the search exhausts the size cap without flipping the
/// prediction.
pub const NO_CRITICAL_WORDS: &str = "no critical words found";

/// Find all minimal critical word subsets for a prediction.
///
/// Widening search over stopword-filtered surface words: subset sizes are
/// tried in ascending order (an explicit loop bounded by
/// `max_combination_size`) and the first size producing any
/// prediction-flipping subset wins, so every returned subset is minimal.
/// Each subset is rendered `word1+word2`. An empty result means no
/// critical words were found within the cap.
pub fn critical_words<F>(
    predict: F,
    span_text: &str,
    predicted_label: &str,
    language: &str,
    max_combination_size: usize,
) -> Vec<String>
where
    F: Fn(&str) -> String,
{
    let words = text::surface_words(span_text, language);

    for size in 1..=max_combination_size {
        if size > words.len() {
            break;
        }

        let mut found = Vec::new();
        for combo in combinations(words.len(), size) {
            let remaining: Vec<&str> = words
                .iter()
                .enumerate()
                .filter(|(i, _)| !combo.contains(i))
                .map(|(_, w)| w.as_str())
                .collect();

            if predict(&remaining.join(" ")) != predicted_label {
                found.push(
                    combo
                        .iter()
                        .map(|&i| words[i].as_str())
                        .collect::<Vec<_>>()
                        .join("+"),
                );
            }
        }

        if !found.is_empty() {
            return found;
        }
    }

    Vec::new()
}

/// Render critical-word subsets as the stored explanation string.
pub fn render(subsets: &[String]) -> String {
    if subsets.is_empty() {
        NO_CRITICAL_WORDS.to_string()
    } else {
        subsets.join(", ")
    }
}

/// All k-combinations of `0..n`, lexicographic order.
fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut result = Vec::new();
    if k == 0 || k > n {
        return result;
    }

    let mut indices: Vec<usize> = (0..k).collect();
    loop {
        result.push(indices.clone());

        // Rightmost index that can still advance.
        let mut i = k;
        while i > 0 {
            i -= 1;
            if indices[i] != n - k + i {
                break;
            }
            if i == 0 {
                return result;
            }
        }
        indices[i] += 1;
        for j in i + 1..k {
            indices[j] = indices[j - 1] + 1;
        }
    }
}
