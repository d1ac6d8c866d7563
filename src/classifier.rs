//! Linear text classifier for the label trainer.
//!
//! One-vs-rest logistic regression fit by stochastic gradient descent with
//! elastic-net regularization and class-balanced sample weights — one
//! small, explicit model per document, retrained from scratch on every
//! call. Per-class sigmoid scores are normalized into a probability
//! distribution for prediction.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::tfidf::SparseVec;

/// SGD hyperparameters.
#[derive(Debug, Clone, Copy)]
pub struct SgdSettings {
    /// Passes over the shuffled training set.
    pub epochs: usize,
    /// Elastic-net regularization strength.
    pub alpha: f64,
    /// Elastic-net mixing: 1.0 pure l1, 0.0 pure l2.
    pub l1_ratio: f64,
}

const ETA0: f64 = 0.5;

/// A fitted one-vs-rest logistic regression model.
pub struct SgdClassifier {
    classes: Vec<String>,
    /// Per-class weight vectors, indexed by feature.
    weights: Vec<Vec<f64>>,
    intercepts: Vec<f64>,
}

impl SgdClassifier {
    /// Fit on sparse rows with class indices into `classes`.
    ///
    /// Class imbalance is compensated sklearn-style: each sample is
    /// weighted `n / (k * count(class))`.
    pub fn fit(
        rows: &[SparseVec],
        targets: &[usize],
        classes: Vec<String>,
        n_features: usize,
        settings: SgdSettings,
        rng: &mut StdRng,
    ) -> Self {
        let k = classes.len();
        let n = rows.len();

        let mut class_counts = vec![0usize; k];
        for &t in targets {
            class_counts[t] += 1;
        }
        let class_weights: Vec<f64> = class_counts
            .iter()
            .map(|&c| {
                if c == 0 {
                    0.0
                } else {
                    n as f64 / (k as f64 * c as f64)
                }
            })
            .collect();

        let mut weights = vec![vec![0.0f64; n_features]; k];
        let mut intercepts = vec![0.0f64; k];

        let mut order: Vec<usize> = (0..n).collect();
        let mut step: u64 = 0;

        for _ in 0..settings.epochs {
            order.shuffle(rng);
            for &i in &order {
                step += 1;
                // Inverse-scaling learning rate.
                let eta = ETA0 / (1.0 + settings.alpha * ETA0 * step as f64).sqrt();
                let row = &rows[i];

                for c in 0..k {
                    let y = if targets[i] == c { 1.0 } else { 0.0 };
                    let w = &mut weights[c];

                    let mut z = intercepts[c];
                    for &(j, v) in row {
                        z += w[j] * v;
                    }
                    let p = sigmoid(z);
                    let g = (p - y) * class_weights[targets[i]];

                    for &(j, v) in row {
                        let penalty = settings.alpha
                            * (settings.l1_ratio * w[j].signum()
                                + (1.0 - settings.l1_ratio) * w[j]);
                        w[j] -= eta * (g * v + penalty);
                    }
                    intercepts[c] -= eta * g;
                }
            }
        }

        Self {
            classes,
            weights,
            intercepts,
        }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Normalized per-class probabilities for one row, in `classes` order.
    pub fn predict_proba(&self, row: &SparseVec) -> Vec<f64> {
        let mut scores: Vec<f64> = (0..self.classes.len())
            .map(|c| {
                let mut z = self.intercepts[c];
                for &(j, v) in row {
                    z += self.weights[c][j] * v;
                }
                sigmoid(z)
            })
            .collect();

        let total: f64 = scores.iter().sum();
        if total > 0.0 {
            for s in scores.iter_mut() {
                *s /= total;
            }
        } else {
            let uniform = 1.0 / self.classes.len() as f64;
            scores.iter_mut().for_each(|s| *s = uniform);
        }
        scores
    }

    /// Best class index and its probability.
    pub fn predict(&self, row: &SparseVec) -> (usize, f64) {
        let probabilities = self.predict_proba(row);
        let mut best = 0;
        for (c, &p) in probabilities.iter().enumerate() {
            if p > probabilities[best] {
                best = c;
            }
        }
        (best, probabilities[best])
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn settings() -> SgdSettings {
        SgdSettings {
            epochs: 50,
            alpha: 1e-4,
            l1_ratio: 0.15,
        }
    }

    /// Two disjoint one-hot features, one per class.
    fn separable() -> (Vec<SparseVec>, Vec<usize>) {
        let rows = vec![
            vec![(0, 1.0)],
            vec![(0, 1.0)],
            vec![(0, 1.0)],
            vec![(1, 1.0)],
            vec![(1, 1.0)],
            vec![(1, 1.0)],
        ];
        let targets = vec![0, 0, 0, 1, 1, 1];
        (rows, targets)
    }

    #[test]
    fn learns_separable_classes() {
        let (rows, targets) = separable();
        let mut rng = StdRng::seed_from_u64(7);
        let clf = SgdClassifier::fit(
            &rows,
            &targets,
            vec!["a".into(), "b".into()],
            2,
            settings(),
            &mut rng,
        );

        let (class_a, p_a) = clf.predict(&vec![(0, 1.0)]);
        let (class_b, p_b) = clf.predict(&vec![(1, 1.0)]);
        assert_eq!(clf.classes()[class_a], "a");
        assert_eq!(clf.classes()[class_b], "b");
        assert!(p_a > 0.5 && p_b > 0.5);
    }

    #[test]
    fn probabilities_sum_to_one() {
        let (rows, targets) = separable();
        let mut rng = StdRng::seed_from_u64(7);
        let clf = SgdClassifier::fit(
            &rows,
            &targets,
            vec!["a".into(), "b".into()],
            2,
            settings(),
            &mut rng,
        );
        let probabilities = clf.predict_proba(&vec![(0, 0.7), (1, 0.7)]);
        let total: f64 = probabilities.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn deterministic_under_fixed_seed() {
        let (rows, targets) = separable();
        let fit = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            SgdClassifier::fit(
                &rows,
                &targets,
                vec!["a".into(), "b".into()],
                2,
                settings(),
                &mut rng,
            )
        };
        let c1 = fit(42);
        let c2 = fit(42);
        assert_eq!(
            c1.predict_proba(&vec![(0, 1.0)]),
            c2.predict_proba(&vec![(0, 1.0)])
        );
    }

    #[test]
    fn balanced_weights_rescue_minority_class() {
        // 8:1 imbalance on disjoint features; the minority class must
        // still win on its own feature.
        let mut rows: Vec<SparseVec> = Vec::new();
        let mut targets = Vec::new();
        for _ in 0..8 {
            rows.push(vec![(0, 1.0)]);
            targets.push(0);
        }
        rows.push(vec![(1, 1.0)]);
        targets.push(1);

        let mut rng = StdRng::seed_from_u64(3);
        let clf = SgdClassifier::fit(
            &rows,
            &targets,
            vec!["majority".into(), "minority".into()],
            2,
            settings(),
            &mut rng,
        );
        let (class, _) = clf.predict(&vec![(1, 1.0)]);
        assert_eq!(clf.classes()[class], "minority");
    }

    #[test]
    fn empty_row_yields_uniformish_distribution() {
        let (rows, targets) = separable();
        let mut rng = StdRng::seed_from_u64(7);
        let clf = SgdClassifier::fit(
            &rows,
            &targets,
            vec!["a".into(), "b".into()],
            2,
            settings(),
            &mut rng,
        );
        let probabilities = clf.predict_proba(&Vec::new());
        // Intercept-only scores; neither class should dominate strongly.
        assert!(probabilities.iter().all(|&p| p > 0.2 && p < 0.8));
    }
}
