use ndarray::{Array2, ArrayView2, Axis};

pub trait LossFn {
    fn loss(&self, logits: ArrayView2<f32>, targets: &[usize]) -> f32;
    fn loss_prime(&self, logits: ArrayView2<f32>, targets: &[usize]) -> Array2<f32>;
}

/// Softmax cross entropy over class indices.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossEntropy;

impl CrossEntropy {
    /// Returns a new `CrossEntropy`.
    pub fn new() -> Self {
        Self
    }
}

fn softmax(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut probs = logits.to_owned();

    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }

    probs
}

impl LossFn for CrossEntropy {
    fn loss(&self, logits: ArrayView2<f32>, targets: &[usize]) -> f32 {
        let probs = softmax(logits);
        let n = targets.len().max(1) as f32;

        targets
            .iter()
            .zip(probs.axis_iter(Axis(0)))
            .map(|(&t, row)| row.get(t).map_or(f32::INFINITY, |p| -p.max(f32::MIN_POSITIVE).ln()))
            .sum::<f32>()
            / n
    }

    fn loss_prime(&self, logits: ArrayView2<f32>, targets: &[usize]) -> Array2<f32> {
        let mut grad = softmax(logits);
        let n = targets.len().max(1) as f32;

        for (mut row, &t) in grad.axis_iter_mut(Axis(0)).zip(targets) {
            if let Some(p) = row.get_mut(t) {
                *p -= 1.0;
            }
        }

        grad / n
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn uniform_logits_cost_log_classes() {
        let logits = Array2::zeros((2, 4));
        let loss = CrossEntropy::new().loss(logits.view(), &[0, 3]);
        assert!((loss - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn confident_right_answers_cost_little() {
        let logits = array![[20.0, 0.0], [0.0, 20.0]];
        assert!(CrossEntropy.loss(logits.view(), &[0, 1]) < 1e-6);
        assert!(CrossEntropy.loss(logits.view(), &[1, 0]) > 19.0);
    }

    #[test]
    fn gradient_rows_sum_to_zero() {
        let logits = array![[1.0, 2.0, 3.0], [-1.0, 0.5, 0.0]];
        let grad = CrossEntropy.loss_prime(logits.view(), &[2, 0]);

        for row in grad.axis_iter(Axis(0)) {
            assert!(row.sum().abs() < 1e-6);
        }
        assert!(grad[[0, 2]] < 0.0);
        assert!(grad[[1, 0]] < 0.0);
    }
}
