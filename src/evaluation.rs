use std::fmt;

use num_traits::ToPrimitive;

/// Summary accuracy statistics for one output variable, computed on host
/// memory after predictions and targets have left the device.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalStats {
    pub mse: f64,
    pub rmse: f64,
    pub mae: f64,
    pub bias: f64,
}

impl fmt::Display for EvalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mse={:.6} rmse={:.6} mae={:.6} bias={:.6}",
            self.mse, self.rmse, self.mae, self.bias
        )
    }
}

/// Paired-array accuracy measures. Callers are responsible for shape
/// agreement; both slices are consumed element-wise in order.
pub fn evaluate_preds<T: ToPrimitive>(targets: &[T], preds: &[T]) -> EvalStats {
    debug_assert_eq!(targets.len(), preds.len());
    let n = targets.len() as f64;

    let mut sq_sum = 0.0;
    let mut abs_sum = 0.0;
    let mut err_sum = 0.0;
    for (t, p) in targets.iter().zip(preds.iter()) {
        let t = t.to_f64().expect("target converts to f64");
        let p = p.to_f64().expect("pred converts to f64");
        let err = p - t;
        sq_sum += err * err;
        abs_sum += err.abs();
        err_sum += err;
    }

    let mse = sq_sum / n;
    EvalStats {
        mse,
        rmse: mse.sqrt(),
        mae: abs_sum / n,
        bias: err_sum / n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_predictions_give_zero_error() {
        let values = [1.0f32, 2.0, 3.0, 4.0];
        let stats = evaluate_preds(&values, &values);
        assert_eq!(stats.mse, 0.0);
        assert_eq!(stats.rmse, 0.0);
        assert_eq!(stats.mae, 0.0);
        assert_eq!(stats.bias, 0.0);
    }

    #[test]
    fn known_errors_match_reference_values() {
        let targets = [0.0f32, 0.0, 0.0, 0.0];
        let preds = [1.0f32, -1.0, 2.0, -2.0];
        let stats = evaluate_preds(&targets, &preds);
        assert!((stats.mse - 2.5).abs() < 1e-9);
        assert!((stats.rmse - 2.5f64.sqrt()).abs() < 1e-9);
        assert!((stats.mae - 1.5).abs() < 1e-9);
        assert!(stats.bias.abs() < 1e-9);
    }

    #[test]
    fn bias_carries_the_error_sign() {
        let targets = [1.0f32, 1.0];
        let preds = [2.0f32, 2.0];
        let stats = evaluate_preds(&targets, &preds);
        assert!((stats.bias - 1.0).abs() < 1e-9);
    }
}
