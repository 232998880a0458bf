use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{HempSegError, Result};

/// Step decay: the rate is multiplied by `factor` every `drop_every` epochs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StepDecayParams")]
pub struct StepDecay {
    init_alpha: f64,
    factor: f64,
    drop_every: usize,
}

#[derive(Deserialize)]
struct StepDecayParams {
    init_alpha: f64,
    factor: f64,
    drop_every: usize,
}

impl TryFrom<StepDecayParams> for StepDecay {
    type Error = HempSegError;

    fn try_from(params: StepDecayParams) -> Result<Self> {
        Self::new(params.init_alpha, params.factor, params.drop_every)
    }
}

impl Default for StepDecay {
    fn default() -> Self {
        Self {
            init_alpha: 0.01,
            factor: 0.25,
            drop_every: 10,
        }
    }
}

impl StepDecay {
    pub fn new(init_alpha: f64, factor: f64, drop_every: usize) -> Result<Self> {
        if drop_every == 0 {
            return Err(HempSegError::validation("drop_every", "must be at least 1"));
        }
        if !init_alpha.is_finite() || !factor.is_finite() {
            return Err(HempSegError::validation(
                "step_decay",
                format!("rate {init_alpha} and factor {factor} must be finite"),
            ));
        }
        Ok(Self {
            init_alpha,
            factor,
            drop_every,
        })
    }

    pub fn init_alpha(&self) -> f64 {
        self.init_alpha
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn drop_every(&self) -> usize {
        self.drop_every
    }

    /// Rate for a 0-based epoch index, as passed by a training loop.
    pub fn learning_rate(&self, index: usize) -> f64 {
        let exponent = (1 + index) / self.drop_every;
        let alpha = self.init_alpha * self.factor.powi(exponent as i32);
        info!("Learning Rate: {alpha}");
        alpha
    }

    /// Rate for a 1-based epoch number.
    pub fn learning_rate_for_epoch(&self, epoch: usize) -> f64 {
        self.learning_rate(epoch.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_index_form() {
        let decay = StepDecay::default();
        assert!(close(decay.learning_rate(0), 0.01));
        assert!(close(decay.learning_rate(8), 0.01));
        assert!(close(decay.learning_rate(9), 0.0025));
        assert!(close(decay.learning_rate(19), 0.000625));
    }

    #[test]
    fn test_epoch_form() {
        let decay = StepDecay::default();
        assert!(close(decay.learning_rate_for_epoch(1), 0.01));
        assert!(close(decay.learning_rate_for_epoch(9), 0.01));
        assert!(close(decay.learning_rate_for_epoch(10), 0.0025));
    }

    #[test]
    fn test_zero_drop_every_rejected() {
        assert!(StepDecay::new(0.01, 0.25, 0).is_err());
        assert_eq!(StepDecay::new(0.01, 0.25, 10).ok(), Some(StepDecay::default()));
    }

    #[test]
    fn test_deserialize_validates() {
        let decay: StepDecay =
            serde_json::from_str(r#"{"init_alpha": 0.01, "factor": 0.25, "drop_every": 10}"#).unwrap();
        assert_eq!(decay, StepDecay::default());

        let zero = serde_json::from_str::<StepDecay>(
            r#"{"init_alpha": 0.01, "factor": 0.25, "drop_every": 0}"#,
        );
        assert!(zero.is_err());
    }

    #[test]
    fn test_learning_rate_is_logged() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || LogSink(Arc::clone(&sink)))
            .finish();

        let rate = tracing::subscriber::with_default(subscriber, || {
            StepDecay::default().learning_rate(9)
        });
        assert!(close(rate, 0.0025));

        let output = String::from_utf8(captured.lock().clone()).unwrap();
        assert!(output.contains("Learning Rate: 0.0025"));
    }

    struct LogSink(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
