//! classifier — verification stage of the proposal/verification cascade
//!
//! The trained model is a linear decision function over the LBP descriptor,
//! shipped as a JSON artifact produced by the offline training job:
//!
//! ```json
//! { "weights": [0.12, -0.4, ...], "bias": -0.3 }
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::features::{Descriptor, LBP_BINS};

/// Binary face/non-face decision over a descriptor.
pub trait Classifier: Send + Sync {
    /// `true` when the descriptor is classified as a face.
    fn predict(&self, descriptor: &Descriptor) -> Result<bool>;

    /// Optional signed confidence (e.g. the distance to the hyperplane).
    fn confidence(&self, _descriptor: &Descriptor) -> Option<f64> {
        None
    }
}

/// `sign(w · x + b)` classifier, e.g. a linear SVM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearClassifier {
    weights: Vec<f64>,
    bias: f64,
}

impl LinearClassifier {
    pub fn new(weights: Vec<f64>, bias: f64) -> Result<Self> {
        let model = Self { weights, bias };
        model.validate()?;
        Ok(model)
    }

    /// Load a trained artifact. Any failure here is fatal at startup.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("classifier artifact not found: {}", path.display()))?;
        let model: Self = serde_json::from_str(&text)
            .with_context(|| format!("malformed classifier artifact: {}", path.display()))?;
        model.validate()?;
        info!(path = %path.display(), bias = model.bias, "loaded linear classifier");
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.weights.len() == LBP_BINS,
            "classifier expects {} weights, artifact has {}",
            LBP_BINS,
            self.weights.len()
        );
        ensure!(
            self.weights.iter().all(|w| w.is_finite()) && self.bias.is_finite(),
            "classifier artifact contains non-finite coefficients"
        );
        Ok(())
    }

    /// Signed margin `w · x + b`.
    pub fn decision_function(&self, descriptor: &Descriptor) -> f64 {
        self.weights
            .iter()
            .zip(descriptor.iter())
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.bias
    }
}

impl Classifier for LinearClassifier {
    fn predict(&self, descriptor: &Descriptor) -> Result<bool> {
        Ok(self.decision_function(descriptor) > 0.0)
    }

    fn confidence(&self, descriptor: &Descriptor) -> Option<f64> {
        Some(self.decision_function(descriptor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::lbp_features_gray;
    use image::{GrayImage, Luma};
    use std::io::Write;

    fn flat_descriptor() -> Descriptor {
        lbp_features_gray(&GrayImage::from_pixel(64, 64, Luma([120]))).unwrap()
    }

    #[test]
    fn rejects_wrong_weight_count() {
        assert!(LinearClassifier::new(vec![1.0; 3], 0.0).is_err());
        assert!(LinearClassifier::new(vec![f64::NAN; LBP_BINS], 0.0).is_err());
    }

    #[test]
    fn sign_of_margin_decides() {
        let d = flat_descriptor();
        let positive = LinearClassifier::new(vec![1.0; LBP_BINS], -0.5).unwrap();
        let negative = LinearClassifier::new(vec![1.0; LBP_BINS], -1.5).unwrap();
        assert!(positive.predict(&d).unwrap());
        assert!(!negative.predict(&d).unwrap());
        // weights of 1 sum the normalised histogram
        let margin = positive.confidence(&d).unwrap();
        assert!((margin - 0.5).abs() < 1e-6);
    }

    #[test]
    fn loads_json_artifact() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let weights: Vec<String> = (0..LBP_BINS).map(|i| format!("{}.0", i)).collect();
        write!(file, r#"{{"weights": [{}], "bias": -2.5}}"#, weights.join(",")).unwrap();
        let model = LinearClassifier::load(file.path()).unwrap();
        assert_eq!(model.bias, -2.5);
        assert_eq!(model.weights[25], 25.0);
    }

    #[test]
    fn missing_artifact_is_an_error() {
        let err = LinearClassifier::load("/nonexistent/model.json").unwrap_err();
        assert!(format!("{err:#}").contains("classifier artifact not found"));
    }
}
