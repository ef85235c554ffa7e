// src/services/classifier.rs
use async_trait::async_trait;
use lazy_static::lazy_static;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

use crate::models::skin_check::DiseaseInfo;

/// The seven lesion classes the inference model distinguishes.
pub const CLASS_LABELS: [&str; 7] = ["AKIEC", "BCC", "BKL", "DF", "MEL", "NV", "VASC"];

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Inference request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Inference service error: {0}")]
    Service(String),
    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("Inference service returned no predictions")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub disease_type: String,
    pub confidence: f64,
    pub predictions: BTreeMap<String, f64>,
}

impl Classification {
    /// Picks the most probable label. Ties resolve to the label first in
    /// alphabetical order.
    pub fn from_predictions(predictions: BTreeMap<String, f64>) -> Result<Self, ClassifierError> {
        let (label, confidence) = predictions
            .iter()
            .fold(None::<(&String, f64)>, |best, (label, &p)| match best {
                Some((_, best_p)) if best_p >= p => best,
                _ => Some((label, p)),
            })
            .ok_or(ClassifierError::Empty)?;

        Ok(Self {
            disease_type: label.clone(),
            confidence,
            predictions: predictions.clone(),
        })
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image_path: &Path) -> Result<Classification, ClassifierError>;
}

#[derive(Deserialize)]
struct InferenceResponse {
    predictions: BTreeMap<String, f64>,
}

/// Talks to an external inference service that accepts a multipart `file`
/// and answers with `{"predictions": {label: probability}}`.
#[derive(Debug, Clone)]
pub struct RemoteClassifier {
    client: Client,
    url: String,
}

impl RemoteClassifier {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Classifier for RemoteClassifier {
    async fn classify(&self, image_path: &Path) -> Result<Classification, ClassifierError> {
        let bytes = tokio::fs::read(image_path).await?;
        let file_name = image_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image")
            .to_string();

        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(file_name));

        let response = self.client.post(&self.url).multipart(form).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Service(format!("{}: {}", status, body)));
        }

        let body: InferenceResponse = response.json().await?;
        let predictions = body
            .predictions
            .into_iter()
            .filter(|(label, _)| CLASS_LABELS.contains(&label.as_str()))
            .collect();
        Classification::from_predictions(predictions)
    }
}

lazy_static! {
    static ref DISEASE_INFO: HashMap<&'static str, DiseaseInfo> = {
        let entries = [
            ("AKIEC", "Actinic Keratoses / Intraepithelial Carcinoma", "pre-cancerous",
             "Pre-cancerous scaly patches caused by sun damage. Can develop into squamous cell carcinoma if untreated.",
             "Consult a dermatologist for evaluation and treatment options."),
            ("BCC", "Basal Cell Carcinoma", "cancer",
             "The most common type of skin cancer. Usually appears as a pearly or waxy bump, or a flat flesh-colored lesion.",
             "Seek medical attention. Early treatment is highly effective."),
            ("BKL", "Benign Keratosis", "benign",
             "Non-cancerous skin growths including seborrheic keratoses, solar lentigines, and lichen planus-like keratoses.",
             "Generally harmless. Monitor for any changes."),
            ("DF", "Dermatofibroma", "benign",
             "A common benign skin growth that usually appears on the legs. Feels like a hard lump under the skin.",
             "Typically no treatment needed unless bothersome."),
            ("MEL", "Melanoma", "serious-cancer",
             "The most serious type of skin cancer. Develops from pigment-producing cells (melanocytes).",
             "Seek immediate medical attention. Early detection is critical for successful treatment."),
            ("NV", "Melanocytic Nevi", "benign",
             "Common moles. Benign growths of melanocytes that appear as brown or black spots on the skin.",
             "Monitor for changes in size, shape, or color using the ABCDE rule."),
            ("VASC", "Vascular Lesions", "benign",
             "Lesions related to blood vessels, including cherry angiomas, angiokeratomas, and pyogenic granulomas.",
             "Usually benign. Consult if bleeding or changing."),
        ];

        entries
            .into_iter()
            .map(|(label, name, severity, description, recommendation)| {
                (
                    label,
                    DiseaseInfo {
                        name: name.to_string(),
                        severity: severity.to_string(),
                        description: description.to_string(),
                        recommendation: recommendation.to_string(),
                    },
                )
            })
            .collect()
    };
}

/// Static information for a label; unknown labels get a generic entry.
pub fn disease_info(label: &str) -> DiseaseInfo {
    DISEASE_INFO.get(label).cloned().unwrap_or_else(|| DiseaseInfo {
        name: "Unknown".to_string(),
        severity: "unknown".to_string(),
        description: "Unknown condition".to_string(),
        recommendation: "Consult a dermatologist for proper evaluation.".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preds(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(l, p)| (l.to_string(), *p)).collect()
    }

    #[test]
    fn test_top_prediction_wins() {
        let c = Classification::from_predictions(preds(&[("BCC", 0.1), ("MEL", 0.7), ("NV", 0.2)])).unwrap();
        assert_eq!(c.disease_type, "MEL");
        assert!((c.confidence - 0.7).abs() < f64::EPSILON);
        assert_eq!(c.predictions.len(), 3);
    }

    #[test]
    fn test_empty_predictions_are_an_error() {
        assert!(matches!(
            Classification::from_predictions(BTreeMap::new()),
            Err(ClassifierError::Empty)
        ));
    }

    #[test]
    fn test_every_label_has_disease_info() {
        for label in CLASS_LABELS {
            assert_ne!(disease_info(label).name, "Unknown", "missing info for {}", label);
        }
        assert_eq!(disease_info("XYZ").severity, "unknown");
    }

    #[tokio::test]
    async fn test_remote_classifier_ignores_unknown_labels() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "predictions": {"NV": 0.6, "BKL": 0.3, "OTHER": 0.9}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("mole.png");
        std::fs::write(&image, b"\x89PNG....").unwrap();

        let classifier = RemoteClassifier::new(server.uri());
        let result = classifier.classify(&image).await.unwrap();
        assert_eq!(result.disease_type, "NV");
        assert!(!result.predictions.contains_key("OTHER"));
    }
}
