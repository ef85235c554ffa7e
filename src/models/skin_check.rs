use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl AnalysisStatus {
    /// Processed and failed results never change again on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Processed | AnalysisStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Processed => "processed",
            AnalysisStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(AnalysisStatus::Pending),
            "processing" => Some(AnalysisStatus::Processing),
            "processed" => Some(AnalysisStatus::Processed),
            "failed" => Some(AnalysisStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiseaseInfo {
    pub name: String,
    pub severity: String,
    pub description: String,
    pub recommendation: String,
}

/// Row of the `skin_checks` table.
#[derive(Debug, Clone, FromRow)]
pub struct SkinCheck {
    pub id: Uuid,
    pub user_id: Uuid,
    pub relative_path: String,
    pub status: String,
    pub disease_type: Option<String>,
    pub body_part: Option<String>,
    pub confidence: Option<f64>,
    pub predictions: Option<sqlx::types::Json<BTreeMap<String, f64>>>,
    pub description: Option<String>,
    pub recommendation: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// A skin check as the API exposes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: String,
    pub status: AnalysisStatus,
    #[serde(default)]
    pub body_part: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub disease_type: Option<String>,
    #[serde(default)]
    pub disease_info: Option<DiseaseInfo>,
    #[serde(default)]
    pub predictions: BTreeMap<String, f64>,
    pub image_path: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkinCheckUpdate {
    #[serde(default)]
    pub status: Option<AnalysisStatus>,
    #[serde(default)]
    pub disease_type: Option<String>,
}

impl From<SkinCheck> for AnalysisResult {
    fn from(row: SkinCheck) -> Self {
        let status = AnalysisStatus::parse(&row.status).unwrap_or(AnalysisStatus::Failed);
        let disease_info = row.disease_type.as_deref().map(|label| {
            let base = crate::services::classifier::disease_info(label);
            DiseaseInfo {
                description: row.description.clone().unwrap_or(base.description),
                recommendation: row.recommendation.clone().unwrap_or(base.recommendation),
                ..base
            }
        });

        AnalysisResult {
            id: row.id.to_string(),
            status,
            body_part: row.body_part,
            created_at: row.created_at,
            confidence: row.confidence,
            disease_type: row.disease_type,
            disease_info,
            predictions: row.predictions.map(|p| p.0).unwrap_or_default(),
            image_url: Some(crate::storage::image_url(&row.relative_path)),
            image_path: row.relative_path,
        }
    }
}
