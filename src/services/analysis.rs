// src/services/analysis.rs
//! Background classification of uploaded skin check images.
//!
//! Status moves pending → processing → processed, or → failed on any error.

use std::sync::Arc;
use uuid::Uuid;

use crate::gemini_client::{Content, GenerateContentRequest, GenerationConfig, GeminiClient};
use crate::models::skin_check::{AnalysisStatus, DiseaseInfo};
use crate::prompts;
use crate::services::classifier::{disease_info, Classification};
use crate::AppState;

/// Spawns classification for a freshly uploaded image.
pub fn spawn_analysis(state: Arc<AppState>, image_id: Uuid) {
    tokio::spawn(async move {
        if let Err(e) = process_skin_check(&state, image_id).await {
            tracing::error!(image_id = %image_id, error = %e, "skin check processing failed");
            mark_failed(&state, image_id).await;
        }
    });
}

pub async fn process_skin_check(state: &AppState, image_id: Uuid) -> Result<(), String> {
    let relative_path: Option<String> = sqlx::query_scalar("SELECT relative_path FROM skin_checks WHERE id = $1")
        .bind(image_id)
        .fetch_optional(&state.db_pool)
        .await
        .map_err(|e| e.to_string())?;

    let relative_path = match relative_path {
        Some(path) => path,
        None => {
            tracing::warn!(image_id = %image_id, "skin check vanished before processing");
            return Ok(());
        }
    };

    set_status(state, image_id, AnalysisStatus::Processing).await?;
    tracing::info!(image_id = %image_id, "classification started");

    let classifier = state
        .classifier
        .as_ref()
        .ok_or_else(|| "classifier not configured".to_string())?;
    let absolute_path = state
        .storage
        .absolute_path(&relative_path)
        .map_err(|e| format!("image file unavailable: {}", e))?;

    let classification = classifier.classify(&absolute_path).await.map_err(|e| e.to_string())?;
    tracing::info!(
        image_id = %image_id,
        disease_type = %classification.disease_type,
        confidence = classification.confidence,
        "classification finished"
    );

    let base = disease_info(&classification.disease_type);
    let info = match &state.gemini_client {
        Some(gemini) => personalize(gemini, &classification, &base).await.unwrap_or_else(|e| {
            tracing::warn!(image_id = %image_id, error = %e, "personalized info unavailable, using reference text");
            base.clone()
        }),
        None => base.clone(),
    };

    sqlx::query(
        "UPDATE skin_checks
         SET status = $2, disease_type = $3, confidence = $4, predictions = $5,
             description = $6, recommendation = $7, updated_at = NOW()
         WHERE id = $1",
    )
    .bind(image_id)
    .bind(AnalysisStatus::Processed.as_str())
    .bind(&classification.disease_type)
    .bind(classification.confidence)
    .bind(sqlx::types::Json(&classification.predictions))
    .bind(&info.description)
    .bind(&info.recommendation)
    .execute(&state.db_pool)
    .await
    .map_err(|e| e.to_string())?;

    Ok(())
}

async fn set_status(state: &AppState, image_id: Uuid, status: AnalysisStatus) -> Result<(), String> {
    sqlx::query("UPDATE skin_checks SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(image_id)
        .bind(status.as_str())
        .execute(&state.db_pool)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
}

async fn mark_failed(state: &AppState, image_id: Uuid) {
    if let Err(e) = set_status(state, image_id, AnalysisStatus::Failed).await {
        tracing::error!(image_id = %image_id, error = %e, "could not mark skin check as failed");
    }
}

async fn personalize(
    gemini: &GeminiClient,
    classification: &Classification,
    base: &DiseaseInfo,
) -> Result<DiseaseInfo, String> {
    let prompt = prompts::personalized_info_prompt(
        &base.name,
        &classification.disease_type,
        classification.confidence,
        &top_predictions(classification, 3),
        &base.description,
    );
    let request = GenerateContentRequest {
        contents: vec![Content::text(Some("user"), prompt)],
        system_instruction: Some(Content::text(None, prompts::SYSTEM_INSTRUCTIONS)),
        generation_config: Some(GenerationConfig { max_output_tokens: 512 }),
    };

    let text = gemini.generate_text(&request).await.map_err(|e| e.to_string())?;
    parse_personalized(&text, base).ok_or_else(|| "unexpected personalized info format".to_string())
}

/// "MEL 70%, NV 20%, BKL 5%"
pub fn top_predictions(classification: &Classification, n: usize) -> String {
    let mut ranked: Vec<(&String, &f64)> = classification.predictions.iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
        .into_iter()
        .take(n)
        .map(|(label, p)| format!("{} {:.0}%", label, p * 100.0))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reads the `DESCRIPTION:` / `RECOMMENDATION:` lines; both must be present.
pub fn parse_personalized(text: &str, base: &DiseaseInfo) -> Option<DiseaseInfo> {
    let mut description = None;
    let mut recommendation = None;
    for line in text.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("DESCRIPTION:") {
            description = Some(rest.trim().to_string()).filter(|s| !s.is_empty());
        } else if let Some(rest) = line.strip_prefix("RECOMMENDATION:") {
            recommendation = Some(rest.trim().to_string()).filter(|s| !s.is_empty());
        }
    }

    Some(DiseaseInfo {
        description: description?,
        recommendation: recommendation?,
        ..base.clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_personalized_requires_both_lines() {
        let base = disease_info("NV");
        let parsed = parse_personalized(
            "DESCRIPTION: A common mole.\nRECOMMENDATION: Watch for changes.",
            &base,
        )
        .unwrap();
        assert_eq!(parsed.description, "A common mole.");
        assert_eq!(parsed.recommendation, "Watch for changes.");
        assert_eq!(parsed.name, base.name);

        assert!(parse_personalized("DESCRIPTION: only this", &base).is_none());
    }

    #[test]
    fn test_top_predictions_ranked() {
        let predictions: BTreeMap<String, f64> =
            [("BKL", 0.05), ("MEL", 0.7), ("NV", 0.2), ("DF", 0.05)]
                .into_iter()
                .map(|(l, p)| (l.to_string(), p))
                .collect();
        let c = Classification::from_predictions(predictions).unwrap();
        assert_eq!(top_predictions(&c, 2), "MEL 70%, NV 20%");
    }
}
