// src/captcha.rs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CaptchaConfig;

const ASSESSMENT_URL_BASE: &str = "https://recaptchaenterprise.googleapis.com/v1/projects";
const MIN_SCORE: f32 = 0.5;

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("assessment request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("assessment rejected: {0}")]
    Rejected(&'static str),
}

/// Seam between the HTTP handlers and the external assessment service, so
/// `--test` mode can swap the whole gateway out.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    /// Accepts iff the token is valid, was produced by `expected_action`, and
    /// scores at least the risk threshold.
    async fn verify(&self, client_token: &str, expected_action: &str) -> Result<(), CaptchaError>;
}

pub struct RecaptchaEnterprise {
    http: reqwest::Client,
    config: CaptchaConfig,
}

impl RecaptchaEnterprise {
    pub fn new(config: CaptchaConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[derive(Serialize)]
struct AssessmentEvent<'a> {
    token: &'a str,
    #[serde(rename = "siteKey")]
    site_key: &'a str,
    #[serde(rename = "expectedAction")]
    expected_action: &'a str,
}

#[derive(Serialize)]
struct AssessmentRequest<'a> {
    event: AssessmentEvent<'a>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TokenProperties {
    valid: bool,
    action: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RiskAnalysis {
    score: f32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AssessmentResponse {
    #[serde(rename = "tokenProperties")]
    token_properties: TokenProperties,
    #[serde(rename = "riskAnalysis")]
    risk_analysis: RiskAnalysis,
}

fn evaluate(assessment: &AssessmentResponse, expected_action: &str) -> Result<(), CaptchaError> {
    if !assessment.token_properties.valid {
        return Err(CaptchaError::Rejected("token invalid"));
    }
    if assessment.token_properties.action != expected_action {
        return Err(CaptchaError::Rejected("action mismatch"));
    }
    if assessment.risk_analysis.score < MIN_SCORE {
        return Err(CaptchaError::Rejected("score below threshold"));
    }
    Ok(())
}

#[async_trait]
impl CaptchaVerifier for RecaptchaEnterprise {
    async fn verify(&self, client_token: &str, expected_action: &str) -> Result<(), CaptchaError> {
        let url = format!(
            "{}/{}/assessments?key={}",
            ASSESSMENT_URL_BASE, self.config.project_id, self.config.api_key
        );
        let request = AssessmentRequest {
            event: AssessmentEvent {
                token: client_token,
                site_key: &self.config.site_key,
                expected_action,
            },
        };

        let response = self.http.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error body".to_string());
            tracing::error!(
                http.status = %status,
                error.body = %error_body,
                "Captcha assessment call failed"
            );
            return Err(CaptchaError::Rejected("assessment service error"));
        }

        let assessment = response.json::<AssessmentResponse>().await?;
        tracing::debug!(
            captcha.valid = assessment.token_properties.valid,
            captcha.action = %assessment.token_properties.action,
            captcha.score = assessment.risk_analysis.score,
            "Captcha assessment received"
        );
        evaluate(&assessment, expected_action)
    }
}

/// Used with `--test`: every token passes.
pub struct CaptchaDisabled;

#[async_trait]
impl CaptchaVerifier for CaptchaDisabled {
    async fn verify(&self, _client_token: &str, _expected_action: &str) -> Result<(), CaptchaError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessment(valid: bool, action: &str, score: f32) -> AssessmentResponse {
        AssessmentResponse {
            token_properties: TokenProperties {
                valid,
                action: action.to_string(),
            },
            risk_analysis: RiskAnalysis { score },
        }
    }

    #[test]
    fn accepts_valid_matching_high_score() {
        assert!(evaluate(&assessment(true, "public", 0.9), "public").is_ok());
        assert!(evaluate(&assessment(true, "private", 0.5), "private").is_ok());
    }

    #[test]
    fn rejects_invalid_token() {
        assert!(evaluate(&assessment(false, "public", 0.9), "public").is_err());
    }

    #[test]
    fn rejects_action_mismatch() {
        assert!(evaluate(&assessment(true, "private", 0.9), "public").is_err());
    }

    #[test]
    fn rejects_low_score() {
        assert!(evaluate(&assessment(true, "public", 0.3), "public").is_err());
    }

    #[test]
    fn parses_assessment_wire_format() {
        let body = r#"{
            "tokenProperties": { "valid": true, "action": "public", "hostname": "example.org" },
            "riskAnalysis": { "score": 0.7, "reasons": [] },
            "name": "projects/demo/assessments/1234"
        }"#;
        let assessment: AssessmentResponse =
            serde_json::from_str(body).expect("assessment should parse");
        assert!(assessment.token_properties.valid);
        assert_eq!(assessment.token_properties.action, "public");
        assert!(evaluate(&assessment, "public").is_ok());
    }

    #[tokio::test]
    async fn disabled_verifier_accepts_anything() {
        assert!(CaptchaDisabled.verify("", "public").await.is_ok());
        assert!(CaptchaDisabled.verify("junk", "whatever").await.is_ok());
    }
}
