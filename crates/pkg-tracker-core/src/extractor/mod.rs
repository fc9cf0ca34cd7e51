//! Tracking-number extraction: regex patterns, carrier validation, and the
//! optional LLM augmenter, merged into one ranked candidate list.

pub mod llm;
pub mod patterns;
pub mod preprocess;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::carriers::validation;
use crate::models::CarrierCode;

pub use llm::{HttpLlmExtractor, LlmExtractor};
pub use preprocess::EmailContent;

/// Regex candidates below this confidence trigger the LLM path
const LLM_TRIGGER_CONFIDENCE: f64 = 0.7;

/// Confidence penalty for LLM candidates no carrier format accepts
const FAILED_VALIDATION_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSource {
    Regex,
    Llm,
    Hybrid,
}

/// One ranked extraction result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub tracking_number: String,
    pub carrier: CarrierCode,
    pub description: Option<String>,
    pub merchant: Option<String>,
    pub confidence: f64,
    pub source: CandidateSource,
}

/// The extractor pipeline. The LLM strategy is optional; without it the
/// deterministic regex path stands alone.
pub struct Extractor {
    llm: Option<Arc<dyn LlmExtractor>>,
}

impl Extractor {
    pub fn new() -> Self {
        Self { llm: None }
    }

    pub fn with_llm(llm: Arc<dyn LlmExtractor>) -> Self {
        Self { llm: Some(llm) }
    }

    /// Produce ranked candidates for one decoded email.
    pub async fn extract(&self, content: &EmailContent) -> Vec<Candidate> {
        let text = content.effective_text();
        if text.is_empty() && content.subject.is_empty() {
            return Vec::new();
        }

        let hints = patterns::carrier_hints(content, &text);
        let merchant = patterns::merchant_hint(content);

        // Subject lines carry tracking numbers often enough to scan both
        let scan_text = format!("{}\n{}", content.subject, text);
        let raw = patterns::extract(&scan_text, &hints, merchant.as_deref());
        let mut candidates = validate_regex_candidates(raw, &hints);

        if self.should_invoke_llm(content, &candidates) {
            if let Some(llm) = &self.llm {
                match llm.extract(&content.subject, &content.from_address, &text).await {
                    Ok(extraction) => {
                        let llm_candidates =
                            convert_llm_candidates(extraction, merchant.as_deref());
                        candidates = merge(candidates, llm_candidates);
                    }
                    Err(e) => {
                        // Coverage loss only; the regex results stand
                        warn!("LLM augmentation failed: {}", e);
                    }
                }
            }
        }

        patterns::sort_candidates(&mut candidates);
        debug!(candidates = candidates.len(), "extraction complete");
        candidates
    }

    fn should_invoke_llm(&self, content: &EmailContent, regex_candidates: &[Candidate]) -> bool {
        if self.llm.is_none() {
            return false;
        }
        regex_candidates.is_empty()
            || regex_candidates.iter().all(|c| c.confidence < LLM_TRIGGER_CONFIDENCE)
            || content.is_complex()
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply the carrier `Validate` contract to regex candidates: drop numbers no
/// carrier accepts; when several accept, keep the carrier with the strongest
/// hint.
fn validate_regex_candidates(
    raw: Vec<Candidate>,
    hints: &HashMap<CarrierCode, f64>,
) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = Vec::new();
    let mut kept: HashMap<String, usize> = HashMap::new();

    for mut candidate in raw {
        let accepted = validation::accepting_carriers(&candidate.tracking_number);
        if accepted.is_empty() {
            continue;
        }
        if !accepted.contains(&candidate.carrier) {
            continue;
        }

        if accepted.len() > 1 {
            let hint_of = |c: &CarrierCode| hints.get(c).copied().unwrap_or(0.0);
            if let Some(best) = accepted
                .iter()
                .max_by(|a, b| hint_of(a).partial_cmp(&hint_of(b)).unwrap_or(std::cmp::Ordering::Equal))
            {
                if hint_of(best) > hint_of(&candidate.carrier) {
                    candidate.carrier = *best;
                }
            }
        }

        // One entry per number once carriers are resolved
        match kept.get(&candidate.tracking_number) {
            Some(&index) => {
                if candidate.confidence > out[index].confidence {
                    out[index] = candidate;
                }
            }
            None => {
                kept.insert(candidate.tracking_number.clone(), out.len());
                out.push(candidate);
            }
        }
    }

    out
}

fn convert_llm_candidates(
    extraction: llm::LlmExtraction,
    merchant: Option<&str>,
) -> Vec<Candidate> {
    extraction
        .tracking_numbers
        .into_iter()
        .filter_map(|c| {
            let carrier: CarrierCode = c.carrier.parse().ok()?;
            let number = c.number.trim().to_string();
            if number.is_empty() {
                return None;
            }

            // LLM output is re-checked against the carrier formats; failures
            // are kept at halved confidence rather than discarded
            let confidence = if validation::validate(carrier, &number) {
                c.confidence.clamp(0.0, 1.0)
            } else {
                (c.confidence * FAILED_VALIDATION_FACTOR).clamp(0.0, 1.0)
            };

            Some(Candidate {
                tracking_number: number,
                carrier,
                description: c.description.filter(|d| !d.trim().is_empty()),
                merchant: merchant.map(str::to_string),
                confidence,
                source: CandidateSource::Llm,
            })
        })
        .collect()
}

/// Merge regex and LLM candidates by `(number, carrier)`: max confidence,
/// most informative description, `hybrid` source when both contributed.
fn merge(regex: Vec<Candidate>, llm: Vec<Candidate>) -> Vec<Candidate> {
    let mut merged: Vec<Candidate> = regex;
    let mut index: HashMap<(String, CarrierCode), usize> = merged
        .iter()
        .enumerate()
        .map(|(i, c)| ((c.tracking_number.clone(), c.carrier), i))
        .collect();

    for candidate in llm {
        let key = (candidate.tracking_number.clone(), candidate.carrier);
        match index.get(&key) {
            Some(&i) => {
                let existing = &mut merged[i];
                existing.confidence = existing.confidence.max(candidate.confidence);
                if better_description(&candidate.description, &existing.description) {
                    existing.description = candidate.description;
                }
                existing.source = CandidateSource::Hybrid;
            }
            None => {
                index.insert(key, merged.len());
                merged.push(candidate);
            }
        }
    }

    merged
}

fn better_description(new: &Option<String>, old: &Option<String>) -> bool {
    match (new, old) {
        (Some(n), Some(o)) => n.len() > o.len(),
        (Some(_), None) => true,
        _ => false,
    }
}
