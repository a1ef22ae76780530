//! Pre-submission cost and duration estimation from query complexity.
//!
//! Pure and deterministic: the same query always yields the same estimate.
//! Complexity is scored from length, domain breadth, temporal scope, and
//! entity density, then mapped onto fixed duration and cost bands.

use crate::types::{Complexity, CostEstimate};

const COMPLEX_KEYWORDS: &[&str] = &[
    "comprehensive",
    "detailed",
    "in-depth",
    "thorough",
    "extensive",
    "analysis",
    "compare",
    "contrast",
    "evaluate",
    "synthesize",
    "implications",
    "geopolitical",
    "historical",
    "trends",
    "forecast",
];

const MULTI_DOMAIN_INDICATORS: &[&str] = &[
    "and", "vs", "versus", "between", "across", "multiple", "different", "various", "compare",
    "relation",
];

const TEMPORAL_INDICATORS: &[&str] = &[
    "history",
    "evolution",
    "timeline",
    "past",
    "future",
    "trends",
    "forecast",
    "prediction",
    "development",
    "changes",
];

/// (min, max, likely) duration bands in minutes, per complexity class.
const DURATION_MINUTES: [(f64, f64, f64); 3] = [
    (0.25, 2.0, 0.5),  // simple
    (3.0, 20.0, 8.0),  // medium
    (15.0, 60.0, 35.0), // complex
];

/// (min, max, likely) cost bands in USD, per complexity class.
const COST_USD: [(f64, f64, f64); 3] = [
    (0.10, 0.50, 0.25), // simple
    (0.50, 2.00, 1.00), // medium
    (1.50, 6.00, 3.00), // complex
];

/// Heuristic estimator for research queries.
pub struct CostEstimator {
    sync_budget_secs: u64,
}

impl CostEstimator {
    pub fn new(sync_budget_secs: u64) -> Self {
        Self { sync_budget_secs }
    }

    /// Produce an estimate for a query.
    pub fn estimate(&self, query: &str) -> CostEstimate {
        let complexity = Self::classify(query);
        let band = match complexity {
            Complexity::Simple => 0,
            Complexity::Medium => 1,
            Complexity::Complex => 2,
        };
        let (min_minutes, max_minutes, likely_minutes) = DURATION_MINUTES[band];
        let (min_usd, max_usd, likely_usd) = COST_USD[band];
        let sync_budget_minutes = self.sync_budget_secs as f64 / 60.0;

        CostEstimate {
            complexity,
            min_minutes,
            max_minutes,
            likely_minutes,
            min_usd,
            max_usd,
            likely_usd,
            will_likely_go_async: likely_minutes > sync_budget_minutes,
            recommendation: Self::recommendation(complexity, query),
        }
    }

    /// Score the query and place it in a complexity band.
    ///
    /// Bands are mutually exclusive and totally ordered:
    /// score < 4 simple, 4..8 medium, >= 8 complex.
    fn classify(query: &str) -> Complexity {
        let lower = query.to_lowercase();
        let mut score = 0usize;

        let word_count = query.split_whitespace().count();
        score += match word_count {
            n if n > 50 => 3,
            n if n > 25 => 2,
            n if n > 10 => 1,
            _ => 0,
        };

        let keyword_hits = COMPLEX_KEYWORDS
            .iter()
            .filter(|kw| lower.contains(*kw))
            .count();
        score += keyword_hits.min(4);

        let domain_hits = MULTI_DOMAIN_INDICATORS
            .iter()
            .filter(|ind| lower.contains(*ind))
            .count();
        score += domain_hits.min(3);

        let temporal_hits = TEMPORAL_INDICATORS
            .iter()
            .filter(|ind| lower.contains(*ind))
            .count();
        score += temporal_hits.min(2);

        let question_marks = query.matches('?').count();
        score += match question_marks {
            n if n > 2 => 2,
            n if n > 1 => 1,
            _ => 0,
        };

        score += (Self::proper_noun_count(query) / 2).min(2);

        match score {
            n if n >= 8 => Complexity::Complex,
            n if n >= 4 => Complexity::Medium,
            _ => Complexity::Simple,
        }
    }

    /// Count capitalized words past the first, skipping sentence starts.
    fn proper_noun_count(query: &str) -> usize {
        let words: Vec<&str> = query.split_whitespace().collect();
        words
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(i, word)| {
                let starts_upper = word
                    .chars()
                    .next()
                    .map(|c| c.is_uppercase())
                    .unwrap_or(false);
                let after_sentence_end = words[i - 1].ends_with(['.', '?', '!']);
                starts_upper && !after_sentence_end
            })
            .count()
    }

    fn recommendation(complexity: Complexity, query: &str) -> String {
        let mut rec = match complexity {
            Complexity::Simple => {
                "Simple query detected. Should complete quickly and stay within \
                 synchronous execution."
                    .to_string()
            }
            Complexity::Medium => {
                "Medium complexity query. May take 5-15 minutes and will switch to \
                 async mode if initial processing exceeds the sync budget. Consider \
                 enabling notifications for status updates."
                    .to_string()
            }
            Complexity::Complex => {
                "Complex multi-domain query detected. Will likely require 30+ minutes \
                 and switch to async mode. Consider breaking into smaller focused \
                 queries if time is critical, or enable notifications for a completion \
                 alert."
                    .to_string()
            }
        };

        let lower = query.to_lowercase();
        if lower.contains("compare") || lower.contains("vs") {
            rec.push_str(" Comparative analysis typically requires extensive source gathering.");
        }
        if ["geopolitical", "international", "global"]
            .iter()
            .any(|geo| lower.contains(geo))
        {
            rec.push_str(
                " Geopolitical topics often involve diverse perspectives and may take longer.",
            );
        }
        if query.split_whitespace().count() > 100 {
            rec.push_str(" Very long query - consider summarizing or focusing on key aspects.");
        }
        rec
    }
}
