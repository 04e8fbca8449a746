//! Escalation trigger detection: scans inbound customer text for patterns
//! and keywords indicating anger, a legal request, a formal complaint,
//! confusion, or general dissatisfaction, each scored with a confidence.

use once_cell::sync::Lazy;
use regex::Regex;
use shared_types::{EscalationReason, PatternKind, Trigger};
use std::collections::HashMap;

struct ReasonPatterns {
    reason: EscalationReason,
    patterns: Vec<Regex>,
    keywords: Vec<&'static str>,
    strong_keywords: Vec<&'static str>,
    base_confidence: f64,
}

static PATTERN_TABLE: Lazy<Vec<ReasonPatterns>> = Lazy::new(|| {
    vec![
        ReasonPatterns {
            reason: EscalationReason::Anger,
            patterns: compile(&[
                r"(?i)furious|enraged|pissed off|livid|irate",
                r"(?i)taking my business elsewhere|never using (this|your) (company|service) again",
                r"(?i)speak to your supervisor|let me talk to (someone|your) (higher|manager|boss)",
            ]),
            keywords: vec!["angry", "mad", "frustrated", "unacceptable", "ridiculous"],
            strong_keywords: vec!["furious", "enraged", "supervisor", "manager"],
            base_confidence: 0.7,
        },
        ReasonPatterns {
            reason: EscalationReason::LegalRequest,
            patterns: compile(&[
                r"(?i)lawyer|attorney|legal action|lawsuit|suing|legal counsel",
                r"(?i)CFPB|consumer financial protection|BBB|better business bureau",
                r"(?i)taking legal action|file a complaint with|report (this|you) to",
            ]),
            keywords: vec!["rights", "illegal", "violation", "complaint"],
            strong_keywords: vec!["lawyer", "attorney", "lawsuit", "suing"],
            base_confidence: 0.85,
        },
        ReasonPatterns {
            reason: EscalationReason::Complaint,
            patterns: compile(&[
                r"(?i)formal complaint|file a complaint|written complaint",
                r"(?i)this is (unacceptable|outrageous|ridiculous)",
                r"(?i)documentation of|keep records of|in writing",
            ]),
            keywords: vec!["complaint", "dissatisfied", "unhappy", "poor service"],
            strong_keywords: vec!["formal complaint", "written", "documentation"],
            base_confidence: 0.7,
        },
        ReasonPatterns {
            reason: EscalationReason::Confusion,
            patterns: compile(&[
                r"(?i)i don'?t understand|confus(ed|ing)|what does this mean",
                r"(?i)can you explain|i'?m lost|this doesn'?t make sense",
            ]),
            keywords: vec!["confused", "unclear", "explain", "understand"],
            strong_keywords: vec![],
            base_confidence: 0.7,
        },
        ReasonPatterns {
            reason: EscalationReason::Dissatisfaction,
            patterns: compile(&[
                r"(?i)not happy with|disappointed (in|with)|not satisfied",
                r"(?i)this (isn'?t|is not) (right|fair|working)",
            ]),
            keywords: vec!["disappointed", "unsatisfied", "not fair", "not happy"],
            strong_keywords: vec![],
            base_confidence: 0.7,
        },
    ]
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| Regex::new(p).expect("static pattern is valid regex")).collect()
}

fn pattern_confidence(reason: EscalationReason, base: f64, matched: &str, pattern: &str) -> f64 {
    let mut confidence = base;
    if matched.len() > 10 {
        confidence += 0.1;
    }
    if !pattern.contains('?') && !pattern.contains('*') {
        confidence += 0.05;
    }
    if reason == EscalationReason::Anger {
        let lower = matched.to_lowercase();
        if lower.contains("supervisor") || lower.contains("manager") || lower.contains("someone higher") {
            confidence += 0.1;
        }
    }
    confidence.min(1.0)
}

fn keyword_confidence(reason: EscalationReason, keyword: &str, occurrences: usize, strong: &[&str]) -> f64 {
    let mut confidence = if strong.contains(&keyword) { 0.75 } else { 0.5 };
    if occurrences > 1 {
        confidence += 0.1;
    }
    let _ = reason;
    confidence.min(1.0)
}

/// Finds all escalation triggers in `text`, deduplicated by
/// `(reason, lowercased matched text)` keeping the highest-confidence hit.
pub fn detect_triggers(text: &str) -> Vec<Trigger> {
    let lower = text.to_lowercase();
    let mut found: HashMap<(EscalationReason, String), Trigger> = HashMap::new();

    for table in PATTERN_TABLE.iter() {
        for pattern in &table.patterns {
            if let Some(m) = pattern.find(text) {
                let matched_text = m.as_str().to_string();
                let confidence = pattern_confidence(table.reason, table.base_confidence, &matched_text, pattern.as_str());
                upsert_highest(&mut found, table.reason, matched_text, confidence, PatternKind::Regex);
            }
        }

        for keyword in &table.keywords {
            let occurrences = lower.matches(keyword).count();
            if occurrences > 0 {
                let confidence = keyword_confidence(table.reason, keyword, occurrences, &table.strong_keywords);
                upsert_highest(&mut found, table.reason, keyword.to_string(), confidence, PatternKind::Keyword);
            }
        }
    }

    // HashMap iteration order is randomized per process; break confidence
    // ties on (reason, matched_text) so the returned order is deterministic
    // regardless of insertion order.
    let mut triggers: Vec<Trigger> = found.into_values().collect();
    triggers.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| format!("{:?}", a.reason).cmp(&format!("{:?}", b.reason)))
            .then_with(|| a.matched_text.cmp(&b.matched_text))
    });
    triggers
}

fn upsert_highest(
    found: &mut HashMap<(EscalationReason, String), Trigger>,
    reason: EscalationReason,
    matched_text: String,
    confidence: f64,
    pattern_kind: PatternKind,
) {
    let key = (reason, matched_text.to_lowercase());
    let entry = found.entry(key).or_insert_with(|| Trigger {
        reason,
        confidence,
        matched_text: matched_text.clone(),
        pattern_kind,
    });
    if confidence > entry.confidence {
        entry.confidence = confidence;
        entry.matched_text = matched_text;
        entry.pattern_kind = pattern_kind;
    }
}

/// True if any trigger meets `threshold`, or any legal-request trigger is
/// present at all — legal requests always escalate regardless of score.
pub fn should_escalate(triggers: &[Trigger], threshold: f64) -> bool {
    triggers.iter().any(|t| {
        t.confidence >= threshold || t.reason == EscalationReason::LegalRequest
    })
}

/// The highest-confidence trigger, if any.
pub fn primary_trigger(triggers: &[Trigger]) -> Option<&Trigger> {
    triggers
        .iter()
        .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
}
