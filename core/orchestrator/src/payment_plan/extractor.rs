//! Extracts a structured payment plan (`$X/week for N weeks, starting
//! <date>`) from free-form SMS text, either the tenant's own message or the
//! AI-generated reply that proposed it.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc, Weekday};
use once_cell::sync::Lazy;
use regex::Regex;
use shared_types::{ConfidenceLevel, ExtractedPaymentPlan, PaymentPlanSource};

const MIN_PLAUSIBLE_AMOUNT: f64 = 10.0;
const MAX_PLAUSIBLE_AMOUNT: f64 = 10_000.0;
const MIN_WEEKLY_PAYMENT: f64 = 25.0;
const MAX_DURATION_WEEKS: u32 = 12;

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| Regex::new(p).expect("static pattern is valid regex")).collect()
}

static AMOUNT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)\$(\d+(?:\.\d{2})?)\s*(?:per|/|a)\s*week",
        r"(?i)\$(\d+(?:\.\d{2})?)\s*weekly",
        r"(?i)(\d+(?:\.\d{2})?)\s*dollars?\s*(?:per|/|a)\s*week",
        r"(?i)weekly\s*(?:payment[s]?\s*of)?\s*\$(\d+(?:\.\d{2})?)",
        r"(?i)pay\s*\$(\d+(?:\.\d{2})?)\s*(?:each|every)\s*week",
        r"(?i)\$(\d+(?:\.\d{2})?)\s*every\s*week",
        r"(?i)\$(\d+(?:\.\d{2})?)/wk",
        r"(?i)(\d+(?:\.\d{2})?)\s*a\s*week",
        r"(?i)installments?\s*of\s*\$(\d+(?:\.\d{2})?)",
        r"(?i)\$(\d+(?:\.\d{2})?)\s*payments?",
    ])
});

static DURATION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)(\d+)\s*weeks?",
        r"(?i)(\d+)\s*wks?",
        r"(?i)over\s*(\d+)\s*weeks?",
        r"(?i)for\s*(\d+)\s*weeks?",
        r"(?i)(\d+)\s*months?",
    ])
});

static START_DATE_PATTERNS: Lazy<Vec<(Regex, StartDateKind)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"(?i)\bmonday\b").unwrap(), StartDateKind::Weekday(Weekday::Mon)),
        (Regex::new(r"(?i)\btuesday\b").unwrap(), StartDateKind::Weekday(Weekday::Tue)),
        (Regex::new(r"(?i)\bwednesday\b").unwrap(), StartDateKind::Weekday(Weekday::Wed)),
        (Regex::new(r"(?i)\bthursday\b").unwrap(), StartDateKind::Weekday(Weekday::Thu)),
        (Regex::new(r"(?i)\bfriday\b").unwrap(), StartDateKind::Weekday(Weekday::Fri)),
        (Regex::new(r"(?i)\bsaturday\b").unwrap(), StartDateKind::Weekday(Weekday::Sat)),
        (Regex::new(r"(?i)\bsunday\b").unwrap(), StartDateKind::Weekday(Weekday::Sun)),
        (Regex::new(r"(?i)\btomorrow\b").unwrap(), StartDateKind::Tomorrow),
    ]
});

#[derive(Clone, Copy)]
enum StartDateKind {
    Weekday(Weekday),
    Tomorrow,
}

/// The 4th combined pattern captures duration before amount
/// (`N weeks at $AMT/week`); the others capture amount before duration.
static COMBINED_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)\$(\d+(?:\.\d{2})?)\s*(?:per|/|a)\s*week\s*for\s*(\d+)\s*weeks?",
        r"(?i)\$(\d+(?:\.\d{2})?)\s*weekly\s*for\s*(\d+)\s*weeks?",
        r"(?i)(\d+)\s*(?:weekly\s*)?payments?\s*of\s*\$(\d+(?:\.\d{2})?)",
        r"(?i)(\d+)\s*(?:weeks?|w)\s*(?:at|@)\s*\$(\d+(?:\.\d{2})?)\s*(?:per|/|a)\s*week",
        r"(?i)\$(\d+(?:\.\d{2})?)\s*(?:x|times)\s*(\d+)\s*weeks?",
        r"(?i)(\d+)\s*weeks?\s*\$(\d+(?:\.\d{2})?)",
    ])
});

fn looks_like_amount(value: f64) -> bool {
    (MIN_PLAUSIBLE_AMOUNT..=MAX_PLAUSIBLE_AMOUNT).contains(&value)
}

fn parse_duration_weeks(raw: &str, matched_text: &str) -> Option<u32> {
    let n: f64 = raw.parse().ok()?;
    if matched_text.to_lowercase().contains("month") {
        Some((n * 4.0).round() as u32)
    } else {
        Some(n.round() as u32)
    }
}

fn next_occurrence_of(weekday: Weekday, from: DateTime<Utc>) -> DateTime<Utc> {
    let today = from.weekday();
    let mut days_ahead = weekday.num_days_from_monday() as i64 - today.num_days_from_monday() as i64;
    if days_ahead <= 0 {
        days_ahead += 7;
    }
    from + ChronoDuration::days(days_ahead)
}

fn extract_start_date(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    for (pattern, kind) in START_DATE_PATTERNS.iter() {
        if pattern.is_match(text) {
            return Some(match kind {
                StartDateKind::Weekday(wd) => next_occurrence_of(*wd, now),
                StartDateKind::Tomorrow => now + ChronoDuration::days(1),
            });
        }
    }
    None
}

fn extract_amount(text: &str) -> Option<(f64, String)> {
    for pattern in AMOUNT_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            if let Some(m) = caps.get(1) {
                if let Ok(value) = m.as_str().parse::<f64>() {
                    return Some((value, pattern.as_str().to_string()));
                }
            }
        }
    }
    None
}

fn extract_duration(text: &str) -> Option<(u32, String)> {
    for pattern in DURATION_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            if let Some(m) = caps.get(1) {
                if let Some(weeks) = parse_duration_weeks(m.as_str(), pattern.as_str()) {
                    return Some((weeks, pattern.as_str().to_string()));
                }
            }
        }
    }
    None
}

/// Tries the combined (amount+duration in one match) patterns first, then
/// falls back to independently-matched amount/duration/start-date. Returns
/// `None` when the business pre-filter rejects an implausible plan
/// (amount below the per-week floor, or duration beyond the cap).
pub fn extract_payment_plan(text: &str) -> Option<ExtractedPaymentPlan> {
    extract_payment_plan_at(text, Utc::now())
}

fn extract_payment_plan_at(text: &str, now: DateTime<Utc>) -> Option<ExtractedPaymentPlan> {
    let mut patterns_matched = Vec::new();
    let mut weekly_amount = None;
    let mut duration_weeks = None;
    let mut base_score: f64;

    if let Some((amount, duration, pattern)) = try_combined(text) {
        weekly_amount = Some(amount);
        duration_weeks = Some(duration);
        patterns_matched.push(pattern);
        base_score = if text.contains('$') { 0.8 } else { 0.6 };
    } else {
        base_score = 0.0;
        if let Some((amount, pattern)) = extract_amount(text) {
            weekly_amount = Some(amount);
            patterns_matched.push(pattern);
        }
        if let Some((weeks, pattern)) = extract_duration(text) {
            duration_weeks = Some(weeks);
            patterns_matched.push(pattern);
        }
    }

    let start_date = extract_start_date(text, now);

    if weekly_amount.is_none() && duration_weeks.is_none() {
        return None;
    }

    if let Some(amount) = weekly_amount {
        if amount < MIN_WEEKLY_PAYMENT {
            return None;
        }
    }
    if let Some(weeks) = duration_weeks {
        if weeks > MAX_DURATION_WEEKS {
            return None;
        }
    }

    let (confidence_level, confidence_score) = if weekly_amount.is_some() && duration_weeks.is_some() {
        if start_date.is_some() {
            (ConfidenceLevel::High, (base_score.max(0.7) + 0.2).min(1.0))
        } else {
            (ConfidenceLevel::Medium, base_score.max(0.7))
        }
    } else {
        (ConfidenceLevel::Low, base_score.max(0.6))
    };
    base_score = confidence_score;

    Some(ExtractedPaymentPlan {
        weekly_amount,
        duration_weeks,
        start_date,
        confidence_level: Some(confidence_level),
        confidence_score: base_score,
        source: Some(PaymentPlanSource::TenantMessage),
        patterns_matched,
        raw_text: text.to_string(),
    })
}

/// Tries each combined pattern, disambiguating which captured group is the
/// amount and which is the duration via `looks_like_amount` when a pattern's
/// group order is ambiguous (duration-before-amount vs amount-before-duration).
fn try_combined(text: &str) -> Option<(f64, u32, String)> {
    for pattern in COMBINED_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            let g1 = caps.get(1).map(|m| m.as_str());
            let g2 = caps.get(2).map(|m| m.as_str());
            if let (Some(g1), Some(g2)) = (g1, g2) {
                let v1: Option<f64> = g1.parse().ok();
                let v2: Option<f64> = g2.parse().ok();
                if let (Some(v1), Some(v2)) = (v1, v2) {
                    let (amount, duration) = if looks_like_amount(v1) && !looks_like_amount(v2) {
                        (v1, v2)
                    } else if looks_like_amount(v2) && !looks_like_amount(v1) {
                        (v2, v1)
                    } else {
                        (v1, v2)
                    };
                    return Some((amount, duration.round() as u32, pattern.as_str().to_string()));
                }
            }
        }
    }
    None
}

static STRUCTURED_AI_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)PAYMENT_PLAN:\s*weekly=(\d+(?:\.\d{2})?),\s*weeks=(\d+)").unwrap()
});

/// Extraction from an AI-generated reply: prefers the structured
/// `PAYMENT_PLAN: weekly=X, weeks=Y` marker the prompt asks the model to
/// emit when it proposes a plan; falls back to free-text extraction with a
/// confidence boost, since an AI reply repeating agreed terms is usually
/// more reliable than raw customer text.
pub fn extract_from_ai_response(text: &str) -> Option<ExtractedPaymentPlan> {
    extract_from_ai_response_at(text, Utc::now())
}

fn extract_from_ai_response_at(text: &str, now: DateTime<Utc>) -> Option<ExtractedPaymentPlan> {
    if let Some(caps) = STRUCTURED_AI_PATTERN.captures(text) {
        let weekly_amount: f64 = caps.get(1)?.as_str().parse().ok()?;
        let duration_weeks: u32 = caps.get(2)?.as_str().parse().ok()?;
        if weekly_amount < MIN_WEEKLY_PAYMENT || duration_weeks > MAX_DURATION_WEEKS {
            return None;
        }
        return Some(ExtractedPaymentPlan {
            weekly_amount: Some(weekly_amount),
            duration_weeks: Some(duration_weeks),
            start_date: extract_start_date(text, now),
            confidence_level: Some(ConfidenceLevel::High),
            confidence_score: 0.95,
            source: Some(PaymentPlanSource::AiResponse),
            patterns_matched: vec!["PAYMENT_PLAN structured marker".to_string()],
            raw_text: text.to_string(),
        });
    }

    let mut plan = extract_payment_plan_at(text, now)?;
    plan.confidence_score = (plan.confidence_score + 0.10).min(1.0);
    plan.source = Some(PaymentPlanSource::AiResponse);
    Some(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_amount_and_duration_from_plain_text() {
        let plan = extract_payment_plan("I can pay $50 per week for 8 weeks").unwrap();
        assert_eq!(plan.weekly_amount, Some(50.0));
        assert_eq!(plan.duration_weeks, Some(8));
        assert_eq!(plan.confidence_level, Some(ConfidenceLevel::Medium));
    }

    #[test]
    fn duration_before_amount_ordering_is_disambiguated() {
        let plan = extract_payment_plan("6 weeks at $75 per week").unwrap();
        assert_eq!(plan.weekly_amount, Some(75.0));
        assert_eq!(plan.duration_weeks, Some(6));
    }

    #[test]
    fn months_are_converted_to_weeks() {
        let plan = extract_payment_plan("I'll pay $100 per week over 2 months").unwrap();
        // The combined patterns don't cover "over N months", so duration
        // falls back to the individual month pattern (x4).
        assert_eq!(plan.weekly_amount, Some(100.0));
        assert_eq!(plan.duration_weeks, Some(8));
    }

    #[test]
    fn rejects_amount_below_floor() {
        assert!(extract_payment_plan("I'll pay $5 per week for 4 weeks").is_none());
    }

    #[test]
    fn rejects_duration_beyond_cap() {
        assert!(extract_payment_plan("$50 per week for 20 weeks").is_none());
    }

    #[test]
    fn start_date_presence_upgrades_confidence_to_high() {
        let plan = extract_payment_plan("$50 per week for 8 weeks starting tomorrow").unwrap();
        assert_eq!(plan.confidence_level, Some(ConfidenceLevel::High));
        assert!(plan.start_date.is_some());
    }

    #[test]
    fn structured_ai_marker_takes_priority_and_scores_highest() {
        let plan = extract_from_ai_response(
            "Sounds good. PAYMENT_PLAN: weekly=60.00, weeks=10 Let us know if that works.",
        )
        .unwrap();
        assert_eq!(plan.weekly_amount, Some(60.0));
        assert_eq!(plan.duration_weeks, Some(10));
        assert_eq!(plan.confidence_score, 0.95);
        assert_eq!(plan.source, Some(PaymentPlanSource::AiResponse));
    }

    #[test]
    fn ai_response_fallback_gets_confidence_boost() {
        let from_text = extract_payment_plan("$50 per week for 8 weeks").unwrap();
        let from_ai = extract_from_ai_response("$50 per week for 8 weeks").unwrap();
        assert!(from_ai.confidence_score > from_text.confidence_score);
    }

    #[test]
    fn no_plan_found_in_unrelated_text() {
        assert!(extract_payment_plan("Thanks for reaching out, have a good day!").is_none());
    }
}
