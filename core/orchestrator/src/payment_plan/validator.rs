//! Validates an extracted payment plan against policy constants and decides
//! whether it's complete enough to route for auto-approval, manual review,
//! or rejection.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use shared_types::{AppConfig, ConfidenceLevel, ExtractedPaymentPlan, ValidationReport, ValidationStatus};

/// Below this many weeks a plan is flagged as unusually short; above this
/// many, unusually long. Neither is an error, just a manual-review nudge.
const SHORT_DURATION_WARNING_WEEKS: u32 = 2;
const LONG_DURATION_WARNING_WEEKS: u32 = 10;

/// Auto-approval requires a tighter inner band than the general validity
/// rules: High confidence, at least $50/week, and no more than 8 weeks.
const AUTO_APPROVE_MIN_WEEKLY: f64 = 50.0;
const AUTO_APPROVE_MAX_WEEKS: u32 = 8;

/// Extra context a caller may supply about the customer, used only to
/// surface advisory warnings (never hard errors — the plan may still be
/// technically valid and worth a manager's look).
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationContext {
    pub average_monthly_income: Option<f64>,
    pub total_balance: Option<f64>,
    pub existing_payment_plans: u32,
    pub missed_payments: u32,
}

pub fn validate_payment_plan(plan: &ExtractedPaymentPlan, config: &AppConfig) -> ValidationReport {
    validate_payment_plan_with_context(plan, config, &ValidationContext::default())
}

pub fn validate_payment_plan_with_context(
    plan: &ExtractedPaymentPlan,
    config: &AppConfig,
    context: &ValidationContext,
) -> ValidationReport {
    validate_at(plan, config, context, Utc::now())
}

fn validate_at(
    plan: &ExtractedPaymentPlan,
    config: &AppConfig,
    context: &ValidationContext,
    now: DateTime<Utc>,
) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !plan.is_complete() {
        errors.push("payment plan is missing a weekly amount or a duration".to_string());
    }

    if let Some(amount) = plan.weekly_amount {
        if amount < config.min_weekly_payment {
            errors.push(format!(
                "weekly amount ${:.2} is below the minimum of ${:.2}",
                amount, config.min_weekly_payment
            ));
        }
        if amount > config.max_weekly_payment {
            errors.push(format!(
                "weekly amount ${:.2} exceeds the maximum of ${:.2}",
                amount, config.max_weekly_payment
            ));
        }
    }

    if let Some(weeks) = plan.duration_weeks {
        if weeks == 0 || weeks > config.max_payment_weeks {
            errors.push(format!(
                "duration of {} weeks is outside the allowed 1..={} range",
                weeks, config.max_payment_weeks
            ));
        } else if weeks <= SHORT_DURATION_WARNING_WEEKS {
            warnings.push(format!("duration of {} weeks is unusually short", weeks));
        } else if weeks >= LONG_DURATION_WARNING_WEEKS {
            warnings.push(format!("duration of {} weeks is unusually long", weeks));
        }
    }

    match plan.confidence_level {
        Some(ConfidenceLevel::Low) => {
            errors.push("extraction confidence is too low to trust without manual review".to_string());
        }
        None => errors.push("payment plan has no assigned confidence level".to_string()),
        _ => {}
    }

    match plan.start_date {
        Some(start_date) => {
            let earliest = now + ChronoDuration::days(1);
            let latest = now + ChronoDuration::days(30);
            if start_date < earliest || start_date > latest {
                errors.push("start date is outside the allowed tomorrow..+30 day window".to_string());
            }
        }
        None => warnings.push("no start date was detected; assuming immediate start".to_string()),
    }

    if let (Some(amount), Some(income)) = (plan.weekly_amount, context.average_monthly_income) {
        if amount > 0.30 * (income / 4.33) {
            warnings.push("weekly amount exceeds 30% of estimated weekly income".to_string());
        }
    }
    if let (Some(amount), Some(weeks), Some(balance)) =
        (plan.weekly_amount, plan.duration_weeks, context.total_balance)
    {
        if (weeks as f64) * amount < 0.10 * balance {
            warnings.push("plan covers less than 10% of the outstanding balance".to_string());
        }
    }
    if context.existing_payment_plans > 0 {
        warnings.push("customer already has an existing payment plan on file".to_string());
    }
    if context.missed_payments > 2 {
        warnings.push("customer has missed more than two payments".to_string());
    }

    let is_valid = errors.is_empty();
    let is_auto_approvable = is_valid
        && plan.confidence_level == Some(ConfidenceLevel::High)
        && plan.weekly_amount.map(|a| a >= AUTO_APPROVE_MIN_WEEKLY).unwrap_or(false)
        && plan.duration_weeks.map(|w| w <= AUTO_APPROVE_MAX_WEEKS).unwrap_or(false);

    let status = if !is_valid {
        ValidationStatus::Invalid
    } else if is_auto_approvable {
        ValidationStatus::AutoApproved
    } else if !warnings.is_empty() {
        ValidationStatus::NeedsReview
    } else {
        ValidationStatus::Valid
    };

    let summary = match status {
        ValidationStatus::Invalid => format!("plan rejected: {}", errors.join("; ")),
        ValidationStatus::AutoApproved => {
            "plan auto-approved: within the inner policy band at high confidence".to_string()
        }
        ValidationStatus::NeedsReview => "plan requires manual review".to_string(),
        ValidationStatus::Valid => "plan is valid".to_string(),
    };

    ValidationReport {
        status: Some(status),
        is_valid,
        is_auto_approvable,
        errors,
        warnings,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_plan(amount: f64, weeks: u32, level: ConfidenceLevel, start_in_days: i64) -> ExtractedPaymentPlan {
        ExtractedPaymentPlan {
            weekly_amount: Some(amount),
            duration_weeks: Some(weeks),
            start_date: Some(Utc::now() + ChronoDuration::days(start_in_days)),
            confidence_level: Some(level),
            confidence_score: 0.9,
            source: None,
            patterns_matched: vec![],
            raw_text: "test".to_string(),
        }
    }

    #[test]
    fn within_inner_band_and_high_confidence_auto_approves() {
        let config = AppConfig::default();
        let plan = complete_plan(50.0, 8, ConfidenceLevel::High, 3);
        let report = validate_payment_plan(&plan, &config);
        assert!(report.is_valid);
        assert!(report.is_auto_approvable);
        assert_eq!(report.status, Some(ValidationStatus::AutoApproved));
    }

    #[test]
    fn outside_inner_band_is_valid_but_needs_review() {
        let config = AppConfig::default();
        let plan = complete_plan(50.0, 11, ConfidenceLevel::High, 3);
        let report = validate_payment_plan(&plan, &config);
        assert!(report.is_valid);
        assert!(!report.is_auto_approvable);
        assert_eq!(report.status, Some(ValidationStatus::NeedsReview));
    }

    #[test]
    fn low_confidence_is_invalid() {
        let config = AppConfig::default();
        let plan = complete_plan(50.0, 8, ConfidenceLevel::Low, 3);
        let report = validate_payment_plan(&plan, &config);
        assert!(!report.is_valid);
        assert_eq!(report.status, Some(ValidationStatus::Invalid));
    }

    #[test]
    fn amount_below_minimum_is_invalid() {
        let config = AppConfig::default();
        let plan = complete_plan(10.0, 8, ConfidenceLevel::High, 3);
        let report = validate_payment_plan(&plan, &config);
        assert!(!report.is_valid);
    }

    #[test]
    fn duration_beyond_cap_is_invalid() {
        let config = AppConfig::default();
        let plan = complete_plan(50.0, 52, ConfidenceLevel::High, 3);
        let report = validate_payment_plan(&plan, &config);
        assert!(!report.is_valid);
    }

    #[test]
    fn start_date_beyond_thirty_days_is_invalid() {
        let config = AppConfig::default();
        let plan = complete_plan(50.0, 8, ConfidenceLevel::High, 45);
        let report = validate_payment_plan(&plan, &config);
        assert!(!report.is_valid);
    }

    #[test]
    fn missing_start_date_produces_warning_not_error() {
        let config = AppConfig::default();
        let mut plan = complete_plan(50.0, 8, ConfidenceLevel::High, 3);
        plan.start_date = None;
        let report = validate_payment_plan(&plan, &config);
        assert!(report.is_valid);
        assert!(!report.warnings.is_empty());
        assert_eq!(report.status, Some(ValidationStatus::NeedsReview));
    }

    #[test]
    fn missed_payments_context_adds_advisory_warning() {
        let config = AppConfig::default();
        let plan = complete_plan(50.0, 5, ConfidenceLevel::High, 3);
        let context = ValidationContext { missed_payments: 3, ..Default::default() };
        let report = validate_payment_plan_with_context(&plan, &config, &context);
        assert!(report.is_valid);
        assert!(report.warnings.iter().any(|w| w.contains("missed")));
    }

    #[test]
    fn incomplete_plan_is_invalid() {
        let config = AppConfig::default();
        let plan = ExtractedPaymentPlan {
            weekly_amount: Some(50.0),
            duration_weeks: None,
            ..Default::default()
        };
        let report = validate_payment_plan(&plan, &config);
        assert!(!report.is_valid);
    }
}
