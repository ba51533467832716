//! Trigger evaluation
//!
//! Triggers are cron expressions evaluated in UTC. Standard 5-field
//! expressions are accepted alongside the `cron` crate's native 6/7-field
//! form and the `@daily`-style shorthands.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::debug;

use crate::model::{ChatMessage, ModelClient};
use crate::schedule::Schedule;

/// Bound on re-evaluation when a fire time fails to land after `from`
const MAX_ADVANCE_STEPS: usize = 16;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TriggerError {
    #[error("Invalid trigger '{expression}': {reason}")]
    InvalidTrigger { expression: String, reason: String },
}

fn invalid(expression: &str, reason: impl ToString) -> TriggerError {
    TriggerError::InvalidTrigger {
        expression: expression.to_string(),
        reason: reason.to_string(),
    }
}

/// Rewrite one standard day-of-week element (0 or 7 = Sunday) into the `cron`
/// crate's numbering (1 = Sunday). Named days and anything unparseable pass
/// through untouched so the parser reports them.
fn translate_weekday_element(element: &str) -> String {
    if element == "*" || element == "?" || element.chars().any(|c| c.is_ascii_alphabetic()) {
        return element.to_string();
    }

    let (base, step) = match element.split_once('/') {
        Some((base, step)) => match step.parse::<u32>() {
            Ok(step) if step > 0 => (base, Some(step)),
            _ => return element.to_string(),
        },
        None => (element, None),
    };

    let bounds = match base.split_once('-') {
        _ if base == "*" => Some((0, 6)),
        Some((start, end)) => start.parse::<u32>().ok().zip(end.parse::<u32>().ok()),
        None => base
            .parse::<u32>()
            .ok()
            .map(|start| (start, if step.is_some() { 6 } else { start })),
    };
    let Some((start, end)) = bounds.filter(|(start, end)| start <= end && *end <= 7) else {
        return element.to_string();
    };

    let days: BTreeSet<u32> = (start..=end)
        .step_by(step.unwrap_or(1) as usize)
        .map(|day| day % 7 + 1)
        .collect();
    days.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Convert a standard 5-field expression to the `cron` crate's 6-field form:
/// a zero seconds field, and Sunday-based weekday numbers shifted by one
pub fn normalize_expression(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return trimmed.to_string();
    }

    let mut fields: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
    if fields.len() == 5 {
        fields[4] = fields[4]
            .split(',')
            .map(translate_weekday_element)
            .collect::<Vec<_>>()
            .join(",");
        fields.insert(0, "0".to_string());
    }
    fields.join(" ")
}

pub fn parse_trigger(expression: &str) -> Result<CronSchedule, TriggerError> {
    if expression.trim().is_empty() {
        return Err(invalid(expression, "empty expression"));
    }
    CronSchedule::from_str(&normalize_expression(expression)).map_err(|e| invalid(expression, e))
}

/// Next fire time strictly after `from`
pub fn next_fire_after(
    expression: &str,
    from: DateTime<Utc>,
) -> Result<DateTime<Utc>, TriggerError> {
    let schedule = parse_trigger(expression)?;

    let mut cursor = from;
    for _ in 0..MAX_ADVANCE_STEPS {
        let candidate = schedule
            .after(&cursor)
            .next()
            .ok_or_else(|| invalid(expression, "no future occurrences"))?;

        if candidate > from {
            return Ok(candidate);
        }

        debug!(
            "Trigger '{}' produced {} which is not after {}, advancing",
            expression, candidate, from
        );
        cursor = if candidate > cursor {
            candidate
        } else {
            cursor + chrono::Duration::seconds(1)
        };
    }

    Err(invalid(
        expression,
        format!("did not advance past {} within {} steps", from, MAX_ADVANCE_STEPS),
    ))
}

/// Next fire time of a schedule's trigger strictly after `from`
pub fn compute_next_run(
    schedule: &Schedule,
    from: DateTime<Utc>,
) -> Result<DateTime<Utc>, TriggerError> {
    next_fire_after(&schedule.schedule_expression, from)
}

/// Render a timestamp in the display zone
pub fn format_local(timestamp: DateTime<Utc>, tz: Tz) -> String {
    timestamp
        .with_timezone(&tz)
        .format("%Y-%m-%d %H:%M:%S %Z")
        .to_string()
}

const CRON_PROMPT: &str = "Generate a cron expression for the following schedule description. \
Return strictly the cron expression, no quotes or anything else. \
Use the standard 5-field format (minute hour day-of-month month day-of-week).";

/// Ask a model to turn an English description into a validated trigger
pub async fn generate_cron_expression(
    client: &dyn ModelClient,
    model: &str,
    description: &str,
) -> anyhow::Result<String> {
    let conversation = vec![ChatMessage::User(format!(
        "Schedule description: {}",
        description.trim()
    ))];

    let completion = client
        .complete(model, CRON_PROMPT, &conversation, &[])
        .await?;

    let expression = completion
        .text
        .trim()
        .trim_matches(|c| c == '`' || c == '"' || c == '\'')
        .trim()
        .to_string();

    parse_trigger(&expression)?;
    Ok(expression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::{text, ScriptedModel};
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_normalize_expression() {
        assert_eq!(normalize_expression("0 2 * * *"), "0 0 2 * * *");
        assert_eq!(normalize_expression("  */15  * * * * "), "0 */15 * * * *");
        assert_eq!(normalize_expression("0 0 2 * * *"), "0 0 2 * * *");
        assert_eq!(normalize_expression("@daily"), "@daily");
    }

    #[test]
    fn test_normalize_weekday_numbering() {
        assert_eq!(normalize_expression("0 2 * * 1-5"), "0 0 2 * * 2,3,4,5,6");
        assert_eq!(normalize_expression("0 2 * * 0"), "0 0 2 * * 1");
        assert_eq!(normalize_expression("0 2 * * 7"), "0 0 2 * * 1");
        assert_eq!(normalize_expression("0 2 * * 5-7"), "0 0 2 * * 1,6,7");
        assert_eq!(normalize_expression("0 2 * * */2"), "0 0 2 * * 1,3,5,7");
        assert_eq!(normalize_expression("0 2 * * 1,3"), "0 0 2 * * 2,4");
        assert_eq!(normalize_expression("0 2 * * MON-FRI"), "0 0 2 * * MON-FRI");
        // 6/7-field expressions already use the crate's numbering
        assert_eq!(normalize_expression("0 0 2 * * 1"), "0 0 2 * * 1");
    }

    // 2024-01-05 is a Friday
    #[test]
    fn test_weekday_triggers() {
        let friday_morning = at(2024, 1, 5, 10, 0, 0);
        let cases = [
            ("0 2 * * 1-5", at(2024, 1, 8, 2, 0, 0)),
            ("0 2 * * 0", at(2024, 1, 7, 2, 0, 0)),
            ("0 2 * * 7", at(2024, 1, 7, 2, 0, 0)),
            ("0 2 * * SUN", at(2024, 1, 7, 2, 0, 0)),
            ("0 2 * * 6", at(2024, 1, 6, 2, 0, 0)),
            ("30 6 * * 1,3", at(2024, 1, 8, 6, 30, 0)),
            ("0 2 * * 2-6/2", at(2024, 1, 6, 2, 0, 0)),
            ("0 2 * * 5-7", at(2024, 1, 6, 2, 0, 0)),
        ];

        for (expression, expected) in cases {
            let next = next_fire_after(expression, friday_morning).unwrap();
            assert_eq!(next, expected, "{}", expression);
        }
    }

    #[test]
    fn test_weekday_range_crosses_into_sunday() {
        let next = next_fire_after("0 2 * * 5-7", at(2024, 1, 6, 3, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 7, 2, 0, 0));
    }

    #[test]
    fn test_invalid_weekday() {
        let err = next_fire_after("0 2 * * 8", at(2024, 1, 1, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, TriggerError::InvalidTrigger { .. }));
    }

    #[test]
    fn test_daily_at_two_from_creation() {
        let next = next_fire_after("0 2 * * *", at(2024, 1, 1, 10, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 2, 2, 0, 0));
    }

    #[test]
    fn test_strictly_after_on_exact_fire_time() {
        let next = next_fire_after("0 2 * * *", at(2024, 1, 2, 2, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 3, 2, 0, 0));
    }

    #[test]
    fn test_quarter_hour() {
        let next = next_fire_after("*/15 * * * *", at(2024, 3, 5, 10, 7, 30)).unwrap();
        assert_eq!(next, at(2024, 3, 5, 10, 15, 0));
    }

    #[test]
    fn test_shorthand() {
        let next = next_fire_after("@hourly", at(2024, 3, 5, 10, 7, 30)).unwrap();
        assert_eq!(next, at(2024, 3, 5, 11, 0, 0));
    }

    #[test]
    fn test_monotonic_sequence() {
        let mut from = at(2024, 2, 28, 23, 59, 59);
        for _ in 0..50 {
            let next = next_fire_after("*/7 * * * *", from).unwrap();
            assert!(next > from);
            from = next;
        }
    }

    #[test]
    fn test_invalid_triggers() {
        for expression in ["", "invalid", "0 99 * * *", "every day at 2am"] {
            let err = next_fire_after(expression, at(2024, 1, 1, 0, 0, 0)).unwrap_err();
            assert!(matches!(err, TriggerError::InvalidTrigger { .. }), "{}", expression);
        }
    }

    #[test]
    fn test_format_local() {
        let ts = at(2024, 7, 1, 12, 0, 0);
        assert_eq!(format_local(ts, Tz::UTC), "2024-07-01 12:00:00 UTC");
        assert_eq!(
            format_local(ts, chrono_tz::Europe::Berlin),
            "2024-07-01 14:00:00 CEST"
        );
    }

    #[test]
    fn test_generate_cron_expression_strips_formatting() {
        let model = ScriptedModel::new(vec![text("`0 2 * * *`\n")]);

        let expression = tokio_test::block_on(generate_cron_expression(
            &model,
            "deepseek-chat",
            "every day at 2am",
        ))
        .unwrap();

        assert_eq!(expression, "0 2 * * *");
        assert_eq!(model.calls.lock().unwrap()[0].0, "deepseek-chat");
    }

    #[test]
    fn test_generate_cron_expression_rejects_prose() {
        let model = ScriptedModel::new(vec![text("I think you mean daily")]);

        let result =
            tokio_test::block_on(generate_cron_expression(&model, "deepseek-chat", "daily"));

        assert!(result.is_err());
    }
}
