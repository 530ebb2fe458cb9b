use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use regex::Regex;
use tracing::debug;

use concierge_core::types::Language;

use crate::constraints::ConversationConstraints;

/// A normalized relative time expression.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindow {
    /// Window start, ISO format, clinic-local.
    pub start: String,
    /// Window end, ISO format, clinic-local.
    pub end: String,
    /// Human-readable label, e.g. "tomorrow morning".
    pub label: String,
}

/// Result of a switch detection: exclude the first, desire the second.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchPattern {
    pub exclude: String,
    pub desire: String,
}

// "forget X" / "not X" / "anything but X" — capture group 1 is the entity.
static FORGET_EN: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\bforget (?:about )?(?:the )?([\p{L} .'-]{2,40}?)(?:[.,!?]|$)",
        r"(?i)\banything but (?:the )?([\p{L} .'-]{2,40}?)(?:[.,!?]|$)",
        r"(?i)\bnot (?:with |the )?(dr\.? [\p{L} .'-]{2,40}?)(?:[.,!?]|$)",
        r"(?i)\bno more ([\p{L} .'-]{2,40}?)(?:[.,!?]|$)",
    ])
});

static FORGET_ES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\bolvida(?:te de)? (?:el |la )?([\p{L} .'-]{2,40}?)(?:[.,!?]|$)",
        r"(?i)\bno quiero (?:el |la |a )?([\p{L} .'-]{2,40}?)(?:[.,!?]|$)",
        r"(?i)\bmenos (?:el |la )?(dr\.? [\p{L} .'-]{2,40}?)(?:[.,!?]|$)",
    ])
});

static FORGET_RU: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\bзабудь(?:те)? (?:про |о )?([\p{L} .'-]{2,40}?)(?:[.,!?]|$)",
        r"(?i)\bтолько не ([\p{L} .'-]{2,40}?)(?:[.,!?]|$)",
        r"(?i)\bбез ([\p{L} .'-]{2,40}?)(?:[.,!?]|$)",
    ])
});

// "instead of X, Y" — group 1 excluded, group 2 desired.
static SWITCH_EN: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\binstead of (?:the )?([\p{L} .'-]{2,40}?),?\s+(?:i(?:'d| would)? (?:like|want|prefer)\s+)?(?:a |an |the )?([\p{L} .'-]{2,40}?)(?:\s+please)?(?:[.,!?]|$)",
        r"(?i)\bnot (?:the )?([\p{L} .'-]{2,40}?),\s*(?:a |an |the )?([\p{L} .'-]{2,40}?)\s+please\b",
    ])
});

static SWITCH_ES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\ben vez de (?:el |la )?([\p{L} .'-]{2,40}?),?\s+(?:quiero |prefiero )?(?:el |la |una? )?([\p{L} .'-]{2,40}?)(?:[.,!?]|$)",
    ])
});

static SWITCH_RU: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\bвместо ([\p{L} .'-]{2,40}?),?\s+(?:хочу |лучше )?([\p{L} .'-]{2,40}?)(?:[.,!?]|$)",
    ])
});

// Meta-reset phrases clear ALL constraints and short-circuit the pipeline.
static META_RESET: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\bstart over\b",
        r"(?i)\bstart from scratch\b",
        r"(?i)\breset everything\b",
        r"(?i)\bempezar de nuevo\b",
        r"(?i)\bempecemos de nuevo\b",
        r"(?i)начн[ёе]м сначала",
        r"(?i)начать заново",
        r"(?i)с чистого листа",
        r"(?i)\bcomeçar de novo\b",
        r"(?i)נתחיל מחדש",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
}

/// Parses constraint deltas out of free-form user text.
///
/// Every detector is language-aware: the detected language picks the pattern
/// table, with English always tried as a fallback (code-switching is common
/// on WhatsApp).
pub struct ConstraintExtractor;

impl ConstraintExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Entities the user wants dropped, to be excluded from both doctors and
    /// services (the caller does not know which kind the name refers to).
    pub fn detect_forget_pattern(&self, message: &str, language: Language) -> Vec<String> {
        let tables: &[&LazyLock<Vec<Regex>>] = match language {
            Language::Es => &[&FORGET_ES, &FORGET_EN],
            Language::Ru => &[&FORGET_RU, &FORGET_EN],
            _ => &[&FORGET_EN],
        };

        let mut out = Vec::new();
        for table in tables {
            for re in table.iter() {
                for caps in re.captures_iter(message) {
                    if let Some(entity) = caps.get(1) {
                        let entity = entity.as_str().trim().to_string();
                        if !entity.is_empty() && !out.contains(&entity) {
                            out.push(entity);
                        }
                    }
                }
            }
        }
        if !out.is_empty() {
            debug!(count = out.len(), "forget pattern detected");
        }
        out
    }

    /// "instead of X, Y" → exclude X, desire Y.
    pub fn detect_switch_pattern(&self, message: &str, language: Language) -> Option<SwitchPattern> {
        let tables: &[&LazyLock<Vec<Regex>>] = match language {
            Language::Es => &[&SWITCH_ES, &SWITCH_EN],
            Language::Ru => &[&SWITCH_RU, &SWITCH_EN],
            _ => &[&SWITCH_EN],
        };

        for table in tables {
            for re in table.iter() {
                if let Some(caps) = re.captures(message) {
                    let exclude = caps.get(1)?.as_str().trim().to_string();
                    let desire = caps.get(2)?.as_str().trim().to_string();
                    if !exclude.is_empty() && !desire.is_empty() {
                        return Some(SwitchPattern { exclude, desire });
                    }
                }
            }
        }
        None
    }

    /// Whether the message is an explicit "drop everything" command.
    pub fn is_meta_reset(&self, message: &str) -> bool {
        META_RESET.iter().any(|re| re.is_match(message))
    }

    /// Normalize relative time expressions against a clinic-local reference
    /// instant. Returns None when the message carries no time expression.
    pub fn normalize_time_window(
        &self,
        message: &str,
        now: NaiveDateTime,
        _language: Language,
    ) -> Option<TimeWindow> {
        let lower = message.to_lowercase();
        let today = now.date();

        // Day-part modifiers narrow whichever day is matched.
        let part = detect_day_part(&lower);

        if contains_any(&lower, &["tomorrow", "mañana", "завтра", "amanhã", "מחר"]) {
            return Some(day_window(today + Duration::days(1), part, "tomorrow"));
        }
        if contains_any(&lower, &["today", "hoy", "сегодня", "hoje", "היום"]) {
            return Some(day_window(today, part, "today"));
        }
        if contains_any(&lower, &["this week", "esta semana", "на этой неделе", "esta semana"]) {
            let end = today + Duration::days(i64::from(6 - today.weekday().num_days_from_monday()));
            return Some(span_window(today, end, "this week"));
        }
        if contains_any(&lower, &["next week", "próxima semana", "на следующей неделе", "la semana que viene"])
        {
            let start =
                today + Duration::days(i64::from(7 - today.weekday().num_days_from_monday()));
            return Some(span_window(start, start + Duration::days(6), "next week"));
        }

        if let Some((weekday, label)) = detect_weekday(&lower) {
            let mut date = today + Duration::days(1);
            while date.weekday() != weekday {
                date += Duration::days(1);
            }
            return Some(day_window(date, part, label));
        }

        // A bare day part still narrows today.
        if let Some(p) = part {
            return Some(day_window(today, Some(p), "today"));
        }

        None
    }

    /// Apply everything detectable in one pass. Returns true when any
    /// constraint changed.
    pub fn apply(
        &self,
        constraints: &mut ConversationConstraints,
        message: &str,
        language: Language,
        now: NaiveDateTime,
    ) -> bool {
        let mut changed = false;

        for entity in self.detect_forget_pattern(message, language) {
            constraints.exclude(&entity);
            changed = true;
        }

        if let Some(switch) = self.detect_switch_pattern(message, language) {
            constraints.switch_service(&switch.exclude, &switch.desire);
            changed = true;
        }

        if let Some(window) = self.normalize_time_window(message, now, language) {
            constraints.set_time_window(&window.start, &window.end, &window.label);
            changed = true;
        }

        changed
    }
}

impl Default for ConstraintExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DayPart {
    Morning,
    Afternoon,
    Evening,
}

fn detect_day_part(lower: &str) -> Option<DayPart> {
    if contains_any(lower, &["morning", "mañana por la", "утром", "утра", "manhã", "בבוקר"]) {
        return Some(DayPart::Morning);
    }
    if contains_any(lower, &["afternoon", "tarde", "днём", "днем", "à tarde"]) {
        return Some(DayPart::Afternoon);
    }
    if contains_any(lower, &["evening", "noche", "вечером", "à noite", "בערב"]) {
        return Some(DayPart::Evening);
    }
    None
}

fn detect_weekday(lower: &str) -> Option<(Weekday, &'static str)> {
    const TABLE: &[(&str, Weekday, &str)] = &[
        ("monday", Weekday::Mon, "Monday"),
        ("lunes", Weekday::Mon, "Monday"),
        ("понедельник", Weekday::Mon, "Monday"),
        ("tuesday", Weekday::Tue, "Tuesday"),
        ("martes", Weekday::Tue, "Tuesday"),
        ("вторник", Weekday::Tue, "Tuesday"),
        ("wednesday", Weekday::Wed, "Wednesday"),
        ("miércoles", Weekday::Wed, "Wednesday"),
        ("среда", Weekday::Wed, "Wednesday"),
        ("thursday", Weekday::Thu, "Thursday"),
        ("jueves", Weekday::Thu, "Thursday"),
        ("четверг", Weekday::Thu, "Thursday"),
        ("friday", Weekday::Fri, "Friday"),
        ("viernes", Weekday::Fri, "Friday"),
        ("пятниц", Weekday::Fri, "Friday"),
        ("saturday", Weekday::Sat, "Saturday"),
        ("sábado", Weekday::Sat, "Saturday"),
        ("суббот", Weekday::Sat, "Saturday"),
        ("sunday", Weekday::Sun, "Sunday"),
        ("domingo", Weekday::Sun, "Sunday"),
        ("воскресень", Weekday::Sun, "Sunday"),
    ];
    TABLE
        .iter()
        .find(|(kw, _, _)| lower.contains(kw))
        .map(|(_, wd, label)| (*wd, *label))
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn day_window(date: NaiveDate, part: Option<DayPart>, base_label: &str) -> TimeWindow {
    let (start_h, end_h, suffix) = match part {
        Some(DayPart::Morning) => (8, 12, " morning"),
        Some(DayPart::Afternoon) => (12, 17, " afternoon"),
        Some(DayPart::Evening) => (17, 21, " evening"),
        None => (8, 21, ""),
    };
    TimeWindow {
        start: date
            .and_time(NaiveTime::from_hms_opt(start_h, 0, 0).expect("literal time"))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string(),
        end: date
            .and_time(NaiveTime::from_hms_opt(end_h, 0, 0).expect("literal time"))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string(),
        label: format!("{base_label}{suffix}"),
    }
}

fn span_window(start: NaiveDate, end: NaiveDate, label: &str) -> TimeWindow {
    TimeWindow {
        start: start
            .and_time(NaiveTime::from_hms_opt(8, 0, 0).expect("literal time"))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string(),
        end: end
            .and_time(NaiveTime::from_hms_opt(21, 0, 0).expect("literal time"))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string(),
        label: label.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn reference_now() -> NaiveDateTime {
        // A Wednesday.
        NaiveDate::from_ymd_opt(2026, 8, 5)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap()
    }

    #[test]
    fn forget_pattern_english() {
        let ex = ConstraintExtractor::new();
        let found = ex.detect_forget_pattern("Please forget the whitening", Language::En);
        assert_eq!(found, vec!["whitening".to_string()]);
    }

    #[test]
    fn forget_pattern_russian() {
        let ex = ConstraintExtractor::new();
        let found = ex.detect_forget_pattern("только не отбеливание", Language::Ru);
        assert_eq!(found, vec!["отбеливание".to_string()]);
    }

    #[test]
    fn switch_pattern_excludes_then_desires() {
        let ex = ConstraintExtractor::new();
        let switch = ex
            .detect_switch_pattern("instead of whitening, a cleaning please", Language::En)
            .expect("switch detected");
        assert_eq!(switch.exclude, "whitening");
        assert_eq!(switch.desire, "cleaning");
    }

    #[test]
    fn meta_reset_multilingual() {
        let ex = ConstraintExtractor::new();
        assert!(ex.is_meta_reset("let's start over"));
        assert!(ex.is_meta_reset("давай начнём сначала"));
        assert!(ex.is_meta_reset("empezar de nuevo por favor"));
        assert!(!ex.is_meta_reset("I want a cleaning"));
    }

    #[test]
    fn tomorrow_morning_window() {
        let ex = ConstraintExtractor::new();
        let w = ex
            .normalize_time_window("tomorrow morning works", reference_now(), Language::En)
            .expect("window");
        assert_eq!(w.start, "2026-08-06T08:00:00");
        assert_eq!(w.end, "2026-08-06T12:00:00");
        assert_eq!(w.label, "tomorrow morning");
    }

    #[test]
    fn this_week_spans_to_sunday() {
        let ex = ConstraintExtractor::new();
        let w = ex
            .normalize_time_window("sometime this week", reference_now(), Language::En)
            .expect("window");
        assert!(w.start.starts_with("2026-08-05"));
        assert!(w.end.starts_with("2026-08-09"));
    }

    #[test]
    fn next_weekday_rolls_forward() {
        let ex = ConstraintExtractor::new();
        // Reference is Wednesday; "Monday" means next Monday.
        let w = ex
            .normalize_time_window("next Mon please, Monday", reference_now(), Language::En)
            .expect("window");
        assert!(w.start.starts_with("2026-08-10"));
    }

    #[test]
    fn apply_keeps_invariant_after_forget_then_switch() {
        let ex = ConstraintExtractor::new();
        let mut c = ConversationConstraints::default();
        c.set_desired_service("whitening");

        let changed = ex.apply(
            &mut c,
            "instead of whitening, a cleaning please",
            Language::En,
            reference_now(),
        );
        assert!(changed);
        assert_eq!(c.desired_service.as_deref(), Some("cleaning"));
        assert!(c.excluded_services.contains("whitening"));
        assert!(c.invariant_holds());
    }

    #[test]
    fn no_time_expression_returns_none() {
        let ex = ConstraintExtractor::new();
        assert!(ex
            .normalize_time_window("I need a cleaning", reference_now(), Language::En)
            .is_none());
    }
}
