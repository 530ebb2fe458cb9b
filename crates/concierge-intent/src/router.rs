use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use concierge_core::flags;

/// Known intents that can be resolved without the LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    HandoffHuman,
    ConfirmTime,
    BookAppointment,
    Reschedule,
    Cancel,
    PriceQuery,
    FaqQuery,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Greeting => "greeting",
            Intent::HandoffHuman => "handoff_human",
            Intent::ConfirmTime => "confirm_time",
            Intent::BookAppointment => "book_appointment",
            Intent::Reschedule => "reschedule",
            Intent::Cancel => "cancel",
            Intent::PriceQuery => "price_query",
            Intent::FaqQuery => "faq_query",
            Intent::Unknown => "unknown",
        }
    }

    /// Intents with a local fast handler (template or cached lookup).
    pub fn has_fast_handler(&self) -> bool {
        matches!(
            self,
            Intent::Greeting | Intent::HandoffHuman | Intent::ConfirmTime | Intent::PriceQuery
        )
    }
}

struct PatternTable {
    intent: Intent,
    patterns: Vec<Regex>,
}

// Multilingual patterns. Order matters: the first matching table wins,
// so the most specific intents come first.
static TABLES: LazyLock<Vec<PatternTable>> = LazyLock::new(|| {
    vec![
        table(
            Intent::Greeting,
            &[
                // English
                r"^(hi|hello|hey|good\s+(morning|afternoon|evening|day))\b",
                // Spanish
                r"^(hola|buenos\s+(días|tardes|noches)|buenas)\b",
                // Russian
                r"^(привет|здравствуйте|добрый\s+(день|вечер)|доброе\s+утро)",
                // Hebrew
                r"^(שלום|בוקר\s+טוב|ערב\s+טוב)",
                // Portuguese
                r"^(oi|olá|bom\s+dia)\b",
            ],
        ),
        table(
            Intent::HandoffHuman,
            &[
                r"\b(speak|talk|connect|transfer).{0,20}(human|person|agent|someone|operator|representative)\b",
                r"\b(real|actual).{0,10}(person|agent|human)\b",
                r"\b(manager|supervisor)\b",
                r"\b(hablar|habla).{0,20}(humano|persona|agente)\b",
                r"\bpersona real\b",
                r"(живой\s+оператор|реальный\s+человек|настоящий\s+человек)",
                r"(לדבר עם אדם|נציג אמיתי)",
            ],
        ),
        table(
            Intent::ConfirmTime,
            &[
                // "Yes, at 9", "OK for 9:00", "Yeah, 9 AM works"
                r"^(yes|yeah|yep|ok|okay|sure|fine|perfect|great)[,\s].{0,15}\b(at|for)\s*(\d{1,2})(:\d{2})?\s*(am|pm|o'?clock)?\b",
                r"^(да|ага|окей|ок|хорошо|отлично|подходит)[,\s].{0,15}(на|в|к)\s*(\d{1,2})(:\d{2})?\s*(часов|утра|вечера)?",
                // "Sí, a las 9"
                r"^(sí|si|ok|vale|claro)[,\s].{0,15}\b(a\s+las|a)\s*(\d{1,2})(:(\d{2}))?\s*(am|pm)?",
                // Bare time at the start: "9 AM", "9:00"
                r"^(\d{1,2})(:\d{2})?\s*(am|pm|o'?clock|часов|утра|вечера)\b",
                // Russian word times: "к девяти", "на девять"
                r"^(к|на|в)\s*(\d{1,2}|девят[иь]|десят[иь]|одиннадцат[иь]|двенадцат[иь])\s*(часов|утра|вечера)?\b",
            ],
        ),
        table(
            Intent::BookAppointment,
            &[
                r"\b(book|schedule|make|set up).{0,20}(appointment|meeting|visit)\b",
                r"\b(need|want).{0,20}(appointment|see a? ?doctor|consultation)\b",
                r"\b(записаться|запишите).{0,20}(на при[её]м|к врачу)?",
                r"\b(agendar|reservar).{0,20}(cita|consulta)\b",
            ],
        ),
        table(
            Intent::Reschedule,
            &[
                r"\b(reschedule|change|move).{0,20}(appointment|booking|meeting)\b",
                r"\bcan.{0,20}(change|move|reschedule)\b",
                r"\bперенести.{0,20}(запись|при[её]м)\b",
            ],
        ),
        table(
            Intent::Cancel,
            &[
                r"\b(cancel|delete|remove).{0,20}(appointment|booking|meeting)\b",
                r"\bdon'?t need.{0,20}appointment\b",
                r"\bотменить.{0,20}(запись|при[её]м)\b",
                r"\bcancelar.{0,20}(cita|consulta)\b",
            ],
        ),
        table(
            Intent::PriceQuery,
            &[
                r"\b(how much|price|cost|fee).{0,30}(for|of|to)\b",
                r"\bwhat.{0,20}(cost|price|charge)\b",
                r"\b(сколько\s+стоит|какая\s+цена|какова\s+стоимость|стоимость)\b",
                r"\b(cuánto cuesta|precio|costo)\b",
                r"\b(quanto custa|preço)\b",
                r"\b(כמה עולה|מחיר)\b",
            ],
        ),
        table(
            Intent::FaqQuery,
            &[
                r"\b(what|how|when|where).{0,30}(hours|location|address|policy|insurance|procedure)\b",
                r"\bdo you (offer|provide|have|accept)\b",
                r"\b(qué|cómo|cuándo|dónde).{0,30}(horario|ubicación|política|seguro)\b",
                r"\b(tienen|ofrecen|aceptan)\b",
                r"\b(что|как|когда|где).{0,30}(часы|адрес|политика|страховка)\b",
            ],
        ),
    ]
});

fn table(intent: Intent, patterns: &[&str]) -> PatternTable {
    PatternTable {
        intent,
        patterns: patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")).expect("static pattern"))
            .collect(),
    }
}

/// Hour/minute parsed from a time-confirmation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTime {
    pub hour: u8,
    pub minute: u8,
}

static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,2})(?::(\d{2}))?\s*(am|pm|часов|утра|вечера)?").expect("static pattern")
});

static DATE_KEYWORDS: LazyLock<Vec<(&'static str, &'static str)>> = LazyLock::new(|| {
    vec![
        ("tomorrow", "tomorrow"),
        ("today", "today"),
        ("monday", "Monday"),
        ("tuesday", "Tuesday"),
        ("wednesday", "Wednesday"),
        ("thursday", "Thursday"),
        ("friday", "Friday"),
        ("saturday", "Saturday"),
        ("sunday", "Sunday"),
        ("mañana", "mañana"),
        ("hoy", "hoy"),
        ("lunes", "lunes"),
        ("martes", "martes"),
        ("miércoles", "miércoles"),
        ("jueves", "jueves"),
        ("viernes", "viernes"),
        ("sábado", "sábado"),
        ("domingo", "domingo"),
        ("завтра", "завтра"),
        ("сегодня", "сегодня"),
    ]
});

static NUMERIC_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,2}[/-]\d{1,2}([/-]\d{2,4})?").expect("static pattern"));

/// Fast-path intent detection with a sub-millisecond budget — pure regex,
/// no LLM.
pub struct IntentRouter;

impl IntentRouter {
    pub fn new() -> Self {
        Self
    }

    /// Detect user intent. Returns `Unknown` when the fast path is disabled
    /// by feature flag so callers fall through to full processing.
    pub fn detect_intent(&self, text: &str) -> Intent {
        if !flags::is_fast_path_enabled() {
            debug!("fast path disabled via feature flag");
            return Intent::Unknown;
        }
        if text.trim().len() < 3 {
            return Intent::Unknown;
        }

        for table in TABLES.iter() {
            for pattern in &table.patterns {
                if pattern.is_match(text) {
                    info!(intent = table.intent.as_str(), "fast path intent detected");
                    return table.intent;
                }
            }
        }
        Intent::Unknown
    }

    /// Extract hour/minute from a time-confirmation message.
    pub fn parse_time(&self, text: &str) -> Option<ParsedTime> {
        let lower = text.to_lowercase();

        if let Some(caps) = TIME_RE.captures(&lower) {
            let mut hour: u8 = caps.get(1)?.as_str().parse().ok()?;
            let minute: u8 = caps
                .get(2)
                .map(|m| m.as_str().parse().unwrap_or(0))
                .unwrap_or(0);
            if hour > 23 || minute > 59 {
                return None;
            }
            match caps.get(3).map(|m| m.as_str()) {
                Some("pm") | Some("вечера") if hour < 12 => hour += 12,
                Some("am") | Some("утра") if hour == 12 => hour = 0,
                _ => {}
            }
            return Some(ParsedTime { hour, minute });
        }

        // Russian word-based hours.
        const RU_HOURS: &[(&str, u8)] = &[
            ("девят", 9),
            ("десят", 10),
            ("одиннадцат", 11),
            ("двенадцат", 12),
        ];
        RU_HOURS
            .iter()
            .find(|(word, _)| lower.contains(word))
            .map(|(_, hour)| ParsedTime {
                hour: *hour,
                minute: 0,
            })
    }

    /// Extract a date reference (tomorrow, weekday name, DD/MM). The raw
    /// keyword is returned so downstream templating echoes the user's words.
    pub fn parse_date(&self, text: &str) -> Option<String> {
        let lower = text.to_lowercase();
        for (keyword, label) in DATE_KEYWORDS.iter() {
            if lower.contains(keyword) {
                return Some((*label).to_string());
            }
        }
        NUMERIC_DATE_RE
            .find(&lower)
            .map(|m| m.as_str().to_string())
    }
}

impl Default for IntentRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    // Tests mutate process env; serialize them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn router() -> (MutexGuard<'static, ()>, IntentRouter) {
        let guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("FAST_PATH_ENABLED", "1");
        concierge_core::flags::reload();
        (guard, IntentRouter::new())
    }

    #[test]
    fn greeting_five_languages() {
        let (_guard, r) = router();
        assert_eq!(r.detect_intent("Hello"), Intent::Greeting);
        assert_eq!(r.detect_intent("hola, buenos días"), Intent::Greeting);
        assert_eq!(r.detect_intent("Здравствуйте"), Intent::Greeting);
        assert_eq!(r.detect_intent("שלום"), Intent::Greeting);
        assert_eq!(r.detect_intent("olá"), Intent::Greeting);
    }

    #[test]
    fn handoff_detection() {
        let (_guard, r) = router();
        assert_eq!(r.detect_intent("I want to speak to a human"), Intent::HandoffHuman);
        assert_eq!(r.detect_intent("нужен живой оператор"), Intent::HandoffHuman);
    }

    #[test]
    fn confirm_time_variants() {
        let (_guard, r) = router();
        assert_eq!(r.detect_intent("Yes, at 9 works"), Intent::ConfirmTime);
        assert_eq!(r.detect_intent("да, на 9 часов"), Intent::ConfirmTime);
        assert_eq!(r.detect_intent("9:30 am"), Intent::ConfirmTime);
    }

    #[test]
    fn price_query_multilingual() {
        let (_guard, r) = router();
        assert_eq!(r.detect_intent("how much is it for a cleaning?"), Intent::PriceQuery);
        assert_eq!(r.detect_intent("сколько стоит чистка?"), Intent::PriceQuery);
        assert_eq!(r.detect_intent("cuánto cuesta la limpieza"), Intent::PriceQuery);
    }

    #[test]
    fn unknown_for_short_or_unmatched() {
        let (_guard, r) = router();
        assert_eq!(r.detect_intent("ok"), Intent::Unknown);
        assert_eq!(r.detect_intent("the quick brown fox"), Intent::Unknown);
    }

    #[test]
    fn disabled_flag_returns_unknown() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("FAST_PATH_ENABLED", "0");
        concierge_core::flags::reload();
        let r = IntentRouter::new();
        assert_eq!(r.detect_intent("Hello"), Intent::Unknown);
    }

    #[test]
    fn time_parsing_handles_meridiem() {
        let (_guard, r) = router();
        assert_eq!(r.parse_time("at 9 pm"), Some(ParsedTime { hour: 21, minute: 0 }));
        assert_eq!(r.parse_time("9:45"), Some(ParsedTime { hour: 9, minute: 45 }));
        assert_eq!(r.parse_time("к девяти"), Some(ParsedTime { hour: 9, minute: 0 }));
        assert_eq!(r.parse_time("no time here"), None);
    }

    #[test]
    fn date_parsing() {
        let (_guard, r) = router();
        assert_eq!(r.parse_date("yes, tomorrow at 9").as_deref(), Some("tomorrow"));
        assert_eq!(r.parse_date("el viernes").as_deref(), Some("viernes"));
        assert_eq!(r.parse_date("12/08 ok?").as_deref(), Some("12/08"));
        assert_eq!(r.parse_date("at nine"), None);
    }
}
