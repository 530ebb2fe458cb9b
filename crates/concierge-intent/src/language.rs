use concierge_core::types::Language;

/// Character-range language detection — good enough for the fast path.
/// The LLM step may override with its own detector on the generated reply.
pub fn detect_language(text: &str) -> Language {
    if text.chars().any(|c| ('\u{0400}'..='\u{04FF}').contains(&c)) {
        return Language::Ru;
    }
    if text.chars().any(|c| ('\u{0590}'..='\u{05FF}').contains(&c)) {
        return Language::He;
    }

    let lower = text.to_lowercase();
    // Portuguese before Spanish: the keyword sets overlap ("está").
    if ["olá", "obrigado", "obrigada", "você", "consulta amanhã"]
        .iter()
        .any(|w| lower.contains(w))
    {
        return Language::Pt;
    }
    if ["hola", "gracias", "señor", "está", "qué", "cita", "por favor"]
        .iter()
        .any(|w| lower.contains(w))
    {
        return Language::Es;
    }

    Language::En
}

/// Whether the text carries an unambiguous language signal — used by the
/// routing step's language inertia to decide when a short message may
/// override the persisted session language.
pub fn has_strong_indicator(text: &str) -> bool {
    if text.chars().any(|c| {
        ('\u{0400}'..='\u{04FF}').contains(&c) || ('\u{0590}'..='\u{05FF}').contains(&c)
    }) {
        return true;
    }
    let lower = text.to_lowercase();
    ["hola", "gracias", "por favor", "olá", "obrigado", "você"]
        .iter()
        .any(|w| lower.contains(w))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_ranges() {
        assert_eq!(detect_language("привет, хочу записаться"), Language::Ru);
        assert_eq!(detect_language("שלום, אפשר תור?"), Language::He);
        assert_eq!(detect_language("hola, gracias"), Language::Es);
        assert_eq!(detect_language("olá, obrigado"), Language::Pt);
        assert_eq!(detect_language("hello there"), Language::En);
    }

    #[test]
    fn strong_indicators() {
        assert!(has_strong_indicator("да"));
        assert!(has_strong_indicator("gracias"));
        assert!(!has_strong_indicator("ok"));
        assert!(!has_strong_indicator("9am"));
    }
}
