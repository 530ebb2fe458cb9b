//! Localized reply templates for the fast path and for fallbacks.
//!
//! Every lookup takes a [`Language`] and falls back to English. Templated
//! errors are the only internal failures users ever see.

use concierge_core::types::Language;

/// Greeting template (fast path, no LLM).
pub fn greeting(language: Language) -> &'static str {
    match language {
        Language::En => "Hello! How can I help you today? Would you like to schedule an appointment?",
        Language::Es => "¡Hola! ¿Cómo puedo ayudarle hoy? ¿Desea programar una cita?",
        Language::Ru => "Здравствуйте! Как я могу помочь вам сегодня? Вы хотите записаться на прием?",
        Language::He => "שלום! איך אני יכול לעזור לך היום? האם תרצה לקבוע פגישה?",
        Language::Pt => "Olá! Como posso ajudá-lo hoje? Gostaria de agendar uma consulta?",
    }
}

/// "Which day?" question when a time was confirmed without a date.
pub fn need_date(language: Language, hour: u8, minute: u8) -> String {
    match language {
        Language::En => format!("Perfect! For {hour}:{minute:02}. What day would you like to come in?"),
        Language::Es => format!("¡Perfecto! Para las {hour}:{minute:02}. ¿Qué día le gustaría venir?"),
        Language::Ru => format!("Отлично! На {hour}:{minute:02}. На какой день вы хотите записаться?"),
        Language::He => format!("מעולה! ל-{hour}:{minute:02}. לאיזה יום תרצה להגיע?"),
        Language::Pt => format!("Perfeito! Para {hour}:{minute:02}. Que dia você gostaria de vir?"),
    }
}

/// Meta-reset confirmation stored and sent after constraints are cleared.
pub fn reset_confirmation(language: Language) -> &'static str {
    match language {
        Language::En => "Understood, starting fresh! What would you like to discuss?",
        Language::Es => "Entendido, empezamos de nuevo! ¿De qué quieres hablar?",
        Language::Ru => "Понял, начинаем с чистого листа! О чём вы хотите поговорить?",
        Language::He => "הבנתי, מתחילים מחדש! על מה תרצה לדבר?",
        Language::Pt => "Entendido, começando de novo! O que você gostaria de discutir?",
    }
}

/// Pipeline-level error fallback ("Sorry, I encountered an error…").
pub fn pipeline_error(language: Language) -> &'static str {
    match language {
        Language::En => "I'm sorry, I encountered an error. Please try again.",
        Language::Es => "Lo siento, encontré un error. Por favor, intente de nuevo.",
        Language::Ru => "Извините, произошла ошибка. Пожалуйста, попробуйте снова.",
        Language::He => "סליחה, אירעה שגיאה. אנא נסה שוב.",
        Language::Pt => "Desculpe, ocorreu um erro. Por favor, tente novamente.",
    }
}

/// Soft fallback when the LLM times out and no better reply exists.
pub fn generic_fallback(language: Language) -> &'static str {
    match language {
        Language::En => "I understand. How can I help you today?",
        Language::Es => "Entiendo. ¿En qué puedo ayudarte?",
        Language::Ru => "Понимаю. Чем могу помочь?",
        Language::He => "אני מבין. במה אוכל לעזור?",
        Language::Pt => "Entendo. Como posso ajudar?",
    }
}

/// Header for the doctor-listing fallback used on LLM timeout when the
/// query looked doctor-related.
pub fn doctor_list_header(language: Language) -> &'static str {
    match language {
        Language::En => "We have the following doctors:",
        Language::Es => "Tenemos los siguientes médicos:",
        Language::Ru => "У нас работают следующие врачи:",
        Language::He => "אלה הרופאים שלנו:",
        Language::Pt => "Temos os seguintes médicos:",
    }
}

/// Holding message sent when a conversation is escalated to a human.
pub fn escalation_holding(language: Language) -> &'static str {
    match language {
        Language::En => "Thanks for reaching out — a member of our team will take over this conversation shortly.",
        Language::Es => "Gracias por escribirnos — un miembro de nuestro equipo continuará esta conversación en breve.",
        Language::Ru => "Спасибо за обращение — сотрудник нашей команды скоро продолжит этот разговор.",
        Language::He => "תודה על פנייתך — נציג מהצוות שלנו ימשיך את השיחה בקרוב.",
        Language::Pt => "Obrigado pelo contato — um membro da nossa equipe continuará esta conversa em breve.",
    }
}

/// Apology sent when the assistant needs more time (timeout context).
pub fn apology_timeout(language: Language) -> &'static str {
    match language {
        Language::En => "I need a bit more time to find this information. I'll be back soon.",
        Language::Es => "Necesito un poco más de tiempo para encontrar esta información. Volveré pronto.",
        Language::Ru => "Мне нужно немного больше времени, чтобы найти эту информацию. Я скоро вернусь.",
        Language::He => "אני צריך קצת יותר זמן למצוא את המידע הזה. אחזור בקרוב.",
        Language::Pt => "Preciso de um pouco mais de tempo para encontrar esta informação. Volto logo.",
    }
}

/// "I'll follow up in N hours" notification.
pub fn followup_notification(language: Language, hours: u32) -> String {
    let time_str = match language {
        Language::En if hours < 1 => "within an hour".to_string(),
        Language::En if hours == 1 => "in 1 hour".to_string(),
        Language::En if hours <= 24 => format!("in {hours} hours"),
        Language::En => format!("in {} days", hours / 24),
        Language::Es if hours < 1 => "en menos de una hora".to_string(),
        Language::Es if hours == 1 => "en 1 hora".to_string(),
        Language::Es if hours <= 24 => format!("en {hours} horas"),
        Language::Es => format!("en {} días", hours / 24),
        Language::Ru if hours < 1 => "в течение часа".to_string(),
        Language::Ru if hours == 1 => "через 1 час".to_string(),
        Language::Ru if hours <= 24 => format!("через {hours} часов"),
        Language::Ru => format!("через {} дней", hours / 24),
        Language::He if hours <= 1 => "תוך שעה".to_string(),
        Language::He if hours <= 24 => format!("בעוד {hours} שעות"),
        Language::He => format!("בעוד {} ימים", hours / 24),
        Language::Pt if hours < 1 => "em menos de uma hora".to_string(),
        Language::Pt if hours == 1 => "em 1 hora".to_string(),
        Language::Pt if hours <= 24 => format!("em {hours} horas"),
        Language::Pt => format!("em {} dias", hours / 24),
    };
    match language {
        Language::En => format!("I'll follow up with you {time_str} with an update."),
        Language::Es => format!("Me comunicaré con usted {time_str} con una actualización."),
        Language::Ru => format!("Я свяжусь с вами {time_str} с обновлением."),
        Language::He => format!("אחזור אליך {time_str} עם עדכון."),
        Language::Pt => format!("Entrarei em contato {time_str} com uma atualização."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_language_has_a_greeting() {
        for lang in [Language::En, Language::Es, Language::Ru, Language::He, Language::Pt] {
            assert!(!greeting(lang).is_empty());
            assert!(!pipeline_error(lang).is_empty());
            assert!(!escalation_holding(lang).is_empty());
        }
    }

    #[test]
    fn need_date_pads_minutes() {
        assert!(need_date(Language::En, 9, 5).contains("9:05"));
        assert!(need_date(Language::Ru, 14, 0).contains("14:00"));
    }

    #[test]
    fn reset_confirmation_russian_wording() {
        assert!(reset_confirmation(Language::Ru).starts_with("Понял, начинаем с чистого листа!"));
    }

    #[test]
    fn followup_notification_scales_units() {
        assert!(followup_notification(Language::En, 1).contains("in 1 hour"));
        assert!(followup_notification(Language::En, 5).contains("in 5 hours"));
        assert!(followup_notification(Language::En, 48).contains("in 2 days"));
    }
}
