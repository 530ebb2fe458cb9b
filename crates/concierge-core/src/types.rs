use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a clinic (tenant). Opaque UUID string from the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClinicId(pub String);

impl ClinicId {
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for ClinicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClinicId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClinicId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A tenant's WhatsApp connection, e.g. `clinic-<uuid>-<epoch>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceName(pub String);

impl InstanceName {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Supported conversation languages. Detection is heuristic (character ranges
/// plus keyword hints); `en` is the universal fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Es,
    Ru,
    He,
    Pt,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Es => "es",
            Language::Ru => "ru",
            Language::He => "he",
            Language::Pt => "pt",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "en" => Ok(Language::En),
            "es" => Ok(Language::Es),
            "ru" => Ok(Language::Ru),
            "he" => Ok(Language::He),
            "pt" => Ok(Language::Pt),
            other => Err(format!("unknown language: {}", other)),
        }
    }
}

/// Strip a WhatsApp JID suffix and formatting from a phone identifier so
/// session keys stay stable across channels.
pub fn clean_phone(raw: &str) -> String {
    let stripped = raw
        .split('@')
        .next()
        .unwrap_or(raw)
        .trim_start_matches("whatsapp:");
    stripped
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_phone_strips_jid_and_formatting() {
        assert_eq!(clean_phone("+1 555-123-4567"), "15551234567");
        assert_eq!(clean_phone("79857608984@s.whatsapp.net"), "79857608984");
        assert_eq!(clean_phone("whatsapp:+15551234567"), "15551234567");
    }

    #[test]
    fn language_roundtrip() {
        for lang in [Language::En, Language::Es, Language::Ru, Language::He, Language::Pt] {
            assert_eq!(lang.as_str().parse::<Language>().unwrap(), lang);
        }
        assert!("xx".parse::<Language>().is_err());
    }
}
