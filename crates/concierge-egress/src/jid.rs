//! Phone number normalization to WhatsApp JID form.

/// Convert a phone number to JID format.
///
/// `+79857608984` → `79857608984@s.whatsapp.net`; anything already carrying
/// an `@` suffix (`@lid`, `@s.whatsapp.net`) is preserved as-is.
pub fn to_jid(number: &str) -> String {
    if number.contains('@') {
        return number.to_string();
    }
    let clean: String = number
        .chars()
        .filter(|c| *c != '+' && *c != ' ' && *c != '-')
        .collect();
    format!("{clean}@s.whatsapp.net")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_plus_and_formatting() {
        assert_eq!(to_jid("+7 985 760-89-84"), "79857608984@s.whatsapp.net");
        assert_eq!(to_jid("79857608984"), "79857608984@s.whatsapp.net");
    }

    #[test]
    fn preserves_existing_jid() {
        assert_eq!(to_jid("20886862172386@lid"), "20886862172386@lid");
        assert_eq!(
            to_jid("79857608984@s.whatsapp.net"),
            "79857608984@s.whatsapp.net"
        );
    }
}
