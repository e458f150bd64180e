//! Zero-width bot signature appended to every outbound message.
//!
//! When two gateway replicas share one WhatsApp account, each replica sees the
//! other's outbound traffic as inbound events. The signature lets a replica
//! recognize gateway-originated text without shared state.

/// `U+200B U+200C U+200B`, invisible in every chat client.
pub const BOT_SIGNATURE: &str = "\u{200B}\u{200C}\u{200B}";

/// Signature length in characters (transports count characters, not bytes).
pub const BOT_SIGNATURE_LEN: usize = 3;

/// Appends the signature to an outbound message body.
pub fn sign(text: &str) -> String {
    let mut signed = String::with_capacity(text.len() + BOT_SIGNATURE.len());
    signed.push_str(text);
    signed.push_str(BOT_SIGNATURE);
    signed
}

/// Returns true when `text` carries the signature anywhere in its body.
pub fn carries_signature(text: &str) -> bool {
    text.contains(BOT_SIGNATURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_detect() {
        let signed = sign("market update");
        assert!(carries_signature(&signed));
        assert!(signed.starts_with("market update"));
        assert_eq!(signed.chars().count(), "market update".chars().count() + 3);
    }

    #[test]
    fn plain_text_is_unsigned() {
        assert!(!carries_signature("hello"));
        assert!(!carries_signature(""));
    }

    #[test]
    fn detects_signature_mid_text() {
        let echoed = format!("prefix {BOT_SIGNATURE} suffix");
        assert!(carries_signature(&echoed));
    }
}
