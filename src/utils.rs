use crate::collections::MONTH_NAMES;
use crate::consts::TTS_MAX_CHARS;
use crate::db_types::LanguagePref;

use bigdecimal::BigDecimal;
use once_cell::sync::Lazy;
use regex::Regex;
use std::str::FromStr;

/// Normalise an Indian mobile number to E.164. Anything unrecognised is returned unchanged.
pub fn sanitize_phone_number(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    let is_mobile = |d: &str| d.len() == 10 && d.starts_with(['6', '7', '8', '9']);
    if is_mobile(&digits) {
        format!("+91{digits}")
    } else if digits.len() == 12 && digits.starts_with("91") {
        format!("+{digits}")
    } else if digits.starts_with('0') && is_mobile(&digits[1..]) {
        format!("+91{}", &digits[1..])
    } else {
        phone.to_string()
    }
}

static RUPEE_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)₹\s*(\d+(?:,\d+)*(?:\.\d{1,2})?)",
        r"|\b(\d+(?:,\d+)*(?:\.\d{1,2})?)\s*(?:rupees?|rs\b\.?)",
    ))
    .expect("rupee amount pattern")
});

// A bare number next to a month name is a calendar day, not an amount.
static BARE_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    let months = MONTH_NAMES.join("|");
    Regex::new(&format!(
        r"(?i)((?:{months})\s+)?\b(\d+(?:,\d+)*(?:\.\d{{1,2}})?)\b(\s+(?:{months})\b)?"
    ))
    .expect("bare amount pattern")
});

/// First monetary amount mentioned in `text`, preferring explicit rupee markers over bare
/// numbers. Ordinals ("15th") and day-of-month numbers ("15 march") are not amounts.
pub fn extract_amount_from_text(text: &str) -> Option<BigDecimal> {
    let parse = |digits: &str| BigDecimal::from_str(&digits.replace(',', "")).ok();
    if let Some(amount) = RUPEE_AMOUNT
        .captures(text)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .and_then(|m| parse(m.as_str()))
    {
        return Some(amount);
    }
    BARE_AMOUNT
        .captures_iter(text)
        .filter(|caps| caps.get(1).is_none() && caps.get(3).is_none())
        .find_map(|caps| caps.get(2).and_then(|m| parse(m.as_str())))
}

/// `₹12,345.50`
pub fn format_currency(amount: &BigDecimal) -> String {
    let fixed = amount.with_scale(2).to_string();
    let (sign, unsigned) = match fixed.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", fixed.as_str()),
    };
    let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, "00"));
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{sign}₹{grouped}.{fraction}")
}

/// `+91****3210`
pub fn mask_phone(phone: &str) -> String {
    let chars: Vec<char> = phone.chars().collect();
    if chars.len() > 7 {
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}****{tail}")
    } else {
        "****".to_string()
    }
}

/// `R**********h`
pub fn mask_name(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    if chars.len() > 2 {
        format!(
            "{}{}{}",
            chars[0],
            "*".repeat(chars.len() - 2),
            chars[chars.len() - 1]
        )
    } else {
        "****".to_string()
    }
}

static ABBREVIATIONS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:EMI|KYC|PAN|UPI|NBFC)\b").expect("abbreviation pattern"));
static CURRENCY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\bRs\.|₹)\s*").expect("currency pattern"));

/// "UPI" is read out as "U.P.I.". A full stop right after the abbreviation doubles as the
/// last letter's.
fn spell_out_abbreviations(text: &str) -> String {
    let mut spoken = String::with_capacity(text.len() + 16);
    let mut last = 0;
    for m in ABBREVIATIONS.find_iter(text) {
        spoken.push_str(&text[last..m.start()]);
        let letters: String = m.as_str().chars().map(|c| format!("{c}.")).collect();
        if text[m.end()..].starts_with('.') {
            spoken.push_str(letters.trim_end_matches('.'));
        } else {
            spoken.push_str(&letters);
        }
        last = m.end();
    }
    spoken.push_str(&text[last..]);
    CURRENCY.replace_all(&spoken, "rupees ").into_owned()
}

/// Collapse whitespace, cut long prompts at a sentence boundary and spell out abbreviations
/// so the speech engine pronounces them.
pub fn text_to_speech_optimized(text: &str) -> String {
    text_to_speech_with_limit(text, TTS_MAX_CHARS)
}

pub fn text_to_speech_with_limit(text: &str, max_chars: usize) -> String {
    let mut text = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if text.chars().count() > max_chars {
        let mut truncated = String::new();
        for sentence in text.split(". ") {
            if truncated.chars().count() + sentence.chars().count() <= max_chars.saturating_sub(3)
            {
                truncated.push_str(sentence);
                truncated.push_str(". ");
            } else {
                break;
            }
        }
        let mut truncated = truncated.trim().to_string();
        if truncated.is_empty() || truncated.chars().count() > max_chars {
            truncated = text.chars().take(max_chars.saturating_sub(3)).collect();
            truncated.push_str("...");
        }
        text = truncated;
    }

    spell_out_abbreviations(&text)
}

/// Twilio `<Say>` voice and language for a borrower's preference.
pub fn voice_settings(language: LanguagePref) -> (&'static str, &'static str) {
    match language {
        LanguagePref::Hi => ("alice", "hi-IN"),
        LanguagePref::En => ("alice", "en-IN"),
    }
}

/// Twilio reports durations as a string of seconds; anything unparseable counts as zero.
pub fn parse_twilio_duration(duration: Option<&str>) -> i32 {
    duration
        .and_then(|d| d.trim().parse::<i32>().ok())
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseTemplate {
    VerificationFailed,
    PaymentConfirmation,
    CallbackScheduled,
    DncConfirmed,
}

pub fn response_template(template: ResponseTemplate, language: LanguagePref) -> &'static str {
    use ResponseTemplate::*;
    match (template, language) {
        (VerificationFailed, LanguagePref::En) => {
            "I couldn't verify your identity. Let me transfer you to an agent for assistance."
        }
        (VerificationFailed, LanguagePref::Hi) => {
            "मैं आपकी पहचान सत्यापित नहीं कर सका। मैं आपको सहायता के लिए एजेंट के पास स्थानांतरित कर देता हूं।"
        }
        (PaymentConfirmation, LanguagePref::En) => {
            "Thank you for your payment commitment. You'll receive a confirmation shortly."
        }
        (PaymentConfirmation, LanguagePref::Hi) => {
            "आपकी भुगतान प्रतिबद्धता के लिए धन्यवाद। आपको शीघ्र ही पुष्टि प्राप्त होगी।"
        }
        (CallbackScheduled, LanguagePref::En) => {
            "I've scheduled a callback as requested. Thank you for your time."
        }
        (CallbackScheduled, LanguagePref::Hi) => {
            "मैंने अनुरोध के अनुसार कॉलबैक निर्धारित किया है। आपके समय के लिए धन्यवाद।"
        }
        (DncConfirmed, LanguagePref::En) => {
            "I've added you to our do-not-call list. You won't receive further collection calls."
        }
        (DncConfirmed, LanguagePref::Hi) => {
            "मैंने आपको हमारी डू-नॉट-कॉल सूची में जोड़ दिया है। आपको आगे कलेक्शन कॉल नहीं आएंगे।"
        }
    }
}
