//! Conversions between `HH:MM:SS.fff` duration strings and milliseconds.

/// Parse a duration string into milliseconds.
///
/// Accepts `HH:MM:SS`, `HH:MM:SS.f…`, `MM:SS(.f…)` and bare seconds. The
/// fractional part is a decimal fraction of a second, so `00:00:04.2` is
/// 4200 ms. Returns `None` for anything else.
pub fn parse_duration_ms(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let (whole, frac) = match text.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (text, None),
    };

    let parts: Vec<&str> = whole.split(':').collect();
    if parts.len() > 3 {
        return None;
    }

    let mut seconds: u64 = 0;
    for part in &parts {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        seconds = seconds.checked_mul(60)?.checked_add(part.parse::<u64>().ok()?)?;
    }

    let millis = match frac {
        None => 0,
        Some(f) if f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()) => return None,
        Some(f) => {
            // Pad or truncate to exactly three digits.
            let digits: String = f.chars().chain("000".chars()).take(3).collect();
            digits.parse::<u64>().ok()?
        }
    };

    seconds.checked_mul(1000)?.checked_add(millis)
}

/// Format milliseconds as `HH:MM:SS.mmm`.
pub fn format_duration_ms(total_ms: u64) -> String {
    let total_secs = total_ms / 1000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60,
        total_ms % 1000
    )
}

/// Whole seconds of a duration string, floored. Unparseable input is zero.
pub fn duration_secs(text: &str) -> u64 {
    parse_duration_ms(text).unwrap_or(0) / 1000
}
