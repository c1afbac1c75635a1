/// A chat or API command after parsing. Authorization is decided by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    Restart,
    /// Hot mode at the configured default target.
    Hot,
    /// Termo mode at the configured default target.
    Termo,
    Off,
    /// `/h<n>`; `n` is not validated here.
    SetHot(i32),
    /// `/t<n>`; `n` is not validated here.
    SetTermo(i32),
    Unknown(String),
}

pub fn interpret(text: &str) -> Command {
    match text.to_ascii_lowercase().as_str() {
        "/help" => return Command::Help,
        "/status" => return Command::Status,
        "/restart" => return Command::Restart,
        "/hot" => return Command::Hot,
        "/termo" => return Command::Termo,
        "/off" => return Command::Off,
        _ => {}
    }

    if let Some(rest) = strip_prefix_ignore_case(text, "/t") {
        return Command::SetTermo(parse_setpoint(rest));
    }
    if let Some(rest) = strip_prefix_ignore_case(text, "/h") {
        return Command::SetHot(parse_setpoint(rest));
    }

    Command::Unknown(text.to_string())
}

/// Lenient integer prefix parse: leading whitespace, optional sign, digits up
/// to the first non-digit. No digits parses as 0. Saturates instead of
/// overflowing.
pub fn parse_leading_int(text: &str) -> i64 {
    let trimmed = text.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let magnitude = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0_i64, |acc, digit| {
            acc.saturating_mul(10).saturating_add(i64::from(digit - b'0'))
        });

    if negative {
        -magnitude
    } else {
        magnitude
    }
}

fn parse_setpoint(text: &str) -> i32 {
    parse_leading_int(text).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn exact_commands() {
        assert_eq!(interpret("/help"), Command::Help);
        assert_eq!(interpret("/status"), Command::Status);
        assert_eq!(interpret("/restart"), Command::Restart);
        assert_eq!(interpret("/hot"), Command::Hot);
        assert_eq!(interpret("/termo"), Command::Termo);
        assert_eq!(interpret("/off"), Command::Off);
    }

    #[test]
    fn matching_ignores_case() {
        assert_eq!(interpret("/HOT"), Command::Hot);
        assert_eq!(interpret("/Status"), Command::Status);
        assert_eq!(interpret("/T75"), Command::SetTermo(75));
        assert_eq!(interpret("/H50"), Command::SetHot(50));
    }

    #[test]
    fn setpoint_prefixes_parse_trailing_integer() {
        assert_eq!(interpret("/h50"), Command::SetHot(50));
        assert_eq!(interpret("/t 42"), Command::SetTermo(42));
        assert_eq!(interpret("/h95abc"), Command::SetHot(95));
        assert_eq!(interpret("/h-5"), Command::SetHot(-5));
        assert_eq!(interpret("/t150"), Command::SetTermo(150));
    }

    #[test]
    fn empty_or_non_numeric_suffix_is_zero() {
        assert_eq!(interpret("/t"), Command::SetTermo(0));
        assert_eq!(interpret("/h"), Command::SetHot(0));
        assert_eq!(interpret("/tabc"), Command::SetTermo(0));
        // Not an exact command, so the /t prefix wins.
        assert_eq!(interpret("/termox"), Command::SetTermo(0));
    }

    #[test]
    fn out_of_range_values_saturate() {
        assert_eq!(interpret("/h99999999999999"), Command::SetHot(i32::MAX));
        assert_eq!(interpret("/t-99999999999999"), Command::SetTermo(i32::MIN));
        assert_eq!(
            parse_leading_int("99999999999999999999999"),
            i64::MAX
        );
    }

    #[test]
    fn anything_else_is_unknown() {
        assert_eq!(interpret("hello"), Command::Unknown("hello".to_string()));
        assert_eq!(interpret(""), Command::Unknown(String::new()));
        assert_eq!(interpret("/start"), Command::Unknown("/start".to_string()));
    }

    #[test]
    fn multibyte_text_does_not_panic() {
        assert_eq!(interpret("é"), Command::Unknown("é".to_string()));
        assert_eq!(interpret("/é"), Command::Unknown("/é".to_string()));
    }
}
