//! Line-oriented SCPI framing.
//!
//! Commands go out as one ASCII line each. Replies come back as one line (or
//! whatever arrived before the transport gave up), so decoding never fails:
//! noise bytes are replaced and an empty reply is a value of its own.

/// Terminator appended to every outgoing command.
pub const LINE_TERMINATOR: char = '\n';

/// Leading reply token that marks a failed command.
pub const ERROR_MARKER: &str = "ERROR";

/// Classified reply from an instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Nothing arrived before the timeout.
    Empty,
    /// The instrument reported an error; the full reply text is kept for logging.
    Error(String),
    /// A usable reply.
    Text(String),
}

/// Frame a command for the wire.
///
/// A terminator is only added when the command does not already end with one.
/// Characters outside 7-bit ASCII become `?`.
pub fn encode(command: &str) -> Vec<u8> {
    let mut frame: Vec<u8> = command
        .chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect();
    if !command.ends_with(LINE_TERMINATOR) {
        frame.push(LINE_TERMINATOR as u8);
    }
    frame
}

/// Decode a raw reply, replacing non-ASCII bytes and stripping whitespace
/// and terminators.
pub fn decode(raw: &[u8]) -> String {
    let text: String = raw
        .iter()
        .map(|&b| {
            if b.is_ascii() {
                b as char
            } else {
                char::REPLACEMENT_CHARACTER
            }
        })
        .collect();
    text.trim().to_string()
}

/// Decode and classify a raw reply.
///
/// A reply is an error when its first token is exactly `ERROR`, so
/// `ERROR -113` and `ERROR: timeout` are errors but `ERRORS=0` is not.
pub fn classify(raw: &[u8]) -> Reply {
    let text = decode(raw);
    let first_token = text
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | ':' | ';'))
        .next();
    if text.is_empty() {
        Reply::Empty
    } else if first_token == Some(ERROR_MARKER) {
        Reply::Error(text)
    } else {
        Reply::Text(text)
    }
}

/// Parse a numeric reply.
///
/// Reading lists such as `+1.234E-09A,+5.6E+01,+0.0E+00` use their first
/// field, with a trailing unit letter removed.
pub fn parse_number(text: &str) -> Option<f64> {
    let field = text.split(',').next()?.trim();
    let field = field.trim_end_matches(|c: char| c.is_ascii_alphabetic() && c != 'E' && c != 'e');
    if field.is_empty() {
        return None;
    }
    field.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a comma-separated list of floats, skipping fields that do not parse.
pub fn parse_list(text: &str) -> Vec<f64> {
    text.split(',')
        .filter_map(|field| {
            let field = field.trim();
            if field.is_empty() {
                None
            } else {
                field.parse::<f64>().ok()
            }
        })
        .collect()
}

/// Format a setpoint with the three decimals the supplies expect.
pub fn format_setpoint(value: f64) -> String {
    format!("{value:.3}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_appends_single_terminator() {
        assert_eq!(encode("*IDN?"), b"*IDN?\n".to_vec());
        assert_eq!(encode("*IDN?\n"), b"*IDN?\n".to_vec());
    }

    #[test]
    fn test_encode_replaces_non_ascii() {
        assert_eq!(encode("VOLT µ"), b"VOLT ?\n".to_vec());
    }

    #[test]
    fn test_identity_reply_is_trimmed() {
        let frame = encode("*IDN?");
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(decode(b"KEITHLEY,MODEL 6485\n"), "KEITHLEY,MODEL 6485");
        assert_eq!(decode(b"KEITHLEY,MODEL 6485\r\n"), "KEITHLEY,MODEL 6485");
    }

    #[test]
    fn test_decode_tolerates_line_noise() {
        let decoded = decode(&[b'1', b'.', 0xFF, b'5', b'\n']);
        assert_eq!(decoded, "1.\u{FFFD}5");
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(b""), Reply::Empty);
        assert_eq!(classify(b"  \r\n"), Reply::Empty);
        assert_eq!(
            classify(b"ERROR -113 undefined header\n"),
            Reply::Error("ERROR -113 undefined header".to_string())
        );
        assert_eq!(classify(b"12.500\n"), Reply::Text("12.500".to_string()));
    }

    #[test]
    fn test_error_needs_whole_leading_token() {
        assert_eq!(
            classify(b"ERROR: timeout\n"),
            Reply::Error("ERROR: timeout".to_string())
        );
        assert_eq!(classify(b"ERROR\n"), Reply::Error("ERROR".to_string()));
        assert_eq!(classify(b"ERRORS=0\n"), Reply::Text("ERRORS=0".to_string()));
        assert_eq!(classify(b"0,ERROR\n"), Reply::Text("0,ERROR".to_string()));
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("12.500"), Some(12.5));
        assert_eq!(parse_number("+1.234E-09A,+5.6E+01,+0.0E+00"), Some(1.234e-9));
        assert_eq!(parse_number("-2.5e-3"), Some(-2.5e-3));
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("OVERFLOW"), None);
        assert_eq!(parse_number("nan"), None);
    }

    #[test]
    fn test_parse_list_skips_garbage() {
        assert_eq!(parse_list("1.0, 2.5,,x,3e-9"), vec![1.0, 2.5, 3e-9]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_format_setpoint() {
        assert_eq!(format_setpoint(1.0), "1.000");
        assert_eq!(format_setpoint(0.1 + 0.2), "0.300");
    }
}
