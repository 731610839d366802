/// Formats bytes as uppercase hexadecimal pairs separated by spaces.
pub(crate) fn format_hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<empty>".to_owned();
    }

    bytes
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses decimal or `0x`-prefixed hexadecimal, as used for addresses and fixture options.
pub(crate) fn parse_number(value: &str) -> Option<u32> {
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn format_hex_handles_empty_payload() {
        assert_eq!("<empty>", format_hex(&[]));
    }

    #[test]
    fn format_hex_formats_uppercase_pairs() {
        assert_eq!("18 EC F2 11", format_hex(&[0x18, 0xEC, 0xF2, 0x11]));
    }

    #[rstest]
    #[case::decimal("242", Some(242))]
    #[case::lower_hex("0xf2", Some(0xF2))]
    #[case::upper_hex("0XF2", Some(0xF2))]
    #[case::negative("-1", None)]
    #[case::bare_prefix("0x", None)]
    fn parse_number_accepts_decimal_and_hex(#[case] input: &str, #[case] expected: Option<u32>) {
        assert_eq!(expected, parse_number(input));
    }
}
