use super::MarstekError;

/// Running XOR over all bytes, used as the single byte frame check
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

/// True if no byte has the high bit set
pub fn is_ascii(data: &[u8]) -> bool {
    data.iter().all(|b| *b <= 0x7F)
}

/// Strip everything that is not a hex digit and uppercase the rest.
///
/// Accepts the usual notations (`AA:BB:CC:DD:EE:FF`, `aa-bb-..`, `aabbcc...`),
/// the result must be exactly 12 characters long.
pub fn normalize_mac(input: &str) -> Result<String, MarstekError> {
    let cleaned: String = input
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if cleaned.len() != 12 {
        return Err(MarstekError::InvalidIdentity(format!(
            "MAC must be 12 hex characters, got {} from '{input}'",
            cleaned.len()
        )));
    }

    return Ok(cleaned);
}

/// Number of ASCII decimal digits needed to print `value`
pub fn digit_count(value: usize) -> usize {
    let mut digits = 1;
    let mut rest = value / 10;
    while rest > 0 {
        digits += 1;
        rest /= 10;
    }
    digits
}

/// Two lowercase hex characters, zero padded
pub fn checksum_hex(checksum: u8) -> String {
    hex::encode([checksum])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_checksum() {
        assert_eq!(xor_checksum(&[]), 0);
        assert_eq!(xor_checksum(&[0x01, 0x02, 0x03]), 0x00);
        assert_eq!(xor_checksum(&[0xFF, 0x0F]), 0xF0);
    }

    #[test]
    fn test_is_ascii() {
        assert!(is_ascii(b"|HMG50|0|0"));
        assert!(is_ascii(&[0x01, 0x02, 0x7F]));
        assert!(!is_ascii(&[0x01, 0x80]));
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(normalize_mac("AA:BB:CC:DD:EE:FF").unwrap(), "AABBCCDDEEFF");
        assert_eq!(normalize_mac("aa-bb-cc-dd-ee-ff").unwrap(), "AABBCCDDEEFF");
        assert_eq!(normalize_mac("001122334455").unwrap(), "001122334455");
    }

    #[test]
    fn test_normalize_mac_is_idempotent() {
        let once = normalize_mac("de:ad:be:ef:00:01").unwrap();
        let twice = normalize_mac(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_mac_rejects_wrong_length() {
        for input in ["", "AABBCCDDEE", "AABBCCDDEEFF00", "zz:zz:zz:zz:zz:zz", "GHIJKL"] {
            let result = normalize_mac(input);
            assert!(matches!(result, Err(MarstekError::InvalidIdentity(_))), "{input} accepted");
        }
    }

    #[test]
    fn test_digit_count() {
        assert_eq!(digit_count(0), 1);
        assert_eq!(digit_count(9), 1);
        assert_eq!(digit_count(10), 2);
        assert_eq!(digit_count(99), 2);
        assert_eq!(digit_count(100), 3);
        assert_eq!(digit_count(1000), 4);
    }

    #[test]
    fn test_checksum_hex() {
        assert_eq!(checksum_hex(0x00), "00");
        assert_eq!(checksum_hex(0x0a), "0a");
        assert_eq!(checksum_hex(0xff), "ff");
    }
}
