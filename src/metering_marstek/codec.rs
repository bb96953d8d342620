/*
    Wire format of the CT meter protocol

    SOH STX <length> <body> ETX <checksum>

    length   - ASCII decimal, total frame size including the length digits themselves
    body     - pipe separated ASCII fields, starting with a pipe
    checksum - XOR over SOH..ETX as two lowercase hex characters
*/

use lazy_static::lazy_static;
use regex::Regex;

use super::structs::{DeviceIdentity, TelemetryRecord, TelemetryValue, RESPONSE_LABELS};
use super::{utils, MarstekError};

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// Replies shorter than this can not carry a body at all
pub const MIN_RESPONSE_LEN: usize = 7;
/// Header the reply parser skips: SOH, STX and two length digits
const RESPONSE_BODY_OFFSET: usize = 4;
/// ETX plus two checksum characters
const TRAILER_LEN: usize = 3;

lazy_static! {
    static ref INTEGER: Regex = Regex::new(r"^-?\d+$").unwrap();
}

/// Request body for an identity, the trailing `0|0` are fixed by the protocol
pub fn build_body(identity: &DeviceIdentity) -> String {
    format!(
        "|{}|{}|{}|{}|0|0",
        identity.device_type(),
        identity.battery_mac(),
        identity.ct_type(),
        identity.ct_mac()
    )
}

/// Total frame length for a body of `body_len` bytes.
///
/// The length field counts itself, so its digit count feeds back into the value.
/// Start with the guess for a two byte longer frame and grow once if that guess
/// crossed a power of ten.
pub fn frame_length(body_len: usize) -> usize {
    let base_size = 2 + body_len + 1 + 2;
    let guess_digits = utils::digit_count(base_size + 2);
    let mut total = base_size + guess_digits;
    if utils::digit_count(total) != guess_digits {
        total = base_size + utils::digit_count(total);
    }
    total
}

/// Wrap a body into a complete frame
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let length = frame_length(body.len()).to_string();

    let mut frame = Vec::with_capacity(length.len() + body.len() + 5);
    frame.push(SOH);
    frame.push(STX);
    frame.extend_from_slice(length.as_bytes());
    frame.extend_from_slice(body);
    frame.push(ETX);

    let checksum = utils::xor_checksum(&frame);
    frame.extend_from_slice(utils::checksum_hex(checksum).as_bytes());
    frame
}

/// Build the request frame for an already validated identity
pub fn build_request(identity: &DeviceIdentity) -> Vec<u8> {
    encode_frame(build_body(identity).as_bytes())
}

/// Compare the trailing checksum characters with the XOR over SOH..ETX
pub fn verify_checksum(frame: &[u8]) -> bool {
    if frame.len() < MIN_RESPONSE_LEN {
        return false;
    }
    let split = frame.len() - 2;
    let expected = utils::checksum_hex(utils::xor_checksum(&frame[..split]));
    frame[split..].eq_ignore_ascii_case(expected.as_bytes())
}

/// Decode a reply into a telemetry record.
///
/// The body is taken from a fixed offset of 4 (two digit length field), the checksum is not
/// checked here. Missing trailing fields become empty strings.
pub fn parse_response(data: &[u8]) -> Result<TelemetryRecord, MarstekError> {
    if !utils::is_ascii(data) {
        return Err(MarstekError::MalformedResponse("Invalid ASCII encoding".to_string()));
    }
    if data.len() < MIN_RESPONSE_LEN {
        return Err(MarstekError::MalformedResponse("Response too short".to_string()));
    }

    let payload = &data[RESPONSE_BODY_OFFSET..data.len() - TRAILER_LEN];
    let message = std::str::from_utf8(payload)
        .map_err(|e| MarstekError::MalformedResponse(format!("Invalid ASCII encoding: {e}")))?;

    let mut parts = message.split('|').skip(1);
    let values = RESPONSE_LABELS
        .iter()
        .map(|_| parse_value(parts.next().unwrap_or("")))
        .collect();

    return Ok(TelemetryRecord::from_values(values));
}

fn parse_value(raw: &str) -> TelemetryValue {
    if INTEGER.is_match(raw) {
        /* Values beyond i64 stay text instead of being truncated */
        if let Ok(v) = raw.parse::<i64>() {
            return TelemetryValue::Int(v);
        }
    }
    TelemetryValue::Text(raw.to_string())
}
