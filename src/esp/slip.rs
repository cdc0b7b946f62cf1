//! SLIP framing for the Espressif serial protocol
//!
//! Requests are framed here; decoding the replies is delegated to
//! `slip-codec`, which reads straight from the port.

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Wrap a raw payload in a SLIP frame.
///
/// The frame delimiter and the escape byte are the only two values that
/// need escaping; everything else passes through untouched.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let escapes = payload.iter().filter(|&&b| b == END || b == ESC).count();

    let mut frame = Vec::with_capacity(payload.len() + escapes + 2);
    frame.push(END);

    for &byte in payload {
        match byte {
            END => frame.extend_from_slice(&[ESC, ESC_END]),
            ESC => frame.extend_from_slice(&[ESC, ESC_ESC]),
            other => frame.push(other),
        }
    }

    frame.push(END);
    frame
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn decode(mut framed: &[u8]) -> Vec<u8> {
        let mut decoder = slip_codec::SlipDecoder::new();
        let mut out = Vec::new();
        decoder.decode(&mut framed, &mut out).unwrap();
        out
    }

    #[test]
    fn plain_bytes_pass_through() {
        assert_eq!(
            encode(&[0x01, 0x02, 0x03]),
            vec![0xC0, 0x01, 0x02, 0x03, 0xC0]
        );
    }

    #[test]
    fn end_byte_is_escaped() {
        assert_eq!(encode(&[0xC0]), vec![0xC0, 0xDB, 0xDC, 0xC0]);
    }

    #[test]
    fn esc_byte_is_escaped() {
        assert_eq!(encode(&[0xDB]), vec![0xC0, 0xDB, 0xDD, 0xC0]);
    }

    #[test]
    fn round_trip_all_byte_values() {
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(decode(&encode(&data)), data);
    }

    #[test]
    fn round_trip_escape_heavy_payload() {
        let data = vec![0xC0, 0xDB, 0xC0, 0xC0, 0xDB, 0xDB, 0x00, 0xC0];
        assert_eq!(decode(&encode(&data)), data);
    }
}
