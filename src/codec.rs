//! G.711 μ-law codec adapter
//!
//! Telephony media streams carry 8 kHz mono audio as one μ-law byte per
//! sample. This module expands those bytes to signed 16-bit linear PCM
//! using the standard 256-entry lookup table.

/// Sample rate of telephony audio
pub const SAMPLE_RATE: u32 = 8000;

/// μ-law byte encoding zero amplitude in the negative half of the table
pub const SILENCE_NEG: u8 = 0x7F;

/// μ-law byte encoding zero amplitude in the positive half of the table
pub const SILENCE_POS: u8 = 0xFF;

#[rustfmt::skip]
const ULAW_TO_LINEAR: [i16; 256] = [
    -32124, -31100, -30076, -29052, -28028, -27004, -25980, -24956,
    -23932, -22908, -21884, -20860, -19836, -18812, -17788, -16764,
    -15996, -15484, -14972, -14460, -13948, -13436, -12924, -12412,
    -11900, -11388, -10876, -10364,  -9852,  -9340,  -8828,  -8316,
     -7932,  -7676,  -7420,  -7164,  -6908,  -6652,  -6396,  -6140,
     -5884,  -5628,  -5372,  -5116,  -4860,  -4604,  -4348,  -4092,
     -3900,  -3772,  -3644,  -3516,  -3388,  -3260,  -3132,  -3004,
     -2876,  -2748,  -2620,  -2492,  -2364,  -2236,  -2108,  -1980,
     -1884,  -1820,  -1756,  -1692,  -1628,  -1564,  -1500,  -1436,
     -1372,  -1308,  -1244,  -1180,  -1116,  -1052,   -988,   -924,
      -876,   -844,   -812,   -780,   -748,   -716,   -684,   -652,
      -620,   -588,   -556,   -524,   -492,   -460,   -428,   -396,
      -372,   -356,   -340,   -324,   -308,   -292,   -276,   -260,
      -244,   -228,   -212,   -196,   -180,   -164,   -148,   -132,
      -120,   -112,   -104,    -96,    -88,    -80,    -72,    -64,
       -56,    -48,    -40,    -32,    -24,    -16,     -8,      0,
     32124,  31100,  30076,  29052,  28028,  27004,  25980,  24956,
     23932,  22908,  21884,  20860,  19836,  18812,  17788,  16764,
     15996,  15484,  14972,  14460,  13948,  13436,  12924,  12412,
     11900,  11388,  10876,  10364,   9852,   9340,   8828,   8316,
      7932,   7676,   7420,   7164,   6908,   6652,   6396,   6140,
      5884,   5628,   5372,   5116,   4860,   4604,   4348,   4092,
      3900,   3772,   3644,   3516,   3388,   3260,   3132,   3004,
      2876,   2748,   2620,   2492,   2364,   2236,   2108,   1980,
      1884,   1820,   1756,   1692,   1628,   1564,   1500,   1436,
      1372,   1308,   1244,   1180,   1116,   1052,    988,    924,
       876,    844,    812,    780,    748,    716,    684,    652,
       620,    588,    556,    524,    492,    460,    428,    396,
       372,    356,    340,    324,    308,    292,    276,    260,
       244,    228,    212,    196,    180,    164,    148,    132,
       120,    112,    104,     96,     88,     80,     72,     64,
        56,     48,     40,     32,     24,     16,      8,      0,
];

/// Expand a single μ-law byte to a linear sample.
#[inline]
pub fn ulaw_to_linear(byte: u8) -> i16 {
    ULAW_TO_LINEAR[byte as usize]
}

/// Decode a buffer of μ-law bytes to linear PCM, one sample per byte.
pub fn decode(ulaw: &[u8]) -> Vec<i16> {
    let mut pcm = Vec::with_capacity(ulaw.len());
    decode_into(ulaw, &mut pcm);
    pcm
}

/// Decode μ-law bytes, appending the samples to `out`.
pub fn decode_into(ulaw: &[u8], out: &mut Vec<i16>) {
    out.extend(ulaw.iter().map(|&b| ulaw_to_linear(b)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_every_byte_maps_deterministically() {
        for b in 0..=255u8 {
            let first = ulaw_to_linear(b);
            let second = ulaw_to_linear(b);
            assert_eq!(first, second, "byte {:#04x} not deterministic", b);
            assert_eq!(decode(&[b]), vec![first]);
        }
    }

    #[test]
    fn test_silence_bytes_decode_to_zero() {
        assert_eq!(ulaw_to_linear(SILENCE_NEG), 0);
        assert_eq!(ulaw_to_linear(SILENCE_POS), 0);

        // Bytes adjacent to the silence codes stay near zero amplitude
        for b in 0x78..=0x7Fu8 {
            assert!(ulaw_to_linear(b).unsigned_abs() <= 64, "byte {:#04x}", b);
        }
        for b in 0xF8..=0xFFu8 {
            assert!(ulaw_to_linear(b).unsigned_abs() <= 64, "byte {:#04x}", b);
        }
    }

    #[test]
    fn test_halves_are_sign_symmetric() {
        for b in 0..=0x7Fu8 {
            assert_eq!(ulaw_to_linear(b), -ulaw_to_linear(b ^ 0x80));
        }
    }

    #[test]
    fn test_magnitude_decreases_within_each_half() {
        for b in 0..0x7Fu8 {
            assert!(ulaw_to_linear(b).unsigned_abs() > ulaw_to_linear(b + 1).unsigned_abs());
            assert!(
                ulaw_to_linear(b | 0x80).unsigned_abs()
                    > ulaw_to_linear((b + 1) | 0x80).unsigned_abs()
            );
        }
        assert_eq!(ulaw_to_linear(0x00), -32124);
        assert_eq!(ulaw_to_linear(0x80), 32124);
    }

    #[test]
    fn test_random_buffers_decode_one_sample_per_byte() {
        let mut rng = rand::rng();
        for _ in 0..32 {
            let len = rng.random_range(0..2048);
            let buf: Vec<u8> = (0..len).map(|_| rng.random()).collect();

            let pcm = decode(&buf);
            assert_eq!(pcm.len(), buf.len());
            assert_eq!(pcm, decode(&buf));
            for (byte, sample) in buf.iter().zip(&pcm) {
                assert_eq!(*sample, ulaw_to_linear(*byte));
            }
        }
    }

    #[test]
    fn test_decode_into_appends() {
        let mut out = vec![1i16];
        decode_into(&[0xFF, 0x00], &mut out);
        assert_eq!(out, vec![1, 0, -32124]);
    }
}
