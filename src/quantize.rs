//! Conversion of `f32` embeddings into their stored encodings.
//!
//! The half-precision conversions are plain bit manipulation on `u32`/`u16`
//! and both round to nearest, ties to even.

use crate::engine::EmbeddingType;

/// IEEE 754 binary32 to binary16, round to nearest even.
/// Overflow goes to infinity, tiny values to subnormals or signed zero.
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let mant = bits & 0x007f_ffff;

    if exp == 0xff {
        if mant == 0 {
            return sign | 0x7c00;
        }
        let payload = (mant >> 13) as u16;
        return sign | 0x7c00 | 0x0200 | payload;
    }

    let half_exp = exp - 127 + 15;
    if half_exp >= 0x1f {
        return sign | 0x7c00;
    }

    if half_exp <= 0 {
        if half_exp < -10 {
            return sign;
        }
        // subnormal: shift in the implicit leading one
        let m = mant | 0x0080_0000;
        let shift = (14 - half_exp) as u32;
        let half_mant = m >> shift;
        let rem = m & ((1 << shift) - 1);
        let halfway = 1 << (shift - 1);
        let rounded = if rem > halfway || (rem == halfway && (half_mant & 1) == 1) {
            half_mant + 1
        } else {
            half_mant
        };
        return sign | rounded as u16;
    }

    let half_mant = mant >> 13;
    let rem = mant & 0x1fff;
    let mut out = ((half_exp as u32) << 10) | half_mant;
    if rem > 0x1000 || (rem == 0x1000 && (half_mant & 1) == 1) {
        // carry may roll into the exponent, up to infinity
        out += 1;
    }
    sign | out as u16
}

/// binary32 to bfloat16, round to nearest even. NaN stays quiet NaN.
pub fn f32_to_bf16(value: f32) -> u16 {
    let bits = value.to_bits();
    if (bits & 0x7fff_ffff) > 0x7f80_0000 {
        return ((bits >> 16) | 0x0040) as u16;
    }
    let rounding = 0x7fff + ((bits >> 16) & 1);
    (bits.wrapping_add(rounding) >> 16) as u16
}

pub fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
}

/// `round(v * 127 + 128)` clamped to `[0, 255]`.
pub fn f32_to_u8(value: f32, scaled: bool) -> u8 {
    let v = if scaled { value * 127.0 + 128.0 } else { value };
    round_clamp(v, 0.0, 255.0) as u8
}

/// `round(v * 127)` clamped to `[-127, 127]`.
pub fn f32_to_i8(value: f32, scaled: bool) -> i8 {
    let v = if scaled { value * 127.0 } else { value };
    round_clamp(v, -127.0, 127.0) as i8
}

fn round_clamp(v: f32, lo: f32, hi: f32) -> f32 {
    if v.is_nan() {
        return 0.0_f32.clamp(lo, hi);
    }
    v.round().clamp(lo, hi)
}

/// Encodes `values` as little-endian `ty` elements. When `normalize` is set
/// the vector is L2-normalised first and the 8-bit encodings are scaled by
/// 127 around their zero point.
pub fn encode(values: &[f32], ty: EmbeddingType, normalize: bool) -> Vec<u8> {
    let mut v = values.to_vec();
    if normalize {
        l2_normalize(&mut v);
    }

    let mut out = Vec::with_capacity(v.len() * ty.element_size());
    match ty {
        EmbeddingType::Float32 => v.iter().for_each(|x| out.extend(x.to_le_bytes())),
        EmbeddingType::Float16 => v
            .iter()
            .for_each(|&x| out.extend(f32_to_f16(x).to_le_bytes())),
        EmbeddingType::BFloat16 => v
            .iter()
            .for_each(|&x| out.extend(f32_to_bf16(x).to_le_bytes())),
        EmbeddingType::Uint8 => out.extend(v.iter().map(|&x| f32_to_u8(x, normalize))),
        EmbeddingType::Int8 => out.extend(v.iter().map(|&x| f32_to_i8(x, normalize) as u8)),
    }
    out
}

/// `[a,b,c]` with every value printed like C's `%g` (6 significant digits).
pub fn to_json(values: &[f32]) -> String {
    let mut out = String::with_capacity(values.len() * 12 + 2);
    out.push('[');
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format_g(*v as f64));
    }
    out.push(']');
    out
}

/// `%g` with precision 6.
pub fn format_g(v: f64) -> String {
    const PRECISION: i32 = 6;
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if v == 0.0 {
        return if v.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // exponent after rounding to PRECISION significant digits
    let sci = format!("{:.*e}", (PRECISION - 1) as usize, v);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m.to_string(), e.parse::<i32>().unwrap_or(0)),
        None => (sci.clone(), 0),
    };

    if exp < -4 || exp >= PRECISION {
        let mantissa = strip_zeros(&mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    } else {
        let decimals = (PRECISION - 1 - exp).max(0) as usize;
        strip_zeros(&format!("{:.*}", decimals, v))
    }
}

fn strip_zeros(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::{bf16, f16};

    const SAMPLES: &[f32] = &[
        0.0,
        -0.0,
        1.0,
        -1.0,
        0.1,
        0.333_333_34,
        65504.0,
        65520.0,
        1.0e-5,
        6.0e-8,
        2.0e-8,
        3.0e-8,
        -7.5e-6,
        1.0e10,
        f32::MIN_POSITIVE,
        f32::INFINITY,
        f32::NEG_INFINITY,
        1.000_976_6,
        1.000_488_3,
        1.001_464_8,
    ];

    #[test]
    fn f16_matches_half_crate() {
        for &x in SAMPLES {
            assert_eq!(f32_to_f16(x), f16::from_f32(x).to_bits(), "value {:e}", x);
        }
        let nan = f32_to_f16(f32::NAN);
        assert_eq!(nan & 0x7c00, 0x7c00);
        assert_ne!(nan & 0x03ff, 0);
    }

    #[test]
    fn bf16_matches_half_crate() {
        for &x in SAMPLES {
            assert_eq!(f32_to_bf16(x), bf16::from_f32(x).to_bits(), "value {:e}", x);
        }
        assert!(bf16::from_bits(f32_to_bf16(f32::NAN)).is_nan());
    }

    #[test]
    fn bf16_ties_to_even() {
        // 0x3f80_8000 is exactly halfway between 0x3f80 and 0x3f81
        assert_eq!(f32_to_bf16(f32::from_bits(0x3f80_8000)), 0x3f80);
        assert_eq!(f32_to_bf16(f32::from_bits(0x3f81_8000)), 0x3f82);
        assert_eq!(f32_to_bf16(f32::from_bits(0x3f80_8001)), 0x3f81);
    }

    #[test]
    fn zero_vector_maps_to_zero_points() {
        let zeros = [0.0f32; 6];
        assert_eq!(encode(&zeros, EmbeddingType::Uint8, true), vec![128u8; 6]);
        assert_eq!(encode(&zeros, EmbeddingType::Int8, true), vec![0u8; 6]);
    }

    #[test]
    fn eight_bit_scaling_and_saturation() {
        assert_eq!(f32_to_u8(1.0, true), 255);
        assert_eq!(f32_to_u8(-1.0, true), 1);
        assert_eq!(f32_to_u8(0.5, true), 192);
        assert_eq!(f32_to_i8(-1.0, true), -127);
        assert_eq!(f32_to_i8(0.5, true), 64);

        assert_eq!(f32_to_u8(300.7, false), 255);
        assert_eq!(f32_to_u8(-3.0, false), 0);
        assert_eq!(f32_to_u8(12.5, false), 13);
        assert_eq!(f32_to_i8(-200.0, false), -127);
        assert_eq!(f32_to_i8(3.4, false), 3);
    }

    #[test]
    fn normalized_output_has_unit_length() {
        let bytes = encode(&[3.0, 4.0], EmbeddingType::Float32, true);
        let a = f32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let b = f32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert!((a - 0.6).abs() < 1e-6);
        assert!((b - 0.8).abs() < 1e-6);
    }

    #[test]
    fn raw_float32_is_a_byte_copy() {
        let values = [1.5f32, -2.25];
        let bytes = encode(&values, EmbeddingType::Float32, false);
        let expected: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn encoded_length_is_dimension_times_element_size() {
        let v = [0.1f32; 10];
        assert_eq!(encode(&v, EmbeddingType::Float16, true).len(), 20);
        assert_eq!(encode(&v, EmbeddingType::BFloat16, false).len(), 20);
        assert_eq!(encode(&v, EmbeddingType::Uint8, true).len(), 10);
    }

    #[test]
    fn format_g_like_printf() {
        assert_eq!(format_g(0.0), "0");
        assert_eq!(format_g(1.0), "1");
        assert_eq!(format_g(0.5), "0.5");
        assert_eq!(format_g(-0.123456789), "-0.123457");
        assert_eq!(format_g(123456.0), "123456");
        assert_eq!(format_g(1234567.0), "1.23457e+06");
        assert_eq!(format_g(0.0001), "0.0001");
        assert_eq!(format_g(0.00001234), "1.234e-05");
        assert_eq!(format_g(999999.7), "1e+06");
    }

    #[test]
    fn json_is_bracketed_list() {
        assert_eq!(to_json(&[0.25, -1.0, 0.0]), "[0.25,-1,0]");
        assert_eq!(to_json(&[]), "[]");
    }
}
