//! Wiegand format descriptors and bitstring validation.
//!
//! Holds the seven standard Wiegand lengths plus optional descriptors loaded
//! from `formats.json`. `validate` turns a raw bit string into
//! `(card_id, facility, user_id)` or rejects it outright.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Parity definition for a format: which bits feed the even/odd check bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parity {
    pub even_bits: Vec<usize>,
    pub even_pos: usize,
    pub odd_bits: Vec<usize>,
    pub odd_pos: usize,
}

/// Definition of one Wiegand bit length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiegandFormat {
    pub bit_length: usize,
    pub name: String,
    pub facility_range: (usize, usize),
    pub user_range: (usize, usize),
    #[serde(default)]
    pub parity: Option<Parity>,
    #[serde(default)]
    pub description: String,
}

/// A decoded, validated card read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardRead {
    pub card_id: String,
    pub facility: String,
    pub user_id: String,
    pub bitstring: String,
    pub bit_length: usize,
    pub format_name: String,
    pub reader_name: String,
}

/// On-disk shape of `formats.json`: a top-level `formats` array.
#[derive(Debug, Deserialize)]
struct CustomFormatsFile {
    formats: Vec<WiegandFormat>,
}

/// Registry of known formats, keyed by bit length.
pub struct FormatRegistry {
    formats: HashMap<usize, WiegandFormat>,
}

impl FormatRegistry {
    /// Build a registry with just the seven standard formats.
    pub fn standard() -> Self {
        let mut formats = HashMap::new();
        for fmt in standard_formats() {
            formats.insert(fmt.bit_length, fmt);
        }
        Self { formats }
    }

    /// Build a registry with the standard formats, overlaid with any custom
    /// descriptors from `path`. A missing or malformed file is non-fatal:
    /// the catalogue survives with just the standard formats.
    pub fn with_custom_formats(path: &Path) -> Self {
        let mut registry = Self::standard();
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<CustomFormatsFile>(&contents) {
                Ok(custom) => {
                    for fmt in custom.formats {
                        registry.formats.insert(fmt.bit_length, fmt);
                    }
                }
                Err(e) => {
                    log::warn!("formats: failed to parse {}: {}", path.display(), e);
                }
            },
            Err(e) => {
                log::debug!("formats: no custom formats at {}: {}", path.display(), e);
            }
        }
        registry
    }

    pub fn get(&self, bit_length: usize) -> Option<&WiegandFormat> {
        self.formats.get(&bit_length)
    }

    /// Validate a bitstring of `'0'`/`'1'` characters and, on success, return
    /// the decoded card identity.
    pub fn validate(&self, bitstring: &str, reader_name: &str) -> Option<CardRead> {
        if bitstring.is_empty() || !bitstring.bytes().all(|b| b == b'0' || b == b'1') {
            return None;
        }

        let bit_length = bitstring.len();
        let fmt = self.get(bit_length)?;

        let bits: Vec<u8> = bitstring.bytes().map(|b| b - b'0').collect();

        if let Some(parity) = &fmt.parity {
            let even = parity.even_bits.iter().fold(0u8, |acc, &i| acc ^ bits.get(i).copied().unwrap_or(0));
            let odd = parity
                .odd_bits
                .iter()
                .fold(1u8, |acc, &i| acc ^ bits.get(i).copied().unwrap_or(0));
            let even_ok = bits.get(parity.even_pos).copied() == Some(even);
            let odd_ok = bits.get(parity.odd_pos).copied() == Some(odd);
            if !even_ok || !odd_ok {
                return None;
            }
        }

        let facility = extract_range(&bits, fmt.facility_range)?;
        let user_id = extract_range(&bits, fmt.user_range)?;

        let hex_width = (bit_length + 3) / 4;
        let as_int = u128::from_str_radix(bitstring, 2).ok()?;
        let card_id = format!("{:0width$x}", as_int, width = hex_width);

        Some(CardRead {
            card_id,
            facility: facility.to_string(),
            user_id: user_id.to_string(),
            bitstring: bitstring.to_string(),
            bit_length,
            format_name: fmt.name.clone(),
            reader_name: reader_name.to_string(),
        })
    }
}

/// Extract an inclusive bit range as an unsigned big-endian integer.
fn extract_range(bits: &[u8], (start, end): (usize, usize)) -> Option<u128> {
    if end < start || end >= bits.len() {
        return None;
    }
    let mut value: u128 = 0;
    for &bit in &bits[start..=end] {
        value = (value << 1) | bit as u128;
    }
    Some(value)
}

/// The seven standard Wiegand formats, bit indices MSB-first.
pub fn standard_formats() -> Vec<WiegandFormat> {
    vec![
        WiegandFormat {
            bit_length: 26,
            name: "Standard 26-bit (H10301)".into(),
            facility_range: (1, 8),
            user_range: (9, 24),
            parity: Some(Parity {
                even_bits: (1..=12).collect(),
                even_pos: 0,
                odd_bits: (13..=24).collect(),
                odd_pos: 25,
            }),
            description: "8-bit facility, 16-bit user ID".into(),
        },
        WiegandFormat {
            bit_length: 32,
            name: "32-bit (no parity)".into(),
            facility_range: (0, 15),
            user_range: (16, 31),
            parity: None,
            description: "16-bit facility, 16-bit user ID, no parity".into(),
        },
        WiegandFormat {
            bit_length: 34,
            name: "34-bit (H10306)".into(),
            facility_range: (1, 16),
            user_range: (17, 32),
            parity: Some(Parity {
                even_bits: (1..=16).collect(),
                even_pos: 0,
                odd_bits: (17..=32).collect(),
                odd_pos: 33,
            }),
            description: "16-bit facility, 16-bit user ID".into(),
        },
        WiegandFormat {
            bit_length: 35,
            name: "35-bit Corporate 1000".into(),
            facility_range: (2, 13),
            user_range: (14, 33),
            parity: Some(Parity {
                even_bits: (2..=17).collect(),
                even_pos: 0,
                odd_bits: (18..=33).collect(),
                odd_pos: 34,
            }),
            description: "12-bit company code, 20-bit user ID".into(),
        },
        WiegandFormat {
            bit_length: 36,
            name: "36-bit Simplex".into(),
            facility_range: (1, 14),
            user_range: (15, 34),
            parity: Some(Parity {
                even_bits: (1..=17).collect(),
                even_pos: 0,
                odd_bits: (18..=34).collect(),
                odd_pos: 35,
            }),
            description: "14-bit facility, 20-bit user ID".into(),
        },
        WiegandFormat {
            bit_length: 37,
            name: "37-bit (H10304)".into(),
            facility_range: (1, 16),
            user_range: (17, 35),
            parity: Some(Parity {
                even_bits: (1..=18).collect(),
                even_pos: 0,
                odd_bits: (19..=36).collect(),
                odd_pos: 36,
            }),
            description: "16-bit facility, 19-bit user ID".into(),
        },
        WiegandFormat {
            bit_length: 48,
            name: "48-bit Extended".into(),
            facility_range: (1, 22),
            user_range: (23, 46),
            parity: Some(Parity {
                even_bits: (1..=23).collect(),
                even_pos: 0,
                odd_bits: (24..=46).collect(),
                odd_pos: 47,
            }),
            description: "22-bit facility, 24-bit user ID".into(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encode a 26-bit card into its bitstring, including correct parity, the
    /// inverse of `validate` for this format. Used by round-trip tests.
    fn encode_26(facility: u32, user_id: u32) -> String {
        let data = (facility << 16) | user_id;
        let mut bits = vec![0u8; 26];
        for i in 0..8 {
            bits[1 + i] = ((facility >> (7 - i)) & 1) as u8;
        }
        for i in 0..16 {
            bits[9 + i] = ((user_id >> (15 - i)) & 1) as u8;
        }
        let even = (1..=12).fold(0u8, |acc, i| acc ^ bits[i]);
        let odd = (13..=24).fold(1u8, |acc, i| acc ^ bits[i]);
        bits[0] = even;
        bits[25] = odd;
        let _ = data;
        bits.iter().map(|b| if *b == 1 { '1' } else { '0' }).collect()
    }

    #[test]
    fn validates_well_formed_26_bit_card() {
        let registry = FormatRegistry::standard();
        let bitstring = encode_26(123, 45678);
        let read = registry.validate(&bitstring, "front-door").expect("valid card");
        assert_eq!(read.facility, "123");
        assert_eq!(read.user_id, "45678");
        assert_eq!(read.bit_length, 26);
    }

    #[test]
    fn rejects_flipped_parity_bit() {
        let registry = FormatRegistry::standard();
        let mut bitstring = encode_26(123, 45678).into_bytes();
        bitstring[5] = if bitstring[5] == b'0' { b'1' } else { b'0' };
        let bitstring = String::from_utf8(bitstring).unwrap();
        assert!(registry.validate(&bitstring, "front-door").is_none());
    }

    #[test]
    fn rejects_unknown_bit_length() {
        let registry = FormatRegistry::standard();
        assert!(registry.validate(&"1".repeat(40), "front-door").is_none());
    }

    #[test]
    fn rejects_non_binary_characters() {
        let registry = FormatRegistry::standard();
        let mut bitstring = encode_26(1, 1);
        bitstring.replace_range(3..4, "x");
        assert!(registry.validate(&bitstring, "front-door").is_none());
    }

    #[test]
    fn round_trips_card_id_as_lowercase_hex() {
        let registry = FormatRegistry::standard();
        let bitstring = encode_26(255, 65535);
        let read = registry.validate(&bitstring, "front-door").unwrap();
        let expected = format!("{:07x}", u128::from_str_radix(&bitstring, 2).unwrap());
        assert_eq!(read.card_id, expected);
    }

    #[test]
    fn no_parity_format_passes_without_check() {
        let registry = FormatRegistry::standard();
        let bitstring = "1".repeat(32);
        let read = registry.validate(&bitstring, "r").expect("32-bit has no parity");
        assert_eq!(read.facility, "65535");
        assert_eq!(read.user_id, "65535");
    }

    #[test]
    fn loads_custom_format_overlay_and_falls_back_on_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("formats.json");
        std::fs::write(&path, "{ not json").unwrap();
        let registry = FormatRegistry::with_custom_formats(&path);
        // Standard formats still present despite the malformed overlay file.
        assert!(registry.get(26).is_some());
    }
}
