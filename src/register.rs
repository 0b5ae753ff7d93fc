use crate::error::DecodeError;
use crate::prelude::*;
use std::collections::BTreeMap;

/// Field name -> register descriptor, as configured per device.
pub type RegisterMap = BTreeMap<String, Register>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Width {
    Bits16,
    Bits32,
}

impl Width {
    /// Number of 16-bit machine words a value of this width occupies.
    pub fn words(self) -> usize {
        match self {
            Width::Bits16 => 1,
            Width::Bits32 => 2,
        }
    }
}

impl TryFrom<u8> for Width {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            16 => Ok(Width::Bits16),
            32 => Ok(Width::Bits32),
            other => Err(format!("unsupported register width {} (use 16 or 32)", other)),
        }
    }
}

impl From<Width> for u8 {
    fn from(width: Width) -> u8 {
        match width {
            Width::Bits16 => 16,
            Width::Bits32 => 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    #[default]
    Holding,
    Input,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub address: u16,
    #[serde(default = "default_width")]
    pub width: Width,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub kind: RegisterKind,
}

fn default_width() -> Width {
    Width::Bits16
}

fn default_scale() -> f64 {
    1.0
}

impl Register {
    pub fn new(address: u16, width: Width, signed: bool, scale: f64, unit: &str) -> Self {
        Self {
            address,
            width,
            signed,
            scale,
            unit: unit.to_string(),
            kind: RegisterKind::Holding,
        }
    }

    /// Decode raw words (high word first for 32-bit values) into the scaled
    /// physical value, `raw / scale`.
    pub fn decode(&self, words: &[u16]) -> Result<f64, DecodeError> {
        if !self.scale.is_finite() || self.scale == 0.0 {
            return Err(DecodeError::InvalidScale(self.scale));
        }

        Ok(self.raw(words)? as f64 / self.scale)
    }

    /// The integer held in `words`, reinterpreted as two's complement when the
    /// register is signed.
    pub fn raw(&self, words: &[u16]) -> Result<i64, DecodeError> {
        let expected = self.width.words();
        if words.len() != expected {
            return Err(DecodeError::WordCount {
                expected,
                got: words.len(),
            });
        }

        let raw = match self.width {
            Width::Bits16 => {
                let raw = words[0] as i64;
                if self.signed && raw > 32767 {
                    raw - 65536
                } else {
                    raw
                }
            }
            Width::Bits32 => {
                let raw = (((words[0] as u32) << 16) | words[1] as u32) as i64;
                if self.signed && raw > 2147483647 {
                    raw - 4294967296
                } else {
                    raw
                }
            }
        };

        Ok(raw)
    }

    /// Inverse of `decode`: the words a device would hold for `value`,
    /// saturating at the limits of the register.
    pub fn encode(&self, value: f64) -> Vec<u16> {
        let (min, max, modulus): (i64, i64, i64) = match (self.width, self.signed) {
            (Width::Bits16, false) => (0, 65535, 65536),
            (Width::Bits16, true) => (-32768, 32767, 65536),
            (Width::Bits32, false) => (0, 4294967295, 4294967296),
            (Width::Bits32, true) => (-2147483648, 2147483647, 4294967296),
        };

        let raw = ((value * self.scale).round() as i64).clamp(min, max);
        let bits = if raw < 0 { raw + modulus } else { raw } as u64;

        match self.width {
            Width::Bits16 => vec![bits as u16],
            Width::Bits32 => vec![(bits >> 16) as u16, (bits & 0xFFFF) as u16],
        }
    }
}
