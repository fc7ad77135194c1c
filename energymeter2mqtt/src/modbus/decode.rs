use rust_decimal::{prelude::ToPrimitive, Decimal};
use std::fmt;

use super::definition::{DoubleWord, ParameterDefinition};
use crate::Error;

/// A decoded reading. Unscaled parameters keep their integer identity; scaled ones are the decimal product converted
/// to a float.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Magnitude {
    Raw(u64),
    Scaled(f64),
}

impl fmt::Display for Magnitude {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Magnitude::Raw(raw) => write!(f, "{raw}"),
            Magnitude::Scaled(scaled) => write!(f, "{scaled}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedValue {
    pub name: String,
    pub value: Magnitude,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub unit: Option<String>,
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)?;
        if let Some(unit) = &self.unit {
            write!(f, " {unit}")?;
        }
        Ok(())
    }
}

/// Combine the raw words of one parameter into an unsigned integer.
pub fn combine_words(
    parameter: &ParameterDefinition,
    words: &[u16],
    double_word: DoubleWord,
) -> crate::Result<u64> {
    if words.len() != parameter.count as usize {
        return Err(Error::UnexpectedResponse {
            name: parameter.name.clone(),
            expected: parameter.count,
            got: words.len(),
        });
    }

    match *words {
        [word] => Ok(word.into()),
        [lo, hi] => Ok(u64::from(lo) + u64::from(hi) * double_word.multiplier()),
        _ => Err(Error::UnsupportedRegisterCount {
            name: parameter.name.clone(),
            count: parameter.count,
        }),
    }
}

pub fn apply_scale(
    parameter: &ParameterDefinition,
    raw: u64,
    scale: Option<Decimal>,
) -> crate::Result<Magnitude> {
    match scale {
        None => Ok(Magnitude::Raw(raw)),
        Some(scale) => Decimal::from(raw)
            .checked_mul(scale)
            .and_then(|scaled| scaled.to_f64())
            .map(Magnitude::Scaled)
            .ok_or_else(|| Error::ScaleOverflow(parameter.name.clone())),
    }
}

/// Turn the words read for `parameter` into its published value.
pub fn decode(
    parameter: &ParameterDefinition,
    words: &[u16],
    double_word: DoubleWord,
) -> crate::Result<DecodedValue> {
    let raw = combine_words(parameter, words, double_word)?;
    let value = apply_scale(parameter, raw, parameter.scale)?;

    Ok(DecodedValue {
        name: parameter.name.clone(),
        value,
        device_class: parameter.device_class.clone(),
        state_class: parameter.state_class.clone(),
        unit: parameter.unit.clone(),
    })
}
