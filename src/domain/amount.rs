use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A token amount in base units.
///
/// Contract amounts are uint256; anything beyond `u128` is rejected at decode time. Amounts are
/// written to documents as decimal strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u128);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountParseError {
	#[error("empty amount")]
	Empty,
	#[error("invalid amount {0:?}")]
	Invalid(String),
	#[error("amount {0} does not fit in 128 bits")]
	Overflow(String),
}

impl Amount {
	pub const ZERO: Amount = Amount(0);

	pub const fn new(value: u128) -> Self {
		Amount(value)
	}

	pub const fn value(self) -> u128 {
		self.0
	}

	pub fn checked_add(self, other: Amount) -> Option<Amount> {
		self.0.checked_add(other.0).map(Amount)
	}
}

impl From<u128> for Amount {
	fn from(value: u128) -> Self {
		Amount(value)
	}
}

impl fmt::Display for Amount {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for Amount {
	type Err = AmountParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(AmountParseError::Empty);
		}

		let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
			Some(hex) => (hex, 16),
			None => (s, 10),
		};
		if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
			return Err(AmountParseError::Invalid(s.to_string()));
		}

		// Leading zeros are common in padded hex words
		let significant = digits.trim_start_matches('0');
		if significant.is_empty() {
			return Ok(Amount::ZERO);
		}
		u128::from_str_radix(significant, radix)
			.map(Amount)
			.map_err(|_| AmountParseError::Overflow(s.to_string()))
	}
}

impl Serialize for Amount {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

struct AmountVisitor;

impl<'de> Visitor<'de> for AmountVisitor {
	type Value = Amount;

	fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str("a non-negative integer, decimal string or 0x-prefixed hex string")
	}

	fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
		Ok(Amount(v as u128))
	}

	fn visit_u128<E: de::Error>(self, v: u128) -> Result<Amount, E> {
		Ok(Amount(v))
	}

	fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
		u128::try_from(v)
			.map(Amount)
			.map_err(|_| E::custom(format!("negative amount {}", v)))
	}

	fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
		v.parse().map_err(E::custom)
	}
}

impl<'de> Deserialize<'de> for Amount {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		deserializer.deserialize_any(AmountVisitor)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn parses_decimal_and_hex() {
		assert_eq!("500".parse::<Amount>(), Ok(Amount::new(500)));
		assert_eq!("0x1f4".parse::<Amount>(), Ok(Amount::new(500)));
		assert_eq!(
			"0x00000000000000000000000000000000000000000000000000000000000001f4".parse::<Amount>(),
			Ok(Amount::new(500))
		);
		assert_eq!("0".parse::<Amount>(), Ok(Amount::ZERO));
	}

	#[test]
	fn rejects_garbage_and_overflow() {
		assert_eq!("".parse::<Amount>(), Err(AmountParseError::Empty));
		assert!(matches!("12ab".parse::<Amount>(), Err(AmountParseError::Invalid(_))));
		assert!(matches!("-5".parse::<Amount>(), Err(AmountParseError::Invalid(_))));
		assert!(matches!(
			"0x1ffffffffffffffffffffffffffffffff".parse::<Amount>(),
			Err(AmountParseError::Overflow(_))
		));
	}

	#[test]
	fn json_accepts_numbers_and_strings_and_writes_strings() {
		let from_number: Amount = serde_json::from_value(json!(42)).expect("number");
		let from_string: Amount = serde_json::from_value(json!("42")).expect("string");
		assert_eq!(from_number, from_string);
		assert!(serde_json::from_value::<Amount>(json!(-1)).is_err());
		assert!(serde_json::from_value::<Amount>(json!(1.5)).is_err());

		let big = Amount::new(10u128.pow(30));
		assert_eq!(
			serde_json::to_value(big).expect("serialize"),
			json!("1000000000000000000000000000000")
		);
	}
}
