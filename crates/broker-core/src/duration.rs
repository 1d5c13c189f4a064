//! `serde` helpers for `Duration` fields in config structs.
//!
//! Durations are encoded as plain seconds (`"8s"`, `"180s"`) rather than a
//! bespoke numeric field so that config files stay self-documenting.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};

pub mod serde_dur {
	use super::*;

	pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		s.serialize_str(&format!("{}s", d.as_secs_f64()))
	}

	pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		d.deserialize_str(DurVisitor)
	}
}

pub mod serde_dur_option {
	use super::*;

	pub fn serialize<S>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		match d {
			Some(d) => s.serialize_some(&format!("{}s", d.as_secs_f64())),
			None => s.serialize_none(),
		}
	}

	pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
	where
		D: Deserializer<'de>,
	{
		d.deserialize_option(OptDurVisitor)
	}
}

struct DurVisitor;

impl Visitor<'_> for DurVisitor {
	type Value = Duration;

	fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str("a duration like \"8s\" or a number of seconds")
	}

	fn visit_str<E>(self, value: &str) -> Result<Duration, E>
	where
		E: de::Error,
	{
		parse_duration(value).map_err(de::Error::custom)
	}

	fn visit_u64<E>(self, value: u64) -> Result<Duration, E>
	where
		E: de::Error,
	{
		Ok(Duration::from_secs(value))
	}

	fn visit_f64<E>(self, value: f64) -> Result<Duration, E>
	where
		E: de::Error,
	{
		Ok(Duration::from_secs_f64(value))
	}
}

struct OptDurVisitor;

impl<'de> Visitor<'de> for OptDurVisitor {
	type Value = Option<Duration>;

	fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str("an optional duration")
	}

	fn visit_none<E>(self) -> Result<Self::Value, E>
	where
		E: de::Error,
	{
		Ok(None)
	}

	fn visit_some<D>(self, d: D) -> Result<Self::Value, D::Error>
	where
		D: Deserializer<'de>,
	{
		d.deserialize_str(DurVisitor).map(Some)
	}
}

fn parse_duration(s: &str) -> Result<Duration, String> {
	let s = s.trim();
	let numeric_len = s
		.find(|c: char| !c.is_ascii_digit() && c != '.')
		.unwrap_or(s.len());
	let (num, unit) = s.split_at(numeric_len);
	let num: f64 = num
		.parse()
		.map_err(|_| format!("invalid duration {s:?}"))?;
	let secs = match unit.trim() {
		"" | "s" => num,
		"ms" => num / 1000.0,
		"m" => num * 60.0,
		"h" => num * 3600.0,
		other => return Err(format!("unknown duration unit {other:?}")),
	};
	Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_plain_seconds() {
		assert_eq!(parse_duration("8s").unwrap(), Duration::from_secs(8));
		assert_eq!(parse_duration("8").unwrap(), Duration::from_secs(8));
	}

	#[test]
	fn parses_minutes_and_millis() {
		assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
		assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
	}

	#[test]
	fn rejects_unknown_unit() {
		assert!(parse_duration("3x").is_err());
	}
}
