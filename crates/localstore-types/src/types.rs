//! Common types used throughout the localstore crates.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

// Timestamp //
//***********//
/// Milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl Timestamp {
	pub fn now() -> Timestamp {
		let res = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
		Timestamp(res.as_millis() as i64)
	}

	pub fn from_millis(millis: i64) -> Timestamp {
		Timestamp(millis)
	}
}

impl std::fmt::Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<Timestamp> for serde_json::Value {
	fn from(ts: Timestamp) -> Self {
		serde_json::Value::from(ts.0)
	}
}

impl Serialize for Timestamp {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_i64(self.0)
	}
}

impl<'de> Deserialize<'de> for Timestamp {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		Ok(Timestamp(i64::deserialize(deserializer)?))
	}
}

// DocumentType //
//**************//
/// Kinds of documents the editor can store offline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
	Kix,
	Ritz,
	Punch,
	Drawing,
}

impl DocumentType {
	pub fn as_str(&self) -> &'static str {
		match self {
			DocumentType::Kix => "kix",
			DocumentType::Ritz => "ritz",
			DocumentType::Punch => "punch",
			DocumentType::Drawing => "drawing",
		}
	}
}

impl std::fmt::Display for DocumentType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl std::str::FromStr for DocumentType {
	type Err = crate::error::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"kix" => Ok(DocumentType::Kix),
			"ritz" => Ok(DocumentType::Ritz),
			"punch" => Ok(DocumentType::Punch),
			"drawing" => Ok(DocumentType::Drawing),
			other => Err(crate::error::Error::Serialization(format!(
				"unknown document type: {}",
				other
			))),
		}
	}
}

// vim: ts=4
