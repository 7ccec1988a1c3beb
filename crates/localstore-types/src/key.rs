//! Compound keys and key ranges.
//!
//! Keys follow the indexed-storage model: a key is a number, a string, or an
//! array of keys. Keys are stored in an order-preserving byte encoding so
//! that key ranges translate into plain byte ranges over the engine's sorted
//! tables:
//!
//! - numbers sort before strings, strings before arrays
//! - numbers sort numerically, strings bytewise
//! - arrays sort element-wise, a proper prefix sorts first
//!
//! Every encoding is self-delimiting, so a byte prefix of an encoded array
//! (its tag followed by complete elements) selects exactly the arrays that
//! start with those elements.

use serde_json::Value;
use std::ops::Bound;

use crate::error::{Error, LsResult};

const TAG_END: u8 = 0x00;
const TAG_NUMBER: u8 = 0x10;
const TAG_STRING: u8 = 0x30;
const TAG_ARRAY: u8 = 0x50;
const ESCAPE: u8 = 0xff;
/// Sorts after anything that can follow a complete element.
const SENTINEL: u8 = 0xff;

const SIGN_BIT: u64 = 1 << 63;

#[derive(Clone, Debug, PartialEq)]
pub enum Key {
	Number(f64),
	String(Box<str>),
	Array(Vec<Key>),
}

impl Key {
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(16);
		self.encode_into(&mut out);
		out
	}

	fn encode_into(&self, out: &mut Vec<u8>) {
		match self {
			Key::Number(n) => {
				out.push(TAG_NUMBER);
				let bits = n.to_bits();
				let sortable = if bits & SIGN_BIT == 0 { bits | SIGN_BIT } else { !bits };
				out.extend_from_slice(&sortable.to_be_bytes());
			}
			Key::String(s) => {
				out.push(TAG_STRING);
				for b in s.bytes() {
					out.push(b);
					if b == TAG_END {
						out.push(ESCAPE);
					}
				}
				out.extend_from_slice(&[TAG_END, TAG_END]);
			}
			Key::Array(items) => {
				out.push(TAG_ARRAY);
				for item in items {
					item.encode_into(out);
				}
				out.push(TAG_END);
			}
		}
	}

	pub fn decode(bytes: &[u8]) -> LsResult<Key> {
		let mut pos = 0;
		let key = decode_at(bytes, &mut pos)?;
		if pos != bytes.len() {
			return Err(Error::InvalidKey(format!("{} trailing bytes", bytes.len() - pos)));
		}
		Ok(key)
	}

	/// Converts a JSON value into a key. Only numbers, strings and arrays of
	/// those are valid keys.
	pub fn from_value(value: &Value) -> LsResult<Key> {
		match value {
			Value::Number(n) => match n.as_f64() {
				Some(f) if !f.is_nan() => Ok(Key::Number(f)),
				_ => Err(Error::InvalidKey(format!("not a valid number key: {}", n))),
			},
			Value::String(s) => Ok(Key::String(s.as_str().into())),
			Value::Array(items) => {
				Ok(Key::Array(items.iter().map(Key::from_value).collect::<LsResult<Vec<_>>>()?))
			}
			other => Err(Error::InvalidKey(format!("not a valid key: {}", other))),
		}
	}

	pub fn to_value(&self) -> Value {
		match self {
			Key::Number(n) => {
				if n.fract() == 0.0 && n.abs() < 9.0e15 {
					Value::from(*n as i64)
				} else {
					serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number)
				}
			}
			Key::String(s) => Value::String(s.to_string()),
			Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Key::String(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_i64(&self) -> Option<i64> {
		match self {
			Key::Number(n) if n.fract() == 0.0 => Some(*n as i64),
			_ => None,
		}
	}

	pub fn as_array(&self) -> Option<&[Key]> {
		match self {
			Key::Array(items) => Some(items),
			_ => None,
		}
	}
}

fn decode_at(bytes: &[u8], pos: &mut usize) -> LsResult<Key> {
	let tag = *bytes.get(*pos).ok_or_else(|| Error::InvalidKey("unexpected end".into()))?;
	*pos += 1;
	match tag {
		TAG_NUMBER => {
			let raw = bytes
				.get(*pos..*pos + 8)
				.ok_or_else(|| Error::InvalidKey("truncated number".into()))?;
			let mut buf = [0u8; 8];
			buf.copy_from_slice(raw);
			*pos += 8;
			let sortable = u64::from_be_bytes(buf);
			let bits = if sortable & SIGN_BIT == 0 { !sortable } else { sortable & !SIGN_BIT };
			Ok(Key::Number(f64::from_bits(bits)))
		}
		TAG_STRING => {
			let mut out = Vec::new();
			loop {
				let b = *bytes
					.get(*pos)
					.ok_or_else(|| Error::InvalidKey("unterminated string".into()))?;
				*pos += 1;
				if b != TAG_END {
					out.push(b);
					continue;
				}
				match bytes.get(*pos) {
					Some(&TAG_END) => {
						*pos += 1;
						break;
					}
					Some(&ESCAPE) => {
						*pos += 1;
						out.push(TAG_END);
					}
					_ => return Err(Error::InvalidKey("bad string escape".into())),
				}
			}
			String::from_utf8(out)
				.map(|s| Key::String(s.into()))
				.map_err(|e| Error::InvalidKey(e.to_string()))
		}
		TAG_ARRAY => {
			let mut items = Vec::new();
			loop {
				match bytes.get(*pos) {
					Some(&TAG_END) => {
						*pos += 1;
						break;
					}
					Some(_) => items.push(decode_at(bytes, pos)?),
					None => return Err(Error::InvalidKey("unterminated array".into())),
				}
			}
			Ok(Key::Array(items))
		}
		other => Err(Error::InvalidKey(format!("unknown tag {:#x}", other))),
	}
}

impl From<&str> for Key {
	fn from(s: &str) -> Self {
		Key::String(s.into())
	}
}

impl From<String> for Key {
	fn from(s: String) -> Self {
		Key::String(s.into())
	}
}

impl From<&String> for Key {
	fn from(s: &String) -> Self {
		Key::String(s.as_str().into())
	}
}

impl From<Box<str>> for Key {
	fn from(s: Box<str>) -> Self {
		Key::String(s)
	}
}

impl From<i64> for Key {
	fn from(n: i64) -> Self {
		Key::Number(n as f64)
	}
}

impl From<i32> for Key {
	fn from(n: i32) -> Self {
		Key::Number(f64::from(n))
	}
}

impl From<f64> for Key {
	fn from(n: f64) -> Self {
		Key::Number(n)
	}
}

impl From<Vec<Key>> for Key {
	fn from(items: Vec<Key>) -> Self {
		Key::Array(items)
	}
}

/// Builds an array key from a list of key-convertible values.
#[macro_export]
macro_rules! key {
	($($item:expr),* $(,)?) => {
		$crate::key::Key::Array(vec![$($crate::key::Key::from($item)),*])
	};
}

// KeyRange //
//**********//
pub type ByteBounds = (Bound<Vec<u8>>, Bound<Vec<u8>>);

#[derive(Clone, Debug, PartialEq)]
pub enum KeyRange {
	All,
	Only(Key),
	Bound { lower: Option<(Key, bool)>, upper: Option<(Key, bool)> },
	/// Array keys whose leading elements equal the given ones.
	Prefix(Vec<Key>),
}

impl KeyRange {
	pub fn only(key: impl Into<Key>) -> Self {
		KeyRange::Only(key.into())
	}

	pub fn bound(lower: Key, upper: Key, lower_open: bool, upper_open: bool) -> Self {
		KeyRange::Bound { lower: Some((lower, lower_open)), upper: Some((upper, upper_open)) }
	}

	pub fn lower_bound(lower: Key, open: bool) -> Self {
		KeyRange::Bound { lower: Some((lower, open)), upper: None }
	}

	pub fn upper_bound(upper: Key, open: bool) -> Self {
		KeyRange::Bound { lower: None, upper: Some((upper, open)) }
	}

	pub fn prefix(items: Vec<Key>) -> Self {
		KeyRange::Prefix(items)
	}

	fn prefix_bytes(items: &[Key]) -> Vec<u8> {
		let mut out = vec![TAG_ARRAY];
		for item in items {
			item.encode_into(&mut out);
		}
		out
	}

	/// Byte bounds over encoded primary keys.
	pub fn store_bounds(&self) -> ByteBounds {
		match self {
			KeyRange::All => (Bound::Unbounded, Bound::Unbounded),
			KeyRange::Only(key) => {
				let enc = key.encode();
				(Bound::Included(enc.clone()), Bound::Included(enc))
			}
			KeyRange::Bound { lower, upper } => {
				let lower = match lower {
					Some((key, false)) => Bound::Included(key.encode()),
					Some((key, true)) => Bound::Excluded(key.encode()),
					None => Bound::Unbounded,
				};
				let upper = match upper {
					Some((key, false)) => Bound::Included(key.encode()),
					Some((key, true)) => Bound::Excluded(key.encode()),
					None => Bound::Unbounded,
				};
				(lower, upper)
			}
			KeyRange::Prefix(items) => {
				let start = Self::prefix_bytes(items);
				let mut end = start.clone();
				end.push(SENTINEL);
				(Bound::Included(start), Bound::Excluded(end))
			}
		}
	}

	/// Byte bounds over index entries, which are encoded as the array
	/// `[indexKey, primaryKey]`.
	pub fn index_bounds(&self) -> ByteBounds {
		let wrap = |bytes: Vec<u8>, sentinel: bool| {
			let mut out = Vec::with_capacity(bytes.len() + 2);
			out.push(TAG_ARRAY);
			out.extend_from_slice(&bytes);
			if sentinel {
				out.push(SENTINEL);
			}
			out
		};
		match self {
			KeyRange::All => (Bound::Unbounded, Bound::Unbounded),
			KeyRange::Only(key) => {
				let enc = key.encode();
				(Bound::Included(wrap(enc.clone(), false)), Bound::Excluded(wrap(enc, true)))
			}
			KeyRange::Bound { lower, upper } => {
				let lower = match lower {
					Some((key, open)) => Bound::Included(wrap(key.encode(), *open)),
					None => Bound::Unbounded,
				};
				let upper = match upper {
					Some((key, open)) => Bound::Excluded(wrap(key.encode(), !*open)),
					None => Bound::Unbounded,
				};
				(lower, upper)
			}
			KeyRange::Prefix(items) => {
				let start = Self::prefix_bytes(items);
				(Bound::Included(wrap(start.clone(), false)), Bound::Excluded(wrap(start, true)))
			}
		}
	}

	/// Checks a primary key against this range.
	pub fn contains(&self, key: &Key) -> bool {
		let enc = key.encode();
		let (lower, upper) = self.store_bounds();
		let above = match &lower {
			Bound::Included(b) => enc.as_slice() >= b.as_slice(),
			Bound::Excluded(b) => enc.as_slice() > b.as_slice(),
			Bound::Unbounded => true,
		};
		let below = match &upper {
			Bound::Included(b) => enc.as_slice() <= b.as_slice(),
			Bound::Excluded(b) => enc.as_slice() < b.as_slice(),
			Bound::Unbounded => true,
		};
		above && below
	}
}


// vim: ts=4
