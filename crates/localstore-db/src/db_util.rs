//! Low-level helpers: cursors, key ranges and error descriptions.

use localstore::prelude::*;
use serde_json::Value;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CursorDirection {
	#[default]
	Next,
	Prev,
}

/// Cursor over a snapshot of the rows in a key range.
///
/// The rows are read when the cursor is opened; writes made through the
/// transaction afterwards are not reflected.
#[derive(Debug)]
pub struct Cursor {
	entries: Vec<(Key, Value)>,
	pos: usize,
}

impl Cursor {
	pub(crate) fn new(mut entries: Vec<(Key, Value)>, direction: CursorDirection) -> Self {
		if direction == CursorDirection::Prev {
			entries.reverse();
		}
		Self { entries, pos: 0 }
	}

	/// True while the cursor points at a row
	pub fn is_valid(&self) -> bool {
		self.pos < self.entries.len()
	}

	pub fn key(&self) -> Option<&Key> {
		self.entries.get(self.pos).map(|(k, _)| k)
	}

	pub fn value(&self) -> Option<&Value> {
		self.entries.get(self.pos).map(|(_, v)| v)
	}

	pub fn current(&self) -> Option<(&Key, &Value)> {
		self.entries.get(self.pos).map(|(k, v)| (k, v))
	}

	/// Moves to the next row. Returns false once the cursor is exhausted.
	pub fn continue_next(&mut self) -> bool {
		self.advance(1)
	}

	pub fn advance(&mut self, count: usize) -> bool {
		self.pos = self.pos.saturating_add(count).min(self.entries.len());
		self.is_valid()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn into_values(self) -> Vec<Value> {
		self.entries.into_iter().skip(self.pos).map(|(_, v)| v).collect()
	}
}

impl Iterator for Cursor {
	type Item = (Key, Value);

	fn next(&mut self) -> Option<Self::Item> {
		let item = self.entries.get(self.pos).cloned();
		if item.is_some() {
			self.pos += 1;
		}
		item
	}
}

/// Key range matching exactly one key
pub fn only(key: impl Into<Key>) -> KeyRange {
	KeyRange::only(key)
}

pub fn bound(lower: impl Into<Key>, upper: impl Into<Key>, lower_open: bool, upper_open: bool) -> KeyRange {
	KeyRange::bound(lower.into(), upper.into(), lower_open, upper_open)
}

pub fn lower_bound(lower: impl Into<Key>, open: bool) -> KeyRange {
	KeyRange::lower_bound(lower.into(), open)
}

pub fn upper_bound(upper: impl Into<Key>, open: bool) -> KeyRange {
	KeyRange::upper_bound(upper.into(), open)
}

/// Array keys starting with `items`
pub fn prefix(items: Vec<Key>) -> KeyRange {
	KeyRange::prefix(items)
}

/// Renders a key the way it is shown in logs and error descriptions
pub fn describe_key(key: &Key) -> String {
	key.to_value().to_string()
}

pub fn describe_range(range: &KeyRange) -> String {
	match range {
		KeyRange::All => "*".into(),
		KeyRange::Only(key) => describe_key(key),
		KeyRange::Bound { lower, upper } => {
			let lower = match lower {
				Some((key, true)) => format!("({}", describe_key(key)),
				Some((key, false)) => format!("[{}", describe_key(key)),
				None => "(-inf".into(),
			};
			let upper = match upper {
				Some((key, true)) => format!("{})", describe_key(key)),
				Some((key, false)) => format!("{}]", describe_key(key)),
				None => "+inf)".into(),
			};
			format!("{}..{}", lower, upper)
		}
		KeyRange::Prefix(items) => {
			let items: Vec<String> = items.iter().map(describe_key).collect();
			format!("[{},...]", items.join(","))
		}
	}
}

/// Debug description attached to errors of a request
pub fn describe_request(operation: &str, store: &str, target: &str) -> String {
	format!("{} {} {}", operation, store, target)
}

/// One-line error message including the context it happened in
pub fn format_error(context: &str, err: &Error) -> String {
	match err {
		Error::Request { description, source } => {
			format!("{}: {} (request: {})", context, source.root(), description)
		}
		other => format!("{}: {}", context, other),
	}
}


// vim: ts=4
