//! Glob pattern sets used for pack patterns and query ignores.

use glob::{MatchOptions, Pattern};

use crate::error::Error;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
	case_sensitive: true,
	require_literal_separator: true,
	require_literal_leading_dot: false,
};

/// A compiled, ordered set of glob patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
	patterns: Vec<Pattern>,
}

impl PatternSet {
	pub fn new(raw: &[String]) -> Result<Self, Error> {
		let patterns = raw
			.iter()
			.map(|p| Pattern::new(p))
			.collect::<Result<Vec<_>, _>>()?;
		Ok(PatternSet { patterns })
	}

	pub fn is_empty(&self) -> bool {
		self.patterns.is_empty()
	}

	pub fn matches(&self, path: &str) -> bool {
		self.patterns
			.iter()
			.any(|p| p.matches_with(path, MATCH_OPTIONS))
	}
}

/// Longest directory prefix of `path` matched by one of the pack
/// patterns, or `None` if the path is stored unpacked.
///
/// Pack patterns match whole directory prefixes including their trailing
/// slash (`node_modules/`, `vendor/*/`).
pub fn pack_root(patterns: &PatternSet, path: &str) -> Option<String> {
	if patterns.is_empty() {
		return None;
	}
	let mut best = None;
	let mut idx = 0;
	while let Some(pos) = path[idx..].find('/') {
		let end = idx + pos + 1;
		if patterns.matches(&path[..end]) {
			best = Some(end);
		}
		idx = end;
	}
	best.map(|end| path[..end].to_string())
}

/// Smallest string strictly greater than every string starting with
/// `prefix`, for turning prefix filters into index range scans.
///
/// Returns `None` when no such ASCII-safe bound exists; callers then fall
/// back to a per-row prefix check.
pub fn prefix_upper_bound(prefix: &str) -> Option<String> {
	let mut bytes = prefix.as_bytes().to_vec();
	while let Some(last) = bytes.pop() {
		if last < 0x7f {
			bytes.push(last + 1);
			// All bytes below 0x7f, so this is valid UTF-8.
			return String::from_utf8(bytes).ok();
		}
	}
	None
}
