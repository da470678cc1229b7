use std::collections::HashMap;
use std::time::Duration;

use crate::tftp::consts;
use crate::tftp::error::{OptionError, PacketError};

/// Option names are case-insensitive on the wire; keys are normalized to
/// lowercase on insertion and lookup. Values are kept verbatim. Iteration
/// order is unspecified, equality is order-independent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionSet {
	map: HashMap<String, String>,
}

impl OptionSet {
	pub fn new() -> Self {
		Self { map: HashMap::new() }
	}

	pub fn insert(&mut self, name: &str, value: &str) {
		self.map.insert(name.to_ascii_lowercase(), value.to_string());
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.map.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
	}

	pub fn is_empty(&self) -> bool { self.map.is_empty() }
	pub fn len(&self) -> usize { self.map.len() }

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	/// Serialized size: one name\0value\0 pair per option.
	pub fn wire_len(&self) -> usize {
		self.map.iter().map(|(k, v)| k.len() + v.len() + 2).sum()
	}

	/// Parses the trailing option region of a request or OACK: a sequence of
	/// zero-terminated name/value pairs. A name without a value or a missing
	/// terminator is malformed; an empty region is an empty set.
	pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
		let mut set = Self::new();
		let mut rest = buf;

		while !rest.is_empty() {
			let (name, after_name) = take_cstr(rest)?;
			if name.is_empty() {
				return Err(PacketError::MalformedPacket);
			}
			let (value, after_value) = take_cstr(after_name)?;
			set.insert(name, value);
			rest = after_value;
		}
		Ok(set)
	}

	pub fn write_to(&self, out: &mut Vec<u8>) {
		for (name, value) in self.map.iter() {
			out.extend_from_slice(name.as_bytes());
			out.push(0);
			out.extend_from_slice(value.as_bytes());
			out.push(0);
		}
	}
}

/// Splits one zero-terminated string off the front of `buf`.
pub(crate) fn take_cstr(buf: &[u8]) -> Result<(&str, &[u8]), PacketError> {
	let nul = buf.iter().position(|b| *b == 0)
		.ok_or(PacketError::NotNullTerminated)?;
	let s = std::str::from_utf8(&buf[..nul])
		.map_err(|_| PacketError::InvalidCharacters)?;
	Ok((s, &buf[nul + 1..]))
}

// ############################################################################
// #### TYPED OPTIONS #########################################################
// ############################################################################

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TftpOptionKind {
	Timeout,
	TransferSize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TftpOption {
	Timeout(Duration),
	TransferSize(u64),
}
impl TftpOption {
	pub fn kind(&self) -> TftpOptionKind {
		match self {
			Self::Timeout(_) => TftpOptionKind::Timeout,
			Self::TransferSize(_) => TftpOptionKind::TransferSize,
		}
	}

	pub fn as_str_tuple(&self) -> (&'static str, String) {
		match self {
			Self::Timeout(t) => (consts::OPT_TIMEOUT_IDENT, t.as_secs().to_string()),
			Self::TransferSize(ts) => (consts::OPT_TRANSFERSIZE_IDENT, ts.to_string()),
		}
	}
}

/// Extracts the options this implementation understands. Unknown options are
/// skipped, a known option with an unusable value is an error.
pub fn parse_tftp_options(raw_opts: &OptionSet) -> Result<Vec<TftpOption>, OptionError> {
	let mut res: Vec<TftpOption> = Vec::with_capacity(2);

	if let Some(val) = raw_opts.get(consts::OPT_TIMEOUT_IDENT) {
		match val.parse::<u8>() {
			Ok(secs) if secs >= 1 => res.push(TftpOption::Timeout(Duration::from_secs(secs as u64))),
			_ => return Err(OptionError::InvalidOption),
		}
	}

	if let Some(val) = raw_opts.get(consts::OPT_TRANSFERSIZE_IDENT) {
		match val.parse::<u64>() {
			Ok(tf_size) => res.push(TftpOption::TransferSize(tf_size)),
			Err(_) => return Err(OptionError::InvalidOption),
		}
	}

	Ok(res)
}

// ############################################################################
// ############################################################################

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn keys_are_case_insensitive() {
		let mut set = OptionSet::new();
		set.insert("TSize", "1024");
		assert_eq!(set.get("tsize"), Some("1024"));
		assert_eq!(set.get("TSIZE"), Some("1024"));
		assert_eq!(set.get("timeout"), None);
	}

	#[test]
	fn values_are_kept_verbatim() {
		let mut set = OptionSet::new();
		set.insert("tsize", "MiXeD");
		assert_eq!(set.get("tsize"), Some("MiXeD"));
	}

	#[test]
	fn wire_len_counts_both_terminators() {
		let mut set = OptionSet::new();
		set.insert("tsize", "0");
		set.insert("timeout", "5");
		assert_eq!(set.wire_len(), ("tsize".len() + 1 + 1) + ("timeout".len() + 1 + 1) + 2);
	}

	#[test]
	fn parse_reads_pairs() {
		let set = OptionSet::parse(b"tsize\x00512\x00timeout\x003\x00").unwrap();
		assert_eq!(set.len(), 2);
		assert_eq!(set.get("tsize"), Some("512"));
		assert_eq!(set.get("timeout"), Some("3"));
	}

	#[test]
	fn parse_rejects_dangling_name() {
		assert_eq!(OptionSet::parse(b"tsize\x00512"), Err(PacketError::NotNullTerminated));
		assert_eq!(OptionSet::parse(b"tsize"), Err(PacketError::NotNullTerminated));
	}

	#[test]
	fn parse_rejects_empty_name() {
		assert_eq!(OptionSet::parse(b"\x00512\x00"), Err(PacketError::MalformedPacket));
	}

	#[test]
	fn equality_ignores_insertion_order() {
		let mut a = OptionSet::new();
		a.insert("tsize", "1");
		a.insert("timeout", "2");
		let mut b = OptionSet::new();
		b.insert("timeout", "2");
		b.insert("TSIZE", "1");
		assert_eq!(a, b);
	}

	#[test]
	fn typed_options_skip_unknown_names() {
		let mut set = OptionSet::new();
		set.insert("windowsize", "8");
		set.insert("tsize", "99");
		let opts = parse_tftp_options(&set).unwrap();
		assert_eq!(opts, vec![TftpOption::TransferSize(99)]);
	}

	#[test]
	fn typed_options_reject_bad_values() {
		let mut set = OptionSet::new();
		set.insert("timeout", "0");
		assert_eq!(parse_tftp_options(&set), Err(OptionError::InvalidOption));

		let mut set = OptionSet::new();
		set.insert("tsize", "abc");
		assert_eq!(parse_tftp_options(&set), Err(OptionError::InvalidOption));
	}
}
