use std::fmt::Display;
use std::time::Duration;

use crate::tftp::packet::{Packet, PacketKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
	Drop,
	Duplicate,
	Delay,
}
impl Display for ErrorAction {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", match self {
			Self::Drop => "drop",
			Self::Duplicate => "duplicate",
			Self::Delay => "delay",
		})
	}
}

/// One scheduled perturbation. Matches a relayed packet by kind and, where
/// the packet carries one, block number. A negative repeat count means the
/// instruction never wears out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInstruction {
	pub kind: PacketKind,
	pub action: ErrorAction,
	pub block: u16,
	pub delay: Duration,
	pub repeat: i32,
}

impl ErrorInstruction {
	pub fn matches(&self, pkt: &Packet) -> bool {
		if pkt.kind() != self.kind {
			return false;
		}
		match pkt.block_num() {
			Some(block) => block == self.block,
			/* requests and errors have no block number to compare */
			None => true,
		}
	}
}

impl Display for ErrorInstruction {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} {} block {}", self.action, self.kind, self.block)?;
		if self.action != ErrorAction::Drop {
			write!(f, " delay {}ms", self.delay.as_millis())?;
		}
		match self.repeat {
			r if r < 0 => write!(f, " (indefinite)"),
			r => write!(f, " ({} left)", r),
		}
	}
}

/// The ordered perturbation list. The first matching instruction wins.
#[derive(Debug, Default)]
pub struct RuleSet {
	rules: Vec<ErrorInstruction>,
}

impl RuleSet {
	pub fn add(&mut self, rule: ErrorInstruction) {
		self.rules.push(rule);
	}

	pub fn is_empty(&self) -> bool { self.rules.is_empty() }

	pub fn iter(&self) -> impl Iterator<Item = &ErrorInstruction> {
		self.rules.iter()
	}

	/// Picks the action for one relayed packet. Consumes one repetition of
	/// the first matching rule and drops the rule once it is spent.
	pub fn apply(&mut self, pkt: &Packet) -> Option<(ErrorAction, Duration)> {
		let idx = self.rules.iter().position(|r| r.matches(pkt))?;
		let rule = &mut self.rules[idx];
		let action = (rule.action, rule.delay);

		if rule.repeat > 0 {
			rule.repeat -= 1;
			if rule.repeat == 0 {
				self.rules.remove(idx);
			}
		}
		Some(action)
	}
}

// ############################################################################
// ############################################################################
