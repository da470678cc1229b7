use std::io::{self, BufRead, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::sim::rules::{ErrorAction, ErrorInstruction};
use crate::sim::SimEngine;
use crate::tftp::packet::PacketKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	Continue,
	Shutdown,
}

type Handler<T> = fn(&T, &[&str], &mut dyn Write) -> io::Result<Outcome>;

struct CommandSpec<T> {
	name: &'static str,
	usage: &'static str,
	handler: Handler<T>,
}

/// Routes the first token of a line to a registered handler. `help` is
/// built in; everything else is supplied by the caller.
pub struct CommandSet<T> {
	commands: Vec<CommandSpec<T>>,
}

impl<T> CommandSet<T> {
	pub fn new() -> Self {
		Self { commands: Vec::new() }
	}

	pub fn register(&mut self, name: &'static str, usage: &'static str, handler: Handler<T>) {
		self.commands.push(CommandSpec { name, usage, handler });
	}

	pub fn dispatch(&self, ctx: &T, line: &str, out: &mut dyn Write) -> io::Result<Outcome> {
		let tokens: Vec<&str> = line.split_whitespace().collect();
		let Some((cmd, args)) = tokens.split_first() else {
			return Ok(Outcome::Continue);
		};

		if *cmd == "help" {
			self.print_help(out)?;
			return Ok(Outcome::Continue);
		}
		match self.commands.iter().find(|spec| spec.name == *cmd) {
			Some(spec) => (spec.handler)(ctx, args, out),
			None => {
				writeln!(out, "unknown command '{}', try 'help'", cmd)?;
				Ok(Outcome::Continue)
			},
		}
	}

	fn print_help(&self, out: &mut dyn Write) -> io::Result<()> {
		writeln!(out, "commands:")?;
		for spec in self.commands.iter() {
			writeln!(out, "  {}", spec.usage)?;
		}
		writeln!(out, "  help")
	}
}

/// Reads lines until EOF or `shutdown`. Every line is dispatched; a failed
/// command only prints, it never ends the console.
pub fn run_console<R: BufRead, W: Write>(
	engine: &Arc<SimEngine>,
	input: R,
	mut output: W,
) -> io::Result<()> {
	let commands = simulator_commands();

	for line in input.lines() {
		let line = line?;
		match commands.dispatch(engine, &line, &mut output)? {
			Outcome::Continue => {},
			Outcome::Shutdown => {
				engine.shutdown();
				break;
			},
		}
	}
	Ok(())
}

// ############################################################################
// #### SIMULATOR COMMANDS ####################################################
// ############################################################################

pub fn simulator_commands() -> CommandSet<Arc<SimEngine>> {
	let mut set = CommandSet::new();
	set.register("shutdown", "shutdown", cmd_shutdown);
	set.register("verbose", "verbose", cmd_verbose);
	set.register("quiet", "quiet", cmd_quiet);
	set.register("clientport", "clientport [port]", cmd_clientport);
	set.register("serverport", "serverport [port]", cmd_serverport);
	set.register("serverip", "serverip [addr]", cmd_serverip);
	set.register("drop", "drop <kind> <block> <repeat>", cmd_drop);
	set.register("delay", "delay <kind> <block> <ms> <repeat>", cmd_delay);
	set.register("duplicate", "duplicate <kind> <block> <ms> <repeat>", cmd_duplicate);
	set.register("errors", "errors", cmd_errors);
	set
}

fn cmd_shutdown(_: &Arc<SimEngine>, _: &[&str], out: &mut dyn Write) -> io::Result<Outcome> {
	writeln!(out, "shutting down")?;
	Ok(Outcome::Shutdown)
}

fn cmd_verbose(engine: &Arc<SimEngine>, _: &[&str], out: &mut dyn Write) -> io::Result<Outcome> {
	engine.set_verbose(true);
	writeln!(out, "verbose packet logging enabled")?;
	Ok(Outcome::Continue)
}

fn cmd_quiet(engine: &Arc<SimEngine>, _: &[&str], out: &mut dyn Write) -> io::Result<Outcome> {
	engine.set_verbose(false);
	writeln!(out, "verbose packet logging disabled")?;
	Ok(Outcome::Continue)
}

fn cmd_clientport(engine: &Arc<SimEngine>, args: &[&str], out: &mut dyn Write) -> io::Result<Outcome> {
	match args {
		[] => writeln!(out, "client port: {}", engine.client_port())?,
		[port] => match parse_num::<u16>(port, "port") {
			Ok(port) => match engine.set_client_port(port) {
				Ok(()) => writeln!(out, "client port set to {}", port)?,
				Err(e) => writeln!(out, "cannot bind port {}: {}", port, e)?,
			},
			Err(msg) => writeln!(out, "{}", msg)?,
		},
		_ => writeln!(out, "usage: clientport [port]")?,
	}
	Ok(Outcome::Continue)
}

fn cmd_serverport(engine: &Arc<SimEngine>, args: &[&str], out: &mut dyn Write) -> io::Result<Outcome> {
	match args {
		[] => writeln!(out, "server port: {}", engine.server_addr().port())?,
		[port] => match parse_num::<u16>(port, "port") {
			Ok(port) => {
				engine.set_server_port(port);
				writeln!(out, "server port set to {}", port)?;
			},
			Err(msg) => writeln!(out, "{}", msg)?,
		},
		_ => writeln!(out, "usage: serverport [port]")?,
	}
	Ok(Outcome::Continue)
}

fn cmd_serverip(engine: &Arc<SimEngine>, args: &[&str], out: &mut dyn Write) -> io::Result<Outcome> {
	match args {
		[] => writeln!(out, "server address: {}", engine.server_addr().ip())?,
		[addr] => match addr.parse() {
			Ok(ip) => {
				engine.set_server_ip(ip);
				writeln!(out, "server address set to {}", ip)?;
			},
			Err(_) => writeln!(out, "'{}' is not an ip address", addr)?,
		},
		_ => writeln!(out, "usage: serverip [addr]")?,
	}
	Ok(Outcome::Continue)
}

fn cmd_drop(engine: &Arc<SimEngine>, args: &[&str], out: &mut dyn Write) -> io::Result<Outcome> {
	let &[kind, block, repeat] = args else {
		writeln!(out, "usage: drop <kind> <block> <repeat>")?;
		return Ok(Outcome::Continue);
	};
	schedule_rule(engine, ErrorAction::Drop, kind, block, "0", repeat, out)
}

fn cmd_delay(engine: &Arc<SimEngine>, args: &[&str], out: &mut dyn Write) -> io::Result<Outcome> {
	let &[kind, block, millis, repeat] = args else {
		writeln!(out, "usage: delay <kind> <block> <ms> <repeat>")?;
		return Ok(Outcome::Continue);
	};
	schedule_rule(engine, ErrorAction::Delay, kind, block, millis, repeat, out)
}

fn cmd_duplicate(engine: &Arc<SimEngine>, args: &[&str], out: &mut dyn Write) -> io::Result<Outcome> {
	let &[kind, block, millis, repeat] = args else {
		writeln!(out, "usage: duplicate <kind> <block> <ms> <repeat>")?;
		return Ok(Outcome::Continue);
	};
	schedule_rule(engine, ErrorAction::Duplicate, kind, block, millis, repeat, out)
}

fn cmd_errors(engine: &Arc<SimEngine>, _: &[&str], out: &mut dyn Write) -> io::Result<Outcome> {
	let rules = engine.rules_snapshot();
	if rules.is_empty() {
		writeln!(out, "no errors scheduled")?;
	}
	for rule in rules {
		writeln!(out, "{}", rule)?;
	}
	Ok(Outcome::Continue)
}

// ############################################################################
// #### ARGUMENT PARSING ######################################################
// ############################################################################

fn schedule_rule(
	engine: &Arc<SimEngine>,
	action: ErrorAction,
	kind: &str,
	block: &str,
	millis: &str,
	repeat: &str,
	out: &mut dyn Write,
) -> io::Result<Outcome> {
	let rule = match build_rule(action, kind, block, millis, repeat) {
		Ok(rule) => rule,
		Err(msg) => {
			writeln!(out, "{}", msg)?;
			return Ok(Outcome::Continue);
		},
	};

	writeln!(out, "scheduled: {}", rule)?;
	engine.add_rule(rule);
	Ok(Outcome::Continue)
}

fn build_rule(
	action: ErrorAction,
	kind: &str,
	block: &str,
	millis: &str,
	repeat: &str,
) -> Result<ErrorInstruction, String> {
	let kind = parse_kind(kind)?;
	let block = parse_num::<u16>(block, "block number")?;
	let delay = Duration::from_millis(parse_num::<u64>(millis, "delay")?);
	let repeat = parse_num::<i32>(repeat, "repeat count")?;
	if repeat == 0 {
		return Err("repeat count must not be zero (negative means indefinite)".to_string());
	}

	Ok(ErrorInstruction { kind, action, block, delay, repeat })
}

fn parse_kind(token: &str) -> Result<PacketKind, String> {
	match &token.to_ascii_lowercase()[..] {
		"rrq" => Ok(PacketKind::Rrq),
		"wrq" => Ok(PacketKind::Wrq),
		"data" => Ok(PacketKind::Data),
		"ack" => Ok(PacketKind::Ack),
		"error" => Ok(PacketKind::Error),
		_ => Err(format!("'{}' is not a packet kind (rrq, wrq, data, ack, error)", token)),
	}
}

fn parse_num<T: FromStr>(token: &str, what: &str) -> Result<T, String> {
	token.parse::<T>().map_err(|_| format!("'{}' is not a valid {}", token, what))
}

// ############################################################################
// ############################################################################

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sim::SimSettings;
	use std::net::{IpAddr, Ipv4Addr};
	use tokio_util::sync::CancellationToken;

	fn test_engine() -> Arc<SimEngine> {
		let settings = SimSettings {
			bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
			client_port: 0,
			server_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
			server_port: 6969,
		};
		SimEngine::new(settings, CancellationToken::new()).unwrap()
	}

	fn dispatch(engine: &Arc<SimEngine>, line: &str) -> (Outcome, String) {
		let commands = simulator_commands();
		let mut out: Vec<u8> = Vec::new();
		let outcome = commands.dispatch(engine, line, &mut out).unwrap();
		(outcome, String::from_utf8(out).unwrap())
	}

	#[test]
	fn unknown_commands_report_once() {
		let engine = test_engine();
		let (outcome, out) = dispatch(&engine, "frobnicate 1 2");
		assert_eq!(outcome, Outcome::Continue);
		assert!(out.contains("unknown command 'frobnicate'"));
	}

	#[test]
	fn blank_lines_are_ignored() {
		let engine = test_engine();
		let (outcome, out) = dispatch(&engine, "   ");
		assert_eq!(outcome, Outcome::Continue);
		assert!(out.is_empty());
	}

	#[test]
	fn drop_command_schedules_a_rule() {
		let engine = test_engine();
		let (_, out) = dispatch(&engine, "drop data 2 1");
		assert!(out.contains("scheduled"));

		let rules = engine.rules_snapshot();
		assert_eq!(rules, vec![ ErrorInstruction {
			kind: PacketKind::Data,
			action: ErrorAction::Drop,
			block: 2,
			delay: Duration::ZERO,
			repeat: 1,
		} ]);
	}

	#[test]
	fn duplicate_command_carries_the_inter_copy_delay() {
		let engine = test_engine();
		dispatch(&engine, "duplicate ack 3 250 -1");

		let rules = engine.rules_snapshot();
		assert_eq!(rules, vec![ ErrorInstruction {
			kind: PacketKind::Ack,
			action: ErrorAction::Duplicate,
			block: 3,
			delay: Duration::from_millis(250),
			repeat: -1,
		} ]);
	}

	#[test]
	fn invalid_arguments_change_nothing() {
		let engine = test_engine();

		let (_, out) = dispatch(&engine, "drop oack 2 1");
		assert!(out.contains("not a packet kind"));
		let (_, out) = dispatch(&engine, "drop data twelve 1");
		assert!(out.contains("not a valid block number"));
		let (_, out) = dispatch(&engine, "drop data 2 0");
		assert!(out.contains("must not be zero"));
		let (_, out) = dispatch(&engine, "delay data 2 1");
		assert!(out.contains("usage: delay"));

		assert!(engine.rules_snapshot().is_empty());
	}

	#[test]
	fn verbose_and_quiet_flip_logging() {
		let engine = test_engine();
		dispatch(&engine, "verbose");
		assert!(engine.verbose.load(std::sync::atomic::Ordering::Relaxed));
		dispatch(&engine, "quiet");
		assert!(!engine.verbose.load(std::sync::atomic::Ordering::Relaxed));
	}

	#[test]
	fn port_commands_report_and_update() {
		let engine = test_engine();

		let (_, out) = dispatch(&engine, "clientport");
		assert!(out.contains(&engine.client_port().to_string()));

		dispatch(&engine, "serverport 7070");
		assert_eq!(engine.server_addr().port(), 7070);

		dispatch(&engine, "serverip 127.0.0.2");
		assert_eq!(engine.server_addr().ip().to_string(), "127.0.0.2");
	}

	#[test]
	fn errors_lists_the_schedule() {
		let engine = test_engine();
		let (_, out) = dispatch(&engine, "errors");
		assert!(out.contains("no errors scheduled"));

		dispatch(&engine, "drop data 2 1");
		dispatch(&engine, "delay ack 1 500 2");
		let (_, out) = dispatch(&engine, "errors");
		assert!(out.contains("drop DATA block 2"));
		assert!(out.contains("delay ACK block 1 delay 500ms"));
	}

	#[test]
	fn shutdown_ends_the_console() {
		let engine = test_engine();
		let (outcome, _) = dispatch(&engine, "shutdown");
		assert_eq!(outcome, Outcome::Shutdown);
	}

	#[test]
	fn help_lists_every_command() {
		let engine = test_engine();
		let (_, out) = dispatch(&engine, "help");
		for name in [ "shutdown", "verbose", "quiet", "clientport", "serverport",
		              "serverip", "drop", "delay", "duplicate", "errors", "help" ] {
			assert!(out.contains(name), "missing '{}' in help output", name);
		}
	}
}
