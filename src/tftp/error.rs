use std::io;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum PacketError {
	#[error("packet too short")]
	UnexpectedEof,
	#[error("malformed packet")]
	MalformedPacket,
	#[error("invalid opcode")]
	InvalidOpcode,
	#[error("missing null termination")]
	NotNullTerminated,
	#[error("invalid characters")]
	InvalidCharacters,
	#[error("unknown transfer mode")]
	UnknownTxMode,
}

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum OptionError {
	#[error("invalid option value")]
	InvalidOption,
	#[error("option negotiation was not acknowledged")]
	NoAck,
}

/// Outcome of a single receive on a transfer socket. `Timeout` is the only
/// recoverable variant; the caller decides whether to retransmit or give up.
#[derive(Debug, Error)]
pub enum RecvError {
	#[error("receive timed out")]
	Timeout,
	#[error("invalid packet: {0}")]
	BadPacket(#[from] PacketError),
	#[error("socket error: {0}")]
	Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum RequestError {
	#[error("malformed request")]
	MalformedRequest,
	#[error("unsupported transfer mode")]
	UnsupportedMode,
	#[error("requested path is outside the served root")]
	PathOutsideRoot,
	#[error("file not found")]
	FileNotFound,
	#[error("file already exists")]
	FileExists,
	#[error("file not accessible")]
	FileNotAccessible,
	#[error(transparent)]
	Option(#[from] OptionError),
	#[error("host error: {0}")]
	OtherHostError(#[from] io::Error),
}
