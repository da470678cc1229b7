use std::fmt::Display;

use crate::tftp::error::PacketError;
use crate::tftp::options::{take_cstr, OptionSet};
use crate::tftp::{consts, ErrorCode, Mode, RequestKind};

// ############################################################################
// #### PACKET MODEL ##########################################################
// ############################################################################

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
	Rrq,
	Wrq,
	Data,
	Ack,
	Error,
	OAck,
}
impl Display for PacketKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", match self {
			Self::Rrq => "RRQ",
			Self::Wrq => "WRQ",
			Self::Data => "DATA",
			Self::Ack => "ACK",
			Self::Error => "ERROR",
			Self::OAck => "OACK",
		})
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
	Rrq { filename: String, mode: Mode, options: OptionSet },
	Wrq { filename: String, mode: Mode, options: OptionSet },
	Data { block: u16, data: Vec<u8> },
	Ack { block: u16 },
	Error { code: ErrorCode, message: String },
	OAck { options: OptionSet },
}

impl Packet {
	pub fn kind(&self) -> PacketKind {
		match self {
			Self::Rrq { .. } => PacketKind::Rrq,
			Self::Wrq { .. } => PacketKind::Wrq,
			Self::Data { .. } => PacketKind::Data,
			Self::Ack { .. } => PacketKind::Ack,
			Self::Error { .. } => PacketKind::Error,
			Self::OAck { .. } => PacketKind::OAck,
		}
	}

	pub fn is_request(&self) -> bool {
		matches!(self, Self::Rrq { .. } | Self::Wrq { .. })
	}

	pub fn request_kind(&self) -> Option<RequestKind> {
		match self {
			Self::Rrq { .. } => Some(RequestKind::Rrq),
			Self::Wrq { .. } => Some(RequestKind::Wrq),
			_ => None,
		}
	}

	pub fn block_num(&self) -> Option<u16> {
		match self {
			Self::Data { block, .. } | Self::Ack { block } => Some(*block),
			_ => None,
		}
	}

	pub fn error(code: ErrorCode, message: &str) -> Self {
		Self::Error { code, message: message.to_string() }
	}

	// ########################################################################
	// ###### PARSING #########################################################
	// ########################################################################

	/// Parses one datagram. The buffer must cover exactly the received
	/// datagram. Request strings (filename, mode) are decoded strictly and
	/// invalid UTF-8 is rejected; an ERROR description is decoded lossily.
	pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
		if buf.len() < 2 {
			return Err(PacketError::UnexpectedEof);
		}

		match u16::from_be_bytes([ buf[0], buf[1] ]) {
			consts::OPCODE_RRQ => Self::parse_request(RequestKind::Rrq, &buf[2..]),
			consts::OPCODE_WRQ => Self::parse_request(RequestKind::Wrq, &buf[2..]),
			consts::OPCODE_DATA => Self::parse_data(&buf[2..]),
			consts::OPCODE_ACK => Self::parse_ack(&buf[2..]),
			consts::OPCODE_ERROR => Self::parse_error(&buf[2..]),
			consts::OPCODE_OACK => Ok(Self::OAck { options: OptionSet::parse(&buf[2..])? }),
			_ => Err(PacketError::InvalidOpcode),
		}
	}

	fn parse_request(kind: RequestKind, body: &[u8]) -> Result<Self, PacketError> {
		let (filename, rest) = take_cstr(body)?;
		let (mode_str, rest) = take_cstr(rest)?;
		let mode = Mode::try_from(mode_str).ok_or(PacketError::UnknownTxMode)?;
		let options = OptionSet::parse(rest)?;

		let filename = filename.to_string();
		Ok(match kind {
			RequestKind::Rrq => Self::Rrq { filename, mode, options },
			RequestKind::Wrq => Self::Wrq { filename, mode, options },
		})
	}

	fn parse_data(body: &[u8]) -> Result<Self, PacketError> {
		if body.len() < 2 {
			return Err(PacketError::UnexpectedEof);
		}
		if body.len() - 2 > consts::BLOCK_SIZE {
			return Err(PacketError::MalformedPacket);
		}
		Ok(Self::Data {
			block: u16::from_be_bytes([ body[0], body[1] ]),
			data: body[2..].to_vec(),
		})
	}

	fn parse_ack(body: &[u8]) -> Result<Self, PacketError> {
		match body.len() {
			0 | 1 => Err(PacketError::UnexpectedEof),
			2 => Ok(Self::Ack { block: u16::from_be_bytes([ body[0], body[1] ]) }),
			_ => Err(PacketError::MalformedPacket),
		}
	}

	fn parse_error(body: &[u8]) -> Result<Self, PacketError> {
		if body.len() < 2 {
			return Err(PacketError::UnexpectedEof);
		}
		let code = ErrorCode::from(u16::from_be_bytes([ body[0], body[1] ]));
		let msg = &body[2..];
		let nul = msg.iter().position(|b| *b == 0)
			.ok_or(PacketError::NotNullTerminated)?;

		Ok(Self::Error {
			code,
			message: String::from_utf8_lossy(&msg[..nul]).into_owned(),
		})
	}

	// ########################################################################
	// ###### SERIALIZATION ###################################################
	// ########################################################################

	pub fn serialize(&self) -> Vec<u8> {
		let mut out: Vec<u8> = Vec::with_capacity(self.wire_len());
		match self {
			Self::Rrq { filename, mode, options } =>
				write_request(&mut out, consts::OPCODE_RRQ, filename, *mode, options),
			Self::Wrq { filename, mode, options } =>
				write_request(&mut out, consts::OPCODE_WRQ, filename, *mode, options),
			Self::Data { block, data } => {
				out.extend_from_slice(&consts::OPCODE_DATA.to_be_bytes());
				out.extend_from_slice(&block.to_be_bytes());
				out.extend_from_slice(data);
			},
			Self::Ack { block } => {
				out.extend_from_slice(&consts::OPCODE_ACK.to_be_bytes());
				out.extend_from_slice(&block.to_be_bytes());
			},
			Self::Error { code, message } => {
				out.extend_from_slice(&consts::OPCODE_ERROR.to_be_bytes());
				out.extend_from_slice(&(*code as u16).to_be_bytes());
				out.extend_from_slice(message.as_bytes());
				out.push(0);
			},
			Self::OAck { options } => {
				out.extend_from_slice(&consts::OPCODE_OACK.to_be_bytes());
				options.write_to(&mut out);
			},
		}
		out
	}

	pub fn wire_len(&self) -> usize {
		2 + match self {
			Self::Rrq { filename, mode, options } |
			Self::Wrq { filename, mode, options } =>
				filename.len() + 1 + mode.as_str().len() + 1 + options.wire_len(),
			Self::Data { data, .. } => 2 + data.len(),
			Self::Ack { .. } => 2,
			Self::Error { message, .. } => 2 + message.len() + 1,
			Self::OAck { options } => options.wire_len(),
		}
	}
}

impl Display for Packet {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Rrq { filename, mode, .. } => write!(f, "RRQ file '{}' mode {}", filename, mode),
			Self::Wrq { filename, mode, .. } => write!(f, "WRQ file '{}' mode {}", filename, mode),
			Self::Data { block, data } => write!(f, "DATA block {} ({} bytes)", block, data.len()),
			Self::Ack { block } => write!(f, "ACK block {}", block),
			Self::Error { code, message } => write!(f, "ERROR code {} '{}'", code, message),
			Self::OAck { options } => write!(f, "OACK ({} options)", options.len()),
		}
	}
}

fn write_request(out: &mut Vec<u8>, opcode: u16, filename: &str, mode: Mode, options: &OptionSet) {
	out.extend_from_slice(&opcode.to_be_bytes());
	out.extend_from_slice(filename.as_bytes());
	out.push(0);
	out.extend_from_slice(mode.as_str().as_bytes());
	out.push(0);
	options.write_to(out);
}

// ############################################################################
// ############################################################################

#[cfg(test)]
mod tests {
	use super::*;
	use rand::{Rng, SeedableRng};

	fn roundtrip(pkt: Packet) {
		let bytes = pkt.serialize();
		assert_eq!(bytes.len(), pkt.wire_len());
		assert_eq!(Packet::parse(&bytes).unwrap(), pkt);
	}

	#[test]
	fn roundtrip_requests() {
		let mut options = OptionSet::new();
		options.insert("tsize", "0");
		options.insert("timeout", "4");

		roundtrip(Packet::Rrq {
			filename: "boot/pxe.cfg".to_string(),
			mode: Mode::Octet,
			options,
		});
		roundtrip(Packet::Wrq {
			filename: "upload.bin".to_string(),
			mode: Mode::NetAscii,
			options: OptionSet::new(),
		});
	}

	#[test]
	fn roundtrip_data_ack_error_oack() {
		roundtrip(Packet::Data { block: 7, data: vec![0xAB; 512] });
		roundtrip(Packet::Data { block: 0xFFFF, data: Vec::new() });
		roundtrip(Packet::Ack { block: 0 });
		roundtrip(Packet::Error { code: ErrorCode::FileNotFound, message: "no such file".to_string() });

		let mut options = OptionSet::new();
		options.insert("tsize", "1048576");
		roundtrip(Packet::OAck { options });
	}

	#[test]
	fn data_and_ack_wire_layout() {
		let bytes = Packet::Data { block: 258, data: vec![b'h', b'i'] }.serialize();
		assert_eq!(bytes, [ 0, 3, 1, 2, b'h', b'i' ]);

		let bytes = Packet::Ack { block: 1 }.serialize();
		assert_eq!(bytes, [ 0, 4, 0, 1 ]);
	}

	#[test]
	fn parse_rejects_short_buffers() {
		assert_eq!(Packet::parse(&[]), Err(PacketError::UnexpectedEof));
		assert_eq!(Packet::parse(&[ 0 ]), Err(PacketError::UnexpectedEof));
		assert_eq!(Packet::parse(&[ 0, 3, 0 ]), Err(PacketError::UnexpectedEof));
		assert_eq!(Packet::parse(&[ 0, 5, 0 ]), Err(PacketError::UnexpectedEof));
	}

	#[test]
	fn parse_rejects_bad_opcodes() {
		assert_eq!(Packet::parse(&[ 0, 0, 0, 0 ]), Err(PacketError::InvalidOpcode));
		assert_eq!(Packet::parse(&[ 0, 7, 0, 0 ]), Err(PacketError::InvalidOpcode));
		assert_eq!(Packet::parse(&[ 0xFF, 0xFF, 0, 0 ]), Err(PacketError::InvalidOpcode));
	}

	#[test]
	fn ack_length_must_be_exact() {
		assert_eq!(Packet::parse(&[ 0, 4, 0, 1, 0 ]), Err(PacketError::MalformedPacket));
	}

	#[test]
	fn data_payload_is_capped_at_block_size() {
		let mut buf = vec![ 0, 3, 0, 1 ];
		buf.extend_from_slice(&[ 0u8; 513 ]);
		assert_eq!(Packet::parse(&buf), Err(PacketError::MalformedPacket));
	}

	#[test]
	fn empty_data_marks_end_of_transfer() {
		let pkt = Packet::parse(&[ 0, 3, 0, 9 ]).unwrap();
		assert_eq!(pkt, Packet::Data { block: 9, data: Vec::new() });
	}

	#[test]
	fn error_requires_terminator_and_tolerates_unknown_codes() {
		assert_eq!(Packet::parse(b"\x00\x05\x00\x01oops"), Err(PacketError::NotNullTerminated));

		let pkt = Packet::parse(b"\x00\x05\x00\x63whatever\x00").unwrap();
		assert_eq!(pkt, Packet::Error { code: ErrorCode::NotDefined, message: "whatever".to_string() });
	}

	#[test]
	fn error_description_is_decoded_lossily() {
		let pkt = Packet::parse(b"\x00\x05\x00\x02bad\xFFbyte\x00").unwrap();
		let Packet::Error { code, message } = pkt else { panic!() };
		assert_eq!(code, ErrorCode::AccessViolation);
		assert_eq!(message, "bad\u{FFFD}byte");
	}

	#[test]
	fn request_mode_is_case_insensitive() {
		let pkt = Packet::parse(b"\x00\x01file\x00OcTeT\x00").unwrap();
		assert_eq!(pkt, Packet::Rrq {
			filename: "file".to_string(),
			mode: Mode::Octet,
			options: OptionSet::new(),
		});

		assert_eq!(Packet::parse(b"\x00\x01file\x00carrier-pigeon\x00"), Err(PacketError::UnknownTxMode));
	}

	#[test]
	fn request_requires_both_terminators() {
		assert_eq!(Packet::parse(b"\x00\x02file"), Err(PacketError::NotNullTerminated));
		assert_eq!(Packet::parse(b"\x00\x02file\x00octet"), Err(PacketError::NotNullTerminated));
	}

	#[test]
	fn request_filename_rejects_invalid_utf8() {
		assert_eq!(Packet::parse(b"\x00\x01fi\xFFle\x00octet\x00"), Err(PacketError::InvalidCharacters));
	}

	/* Random buffers must parse cleanly or fail cleanly. A successful parse
	 * must survive a serialize/re-parse cycle with identical meaning (byte
	 * identity is not guaranteed: option keys normalize to lowercase and
	 * trailing ERROR bytes after the terminator are dropped). */
	#[test]
	fn fuzz_parse_never_panics() {
		let mut rng = rand::rngs::StdRng::seed_from_u64(0x1350);

		for _ in 0..10_000 {
			let len = rng.gen_range(0..=520);
			let mut buf = vec![ 0u8; len ];
			rng.fill(&mut buf[..]);
			/* bias half the inputs towards valid opcodes so the variant
			 * parsers actually get exercised */
			if len >= 2 && rng.gen_bool(0.5) {
				buf[0] = 0;
				buf[1] = rng.gen_range(1..=6);
			}

			if let Ok(pkt) = Packet::parse(&buf) {
				let reparsed = Packet::parse(&pkt.serialize()).unwrap();
				assert_eq!(reparsed, pkt);
			}
		}
	}
}
