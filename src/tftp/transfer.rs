use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

#[allow(unused)]
use log::{info, warn, error, debug, trace};

use crate::tftp::consts;
use crate::tftp::error::RecvError;
use crate::tftp::packet::Packet;
use crate::tftp::{TftpConnection, Timings, TransferState};

// ############################################################################
// #### FILE AND OBSERVER CONTRACTS ###########################################
// ############################################################################

/// Feeds a transfer block by block. `read_block` fills the buffer completely
/// unless the underlying stream hits EOF, so only the final block of a
/// transfer comes back short.
pub trait BlockSource {
	fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}
impl<R: Read> BlockSource for R {
	fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		let mut filled = 0;
		while filled < buf.len() {
			match self.read(&mut buf[filled..]) {
				Ok(0) => break,
				Ok(n) => filled += n,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(e),
			}
		}
		Ok(filled)
	}
}

/// Stores received blocks. A block must be durable before the transfer
/// acknowledges it, hence the flush on every write.
pub trait BlockSink {
	fn write_block(&mut self, data: &[u8]) -> io::Result<()>;
}
impl<W: Write> BlockSink for W {
	fn write_block(&mut self, data: &[u8]) -> io::Result<()> {
		self.write_all(data)?;
		self.flush()
	}
}

/// Observer for a transfer's packet traffic and state transitions.
pub trait PacketSink {
	fn sent(&mut self, _pkt: &Packet, _to: SocketAddr) {}
	fn received(&mut self, _pkt: &Packet, _from: SocketAddr) {}
	fn state_changed(&mut self, _state: TransferState) {}
}

/// Default observer: forwards everything to the logging facade.
pub struct LogSink;
impl PacketSink for LogSink {
	fn sent(&mut self, pkt: &Packet, to: SocketAddr) {
		debug!("sent {} to {}", pkt, to);
	}
	fn received(&mut self, pkt: &Packet, from: SocketAddr) {
		debug!("received {} from {}", pkt, from);
	}
	fn state_changed(&mut self, state: TransferState) {
		if state.is_terminal() && state != TransferState::Complete {
			warn!("transfer failed: {}", state);
		} else {
			debug!("transfer state: {}", state);
		}
	}
}

// ############################################################################
// #### SEND TRANSACTION ######################################################
// ############################################################################

/// Drives a file to the peer as numbered DATA blocks, lock-step with the
/// peer's ACKs. Owns its socket for the whole transfer.
pub struct SendTransaction<'a, S: BlockSource> {
	conn: &'a TftpConnection,
	source: &'a mut S,
	size: u64,
	wait_ack_zero: bool,
	timings: Timings,
	state: TransferState,
	sink: &'a mut dyn PacketSink,
}

impl<'a, S: BlockSource> SendTransaction<'a, S> {
	pub fn new(
		conn: &'a TftpConnection,
		source: &'a mut S,
		size: u64,
		wait_ack_zero: bool,
		timings: Timings,
		sink: &'a mut dyn PacketSink,
	) -> Self {
		Self {
			conn,
			source,
			size,
			wait_ack_zero,
			timings,
			state: TransferState::Initialized,
			sink,
		}
	}

	pub fn state(&self) -> TransferState { self.state }

	fn finish(&mut self, state: TransferState) -> TransferState {
		self.state = state;
		self.sink.state_changed(state);
		state
	}

	pub fn run(mut self) -> TransferState {
		self.state = TransferState::InProgress;
		self.sink.state_changed(TransferState::InProgress);

		if self.wait_ack_zero {
			match self.conn.recv(self.timings.packet_lost, true) {
				Ok((pkt @ Packet::Ack { block: 0 }, from)) => self.sink.received(&pkt, from),
				Ok((pkt, from)) => {
					self.sink.received(&pkt, from);
					return self.finish(TransferState::ReceivedBadPacket);
				},
				Err(RecvError::Timeout) => return self.finish(TransferState::BlockZeroTimeout),
				Err(RecvError::BadPacket(_)) => return self.finish(TransferState::ReceivedBadPacket),
				Err(RecvError::Io(_)) => return self.finish(TransferState::SocketIoError),
			}
		}

		let total_blocks = self.size / consts::BLOCK_SIZE as u64 + 1;
		if total_blocks > 0xFFFF {
			return self.finish(TransferState::FileTooLarge);
		}
		let total_blocks = total_blocks as u16;

		let Some(peer) = self.conn.peer_addr() else {
			return self.finish(TransferState::SocketIoError);
		};

		let mut buf = [ 0u8; consts::BLOCK_SIZE ];
		for block in 1..=total_blocks {
			let n = match self.source.read_block(&mut buf) {
				Ok(n) => n,
				Err(e) => {
					error!("read failed at block {}: {}", block, e);
					return self.finish(TransferState::FileIoError);
				},
			};

			let pkt = Packet::Data { block, data: buf[..n].to_vec() };
			if self.conn.send(&pkt).is_err() {
				return self.finish(TransferState::SocketIoError);
			}
			self.sink.sent(&pkt, peer);

			let mut deadline = Instant::now() + self.timings.resend;
			let mut retries: u8 = 0;
			loop {
				let remaining = deadline.saturating_duration_since(Instant::now());
				match self.conn.recv(remaining, false) {
					Ok((ack @ Packet::Ack { block: acked }, from)) if acked == block => {
						self.sink.received(&ack, from);
						break;
					},
					Ok((stale @ Packet::Ack { block: acked }, from)) if acked < block => {
						/* duplicate or delayed ACK for an older block */
						self.sink.received(&stale, from);
					},
					Ok((other, from)) => {
						/* an ACK from the future or a non-ACK packet */
						self.sink.received(&other, from);
						return self.finish(TransferState::ReceivedBadPacket);
					},
					Err(RecvError::Timeout) => {
						if retries == self.timings.max_retransmits {
							return self.finish(match block == total_blocks {
								true => TransferState::LastBlockAckTimeout,
								false => TransferState::Timeout,
							});
						}
						retries += 1;

						/* retransmit the identical DATA, never a re-read */
						if self.conn.send(&pkt).is_err() {
							return self.finish(TransferState::SocketIoError);
						}
						self.sink.sent(&pkt, peer);
						deadline = Instant::now() + self.timings.resend;
					},
					Err(RecvError::BadPacket(_)) => return self.finish(TransferState::ReceivedBadPacket),
					Err(RecvError::Io(_)) => return self.finish(TransferState::SocketIoError),
				}
			}
		}

		self.finish(TransferState::Complete)
	}
}

// ############################################################################
// #### RECEIVE TRANSACTION ###################################################
// ############################################################################

/// Consumes numbered DATA blocks from the peer, writes each one durably and
/// acknowledges it. A short block completes the transfer.
pub struct ReceiveTransaction<'a, D: BlockSink> {
	conn: &'a TftpConnection,
	dest: &'a mut D,
	send_ack_zero: bool,
	update_tid: bool,
	pending: Option<Packet>,
	timings: Timings,
	state: TransferState,
	sink: &'a mut dyn PacketSink,
}

impl<'a, D: BlockSink> ReceiveTransaction<'a, D> {
	pub fn new(
		conn: &'a TftpConnection,
		dest: &'a mut D,
		send_ack_zero: bool,
		update_tid: bool,
		timings: Timings,
		sink: &'a mut dyn PacketSink,
	) -> Self {
		Self {
			conn,
			dest,
			send_ack_zero,
			update_tid,
			pending: None,
			timings,
			state: TransferState::Initialized,
			sink,
		}
	}

	/// Seeds the transfer with a packet the caller already pulled off the
	/// socket (the first server reply, received while learning the TID).
	pub fn with_pending(mut self, pkt: Packet) -> Self {
		self.pending = Some(pkt);
		self
	}

	pub fn state(&self) -> TransferState { self.state }

	fn finish(&mut self, state: TransferState) -> TransferState {
		self.state = state;
		self.sink.state_changed(state);
		state
	}

	fn ack(&mut self, block: u16) -> Result<(), TransferState> {
		let pkt = Packet::Ack { block };
		match self.conn.send(&pkt) {
			Ok(()) => {
				if let Some(peer) = self.conn.peer_addr() {
					self.sink.sent(&pkt, peer);
				}
				Ok(())
			},
			Err(_) => Err(TransferState::SocketIoError),
		}
	}

	pub fn run(mut self) -> TransferState {
		self.state = TransferState::InProgress;
		self.sink.state_changed(TransferState::InProgress);

		if self.send_ack_zero {
			if let Err(state) = self.ack(0) {
				return self.finish(state);
			}
		}

		let mut expected: u16 = 1;
		let mut retries: u8 = 0;
		let mut deadline = Instant::now() + self.timings.resend;

		loop {
			let received = match self.pending.take() {
				Some(pkt) => {
					let from = self.conn.peer_addr()
						.unwrap_or_else(|| SocketAddr::from(([ 0, 0, 0, 0 ], 0)));
					Ok((pkt, from))
				},
				None => {
					let remaining = deadline.saturating_duration_since(Instant::now());
					self.conn.recv(remaining, expected == 1 && self.update_tid)
				},
			};

			match received {
				Ok((pkt @ Packet::Data { .. }, from)) => {
					let Packet::Data { block, ref data } = pkt else { unreachable!() };
					if block == expected {
						if self.dest.write_block(data).is_err() {
							return self.finish(TransferState::FileIoError);
						}
						self.sink.received(&pkt, from);
						if let Err(state) = self.ack(block) {
							return self.finish(state);
						}
						if data.len() < consts::BLOCK_SIZE {
							return self.finish(TransferState::Complete);
						}
						if expected == 0xFFFF {
							/* the next block number would wrap to zero */
							return self.finish(TransferState::FileTooLarge);
						}
						expected += 1;
						retries = 0;
						deadline = Instant::now() + self.timings.resend;
					} else if block < expected {
						/* duplicate of an already-written block: re-acknowledge
						 * it without touching the file or the cursor */
						self.sink.received(&pkt, from);
						if let Err(state) = self.ack(block) {
							return self.finish(state);
						}
					} else {
						self.sink.received(&pkt, from);
						return self.finish(TransferState::ReceivedBadPacket);
					}
				},
				Ok((other, from)) => {
					self.sink.received(&other, from);
					return self.finish(TransferState::ReceivedBadPacket);
				},
				Err(RecvError::Timeout) => {
					if expected == 1 {
						/* nothing was ever acknowledged, so there is nothing
						 * to re-send that could provoke the peer */
						return self.finish(TransferState::BlockZeroTimeout);
					}
					if retries == self.timings.max_retransmits {
						return self.finish(TransferState::Timeout);
					}
					retries += 1;
					if let Err(state) = self.ack(expected - 1) {
						return self.finish(state);
					}
					deadline = Instant::now() + self.timings.resend;
				},
				Err(RecvError::BadPacket(_)) => return self.finish(TransferState::ReceivedBadPacket),
				Err(RecvError::Io(_)) => return self.finish(TransferState::SocketIoError),
			}
		}
	}
}

// ############################################################################
// ############################################################################
