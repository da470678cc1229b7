use std::fmt::Display;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub mod consts {
	pub const TFTP_LISTEN_PORT: u16 = 69;
	pub const SIM_LISTEN_PORT: u16 = 23;

	pub const BLOCK_SIZE: usize = 512;
	pub const MAX_PACKET_SIZE: usize = 516;

	/* The interop timeouts: how long to wait for the first packet of a
	 * transfer, how long before a DATA/ACK is retransmitted, and how many
	 * retransmissions are attempted before the transfer is abandoned. */
	pub const PACKET_LOST_TIMEOUT_MS: u64 = 3000;
	pub const DATA_RESEND_TIMEOUT_MS: u64 = 3500;
	pub const MAX_RETRANSMITS: u8 = 5;

	pub const OPT_TIMEOUT_IDENT: &str = "timeout";
	pub const OPT_TRANSFERSIZE_IDENT: &str = "tsize";

	pub const OPCODE_RRQ: u16 = 1;
	pub const OPCODE_WRQ: u16 = 2;
	pub const OPCODE_DATA: u16 = 3;
	pub const OPCODE_ACK: u16 = 4;
	pub const OPCODE_ERROR: u16 = 5;
	pub const OPCODE_OACK: u16 = 6;
}

pub mod error;
pub mod options;
pub mod packet;
pub mod transfer;

use error::RecvError;
use packet::Packet;

// ############################################################################
// ############################################################################
// ############################################################################

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
	Rrq,
	Wrq,
}
impl Display for RequestKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", match self {
			Self::Rrq => "RRQ",
			Self::Wrq => "WRQ",
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
	NotDefined = 0,
	FileNotFound = 1,
	AccessViolation = 2,
	StorageError = 3,
	IllegalOperation = 4,
	UnknownTid = 5,
	FileExists = 6,
	NoSuchUser = 7,
	InvalidOption = 8,
}
impl Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", *self as u16)
	}
}
impl From<u16> for ErrorCode {
	/* Codes outside the defined range collapse to NotDefined instead of
	 * failing the parse; peers disagree about vendor extensions often
	 * enough that a readable ERROR beats a MalformedPacket. */
	fn from(value: u16) -> Self {
		match value {
			0 => Self::NotDefined,
			1 => Self::FileNotFound,
			2 => Self::AccessViolation,
			3 => Self::StorageError,
			4 => Self::IllegalOperation,
			5 => Self::UnknownTid,
			6 => Self::FileExists,
			7 => Self::NoSuchUser,
			8 => Self::InvalidOption,
			_ => Self::NotDefined,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	NetAscii,
	Octet,
	Mail,
}
impl Mode {
	pub fn try_from(input: &str) -> Option<Self> {
		match &(input.to_ascii_lowercase())[..] {
			"netascii" => Some(Self::NetAscii),
			"octet" => Some(Self::Octet),
			"mail" => Some(Self::Mail),
			_ => None,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::NetAscii => "netascii",
			Self::Octet => "octet",
			Self::Mail => "mail",
		}
	}
}
impl Display for Mode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// Lifecycle of one transfer. `Initialized` and `InProgress` may transition
/// further; every other state is terminal and implies that no more packets
/// leave this transfer's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
	Initialized,
	InProgress,
	BlockZeroTimeout,
	Timeout,
	LastBlockAckTimeout,
	FileTooLarge,
	FileIoError,
	SocketIoError,
	ReceivedBadPacket,
	Complete,
}
impl TransferState {
	pub fn is_terminal(&self) -> bool {
		!matches!(self, Self::Initialized | Self::InProgress)
	}
}
impl Display for TransferState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:?}", self)
	}
}

/// Retransmission parameters. The defaults are the interop set; tests shrink
/// them, and a negotiated `timeout` option overrides the resend interval.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
	pub packet_lost: Duration,
	pub resend: Duration,
	pub max_retransmits: u8,
}
impl Default for Timings {
	fn default() -> Self {
		Self {
			packet_lost: Duration::from_millis(consts::PACKET_LOST_TIMEOUT_MS),
			resend: Duration::from_millis(consts::DATA_RESEND_TIMEOUT_MS),
			max_retransmits: consts::MAX_RETRANSMITS,
		}
	}
}

// ############################################################################
// #### TRANSPORT ENDPOINT ####################################################
// ############################################################################

struct Peer {
	ip: IpAddr,
	tid: Option<u16>,
}

/// One side of one transfer: a socket plus the peer it is bound to. The peer
/// TID is either fixed at construction or learned from the first packet a
/// `recv(.., true)` sees; once learned it never changes for this connection.
pub struct TftpConnection {
	socket: UdpSocket,
	peer: Mutex<Peer>,
	/* held across set-timeout + receive so concurrent users cannot corrupt
	 * each other's deadline */
	io_lock: Mutex<()>,
}

impl TftpConnection {
	pub fn new(local_ip: IpAddr, peer_ip: IpAddr, peer_tid: Option<u16>) -> io::Result<Self> {
		let socket = UdpSocket::bind((local_ip, 0))?;
		Ok(Self::from_socket(socket, peer_ip, peer_tid))
	}

	pub fn from_socket(socket: UdpSocket, peer_ip: IpAddr, peer_tid: Option<u16>) -> Self {
		Self {
			socket,
			peer: Mutex::new(Peer { ip: peer_ip, tid: peer_tid }),
			io_lock: Mutex::new(()),
		}
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.socket.local_addr()
	}

	/// The peer address, once the TID is known.
	pub fn peer_addr(&self) -> Option<SocketAddr> {
		let peer = self.peer.lock().unwrap();
		peer.tid.map(|tid| SocketAddr::new(peer.ip, tid))
	}

	/// Serializes and transmits one packet to the bound peer. The peer TID
	/// must be known by now.
	pub fn send(&self, pkt: &Packet) -> io::Result<()> {
		let dst = self.peer_addr()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "peer TID not yet known"))?;
		self.socket.send_to(&pkt.serialize(), dst)?;
		Ok(())
	}

	/// Transmits one packet to an explicit destination, bypassing the bound
	/// peer. Used for the initial request and for ERROR replies to strangers.
	pub fn send_to(&self, pkt: &Packet, dst: SocketAddr) -> io::Result<()> {
		self.socket.send_to(&pkt.serialize(), dst)?;
		Ok(())
	}

	/// Blocks until a datagram from the bound peer arrives or `timeout`
	/// expires. With `update_tid` the sender's port is adopted as the peer
	/// TID; without it a datagram from any other port is answered with
	/// ERROR 5 and the wait continues on the remaining time.
	pub fn recv(&self, timeout: Duration, update_tid: bool) -> Result<(Packet, SocketAddr), RecvError> {
		let _io = self.io_lock.lock().unwrap();
		let deadline = Instant::now() + timeout;
		let mut buf = [ 0u8; consts::MAX_PACKET_SIZE ];

		loop {
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				return Err(RecvError::Timeout);
			}
			self.socket.set_read_timeout(Some(remaining)).map_err(RecvError::Io)?;

			let (len, from) = match self.socket.recv_from(&mut buf) {
				Ok(recv) => recv,
				Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
					return Err(RecvError::Timeout),
				Err(e) => return Err(RecvError::Io(e)),
			};

			if !self.accept_sender(from, update_tid) {
				/* wrong TID: tell the stranger, keep waiting for the peer */
				log::warn!("packet from unexpected source {}, sent ERROR 5", from);
				let rejection = Packet::error(ErrorCode::UnknownTid, "unknown transfer id");
				let _ = self.socket.send_to(&rejection.serialize(), from);
				continue;
			}

			let pkt = Packet::parse(&buf[..len])?;
			return Ok((pkt, from));
		}
	}

	fn accept_sender(&self, from: SocketAddr, update_tid: bool) -> bool {
		let mut peer = self.peer.lock().unwrap();
		if from.ip() != peer.ip {
			return false;
		}
		if update_tid || peer.tid.is_none() {
			peer.tid = Some(from.port());
			return true;
		}
		peer.tid == Some(from.port())
	}
}

// ############################################################################
// ############################################################################
