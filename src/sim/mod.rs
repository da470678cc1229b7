use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[allow(unused)]
use log::{info, warn, error, debug, trace};

use crate::tftp::consts;
use crate::tftp::packet::Packet;

pub mod console;
pub mod rules;

use rules::{ErrorAction, ErrorInstruction, RuleSet};

// ############################################################################
// ############################################################################
// ############################################################################

#[derive(Debug, Clone, Copy)]
pub struct SimSettings {
	pub bind_ip: IpAddr,
	pub client_port: u16,
	pub server_ip: IpAddr,
	pub server_port: u16,
}
impl Default for SimSettings {
	fn default() -> Self {
		Self {
			bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			client_port: consts::SIM_LISTEN_PORT,
			server_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
			server_port: consts::TFTP_LISTEN_PORT,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
	ToServer,
	ToClient,
}

struct ClientSide {
	/* learned from every packet the client sends */
	addr: Option<SocketAddr>,
	/* during a transfer the client is served from the per-transfer socket
	 * so its packets land there instead of on the known port */
	use_tid_socket: bool,
	/* a short DATA went through; the next relayed ACK ends the transfer */
	awaiting_final_ack: bool,
}

struct ServerSide {
	ip: IpAddr,
	port: u16,
	/* learned from the server's first reply of a transfer */
	tid: Option<u16>,
}

/// The on-path proxy. Two relay loops (client-facing and server-facing)
/// share the learned addresses and the perturbation rules; every relayed
/// datagram runs through the ruleset first. Sends towards either peer are
/// serialized by that peer's state mutex.
pub struct SimEngine {
	known_socket: Mutex<UdpSocket>,
	tid_socket: UdpSocket,
	server_socket: UdpSocket,
	bind_ip: IpAddr,
	client_side: Mutex<ClientSide>,
	server_side: Mutex<ServerSide>,
	rules: Mutex<RuleSet>,
	verbose: AtomicBool,
	cancel: CancellationToken,
}

impl SimEngine {
	pub fn new(settings: SimSettings, cancel: CancellationToken) -> io::Result<Arc<Self>> {
		let known_socket = bind_relay_socket(settings.bind_ip, settings.client_port)?;
		let tid_socket = bind_relay_socket(settings.bind_ip, 0)?;
		let server_socket = bind_relay_socket(settings.bind_ip, 0)?;

		Ok(Arc::new(Self {
			known_socket: Mutex::new(known_socket),
			tid_socket,
			server_socket,
			bind_ip: settings.bind_ip,
			client_side: Mutex::new(ClientSide {
				addr: None,
				use_tid_socket: false,
				awaiting_final_ack: false,
			}),
			server_side: Mutex::new(ServerSide {
				ip: settings.server_ip,
				port: settings.server_port,
				tid: None,
			}),
			rules: Mutex::new(RuleSet::default()),
			verbose: AtomicBool::new(false),
			cancel,
		}))
	}

	// ########################################################################
	// ###### RELAY LOOPS #####################################################
	// ########################################################################

	/// Receives from the client on whichever client-facing socket is active
	/// and pushes everything towards the server.
	pub fn client_relay(self: &Arc<Self>) {
		let mut buf = [ 0u8; consts::MAX_PACKET_SIZE ];

		loop {
			if self.cancel.is_cancelled() {
				break;
			}

			let received = if self.client_side.lock().unwrap().use_tid_socket {
				self.tid_socket.recv_from(&mut buf)
			} else {
				/* cloned so the lock is not held across the blocking receive;
				 * a clientport change simply takes effect next iteration */
				match self.known_socket.lock().unwrap().try_clone() {
					Ok(socket) => socket.recv_from(&mut buf),
					Err(e) => Err(e),
				}
			};

			match received {
				Ok((len, from)) => self.handle_client_packet(&buf[..len], from),
				Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {},
				Err(e) => error!("client relay receive failed: {}", e),
			}
		}
	}

	/// Receives the server's replies and pushes them towards the client.
	pub fn server_relay(self: &Arc<Self>) {
		let mut buf = [ 0u8; consts::MAX_PACKET_SIZE ];

		loop {
			if self.cancel.is_cancelled() {
				break;
			}

			match self.server_socket.recv_from(&mut buf) {
				Ok((len, from)) => self.handle_server_packet(&buf[..len], from),
				Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {},
				Err(e) => error!("server relay receive failed: {}", e),
			}
		}
	}

	fn handle_client_packet(self: &Arc<Self>, bytes: &[u8], from: SocketAddr) {
		let pkt = Packet::parse(bytes).ok();
		self.log_relay("client", from, &pkt, bytes.len());

		{
			let mut cs = self.client_side.lock().unwrap();
			cs.addr = Some(from);
			if pkt.as_ref().is_some_and(|p| p.is_request()) {
				/* new transfer: serve the client from the per-transfer
				 * socket so the reply path gets its own TID */
				cs.use_tid_socket = true;
				cs.awaiting_final_ack = false;
				drop(cs);
				self.server_side.lock().unwrap().tid = None;
			}
		}

		self.perturb_and_forward(bytes, pkt, Direction::ToServer);
	}

	fn handle_server_packet(self: &Arc<Self>, bytes: &[u8], from: SocketAddr) {
		let pkt = Packet::parse(bytes).ok();
		self.log_relay("server", from, &pkt, bytes.len());

		{
			let mut ss = self.server_side.lock().unwrap();
			if from.ip() != ss.ip {
				warn!("dropping packet from unexpected host {}", from);
				return;
			}
			if ss.tid.is_none() {
				debug!("learned server TID {}", from.port());
				ss.tid = Some(from.port());
			}
		}

		self.perturb_and_forward(bytes, pkt, Direction::ToClient);
	}

	// ########################################################################
	// ###### FORWARDING ######################################################
	// ########################################################################

	fn perturb_and_forward(self: &Arc<Self>, bytes: &[u8], pkt: Option<Packet>, dir: Direction) {
		/* unparseable datagrams bypass the ruleset and relay untouched */
		let action = match &pkt {
			Some(pkt) => self.rules.lock().unwrap().apply(pkt),
			None => None,
		};

		match action {
			None => self.forward(bytes, dir),
			Some((ErrorAction::Drop, _)) => {
				info!("dropping {}", describe(&pkt));
			},
			Some((ErrorAction::Duplicate, delay)) => {
				info!("duplicating {} with {}ms between copies", describe(&pkt), delay.as_millis());
				self.forward(bytes, dir);
				self.schedule(bytes.to_vec(), dir, delay);
			},
			Some((ErrorAction::Delay, delay)) => {
				info!("delaying {} by {}ms", describe(&pkt), delay.as_millis());
				self.schedule(bytes.to_vec(), dir, delay);
			},
		}
	}

	/// Hands an owned copy of the datagram to a timer thread; the relay loop
	/// itself never sleeps.
	fn schedule(self: &Arc<Self>, bytes: Vec<u8>, dir: Direction, delay: Duration) {
		let engine = Arc::clone(self);
		std::thread::spawn(move || {
			std::thread::sleep(delay);
			engine.forward(&bytes, dir);
		});
	}

	fn forward(&self, bytes: &[u8], dir: Direction) {
		match dir {
			Direction::ToServer => self.send_to_server(bytes),
			Direction::ToClient => self.send_to_client(bytes),
		}
		self.note_forwarded(bytes);
	}

	fn send_to_server(&self, bytes: &[u8]) {
		/* the lock both serializes sends and pins the learned TID */
		let ss = self.server_side.lock().unwrap();
		let dst = SocketAddr::new(ss.ip, ss.tid.unwrap_or(ss.port));
		if let Err(e) = self.server_socket.send_to(bytes, dst) {
			error!("forward to server {} failed: {}", dst, e);
		}
	}

	fn send_to_client(&self, bytes: &[u8]) {
		let cs = self.client_side.lock().unwrap();
		let Some(dst) = cs.addr else {
			warn!("no client seen yet, dropping {} bytes", bytes.len());
			return;
		};
		let sent = if cs.use_tid_socket {
			self.tid_socket.send_to(bytes, dst)
		} else {
			self.known_socket.lock().unwrap().send_to(bytes, dst)
		};
		if let Err(e) = sent {
			error!("forward to client {} failed: {}", dst, e);
		}
	}

	/// Transfer-end bookkeeping: a short DATA announces the last block, and
	/// once the ACK answering it has been relayed the client side falls back
	/// to the known port for the next request.
	fn note_forwarded(&self, bytes: &[u8]) {
		if bytes.len() < 2 {
			return;
		}
		let opcode = u16::from_be_bytes([ bytes[0], bytes[1] ]);
		let short_data = opcode == consts::OPCODE_DATA && bytes.len() < consts::MAX_PACKET_SIZE;
		let is_ack = opcode == consts::OPCODE_ACK;

		let mut cs = self.client_side.lock().unwrap();
		if short_data {
			cs.awaiting_final_ack = true;
		} else if cs.awaiting_final_ack && is_ack {
			cs.use_tid_socket = false;
			cs.awaiting_final_ack = false;
			drop(cs);
			self.server_side.lock().unwrap().tid = None;
			debug!("transfer finished, client side back on the known port");
		}
	}

	fn log_relay(&self, origin: &str, from: SocketAddr, pkt: &Option<Packet>, len: usize) {
		if self.verbose.load(Ordering::Relaxed) {
			info!("{} {} -> {} ({} bytes)", origin, from, describe(pkt), len);
		} else {
			debug!("{} {} -> {} ({} bytes)", origin, from, describe(pkt), len);
		}
	}

	// ########################################################################
	// ###### CONSOLE SURFACE #################################################
	// ########################################################################

	pub fn shutdown(&self) {
		self.cancel.cancel();
	}

	pub fn set_verbose(&self, verbose: bool) {
		self.verbose.store(verbose, Ordering::Relaxed);
	}

	pub fn add_rule(&self, rule: ErrorInstruction) {
		self.rules.lock().unwrap().add(rule);
	}

	pub fn rules_snapshot(&self) -> Vec<ErrorInstruction> {
		self.rules.lock().unwrap().iter().cloned().collect()
	}

	pub fn client_port(&self) -> u16 {
		self.known_socket.lock().unwrap()
			.local_addr().map(|a| a.port()).unwrap_or(0)
	}

	/// Rebinds the client-facing listen socket. Takes effect for the next
	/// request; an in-flight transfer keeps its per-transfer socket.
	pub fn set_client_port(&self, port: u16) -> io::Result<()> {
		let fresh = bind_relay_socket(self.bind_ip, port)?;
		*self.known_socket.lock().unwrap() = fresh;
		Ok(())
	}

	pub fn server_addr(&self) -> SocketAddr {
		let ss = self.server_side.lock().unwrap();
		SocketAddr::new(ss.ip, ss.port)
	}

	pub fn set_server_port(&self, port: u16) {
		self.server_side.lock().unwrap().port = port;
	}

	pub fn set_server_ip(&self, ip: IpAddr) {
		self.server_side.lock().unwrap().ip = ip;
	}

	#[cfg(test)]
	fn tid_port(&self) -> u16 {
		self.tid_socket.local_addr().unwrap().port()
	}
}

fn bind_relay_socket(ip: IpAddr, port: u16) -> io::Result<UdpSocket> {
	let socket = UdpSocket::bind((ip, port))?;
	socket.set_read_timeout(Some(Duration::from_millis(500)))?;
	Ok(socket)
}

fn describe(pkt: &Option<Packet>) -> String {
	match pkt {
		Some(pkt) => pkt.to_string(),
		None => "unparseable datagram".to_string(),
	}
}

pub async fn sim_task(settings: SimSettings, cxl_token: CancellationToken) -> io::Result<()> {
	let engine = SimEngine::new(settings, cxl_token)?;
	info!(
		"relaying client port {} to server {}",
		engine.client_port(), engine.server_addr(),
	);

	let client_loop = {
		let engine = Arc::clone(&engine);
		tokio::task::spawn_blocking(move || engine.client_relay())
	};
	let server_loop = {
		let engine = Arc::clone(&engine);
		tokio::task::spawn_blocking(move || engine.server_relay())
	};

	/* the console owns stdin on a plain thread; it ends the process by
	 * cancelling the relays */
	{
		let engine = Arc::clone(&engine);
		std::thread::spawn(move || {
			let stdin = io::stdin().lock();
			if let Err(e) = console::run_console(&engine, stdin, io::stdout()) {
				error!("console failed: {}", e);
				engine.shutdown();
			}
		});
	}

	let _ = client_loop.await;
	let _ = server_loop.await;
	Ok(())
}

// ############################################################################
// ############################################################################
