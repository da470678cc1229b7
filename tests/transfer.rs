//! End-to-end exchanges between the real server, the client engine and the
//! error-simulating relay, all on localhost ephemeral ports.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tftpkit::client::{self, TftpRequestParameters};
use tftpkit::server::TftpServer;
use tftpkit::sim::rules::{ErrorAction, ErrorInstruction};
use tftpkit::sim::{SimEngine, SimSettings};
use tftpkit::tftp::options::TftpOption;
use tftpkit::tftp::packet::{Packet, PacketKind};
use tftpkit::tftp::{consts, ErrorCode, RequestKind, Timings, TransferState};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn fast_timings() -> Timings {
	Timings {
		packet_lost: Duration::from_millis(600),
		resend: Duration::from_millis(200),
		max_retransmits: 5,
	}
}

static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

fn scratch_dir(tag: &str) -> PathBuf {
	let dir = std::env::temp_dir().join(format!(
		"tftpkit-{}-{}-{}",
		tag,
		std::process::id(),
		DIR_SEQ.fetch_add(1, Ordering::Relaxed),
	));
	fs::create_dir_all(&dir).unwrap();
	dir
}

struct RunningServer {
	addr: SocketAddr,
	root: PathBuf,
	token: CancellationToken,
	handle: Option<std::thread::JoinHandle<()>>,
}

impl RunningServer {
	fn start(tag: &str) -> Self {
		let root = scratch_dir(tag);
		let server = TftpServer::new(SocketAddr::new(LOCALHOST, 0), root.clone())
			.unwrap()
			.with_timings(fast_timings());
		let addr = server.local_addr().unwrap();

		let token = CancellationToken::new();
		let serve_token = token.clone();
		let handle = std::thread::spawn(move || server.serve(serve_token));

		Self { addr, root, token, handle: Some(handle) }
	}
}

impl Drop for RunningServer {
	fn drop(&mut self) {
		self.token.cancel();
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
		let _ = fs::remove_dir_all(&self.root);
	}
}

fn get_params(server: SocketAddr, remote: &str, local: &Path, options: Vec<TftpOption>) -> TftpRequestParameters {
	TftpRequestParameters {
		req_kind: RequestKind::Rrq,
		server,
		remote_file: remote.to_string(),
		local_file: local.to_path_buf(),
		options,
	}
}

fn put_params(server: SocketAddr, local: &Path, remote: &str, options: Vec<TftpOption>) -> TftpRequestParameters {
	TftpRequestParameters {
		req_kind: RequestKind::Wrq,
		server,
		remote_file: remote.to_string(),
		local_file: local.to_path_buf(),
		options,
	}
}

// ############################################################################
// #### CLIENT <-> SERVER #####################################################
// ############################################################################

#[test]
fn read_of_a_small_file() {
	let server = RunningServer::start("read-small");
	fs::write(server.root.join("hi.bin"), b"hello").unwrap();

	let dest_dir = scratch_dir("read-small-dest");
	let dest = dest_dir.join("hi.bin");

	let state = client::get(&get_params(server.addr, "hi.bin", &dest, Vec::new()), fast_timings()).unwrap();
	assert_eq!(state, TransferState::Complete);
	assert_eq!(fs::read(&dest).unwrap(), b"hello");

	let _ = fs::remove_dir_all(&dest_dir);
}

#[test]
fn read_of_an_exact_block_multiple() {
	let server = RunningServer::start("read-boundary");
	let payload = vec![ 0xC3u8; 512 ];
	fs::write(server.root.join("block.bin"), &payload).unwrap();

	let dest_dir = scratch_dir("read-boundary-dest");
	let dest = dest_dir.join("block.bin");

	/* the transfer only ends after the empty trailing DATA */
	let state = client::get(&get_params(server.addr, "block.bin", &dest, Vec::new()), fast_timings()).unwrap();
	assert_eq!(state, TransferState::Complete);
	assert_eq!(fs::read(&dest).unwrap(), payload);

	let _ = fs::remove_dir_all(&dest_dir);
}

#[test]
fn write_then_collision() {
	let server = RunningServer::start("write");
	let src_dir = scratch_dir("write-src");
	let src = src_dir.join("upload.bin");
	let payload: Vec<u8> = (0..1300u32).map(|i| i as u8).collect();
	fs::write(&src, &payload).unwrap();

	let state = client::put(&put_params(server.addr, &src, "upload.bin", Vec::new()), fast_timings()).unwrap();
	assert_eq!(state, TransferState::Complete);
	assert_eq!(fs::read(server.root.join("upload.bin")).unwrap(), payload);

	/* the name is taken now, the server must refuse the second write */
	let state = client::put(&put_params(server.addr, &src, "upload.bin", Vec::new()), fast_timings()).unwrap();
	assert_ne!(state, TransferState::Complete);
	assert_eq!(fs::read(server.root.join("upload.bin")).unwrap(), payload);

	let _ = fs::remove_dir_all(&src_dir);
}

#[test]
fn read_of_a_missing_file_fails() {
	let server = RunningServer::start("read-missing");
	let dest_dir = scratch_dir("read-missing-dest");
	let dest = dest_dir.join("out.bin");

	let state = client::get(&get_params(server.addr, "nope.bin", &dest, Vec::new()), fast_timings()).unwrap();
	assert_ne!(state, TransferState::Complete);

	let _ = fs::remove_dir_all(&dest_dir);
}

#[test]
fn read_with_negotiated_options() {
	let server = RunningServer::start("read-oack");
	let payload = vec![ 0x11u8; 700 ];
	fs::write(server.root.join("sized.bin"), &payload).unwrap();

	let dest_dir = scratch_dir("read-oack-dest");
	let dest = dest_dir.join("sized.bin");

	let options = vec![ TftpOption::TransferSize(0), TftpOption::Timeout(Duration::from_secs(1)) ];
	let state = client::get(&get_params(server.addr, "sized.bin", &dest, options), fast_timings()).unwrap();
	assert_eq!(state, TransferState::Complete);
	assert_eq!(fs::read(&dest).unwrap(), payload);

	let _ = fs::remove_dir_all(&dest_dir);
}

#[test]
fn write_with_negotiated_options() {
	let server = RunningServer::start("write-oack");
	let src_dir = scratch_dir("write-oack-src");
	let src = src_dir.join("sized.bin");
	let payload = vec![ 0x22u8; 700 ];
	fs::write(&src, &payload).unwrap();

	let options = vec![ TftpOption::TransferSize(0) ];
	let state = client::put(&put_params(server.addr, &src, "sized.bin", options), fast_timings()).unwrap();
	assert_eq!(state, TransferState::Complete);
	assert_eq!(fs::read(server.root.join("sized.bin")).unwrap(), payload);

	let _ = fs::remove_dir_all(&src_dir);
}

#[test]
fn listen_port_rejects_stray_traffic() {
	let server = RunningServer::start("stray");
	let rogue = UdpSocket::bind((LOCALHOST, 0)).unwrap();
	rogue.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
	let mut buf = [ 0u8; consts::MAX_PACKET_SIZE ];

	/* transfer traffic for a foreign TID gets ERROR 5 */
	rogue.send_to(&Packet::Ack { block: 1 }.serialize(), server.addr).unwrap();
	let (len, _) = rogue.recv_from(&mut buf).unwrap();
	let Packet::Error { code, .. } = Packet::parse(&buf[..len]).unwrap() else {
		panic!("expected an ERROR reply");
	};
	assert_eq!(code, ErrorCode::UnknownTid);

	/* garbage gets ERROR 4 */
	rogue.send_to(&[ 0xBA, 0xAD, 0xF0, 0x0D ], server.addr).unwrap();
	let (len, _) = rogue.recv_from(&mut buf).unwrap();
	let Packet::Error { code, .. } = Packet::parse(&buf[..len]).unwrap() else {
		panic!("expected an ERROR reply");
	};
	assert_eq!(code, ErrorCode::IllegalOperation);
}

// ############################################################################
// #### THROUGH THE ERROR SIMULATOR ###########################################
// ############################################################################

struct RunningSim {
	engine: Arc<SimEngine>,
	relays: Vec<std::thread::JoinHandle<()>>,
}

impl RunningSim {
	fn start(server: SocketAddr) -> Self {
		let settings = SimSettings {
			bind_ip: LOCALHOST,
			client_port: 0,
			server_ip: server.ip(),
			server_port: server.port(),
		};
		let engine = SimEngine::new(settings, CancellationToken::new()).unwrap();

		let relays = vec![
			{ let e = Arc::clone(&engine); std::thread::spawn(move || e.client_relay()) },
			{ let e = Arc::clone(&engine); std::thread::spawn(move || e.server_relay()) },
		];
		Self { engine, relays }
	}

	fn addr(&self) -> SocketAddr {
		SocketAddr::new(LOCALHOST, self.engine.client_port())
	}
}

impl Drop for RunningSim {
	fn drop(&mut self) {
		self.engine.shutdown();
		for relay in self.relays.drain(..) {
			let _ = relay.join();
		}
	}
}

#[test]
fn read_recovers_from_a_single_dropped_data() {
	let server = RunningServer::start("sim-drop");
	let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
	fs::write(server.root.join("lossy.bin"), &payload).unwrap();

	let sim = RunningSim::start(server.addr);
	sim.engine.add_rule(ErrorInstruction {
		kind: PacketKind::Data,
		action: ErrorAction::Drop,
		block: 2,
		delay: Duration::ZERO,
		repeat: 1,
	});

	let dest_dir = scratch_dir("sim-drop-dest");
	let dest = dest_dir.join("lossy.bin");

	/* DATA 2 dies once; the server's retransmission completes the transfer */
	let state = client::get(&get_params(sim.addr(), "lossy.bin", &dest, Vec::new()), fast_timings()).unwrap();
	assert_eq!(state, TransferState::Complete);
	assert_eq!(fs::read(&dest).unwrap(), payload);
	assert!(sim.engine.rules_snapshot().is_empty());

	let _ = fs::remove_dir_all(&dest_dir);
}

#[test]
fn read_under_indefinite_drop_times_out() {
	let server = RunningServer::start("sim-starve");
	fs::write(server.root.join("never.bin"), vec![ 0u8; 600 ]).unwrap();

	let sim = RunningSim::start(server.addr);
	sim.engine.add_rule(ErrorInstruction {
		kind: PacketKind::Data,
		action: ErrorAction::Drop,
		block: 1,
		delay: Duration::ZERO,
		repeat: -1,
	});

	let dest_dir = scratch_dir("sim-starve-dest");
	let dest = dest_dir.join("never.bin");

	/* no DATA ever reaches the client */
	let state = client::get(&get_params(sim.addr(), "never.bin", &dest, Vec::new()), fast_timings()).unwrap();
	assert_eq!(state, TransferState::BlockZeroTimeout);

	let _ = fs::remove_dir_all(&dest_dir);
}

#[test]
fn duplicated_data_does_not_corrupt_the_file() {
	let server = RunningServer::start("sim-dup");
	let payload: Vec<u8> = (0..1300u32).map(|i| (i % 253) as u8).collect();
	fs::write(server.root.join("dup.bin"), &payload).unwrap();

	let sim = RunningSim::start(server.addr);
	sim.engine.add_rule(ErrorInstruction {
		kind: PacketKind::Data,
		action: ErrorAction::Duplicate,
		block: 2,
		delay: Duration::from_millis(50),
		repeat: 1,
	});

	let dest_dir = scratch_dir("sim-dup-dest");
	let dest = dest_dir.join("dup.bin");

	/* wherever the late copy lands, the file must come out intact */
	let state = client::get(&get_params(sim.addr(), "dup.bin", &dest, Vec::new()), fast_timings()).unwrap();
	assert_eq!(state, TransferState::Complete);
	assert_eq!(fs::read(&dest).unwrap(), payload);

	let _ = fs::remove_dir_all(&dest_dir);
}

#[test]
fn write_passes_through_the_relay() {
	let server = RunningServer::start("sim-write");
	let src_dir = scratch_dir("sim-write-src");
	let src = src_dir.join("up.bin");
	let payload: Vec<u8> = (0..800u32).map(|i| (i % 199) as u8).collect();
	fs::write(&src, &payload).unwrap();

	let sim = RunningSim::start(server.addr);

	let state = client::put(&put_params(sim.addr(), &src, "up.bin", Vec::new()), fast_timings()).unwrap();
	assert_eq!(state, TransferState::Complete);
	assert_eq!(fs::read(server.root.join("up.bin")).unwrap(), payload);

	let _ = fs::remove_dir_all(&src_dir);
}
