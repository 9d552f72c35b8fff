//! The shipgate link: a TLS client carrying the framed, versioned RPC that
//! owns all persistent state.
//!
//! The link reconnects with back-off for as long as the ship runs;
//! outbound messages queue in the handle's channel while it is down.
//! Responses are correlated by `(type | RESPONSE)` plus the request keys
//! embedded in each payload (guildcard, block, ...).

use std::io::BufReader;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;

use ragol_common::shipgate::*;
use ragol_common::{Version, SHIPGATE_PROTO_VER};

use crate::client::{self, BlocklistEntry};
use crate::scripts::{ScriptAction, ScriptArg};
use crate::send;
use crate::ship::Ship;

/// Minimum delay between connection attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);
/// Ping cadence, and how long an unanswered ping may ride before the link
/// is considered dead.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// The sending half handed to the rest of the server.
pub struct ShipgateHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    connected: AtomicBool,
    ship_id: AtomicU32,
}

impl ShipgateHandle {
    pub fn new() -> (Arc<ShipgateHandle>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Arc::new(ShipgateHandle {
                tx,
                connected: AtomicBool::new(false),
                ship_id: AtomicU32::new(0),
            }),
            rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn ship_id(&self) -> u32 {
        self.ship_id.load(Ordering::Acquire)
    }

    fn send(&self, frame: Vec<u8>) {
        let _ = self.tx.send(frame);
    }

    // --- Outbound message builders ---------------------------------------

    pub fn send_ping(&self, reply: bool) {
        let flags = if reply { SHDR_RESPONSE } else { 0 };
        self.send(ShipgateFrame::build(SHDR_TYPE_PING, flags, &[]));
    }

    pub fn send_cnt(&self, clients: u16, games: u16) {
        let mut p = Vec::with_capacity(8);
        p.extend_from_slice(&clients.to_le_bytes());
        p.extend_from_slice(&games.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes()); // ship_id: 0 for ship->gate
        self.send(ShipgateFrame::build(SHDR_TYPE_COUNT, 0, &p));
    }

    /// Forward a decrypted client packet. `fw_type` is one of the
    /// per-version SHDR_TYPE_DC/PC/BB/... codes.
    pub fn forward(&self, fw_type: u16, fw_flags: u32, gc: u32, block: u32, pkt: &[u8]) {
        let mut p = Vec::with_capacity(16 + pkt.len());
        p.extend_from_slice(&0u32.to_le_bytes()); // ship id
        p.extend_from_slice(&fw_flags.to_le_bytes());
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&block.to_le_bytes());
        p.extend_from_slice(pkt);
        self.send(ShipgateFrame::build(fw_type, 0, &p));
    }

    pub fn send_cdata(&self, gc: u32, slot: u32, block: u32, data: &[u8]) {
        let mut p = Vec::with_capacity(12 + data.len());
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&slot.to_le_bytes());
        p.extend_from_slice(&block.to_le_bytes());
        p.extend_from_slice(data);
        self.send(ShipgateFrame::build(SHDR_TYPE_CDATA, 0, &p));
    }

    pub fn send_creq(&self, gc: u32, slot: u32) {
        let mut p = Vec::with_capacity(8);
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&slot.to_le_bytes());
        self.send(ShipgateFrame::build(SHDR_TYPE_CREQ, 0, &p));
    }

    pub fn send_usrlogin(&self, gc: u32, block: u32, username: &str, password: &str) {
        let mut p = Vec::with_capacity(72);
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&block.to_le_bytes());
        p.extend_from_slice(&fixed_str::<32>(username));
        p.extend_from_slice(&fixed_str::<32>(password));
        self.send(ShipgateFrame::build(SHDR_TYPE_USRLOGIN, 0, &p));
    }

    /// `ban_type` is SHDR_TYPE_GCBAN or SHDR_TYPE_IPBAN.
    pub fn send_ban(&self, ban_type: u16, requester: u32, target: u32, until: u32, msg: &str) {
        let mut p = Vec::with_capacity(272);
        p.extend_from_slice(&requester.to_le_bytes());
        p.extend_from_slice(&target.to_le_bytes());
        p.extend_from_slice(&until.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes());
        p.extend_from_slice(&fixed_str::<256>(msg));
        self.send(ShipgateFrame::build(ban_type, 0, &p));
    }

    pub fn send_block_login(&self, on: bool, gc: u32, block: u32, ch_name: &str) {
        let mut p = Vec::with_capacity(40);
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&block.to_le_bytes());
        p.extend_from_slice(&fixed_str::<32>(ch_name));

        let ty = if on {
            SHDR_TYPE_BLKLOGIN
        } else {
            SHDR_TYPE_BLKLOGOUT
        };
        self.send(ShipgateFrame::build(ty, 0, &p));
    }

    pub fn send_lobby_chg(&self, gc: u32, lobby_id: u32, lobby_name: &str) {
        let mut p = Vec::with_capacity(40);
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&lobby_id.to_le_bytes());
        p.extend_from_slice(&fixed_str::<32>(lobby_name));
        self.send(ShipgateFrame::build(SHDR_TYPE_LOBBYCHG, 0, &p));
    }

    pub fn send_friend_add(&self, user: u32, friend: u32, nick: &str) {
        let mut p = Vec::with_capacity(40);
        p.extend_from_slice(&user.to_le_bytes());
        p.extend_from_slice(&friend.to_le_bytes());
        p.extend_from_slice(&fixed_str::<32>(nick));
        self.send(ShipgateFrame::build(SHDR_TYPE_ADDFRIEND, 0, &p));
    }

    pub fn send_friend_del(&self, user: u32, friend: u32) {
        let mut p = Vec::with_capacity(8);
        p.extend_from_slice(&user.to_le_bytes());
        p.extend_from_slice(&friend.to_le_bytes());
        self.send(ShipgateFrame::build(SHDR_TYPE_DELFRIEND, 0, &p));
    }

    pub fn send_frlist_req(&self, gc: u32, block: u32, start: u32) {
        let mut p = Vec::with_capacity(16);
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&block.to_le_bytes());
        p.extend_from_slice(&start.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes());
        self.send(ShipgateFrame::build(SHDR_TYPE_FRLIST, 0, &p));
    }

    pub fn send_global_msg(&self, requester: u32, text: &str) {
        let mut p = Vec::with_capacity(8 + text.len() + 1);
        p.extend_from_slice(&requester.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes());
        p.extend_from_slice(text.as_bytes());
        p.push(0);
        self.send(ShipgateFrame::build(SHDR_TYPE_GLOBALMSG, 0, &p));
    }

    pub fn send_user_opt(&self, gc: u32, block: u32, opt: u32, data: &[u8]) {
        // One option record, padded to 8 bytes, wrapped in the options
        // packet layout.
        let padded = data.len().div_ceil(8) * 8;

        let mut p = Vec::with_capacity(24 + padded);
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&block.to_le_bytes());
        p.extend_from_slice(&1u32.to_le_bytes()); // count
        p.extend_from_slice(&0u32.to_le_bytes());
        p.extend_from_slice(&opt.to_le_bytes());
        p.extend_from_slice(&((8 + padded) as u32).to_le_bytes());
        p.extend_from_slice(data);
        p.resize(24 + padded, 0);
        self.send(ShipgateFrame::build(SHDR_TYPE_USEROPT, 0, &p));
    }

    pub fn send_bb_opt_req(&self, gc: u32, block: u32) {
        let mut p = Vec::with_capacity(8);
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&block.to_le_bytes());
        self.send(ShipgateFrame::build(SHDR_TYPE_BBOPT_REQ, 0, &p));
    }

    pub fn send_cbkup(&self, gc: u32, block: u32, name: &str, data: &[u8]) {
        let mut p = Vec::with_capacity(40 + data.len());
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&block.to_le_bytes());
        p.extend_from_slice(&fixed_str::<32>(name));
        p.extend_from_slice(data);
        self.send(ShipgateFrame::build(SHDR_TYPE_CBKUP, 0, &p));
    }

    pub fn send_cbkup_req(&self, gc: u32, block: u32, name: &str) {
        let mut p = Vec::with_capacity(40);
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&block.to_le_bytes());
        p.extend_from_slice(&fixed_str::<32>(name));
        self.send(ShipgateFrame::build(SHDR_TYPE_CBKUP, 0, &p));
    }

    /// Flush a client's kill counters.
    pub fn send_mkill(
        &self,
        gc: u32,
        block: u32,
        episode: u8,
        difficulty: u8,
        version: Version,
        counts: &[u32; client::KILL_COUNTERS],
    ) {
        let mut p = Vec::with_capacity(12 + counts.len() * 4);
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&block.to_le_bytes());
        p.push(episode);
        p.push(difficulty);
        p.push(version.wire_code());
        p.push(0);

        for c in counts {
            p.extend_from_slice(&c.to_le_bytes());
        }

        self.send(ShipgateFrame::build(SHDR_TYPE_MKILL, 0, &p));
    }

    pub fn send_sdata(
        &self,
        gc: u32,
        block: u32,
        event: u32,
        episode: u8,
        difficulty: u8,
        version: Version,
        data: &[u8],
    ) {
        let mut p = Vec::with_capacity(20 + data.len());
        p.extend_from_slice(&event.to_le_bytes());
        p.extend_from_slice(&(data.len() as u32).to_le_bytes());
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&block.to_le_bytes());
        p.push(episode);
        p.push(difficulty);
        p.push(version.wire_code());
        p.push(0);
        p.extend_from_slice(data);
        self.send(ShipgateFrame::build(SHDR_TYPE_SDATA, 0, &p));
    }

    /// Set (or, with `QFLAG_DELETE_FLAG` in `ctl`, delete) a quest flag.
    pub fn send_qflag(
        &self,
        gc: u32,
        block: u32,
        set: bool,
        flag_id: u32,
        quest_id: u32,
        value: u32,
        ctl: u32,
    ) {
        let mut p = Vec::with_capacity(24);
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&block.to_le_bytes());
        p.extend_from_slice(&((flag_id & 0xFFFF) | ctl).to_le_bytes());
        p.extend_from_slice(&quest_id.to_le_bytes());
        p.extend_from_slice(&(((flag_id >> 16) & 0xFFFF) as u16).to_le_bytes());
        p.extend_from_slice(&0u16.to_le_bytes());
        p.extend_from_slice(&value.to_le_bytes());

        let ty = if set {
            SHDR_TYPE_QFLAG_SET
        } else {
            SHDR_TYPE_QFLAG_GET
        };
        self.send(ShipgateFrame::build(ty, 0, &p));
    }

    pub fn send_kick(&self, requester: u32, gc: u32, reason: &str) {
        let mut p = Vec::with_capacity(80);
        p.extend_from_slice(&requester.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes());
        p.extend_from_slice(&gc.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes());
        p.extend_from_slice(&fixed_str::<64>(reason));
        self.send(ShipgateFrame::build(SHDR_TYPE_KICK, 0, &p));
    }

    pub fn send_ubl_add(&self, requester: u32, block: u32, blocked: u32, flags: u32, name: &str) {
        let mut p = Vec::with_capacity(56);
        p.extend_from_slice(&requester.to_le_bytes());
        p.extend_from_slice(&block.to_le_bytes());
        p.extend_from_slice(&blocked.to_le_bytes());
        p.extend_from_slice(&flags.to_le_bytes());
        p.extend_from_slice(&fixed_str::<32>(name));
        p.extend_from_slice(&[0u8; 8]);
        self.send(ShipgateFrame::build(SHDR_TYPE_UBL_ADD, 0, &p));
    }
}

fn fixed_str<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    for (dst, src) in out.iter_mut().zip(s.as_bytes()) {
        *dst = *src;
    }
    // Always NUL-terminated.
    out[N - 1] = 0;
    out
}

fn rd32(p: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([p[off], p[off + 1], p[off + 2], p[off + 3]])
}

fn rd_cstr(p: &[u8]) -> String {
    let end = p.iter().position(|&b| b == 0).unwrap_or(p.len());
    String::from_utf8_lossy(&p[..end]).into_owned()
}

/// The ship's login information packet, sent after the gate's hello.
fn build_login6(ship: &Ship) -> Vec<u8> {
    let cfg = &ship.cfg;
    let (clients, games) = ship.counts();

    let mut p = Vec::with_capacity(64);
    p.extend_from_slice(&SHIPGATE_PROTO_VER.to_le_bytes());
    p.extend_from_slice(&cfg.shipgate_flags.to_le_bytes());
    p.extend_from_slice(&fixed_str::<12>(&cfg.name));
    p.extend_from_slice(&cfg.ship_addr4.octets());

    match cfg.ship_addr6 {
        Some(a6) => p.extend_from_slice(&a6.octets()),
        None => p.extend_from_slice(&[0u8; 16]),
    }

    p.extend_from_slice(&cfg.base_port.to_le_bytes());
    p.extend_from_slice(&0u16.to_le_bytes());
    p.extend_from_slice(&clients.to_le_bytes());
    p.extend_from_slice(&games.to_le_bytes());
    p.extend_from_slice(&cfg.menu_code.to_le_bytes());
    p.extend_from_slice(&[0u8; 2]);
    p.extend_from_slice(&0u32.to_le_bytes()); // privileges

    ShipgateFrame::build(SHDR_TYPE_LOGIN6, 0, &p)
}

/// The bulk client list sent after (re)connecting.
fn build_bclients(ship: &Ship) -> Vec<Vec<u8>> {
    let mut out = Vec::new();

    for block in &ship.blocks {
        let clients = block.clients.read().unwrap_or_else(|e| e.into_inner());
        if clients.is_empty() {
            continue;
        }

        let mut p = Vec::new();
        let mut count = 0u32;
        p.extend_from_slice(&0u32.to_le_bytes()); // patched below
        p.extend_from_slice(&block.b.to_le_bytes());

        for c in clients.iter() {
            let (gc, lobby_id, name, lobby) = {
                let cs = c.lock();
                (cs.guildcard, cs.lobby_id, cs.player.name.clone(), cs.cur_lobby.upgrade())
            };

            if gc == 0 {
                continue;
            }

            let lobby_name = lobby.map(|l| l.lock().name.clone()).unwrap_or_default();

            p.extend_from_slice(&gc.to_le_bytes());
            p.extend_from_slice(&lobby_id.to_le_bytes());
            p.extend_from_slice(&lobby_id.to_le_bytes());
            p.extend_from_slice(&0u32.to_le_bytes());
            p.extend_from_slice(&fixed_str::<32>(&name));
            p.extend_from_slice(&fixed_str::<32>(&lobby_name));
            count += 1;
        }

        p[0..4].copy_from_slice(&count.to_le_bytes());
        out.push(ShipgateFrame::build(SHDR_TYPE_BCLIENTS, 0, &p));
    }

    out
}

/// Spawn the shipgate link task.
pub fn spawn(ship: Arc<Ship>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(link_task(ship, rx))
}

async fn link_task(ship: Arc<Ship>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    let connector = match build_tls_connector(&ship) {
        Ok(c) => c,
        Err(e) => {
            // A broken TLS setup is fatal at boot.
            error!("cannot initialise shipgate TLS: {}", e);
            return;
        }
    };

    loop {
        match run_connection(&ship, &connector, &mut rx).await {
            Ok(()) => info!("shipgate link closed"),
            Err(e) => warn!("shipgate link error: {}", e),
        }

        ship.sg.connected.store(false, Ordering::Release);
        tokio::time::sleep(RECONNECT_BACKOFF).await;
        info!("reconnecting to the shipgate...");
    }
}

fn build_tls_connector(ship: &Ship) -> Result<TlsConnector, Box<dyn std::error::Error + Send + Sync>> {
    let cfg = &ship.cfg;

    let mut roots = rustls::RootCertStore::empty();
    let ca = std::fs::File::open(&cfg.shipgate_ca)?;
    for cert in rustls_pemfile::certs(&mut BufReader::new(ca))? {
        roots.add(&rustls::Certificate(cert))?;
    }

    let certs = rustls_pemfile::certs(&mut BufReader::new(std::fs::File::open(&cfg.ship_cert)?))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    let mut keys =
        rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(std::fs::File::open(&cfg.ship_key)?))?;

    let key = keys
        .pop()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no key found"))?;

    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, rustls::PrivateKey(key))?;

    Ok(TlsConnector::from(Arc::new(config)))
}

async fn run_connection(
    ship: &Arc<Ship>,
    connector: &TlsConnector,
    rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cfg = &ship.cfg;
    let addr = (cfg.shipgate_host.as_str(), cfg.shipgate_port);

    info!("connecting to shipgate at {}:{}", cfg.shipgate_host, cfg.shipgate_port);

    let stream = TcpStream::connect(addr).await?;
    let domain = rustls::ServerName::try_from(cfg.shipgate_host.as_str())?;
    let tls = connector.connect(domain, stream).await?;

    let mut framed = Framed::new(tls, ShipgateCodec);
    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    let mut outstanding_ping = false;

    loop {
        tokio::select! {
            frame = framed.next() => {
                let frame = match frame {
                    Some(Ok(f)) => f,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                };

                if frame.hdr.pkt_type == SHDR_TYPE_PING && frame.hdr.is_response() {
                    outstanding_ping = false;
                    continue;
                }

                if let Some(reply) = dispatch(ship, &frame) {
                    framed.send(reply).await?;
                }
            }

            out = rx.recv() => {
                match out {
                    Some(frame) => framed.send(frame).await?,
                    None => return Ok(()),
                }
            }

            _ = ping_timer.tick() => {
                if outstanding_ping {
                    return Err("shipgate stopped answering pings".into());
                }

                if ship.sg.is_connected() {
                    outstanding_ping = true;
                    framed.send(ShipgateFrame::build(SHDR_TYPE_PING, 0, &[])).await?;
                }
            }
        }
    }
}

/// Process one inbound frame; optionally returns an immediate reply.
fn dispatch(ship: &Arc<Ship>, frame: &ShipgateFrame) -> Option<Vec<u8>> {
    let p = &frame.payload[..];
    let hdr = &frame.hdr;

    match (hdr.pkt_type, hdr.is_response()) {
        (SHDR_TYPE_LOGIN, false) => {
            // The gate's hello; answer with our information.
            info!("shipgate hello received, logging in");
            Some(build_login6(ship))
        }

        (SHDR_TYPE_LOGIN6, true) => {
            if hdr.is_failure() {
                let code = rd32(p, 0);
                error!("shipgate rejected our login: {:08x}", code);
                return None;
            }

            ship.sg.connected.store(true, Ordering::Release);

            if p.len() >= 12 {
                ship.sg.ship_id.store(rd32(p, 8), Ordering::Release);
            }

            info!("shipgate login complete (ship id {})", ship.sg.ship_id());

            // Re-announce our population.
            let (clients, games) = ship.counts();
            ship.sg.send_cnt(clients, games);

            for pkt in build_bclients(ship) {
                ship.sg.send(pkt);
            }

            None
        }

        (SHDR_TYPE_PING, false) => {
            Some(ShipgateFrame::build(SHDR_TYPE_PING, SHDR_RESPONSE, &[]))
        }

        (SHDR_TYPE_USRLOGIN, true) => {
            if p.len() < 12 {
                return None;
            }

            if hdr.is_failure() {
                let gc = rd32(p, 8);
                if let Some((_, c)) = ship.find_client(gc) {
                    send::send_txt(&c, "\tE\tC7Login failed.");
                }
                return None;
            }

            let gc = rd32(p, 0);
            let priv_bits = rd32(p, 8);

            if let Some((_, c)) = ship.find_client(gc) {
                {
                    let mut cs = c.lock();
                    cs.privilege |= priv_bits;
                    cs.flags |= client::FLAG_LOGGED_IN;
                    cs.flags &= !client::FLAG_GC_PROTECT;
                }
                send::send_txt(&c, "\tE\tC7Logged in.");
            }

            None
        }

        (SHDR_TYPE_CREQ, true) => {
            if hdr.is_failure() {
                let gc = rd32(p, 8);
                if let Some((_, c)) = ship.find_client(gc) {
                    send::send_txt(&c, "\tE\tC7No character data found.");
                }
                return None;
            }

            if p.len() < 12 {
                return None;
            }

            let gc = rd32(p, 0);
            if let Some((_, c)) = ship.find_client(gc) {
                c.lock().player.raw = p[12..].to_vec();
                send::send_txt(&c, "\tE\tC7Character data restored.\nRe-select your character.");
            }

            None
        }

        (SHDR_TYPE_CDATA, true) => {
            let gc = if hdr.is_failure() { rd32(p, 8) } else { rd32(p, 0) };

            if let Some((_, c)) = ship.find_client(gc) {
                if hdr.is_failure() {
                    send::send_txt(&c, "\tE\tC7Couldn't save character data.");
                } else {
                    send::send_txt(&c, "\tE\tC7Character data saved.");
                }
            }

            None
        }

        (SHDR_TYPE_CBKUP, true) => {
            let gc = if hdr.is_failure() { rd32(p, 8) } else { rd32(p, 0) };

            if let Some((_, c)) = ship.find_client(gc) {
                if hdr.is_failure() {
                    send::send_txt(&c, "\tE\tC7Backup request failed.");
                } else if p.len() > 40 {
                    c.lock().player.raw = p[40..].to_vec();
                    send::send_txt(&c, "\tE\tC7Backup restored.\nRe-select your character.");
                } else {
                    send::send_txt(&c, "\tE\tC7Backup saved.");
                }
            }

            None
        }

        (SHDR_TYPE_BLKLOGIN, true) => {
            if hdr.is_failure() && p.len() >= 12 {
                // Duplicate login or bad name; the gate refused the user.
                let gc = rd32(p, 8);
                if let Some((_, c)) = ship.find_client(gc) {
                    send::send_msg_box(&c, "\tEYou are already logged in.");
                    c.disconnect();
                }
            }

            None
        }

        (SHDR_TYPE_FRLOGIN, false) | (SHDR_TYPE_FRLOGOUT, false) => {
            if p.len() < 88 {
                return None;
            }

            let dest_gc = rd32(p, 0);
            let friend_ship = rd32(p, 12);
            let friend_block = rd32(p, 16);
            let name = rd_cstr(&p[24..56]);
            let nick = rd_cstr(&p[56..88]);

            let what = if hdr.pkt_type == SHDR_TYPE_FRLOGIN {
                "online"
            } else {
                "offline"
            };

            if let Some((_, c)) = ship.find_client(dest_gc) {
                let display = if nick.is_empty() { name } else { nick };
                send::send_txt(
                    &c,
                    &format!(
                        "\tE\tC2{}\tC7 is {}\n(Ship {:02}, Block {:02})",
                        display, what, friend_ship, friend_block
                    ),
                );
            }

            None
        }

        (SHDR_TYPE_FRLIST, true) => {
            if p.len() < 8 {
                return None;
            }

            let gc = rd32(p, 0);
            if let Some((_, c)) = ship.find_client(gc) {
                let mut text = String::from("\tEFriends:\n");
                let mut off = 8;

                while off + 48 <= p.len() {
                    let fgc = rd32(p, off);
                    let fship = rd32(p, off + 4);
                    let fblock = rd32(p, off + 8);
                    let name = rd_cstr(&p[off + 16..off + 48]);

                    if fgc != 0 {
                        if fship != 0 {
                            text.push_str(&format!("\tC2{}\tC7 {:02}:{:02}\n", name, fship, fblock));
                        } else {
                            text.push_str(&format!("\tC4{}\tC7 offline\n", name));
                        }
                    }

                    off += 48;
                }

                send::send_info_reply(&c, &text);
            }

            None
        }

        (SHDR_TYPE_GLOBALMSG, false) => {
            if p.len() < 8 {
                return None;
            }

            let text = rd_cstr(&p[8..]);
            info!("global message: {}", text);

            for block in &ship.blocks {
                let clients = block.clients.read().unwrap_or_else(|e| e.into_inner());
                for c in clients.iter() {
                    send::send_txt(c, &format!("\tE\tC4Global:\tC7 {}", text));
                }
            }

            None
        }

        (SHDR_TYPE_KICK, false) => {
            if p.len() < 80 {
                return None;
            }

            let gc = rd32(p, 8);
            let reason = rd_cstr(&p[16..80]);

            if let Some((_, c)) = ship.find_client(gc) {
                if reason.is_empty() {
                    send::send_msg_box(&c, "\tEYou have been kicked by a GM.");
                } else {
                    send::send_msg_box(
                        &c,
                        &format!("\tEYou have been kicked by a GM.\n\nReason:\n{}", reason),
                    );
                }
                c.disconnect();
            }

            None
        }

        (SHDR_TYPE_GCBAN, false) | (SHDR_TYPE_IPBAN, false) => {
            if p.len() < 272 {
                return None;
            }

            let requester = rd32(p, 0);
            let target = rd32(p, 4);
            let until = rd32(p, 8);
            let reason = rd_cstr(&p[16..272]);

            if hdr.pkt_type == SHDR_TYPE_GCBAN {
                ship.bans.ban_guildcard(
                    target,
                    crate::bans::BanEntry {
                        banner_gc: requester,
                        until,
                        reason: reason.clone(),
                    },
                );

                if let Some((_, c)) = ship.find_client(target) {
                    let length = crate::bans::ban_length_text(until, unix_now());
                    send::send_msg_box(
                        &c,
                        &format!("\tEYou have been banned.\nLength: {}\n\n{}", length, reason),
                    );
                    c.disconnect();
                }
            } else {
                let addr = std::net::IpAddr::from(target.to_be_bytes());
                ship.bans.ban_ip(
                    addr,
                    32,
                    crate::bans::BanEntry {
                        banner_gc: requester,
                        until,
                        reason,
                    },
                );
            }

            None
        }

        (SHDR_TYPE_QFLAG_SET, true) | (SHDR_TYPE_QFLAG_GET, true) => {
            if p.len() < 24 {
                return None;
            }

            let gc = rd32(p, 0);
            let value = rd32(p, 20);

            if hdr.is_failure() {
                debug!("quest flag request failed for gc {}", gc);
                return None;
            }

            if let Some((_, c)) = ship.find_client(gc) {
                // Deliver the value into the quest's data register.
                let lobby = { c.lock().cur_lobby.upgrade() };
                let reg = lobby.and_then(|l| {
                    let st = l.lock();
                    (st.q_flags & crate::lobby::LOBBY_QFLAG_DATA != 0).then_some(st.q_data_reg)
                });

                if let Some(reg) = reg {
                    send::send_sync_register(&c, reg, value);
                }
            }

            None
        }

        (SHDR_TYPE_UBLOCKS, false) => {
            if p.len() < 16 {
                return None;
            }

            let gc = rd32(p, 0);
            let count = rd32(p, 8) as usize;

            if let Some((_, c)) = ship.find_client(gc) {
                let mut list = Vec::with_capacity(count);
                let mut off = 16;

                for _ in 0..count {
                    if off + 8 > p.len() {
                        break;
                    }

                    list.push(BlocklistEntry {
                        gc: rd32(p, off),
                        flags: rd32(p, off + 4),
                    });
                    off += 8;
                }

                c.lock().blocklist = list;
            }

            None
        }

        (SHDR_TYPE_USEROPT, false) => {
            if p.len() < 16 {
                return None;
            }

            let gc = rd32(p, 0);
            let count = rd32(p, 8) as usize;

            if let Some((_, c)) = ship.find_client(gc) {
                let mut off = 16;

                for _ in 0..count {
                    if off + 8 > p.len() {
                        break;
                    }

                    let opt = rd32(p, off);
                    let len = rd32(p, off + 4) as usize;
                    let data = p.get(off + 8..off + len.max(8))?;
                    apply_user_opt(&c, opt, data);
                    off += len.max(8);
                }
            }

            None
        }

        (SHDR_TYPE_SCHUNK, false) => {
            if p.len() < 48 {
                return None;
            }

            let chunk_type = p[0];
            let chunk_len = rd32(p, 4) as usize;
            let chunk_crc = rd32(p, 8);
            let filename = rd_cstr(&p[16..48]);

            // Filenames stay inside the scripts directory, no exceptions.
            if filename.is_empty() || filename.contains('/') || filename.contains("..") {
                return Some(schunk_reply(chunk_type, &filename, false));
            }

            let path = ship.cfg.scripts_dir.join(&filename);

            if chunk_type & SCHUNK_CHECK != 0 {
                // Only verify what's on disk against the expected checksum.
                let ok = std::fs::read(&path)
                    .map(|data| crc::crc32::checksum_ieee(&data) == chunk_crc)
                    .unwrap_or(false);

                return Some(schunk_reply(chunk_type, &filename, ok));
            }

            let chunk = match p.get(48..48 + chunk_len) {
                Some(c) => c,
                None => return Some(schunk_reply(chunk_type, &filename, false)),
            };

            if crc::crc32::checksum_ieee(chunk) != chunk_crc {
                warn!("script chunk {} failed its checksum", filename);
                return Some(schunk_reply(chunk_type, &filename, false));
            }

            let _ = std::fs::create_dir_all(&ship.cfg.scripts_dir);
            let ok = std::fs::write(&path, chunk).is_ok();

            if ok {
                info!("stored script chunk {} ({} bytes)", filename, chunk_len);
            }

            Some(schunk_reply(chunk_type, &filename, ok))
        }

        (SHDR_TYPE_SDATA, false) => {
            if p.len() < 20 {
                return None;
            }

            let event = rd32(p, 0);
            let gc = rd32(p, 8);

            ship.hooks.execute(
                ScriptAction::ShipgateData,
                &[
                    ScriptArg::Uint(event as u64),
                    ScriptArg::Client(gc),
                ],
            );

            None
        }

        (SHDR_TYPE_SSTATUS, false) => {
            if p.len() >= 16 {
                let name = rd_cstr(&p[0..12]);
                let status = p.get(38).copied().unwrap_or(0);
                info!("ship status update: {} -> {}", name, status);
            }

            None
        }

        (ty, resp) => {
            debug!("unhandled shipgate packet {:04x} (response: {})", ty, resp);
            None
        }
    }
}

/// Build the SCHUNK acknowledgement (or failure) frame.
fn schunk_reply(chunk_type: u8, filename: &str, ok: bool) -> Vec<u8> {
    let mut p = Vec::with_capacity(44);

    if ok {
        p.push(chunk_type);
        p.extend_from_slice(&[0u8; 3]);
        p.extend_from_slice(&fixed_str::<32>(filename));
        ShipgateFrame::build(SHDR_TYPE_SCHUNK, SHDR_RESPONSE, &p)
    } else {
        // Error replies carry the error code ahead of the echoed keys.
        p.extend_from_slice(&ERR_SCHUNK_NEED_SCRIPT.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes());
        p.push(chunk_type);
        p.extend_from_slice(&[0u8; 3]);
        p.extend_from_slice(&fixed_str::<32>(filename));
        ShipgateFrame::build(SHDR_TYPE_SCHUNK, SHDR_RESPONSE | SHDR_FAILURE, &p)
    }
}

fn apply_user_opt(c: &Arc<crate::client::Client>, opt: u32, data: &[u8]) {
    let mut cs = c.lock();

    match opt {
        USER_OPT_QUEST_LANG => {
            if let Some(&lang) = data.first() {
                cs.quest_lang = ragol_common::version::Language::from_code(lang);
            }
        }
        USER_OPT_ENABLE_BACKUP => {
            if data.first().copied().unwrap_or(0) != 0 {
                cs.flags |= client::FLAG_AUTO_BACKUP;
            }
        }
        USER_OPT_GC_PROTECT => {
            if data.first().copied().unwrap_or(0) != 0 {
                cs.flags |= client::FLAG_GC_PROTECT;
            }
        }
        USER_OPT_TRACK_KILLS => {
            if data.first().copied().unwrap_or(0) != 0 {
                cs.flags |= client::FLAG_TRACK_KILLS;
            }
        }
        USER_OPT_LEGIT_ALWAYS => {
            if data.first().copied().unwrap_or(0) != 0 {
                cs.flags |= client::FLAG_LEGIT;
            }
        }
        USER_OPT_WORD_CENSOR => {
            if data.first().copied().unwrap_or(0) != 0 {
                cs.flags |= client::FLAG_WORD_CENSOR;
            }
        }
        other => debug!("unknown user option {:08x}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login6_carries_the_protocol_version() {
        let pkt = {
            let mut p = Vec::new();
            p.extend_from_slice(&SHIPGATE_PROTO_VER.to_le_bytes());
            p
        };
        assert_eq!(rd32(&pkt, 0), 19);
    }

    #[test]
    fn fixed_strings_truncate_and_terminate() {
        let s = fixed_str::<8>("a long ship name");
        assert_eq!(s[7], 0);
        assert_eq!(&s[..7], b"a long ");

        let s = fixed_str::<8>("hi");
        assert_eq!(&s[..3], b"hi\0");
    }

    #[test]
    fn qflag_requests_split_wide_flag_ids() {
        let (handle, mut rx) = ShipgateHandle::new();
        handle.send_qflag(1, 2, true, 0x0012_0034, 55, 99, QFLAG_LONG_FLAG);

        let frame = rx.try_recv().unwrap();
        // Past the 8-byte header: gc, block, flag lo | ctl, qid, flag hi.
        assert_eq!(rd32(&frame, 8), 1);
        assert_eq!(rd32(&frame, 12), 2);
        assert_eq!(rd32(&frame, 16), 0x0034 | QFLAG_LONG_FLAG);
        assert_eq!(rd32(&frame, 20), 55);
        assert_eq!(u16::from_le_bytes([frame[24], frame[25]]), 0x0012);
        assert_eq!(rd32(&frame, 28), 99);
    }

    #[test]
    fn counters_pack_little_endian() {
        let (handle, mut rx) = ShipgateHandle::new();
        handle.send_cnt(12, 3);

        let frame = rx.try_recv().unwrap();
        assert_eq!(u16::from_le_bytes([frame[8], frame[9]]), 12);
        assert_eq!(u16::from_le_bytes([frame[10], frame[11]]), 3);
    }
}
