//! Per-block client handling: the listeners, the connection lifecycle and
//! the packet dispatch.
//!
//! Each accepted socket becomes a reader task plus a writer task; the
//! writer drains the client's outbound queue through the send cipher. The
//! welcome exchange runs in the clear, after which both directions are
//! encrypted with the negotiated seeds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use ragol_common::codec::{CipherState, RawPacket, ShipCodec};
use ragol_common::crypt::{BbCipher, PsoCipher};
use ragol_common::packets::{self, get_u32_le};
use ragol_common::shipgate as sg;
use ragol_common::text;
use ragol_common::version::{Language, Version};
use ragol_common::ItemData;

use crate::client::{self, Client, PlayerData, SessionStage};
use crate::commands;
use crate::lobby::{self, JoinError, LobbyType};
use crate::quests;
use crate::send;
use crate::ship::{Block, Ship};
use crate::subcmd;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Offsets of each version's listener on a block's port base.
fn version_port_offset(v: Version) -> u16 {
    match v {
        Version::DcNte | Version::Dcv1 | Version::Dcv2 => 0,
        Version::PcNte | Version::Pcv2 => 1,
        Version::Gc => 2,
        Version::Ep3 => 3,
        Version::BlueBurst => 4,
        Version::Xbox => 5,
    }
}

/// The listener versions a block opens (one listener covers all DC
/// flavors; the login packet refines which one it is).
const LISTENER_VERSIONS: [Version; 6] = [
    Version::Dcv1,
    Version::Pcv2,
    Version::Gc,
    Version::Ep3,
    Version::BlueBurst,
    Version::Xbox,
];

pub async fn spawn_listeners(ship: Arc<Ship>, block: Arc<Block>) -> std::io::Result<()> {
    for version in LISTENER_VERSIONS {
        if !ship.cfg.version_allowed(version) {
            continue;
        }

        let port = block.port + version_port_offset(version);
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("block {:02}: listening for {} on {}", block.b, version, port);

        let ship = ship.clone();
        let block = block.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, addr)) => {
                        debug!("block {:02}: connection from {}", block.b, addr);
                        tokio::spawn(client_task(
                            ship.clone(),
                            block.clone(),
                            socket,
                            version,
                        ));
                    }
                    Err(e) => {
                        warn!("block {:02}: accept error: {}", block.b, e);
                        return;
                    }
                }
            }
        });
    }

    Ok(())
}

fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// The pre-BB welcome: a fixed copyright string plus the two cipher seeds.
fn build_welcome(version: Version, server_seed: u32, client_seed: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(0x48);
    let copyright: &[u8] = b"DreamCast Port Map. Copyright SEGA Enterprises. 1999";

    body.extend_from_slice(copyright);
    body.resize(0x40, 0);
    body.extend_from_slice(&server_seed.to_le_bytes());
    body.extend_from_slice(&client_seed.to_le_bytes());

    send::build(version, packets::WELCOME_TYPE, 0, &body)
}

/// The Blue Burst welcome carries 48-byte seed blocks instead.
fn build_bb_welcome(server_seed: &[u8; 48], client_seed: &[u8; 48]) -> Vec<u8> {
    let mut body = Vec::with_capacity(0x60 + 96);
    let copyright: &[u8] =
        b"Phantasy Star Online Blue Burst Game Server. Copyright 1999-2004 SONICTEAM.";

    body.extend_from_slice(copyright);
    body.resize(0x60, 0);
    body.extend_from_slice(server_seed);
    body.extend_from_slice(client_seed);

    send::build(Version::BlueBurst, packets::BB_WELCOME_TYPE, 0, &body)
}

async fn client_task(ship: Arc<Ship>, block: Arc<Block>, socket: TcpStream, version: Version) {
    let addr = match socket.peer_addr() {
        Ok(a) => a,
        Err(_) => return,
    };

    // IP bans are enforced before anything is sent.
    if let Some(ban) = ship.bans.check_ip(addr.ip(), unix_now()) {
        debug!("refusing banned address {}: {}", addr, ban.reason);
        return;
    }

    let (read_half, mut write_half) = socket.into_split();

    // The welcome exchange, in the clear.
    let (welcome, recv_cipher, send_cipher) = if version.is_bb() {
        let mut server_seed = [0u8; 48];
        let mut client_seed = [0u8; 48];
        for b in server_seed.iter_mut() {
            *b = rand::random();
        }
        for b in client_seed.iter_mut() {
            *b = rand::random();
        }

        (
            build_bb_welcome(&server_seed, &client_seed),
            CipherState::Bb(BbCipher::new(&client_seed)),
            CipherState::Bb(BbCipher::new(&server_seed)),
        )
    } else {
        let server_seed: u32 = rand::random();
        let client_seed: u32 = rand::random();

        (
            build_welcome(version, server_seed, client_seed),
            CipherState::Pso(PsoCipher::new(client_seed)),
            CipherState::Pso(PsoCipher::new(server_seed)),
        )
    };

    if write_half.write_all(&welcome).await.is_err() {
        return;
    }

    // The decoder keeps the inbound cipher; the writer task owns the
    // outbound one. Packets queue as plaintext and encrypt on the way out.
    let mut codec = ShipCodec::new(version);
    codec.install_recv_cipher(recv_cipher);

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let c = Arc::new(Client::new(id, addr, block.b, version, tx));

    block.add_client(c.clone());
    ship.inc_clients();

    {
        let (clients, games) = ship.counts();
        ship.sg.send_cnt(clients, games);
    }

    let mut framed = FramedRead::new(read_half, codec);
    let writer_client = c.clone();

    let writer = tokio::spawn(async move {
        let mut cipher = send_cipher;

        while let Some(mut pkt) = rx.recv().await {
            cipher.apply(&mut pkt);

            if write_half.write_all(&pkt).await.is_err() {
                writer_client.disconnect();
                break;
            }
        }
    });

    // Reader loop with a coarse tick so the disconnect flag is observed
    // even on an idle connection.
    let mut check = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            pkt = framed.next() => {
                match pkt {
                    Some(Ok(pkt)) => {
                        if let Err(e) = handle_packet(&ship, &block, &c, pkt).await {
                            warn!("client {}: protocol error: {}", id, e);
                            send::send_msg_box(&c, "\tEProtocol error.\nDisconnected.");
                            c.disconnect();
                        }
                    }
                    Some(Err(e)) => {
                        debug!("client {}: codec error: {}", id, e);
                        break;
                    }
                    None => break,
                }
            }
            _ = check.tick() => {}
        }

        if c.is_disconnected() {
            break;
        }
    }

    teardown(&ship, &block, &c).await;

    // Let the writer flush any goodbye (ban boxes, error messages) before
    // it goes away.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    writer.abort();
}

/// Full client teardown: lobby removal (with leader re-election and burst
/// unlock), kill-count flush, shipgate logoff and roster cleanup.
async fn teardown(ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>) {
    let (gc, name, tracked, lobby) = {
        let mut cs = c.lock();
        cs.stage = SessionStage::Disconnecting;
        (
            cs.guildcard,
            cs.player.name.clone(),
            cs.flags & client::FLAG_TRACK_KILLS != 0,
            cs.cur_lobby.upgrade(),
        )
    };

    if let Some(l) = lobby {
        leave_lobby(ship, block, c, &l);
    }

    if tracked {
        flush_kills(ship, block, c);
    }

    if gc != 0 {
        ship.sg.send_block_login(false, gc, block.b, &name);
    }

    block.remove_client(c);
    ship.dec_clients();

    let (clients, games) = ship.counts();
    ship.sg.send_cnt(clients, games);

    info!("client {} ({}) disconnected from block {:02}", c.id, gc, c.block);
}

fn flush_kills(ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>) {
    let (gc, counts, version) = {
        let mut cs = c.lock();
        let counts = cs.enemy_kills;
        cs.enemy_kills = [0; client::KILL_COUNTERS];
        (cs.guildcard, counts, cs.version)
    };

    let (episode, difficulty) = {
        let lobby = { c.lock().cur_lobby.upgrade() };
        match lobby {
            Some(l) => {
                let st = l.lock();
                (st.episode, st.difficulty)
            }
            None => (1, 0),
        }
    };

    if counts.iter().any(|&k| k != 0) {
        ship.sg
            .send_mkill(gc, block.b, episode, difficulty, version, &counts);
    }
}

/// Remove a client from its lobby, running the whole departure protocol.
fn leave_lobby(ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>, l: &Arc<lobby::Lobby>) {
    let was_bursting = {
        let mut cs = c.lock();
        let b = cs.flags & client::FLAG_BURSTING != 0;
        cs.flags &= !client::FLAG_BURSTING;
        b
    };

    let (empty, left_slot) = {
        let mut st = l.lock();

        if was_bursting {
            st.flags &= !lobby::LOBBY_FLAG_BURSTING;
        }

        let slot = c.lock().client_id;
        let empty = lobby::remove_client_locked(&mut st, l.lobby_type, slot, c);

        if !empty {
            send::send_leave(&st, l.is_team(), slot);
        }

        (empty, slot)
    };

    // An interrupted burst releases the queues for whoever is left.
    if was_bursting && !empty {
        subcmd::finish_burst(ship, block, l, None);
    }

    let _ = left_slot;

    if empty {
        ship.hooks.execute(
            crate::scripts::ScriptAction::TeamDestroy,
            &[crate::scripts::ScriptArg::Lobby(l.lobby_id)],
        );

        block.remove_lobby(l.lobby_id);
        ship.dec_games();
    }

    if l.is_team() && c.lock().flags & client::FLAG_TRACK_KILLS != 0 {
        flush_kills(ship, block, c);
    }
}

/// Map a join rejection onto the message the client sees.
fn join_error_text(e: JoinError) -> &'static str {
    match e {
        JoinError::Full => "\tE\tC4That game is full.",
        JoinError::Bursting => "\tE\tC4A player is bursting.\nTry again.",
        JoinError::LevelTooLow => "\tE\tC4Your level is too low.",
        JoinError::LevelTooHigh => "\tE\tC4Your level is too high.",
        JoinError::V2Only => "\tE\tC4That game is for\nVersion 2 only.",
        JoinError::Questing => "\tE\tC4A quest is in progress.",
        JoinError::QuestSel => "\tE\tC4A quest is being\nselected.",
        JoinError::Legit => "\tE\tC4Game is in legit mode\nand you failed the check.",
        JoinError::TempUnavailable => "\tE\tC4That game is\nunavailable.",
        JoinError::DcOnly => "\tE\tC4That game is for\nDreamcast only.",
        JoinError::V1Only => "\tE\tC4That game is for\nVersion 1 only.",
        JoinError::PcOnly => "\tE\tC4That game is for\nPC only.",
        JoinError::SinglePlayer => "\tE\tC4That game is for\na single player.",
        JoinError::V1Class => "\tE\tC4Your class cannot\njoin Version 1 games.",
        JoinError::Internal => "\tE\tC4Try again later.",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet in wrong session stage")]
    WrongStage,
    #[error("malformed packet")]
    Malformed,
    #[error(transparent)]
    Subcmd(#[from] subcmd::SubcmdError),
}

async fn handle_packet(
    ship: &Arc<Ship>,
    block: &Arc<Block>,
    c: &Arc<Client>,
    pkt: RawPacket,
) -> Result<(), PacketError> {
    let stage = c.lock().stage;
    let body = &pkt.body[..];

    match pkt.hdr.pkt_type {
        packets::PING_TYPE => Ok(()),

        packets::LOGIN_93_TYPE
        | packets::LOGIN_9A_TYPE
        | packets::LOGIN_9D_TYPE
        | packets::LOGIN_9E_TYPE => {
            if stage != SessionStage::Handshake && stage != SessionStage::Login {
                return Err(PacketError::WrongStage);
            }

            handle_login(ship, block, c, pkt.hdr.pkt_type, body)
        }

        packets::CHAR_DATA_TYPE => {
            if stage != SessionStage::CharacterLoad && stage != SessionStage::InLobby {
                return Err(PacketError::WrongStage);
            }

            handle_char_data(ship, block, c, body)
        }

        packets::CHAT_TYPE => {
            if stage != SessionStage::InLobby && stage != SessionStage::InTeam {
                return Err(PacketError::WrongStage);
            }

            handle_chat(ship, block, c, body)
        }

        packets::GAME_COMMAND0_TYPE => {
            let lobby = { c.lock().cur_lobby.upgrade() };
            match lobby {
                Some(l) => Ok(subcmd::handle_bcast(ship, block, c, &l, body)?),
                None => Err(PacketError::WrongStage),
            }
        }

        packets::GAME_COMMAND2_TYPE | packets::GAME_COMMANDD_TYPE => {
            let lobby = { c.lock().cur_lobby.upgrade() };
            match lobby {
                Some(l) => Ok(subcmd::handle_one(
                    ship,
                    block,
                    c,
                    &l,
                    pkt.hdr.pkt_type,
                    (pkt.hdr.flags & 0xFF) as u8,
                    body,
                )?),
                None => Err(PacketError::WrongStage),
            }
        }

        packets::GAME_COMMANDC_TYPE => {
            // Ep3-specific traffic: route to Ep3 clients in the lobby.
            let lobby = { c.lock().cur_lobby.upgrade() };
            if let Some(l) = lobby {
                let st = l.lock();
                send::send_to_lobby(&st, Some(c), packets::GAME_COMMANDC_TYPE, 0, body, false);
            }
            Ok(())
        }

        packets::LOBBY_CHANGE_TYPE => {
            let item_id = get_u32_le(body, 4).ok_or(PacketError::Malformed)?;
            handle_lobby_change(ship, block, c, item_id)
        }

        packets::DC_GAME_CREATE_TYPE | packets::GAME_CREATE_TYPE => {
            if stage != SessionStage::InLobby {
                return Err(PacketError::WrongStage);
            }

            handle_game_create(ship, block, c, body)
        }

        packets::MENU_SELECT_TYPE => {
            let menu_id = get_u32_le(body, 0).ok_or(PacketError::Malformed)?;
            let item_id = get_u32_le(body, 4).ok_or(PacketError::Malformed)?;
            handle_menu_select(ship, block, c, menu_id, item_id, &body[8..])
        }

        packets::DONE_BURSTING_TYPE => handle_done_burst(ship, block, c),

        packets::LEAVE_GAME_PL_DATA_TYPE => {
            // Back to the lobby with refreshed character data.
            handle_char_data(ship, block, c, body)
        }

        packets::GUILD_SEARCH_TYPE => {
            let fw_type = forward_type(c.version());
            let gc = c.guildcard();
            ship.sg.forward(fw_type, 0, gc, block.b, body);
            Ok(())
        }

        packets::SIMPLE_MAIL_TYPE => {
            // Mail is mediated by the shipgate so blocklists apply there.
            let fw_type = forward_type(c.version());
            let gc = c.guildcard();
            ship.sg.forward(fw_type, 0, gc, block.b, body);
            Ok(())
        }

        packets::BLACKLIST_TYPE => {
            // The in-game blacklist: up to 30 guild cards.
            let mut cs = c.lock();
            cs.blocklist.clear();

            for chunk in body.chunks_exact(4).take(30) {
                let gc = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                if gc != 0 {
                    cs.blocklist.push(client::BlocklistEntry {
                        gc,
                        flags: 0xFFFF_FFFF,
                    });
                }
            }

            Ok(())
        }

        packets::AUTOREPLY_SET_TYPE | packets::AUTOREPLY_CLEAR_TYPE => Ok(()),

        packets::INFO_REQUEST_TYPE => {
            let item_id = get_u32_le(body, 4).ok_or(PacketError::Malformed)?;
            handle_info_request(block, c, item_id)
        }

        packets::BLOCK_LIST_REQ_TYPE => {
            let mut text = format!("\tE{}\n", ship.cfg.name);

            for b in ship.blocks.iter() {
                let n = b.num_clients.load(Ordering::Relaxed);
                text.push_str(&format!("BLOCK{:02} - {} users\n", b.b, n));
            }

            send::send_info_reply(c, &text);
            Ok(())
        }

        packets::QUEST_LIST_TYPE => {
            handle_quest_list(ship, c);
            Ok(())
        }

        packets::QUEST_LOAD_DONE_TYPE => Ok(()),

        other => {
            debug!("unhandled packet {:04x} from client {}", other, c.id);
            Ok(())
        }
    }
}

fn forward_type(v: Version) -> u16 {
    match v {
        Version::PcNte | Version::Pcv2 => sg::SHDR_TYPE_PC,
        Version::Gc => sg::SHDR_TYPE_GC,
        Version::Ep3 => sg::SHDR_TYPE_EP3,
        Version::Xbox => sg::SHDR_TYPE_XBOX,
        Version::BlueBurst => sg::SHDR_TYPE_BB,
        _ => sg::SHDR_TYPE_DC,
    }
}

fn handle_login(
    ship: &Arc<Ship>,
    block: &Arc<Block>,
    c: &Arc<Client>,
    pkt_type: u16,
    body: &[u8],
) -> Result<(), PacketError> {
    let gc = get_u32_le(body, 4).ok_or(PacketError::Malformed)?;

    // The DC listener serves both Dreamcast versions; the login packet
    // type tells them apart. The header shape doesn't change.
    if c.version() == Version::Dcv1
        && (pkt_type == packets::LOGIN_9A_TYPE || pkt_type == packets::LOGIN_9D_TYPE)
    {
        c.lock().version = Version::Dcv2;
    }

    // Guildcard bans take effect before anything else happens.
    if let Some(ban) = ship.bans.check_guildcard(gc, unix_now()) {
        let length = crate::bans::ban_length_text(ban.until, unix_now());
        send::send_msg_box(
            c,
            &format!(
                "\tEYou have been banned from this ship.\nLength: {}\n\n{}",
                length, ban.reason
            ),
        );
        c.disconnect();
        return Ok(());
    }

    {
        let mut cs = c.lock();
        cs.guildcard = gc;
        cs.stage = SessionStage::CharacterLoad;
    }

    debug!("client {} logged in with guildcard {}", c.id, gc);

    // Ask for the character data next.
    let version = c.version();
    c.send(send::build(version, packets::CHAR_DATA_REQUEST_TYPE, 0, &[]));

    let _ = block;
    Ok(())
}

/// The character blob layout the server reads fields from: the inventory
/// header and items, then the display data with level, name, section and
/// class at fixed offsets.
const INV_ITEM_COUNT_OFF: usize = 0;
const INV_ITEMS_OFF: usize = 4;
const INV_ITEM_SIZE: usize = 28;
const DISP_OFF: usize = 0x34C;
const DISP_LEVEL_OFF: usize = DISP_OFF + 0x10;
const DISP_NAME_OFF: usize = DISP_OFF + 0x20;
const DISP_SECTION_OFF: usize = DISP_OFF + 0x30;
const DISP_CLASS_OFF: usize = DISP_OFF + 0x31;

pub fn parse_player_data(version: Version, lang: Language, body: &[u8]) -> PlayerData {
    let mut pd = PlayerData {
        raw: body.to_vec(),
        ..Default::default()
    };

    if body.len() < DISP_OFF + 0x40 {
        return pd;
    }

    let count = (body[INV_ITEM_COUNT_OFF] as usize).min(30);
    for i in 0..count {
        let off = INV_ITEMS_OFF + i * INV_ITEM_SIZE;
        if off + INV_ITEM_SIZE > body.len() {
            break;
        }

        let dw = |o: usize| u32::from_le_bytes([body[o], body[o + 1], body[o + 2], body[o + 3]]);

        pd.inv.push(ItemData {
            data: [dw(off + 8), dw(off + 12), dw(off + 16)],
            item_id: dw(off + 20),
            data2: dw(off + 24),
        });
    }

    pd.level = u32::from_le_bytes([
        body[DISP_LEVEL_OFF],
        body[DISP_LEVEL_OFF + 1],
        body[DISP_LEVEL_OFF + 2],
        body[DISP_LEVEL_OFF + 3],
    ]);
    pd.name = text::decode_string(version, lang, &body[DISP_NAME_OFF..DISP_NAME_OFF + 16]);
    pd.section = body[DISP_SECTION_OFF] % 10;
    pd.ch_class = body[DISP_CLASS_OFF];

    pd
}

fn handle_char_data(
    ship: &Arc<Ship>,
    block: &Arc<Block>,
    c: &Arc<Client>,
    body: &[u8],
) -> Result<(), PacketError> {
    let (version, lang, gc, first_time) = {
        let cs = c.lock();
        (
            cs.version,
            cs.language,
            cs.guildcard,
            cs.stage == SessionStage::CharacterLoad,
        )
    };

    let pd = parse_player_data(version, lang, body);
    let name = pd.name.clone();

    {
        let mut cs = c.lock();
        cs.items = pd.inv.clone();
        cs.player = pd;
        cs.stage = SessionStage::InBlock;
    }

    if first_time {
        ship.sg.send_block_login(true, gc, block.b, &name);
        ship.hooks.execute(
            crate::scripts::ScriptAction::ClientLogin,
            &[crate::scripts::ScriptArg::Client(gc)],
        );

        // Auto backups happen silently on entry.
        if c.lock().flags & client::FLAG_AUTO_BACKUP != 0 {
            let raw = c.lock().player.raw.clone();
            ship.sg.send_cbkup(gc, block.b, &name, &raw);
        }
    }

    // Leaving a game re-sends character data; clear the old lobby before
    // landing back in a default one.
    let old = { c.lock().cur_lobby.upgrade() };
    if let Some(old) = old {
        leave_lobby(ship, block, c, &old);
    }

    // Land the client in the first default lobby with space.
    add_to_default_lobby(ship, block, c, None)
}

fn add_to_default_lobby(
    ship: &Arc<Ship>,
    block: &Arc<Block>,
    c: &Arc<Client>,
    preferred: Option<u32>,
) -> Result<(), PacketError> {
    let version = c.version();
    let lobbies = block.lobbies.read().unwrap_or_else(|e| e.into_inner());

    let candidates: Vec<Arc<lobby::Lobby>> = preferred
        .and_then(|id| lobbies.iter().find(|l| l.lobby_id == id).cloned())
        .into_iter()
        .chain(lobbies.iter().cloned())
        .collect();

    drop(lobbies);

    for l in candidates {
        if l.is_team() {
            continue;
        }

        // V1 clients can't see lobbies past 10.
        if version == Version::Dcv1 && l.lobby_id > 10 {
            continue;
        }

        // Ep3 lobbies are for Ep3 clients.
        if l.lobby_id > 15 && version != Version::Ep3 {
            continue;
        }

        let mut st = l.lock();

        if st.num_clients >= st.max_clients {
            continue;
        }

        if lobby::add_client_locked(&mut st, &l, LobbyType::Default, c).is_ok() {
            drop(st);

            send::send_lobby_join(c, &l);
            send::send_add_player(&l, c);

            let name = l.lock().name.clone();
            ship.sg.send_lobby_chg(c.guildcard(), l.lobby_id, &name);
            return Ok(());
        }
    }

    send::send_msg_box(c, "\tEThe block is full.\nTry another block.");
    c.disconnect();
    Ok(())
}

fn handle_chat(
    ship: &Arc<Ship>,
    block: &Arc<Block>,
    c: &Arc<Client>,
    body: &[u8],
) -> Result<(), PacketError> {
    if body.len() < 8 {
        return Err(PacketError::Malformed);
    }

    let (version, lang, gc, name, muted) = {
        let cs = c.lock();
        (
            cs.version,
            cs.language,
            cs.guildcard,
            cs.player.name.clone(),
            cs.flags & client::FLAG_STFU != 0,
        )
    };

    let msg = text::decode_string(version, lang, &body[8..]);

    // Strip the leading language tag ("\tE" / "\tJ") for command parsing.
    let stripped = msg
        .strip_prefix("\tE")
        .or_else(|| msg.strip_prefix("\tJ"))
        .unwrap_or(&msg);

    if let Some(cmdline) = stripped.strip_prefix('/') {
        commands::handle_command(ship, block, c, cmdline);
        return Ok(());
    }

    // Muted clients think they're talking; nobody else hears them.
    if muted {
        return Ok(());
    }

    let lobby = { c.lock().cur_lobby.upgrade() };
    if let Some(l) = lobby {
        let st = l.lock();

        for member in st.clients[..st.max_clients].iter().flatten() {
            if Arc::ptr_eq(member, c) {
                continue;
            }

            let skip = {
                let ms = member.lock();
                ms.ignores(gc) || ms.blocklist_blocks(gc, sg::BLOCKLIST_CHAT)
            };

            if !skip {
                send::send_chat(member, gc, &name, &msg);
            }
        }
    }

    Ok(())
}

fn handle_lobby_change(
    ship: &Arc<Ship>,
    block: &Arc<Block>,
    c: &Arc<Client>,
    item_id: u32,
) -> Result<(), PacketError> {
    let target = block.get_lobby(item_id);

    let old = { c.lock().cur_lobby.upgrade() };

    let target = match target {
        Some(t) if !t.is_team() => t,
        _ => {
            send::send_txt(c, "\tE\tC4That lobby does\nnot exist.");
            return Ok(());
        }
    };

    {
        let st = target.lock();
        if st.num_clients >= st.max_clients {
            send::send_txt(c, "\tE\tC4That lobby is full.");
            return Ok(());
        }
    }

    if let Some(old) = old {
        leave_lobby(ship, block, c, &old);
    }

    add_to_default_lobby(ship, block, c, Some(target.lobby_id))
}

fn handle_game_create(
    ship: &Arc<Ship>,
    block: &Arc<Block>,
    c: &Arc<Client>,
    body: &[u8],
) -> Result<(), PacketError> {
    // Layout: menu tags, then name[16], password[16], then the flags.
    if body.len() < 42 {
        return Err(PacketError::Malformed);
    }

    let (version, lang) = {
        let cs = c.lock();
        (cs.version, cs.language)
    };

    let name = text::decode_string(version, lang, &body[8..24]);
    let passwd = text::decode_string(version, lang, &body[24..40]);
    let difficulty = body[40];
    let battle = body.get(41).copied().unwrap_or(0) != 0;
    let challenge = body.get(42).copied().unwrap_or(0) != 0;
    let episode = body.get(43).copied().unwrap_or(1).max(1);
    let single_player = body.get(44).copied().unwrap_or(0) != 0;
    let v2 = version == Version::Dcv2 || version == Version::Pcv2;

    let section = c.lock().player.section;
    let event = ship.game_event.load(Ordering::Relaxed) as u8;

    let lobby_id = block.alloc_lobby_id();

    let l = {
        let mut rng = block.rng.lock().unwrap_or_else(|e| e.into_inner());

        if version == Version::Ep3 {
            lobby::create_ep3_game(block.b, lobby_id, &mut rng, name, passwd, section, event)
        } else {
            lobby::create_game(
                block.b,
                lobby_id,
                &mut rng,
                lobby::CreateGameParams {
                    name,
                    passwd,
                    difficulty: difficulty.min(3),
                    battle,
                    challenge,
                    v2,
                    version,
                    section,
                    event,
                    episode,
                    single_player,
                },
                c,
            )
        }
    };

    // Load the enemy data for the version's map set.
    {
        let mut st = l.lock();
        let selections = st.maps;
        let difficulty = st.difficulty;
        let ev = st.event;

        let loaded = match version {
            Version::BlueBurst => ship.maps_bb.as_ref().and_then(|m| {
                let solo = single_player as usize;
                let ep = (st.episode.max(1) as usize - 1).min(2);
                crate::map::load_game_enemies(&m.areas[solo][ep], &selections, difficulty, ev).ok()
            }),
            Version::Gc => ship.maps_gc.as_ref().and_then(|m| {
                let ep = (st.episode.max(1) as usize - 1).min(1);
                crate::map::load_game_enemies(&m.areas[ep], &selections, difficulty, ev).ok()
            }),
            Version::Ep3 => None,
            _ => ship.maps_v2.as_ref().and_then(|m| {
                crate::map::load_game_enemies(&m.areas, &selections, difficulty, ev).ok()
            }),
        };

        if let Some((enemies, objects)) = loaded {
            st.map_enemies = Some(enemies);
            st.map_objects = Some(objects);
        }
    }

    lobby::setup_drops(&l, c, &ship.drop_data_availability());

    block.add_lobby(l.clone());
    ship.inc_games();

    ship.hooks.execute(
        crate::scripts::ScriptAction::TeamCreate,
        &[
            crate::scripts::ScriptArg::Client(c.guildcard()),
            crate::scripts::ScriptArg::Lobby(lobby_id),
        ],
    );

    // Move the creator out of their lobby and into the new team.
    let old = { c.lock().cur_lobby.upgrade() };
    if let Some(old) = old {
        leave_lobby(ship, block, c, &old);
    }

    {
        let mut st = l.lock();
        if lobby::add_client_locked(&mut st, &l, l.lobby_type, c).is_err() {
            drop(st);
            send::send_txt(c, "\tE\tC4Try again later.");
            return add_to_default_lobby(ship, block, c, None);
        }
    }

    send::send_game_join(c, &l);

    let name = l.lock().name.clone();
    ship.sg.send_lobby_chg(c.guildcard(), lobby_id, &name);

    let (clients, games) = ship.counts();
    ship.sg.send_cnt(clients, games);

    Ok(())
}

/// Menu namespaces for MENU_SELECT.
const MENU_ID_BLOCK: u32 = 0x0000_0001;
const MENU_ID_GAME: u32 = 0x0000_0002;
const MENU_ID_QUEST: u32 = 0x0000_0004;

fn handle_menu_select(
    ship: &Arc<Ship>,
    block: &Arc<Block>,
    c: &Arc<Client>,
    menu_id: u32,
    item_id: u32,
    rest: &[u8],
) -> Result<(), PacketError> {
    match menu_id & 0xFF {
        MENU_ID_BLOCK => {
            // Bounce the client over to the chosen block's listener for
            // its version.
            let Some(target) = ship.block(item_id) else {
                send::send_txt(c, "\tE\tC4That block does\nnot exist.");
                return Ok(());
            };

            let port = target.port + version_port_offset(c.version());
            c.lock().stage = SessionStage::Redirect;
            send::send_redirect(c, ship.cfg.ship_addr4, port);
            c.disconnect();
            Ok(())
        }
        MENU_ID_GAME => handle_game_join(ship, block, c, item_id, rest),
        MENU_ID_QUEST => {
            let lobby = { c.lock().cur_lobby.upgrade() };
            let Some(l) = lobby else {
                return Err(PacketError::WrongStage);
            };

            let lang = c.lock().quest_lang.code();
            let quests = ship.quests.read().unwrap_or_else(|e| e.into_inner()).clone();

            match quests::setup_quest(&quests, ship.cfg.quests_dir.as_ref(), &l, item_id, lang) {
                Ok(()) => {
                    ship.hooks.execute(
                        crate::scripts::ScriptAction::QuestLoad,
                        &[
                            crate::scripts::ScriptArg::Lobby(l.lobby_id),
                            crate::scripts::ScriptArg::Uint(item_id as u64),
                        ],
                    );

                    // Kill counters flush before the quest changes what
                    // counts.
                    let st = l.lock();
                    let members: Vec<Arc<Client>> =
                        st.clients[..st.max_clients].iter().flatten().cloned().collect();
                    drop(st);

                    for member in members {
                        if member.lock().flags & client::FLAG_TRACK_KILLS != 0 {
                            flush_kills(ship, block, &member);
                        }
                    }

                    Ok(())
                }
                Err(e) => {
                    warn!("quest setup failed: {}", e);
                    send::send_txt(c, "\tE\tC4Quest info\nmissing.\n\nReport this to\nthe ship admin.");
                    Ok(())
                }
            }
        }
        _ => {
            debug!("unhandled menu select {:08x}/{:08x}", menu_id, item_id);
            Ok(())
        }
    }
}

fn handle_game_join(
    ship: &Arc<Ship>,
    block: &Arc<Block>,
    c: &Arc<Client>,
    item_id: u32,
    rest: &[u8],
) -> Result<(), PacketError> {
    let Some(l) = block.get_lobby(item_id) else {
        send::send_txt(c, "\tE\tC4That game no\nlonger exists.");
        return Ok(());
    };

    if !l.is_team() {
        return Err(PacketError::Malformed);
    }

    let override_checks = {
        let mut cs = c.lock();
        let o = cs.flags & client::FLAG_OVERRIDE_GAME != 0;
        cs.flags &= !client::FLAG_OVERRIDE_GAME;
        o
    };

    {
        let st = l.lock();

        // Password first, unless overridden.
        if !st.passwd.is_empty() && !override_checks {
            let (version, lang) = {
                let cs = c.lock();
                (cs.version, cs.language)
            };
            let given = text::decode_string(version, lang, rest);

            if given.trim_end_matches('\0') != st.passwd {
                drop(st);
                send::send_txt(c, "\tE\tC4Wrong password.");
                return Ok(());
            }
        }

        if let Err(e) = lobby::check_join(&st, c, override_checks) {
            drop(st);
            send::send_txt(c, join_error_text(e));
            return Ok(());
        }

        if st.flags & lobby::LOBBY_FLAG_LEGIT_MODE != 0
            && !lobby::check_client_legit(&st, c)
            && !override_checks
        {
            drop(st);
            send::send_txt(c, join_error_text(JoinError::Legit));
            return Ok(());
        }
    }

    let old = { c.lock().cur_lobby.upgrade() };
    if let Some(old) = old {
        leave_lobby(ship, block, c, &old);
    }

    {
        let mut st = l.lock();
        match lobby::add_client_locked(&mut st, &l, l.lobby_type, c) {
            Ok(_) => {
                st.flags |= lobby::LOBBY_FLAG_BURSTING;
            }
            Err(e) => {
                drop(st);
                send::send_txt(c, join_error_text(e));
                return add_to_default_lobby(ship, block, c, None);
            }
        }
    }

    {
        let mut cs = c.lock();
        cs.flags |= client::FLAG_BURSTING;
        cs.enemy_kills = [0; client::KILL_COUNTERS];
    }

    ship.hooks.execute(
        crate::scripts::ScriptAction::TeamJoin,
        &[
            crate::scripts::ScriptArg::Client(c.guildcard()),
            crate::scripts::ScriptArg::Lobby(l.lobby_id),
        ],
    );

    send::send_game_join(c, &l);
    send::send_add_player(&l, c);

    // Anything earlier bursters produced gets replayed to this joiner.
    subcmd::resend_burst(&l, c);

    let name = l.lock().name.clone();
    ship.sg.send_lobby_chg(c.guildcard(), l.lobby_id, &name);

    Ok(())
}

fn handle_done_burst(
    ship: &Arc<Ship>,
    block: &Arc<Block>,
    c: &Arc<Client>,
) -> Result<(), PacketError> {
    let lobby = { c.lock().cur_lobby.upgrade() };
    let Some(l) = lobby else {
        return Err(PacketError::WrongStage);
    };

    {
        let mut cs = c.lock();
        if cs.flags & client::FLAG_BURSTING == 0 {
            return Err(PacketError::WrongStage);
        }
        cs.flags &= !client::FLAG_BURSTING;
    }

    l.lock().flags &= !lobby::LOBBY_FLAG_BURSTING;

    subcmd::finish_burst(ship, block, &l, Some(c));
    Ok(())
}

fn handle_info_request(
    block: &Arc<Block>,
    c: &Arc<Client>,
    item_id: u32,
) -> Result<(), PacketError> {
    match block.get_lobby(item_id) {
        Some(l) => {
            let st = l.lock();
            let mut text = format!(
                "\tE{}\n{}/{}  Difficulty: {}\nLevels: {}+",
                st.name,
                st.num_clients,
                st.max_clients,
                ["Normal", "Hard", "Very Hard", "Ultimate"][st.difficulty as usize & 3],
                st.min_level,
            );

            for member in st.clients[..st.max_clients].iter().flatten() {
                let ms = member.lock();
                text.push_str(&format!("\n{} Lv{}", ms.player.name, ms.player.level + 1));
            }

            drop(st);
            send::send_info_reply(c, &text);
        }
        None => send::send_info_reply(c, "\tEGame no longer exists."),
    }

    Ok(())
}

fn handle_quest_list(ship: &Arc<Ship>, c: &Arc<Client>) {
    let quests = ship.quests.read().unwrap_or_else(|e| e.into_inner());

    if quests.is_empty() {
        send::send_txt(c, "\tE\tC4Quests not\nconfigured.");
        return;
    }

    // The menu itself is version-specific UI; a text list keeps the
    // selection ids visible for MENU_SELECT.
    send::send_txt(c, "\tE\tC7Select a quest from\nthe menu.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_data_parses_the_fixed_offsets() {
        let mut blob = vec![0u8; 0x400];
        blob[INV_ITEM_COUNT_OFF] = 1;
        // One item: a saber (code 0x0000_0100) with id 0x10001.
        blob[INV_ITEMS_OFF + 8..INV_ITEMS_OFF + 12].copy_from_slice(&0x0000_0100u32.to_le_bytes());
        blob[INV_ITEMS_OFF + 20..INV_ITEMS_OFF + 24].copy_from_slice(&0x0001_0001u32.to_le_bytes());

        blob[DISP_LEVEL_OFF..DISP_LEVEL_OFF + 4].copy_from_slice(&41u32.to_le_bytes());
        blob[DISP_NAME_OFF..DISP_NAME_OFF + 5].copy_from_slice(b"Alice");
        blob[DISP_SECTION_OFF] = 9;
        blob[DISP_CLASS_OFF] = 2;

        let pd = parse_player_data(Version::Dcv2, Language::English, &blob);
        assert_eq!(pd.level, 41);
        assert_eq!(pd.name, "Alice");
        assert_eq!(pd.section, 9);
        assert_eq!(pd.ch_class, 2);
        assert_eq!(pd.inv.len(), 1);
        assert_eq!(pd.inv[0].data[0], 0x0000_0100);
        assert_eq!(pd.inv[0].item_id, 0x0001_0001);
    }

    #[test]
    fn short_blobs_stay_opaque() {
        let pd = parse_player_data(Version::Dcv2, Language::English, &[0u8; 16]);
        assert_eq!(pd.level, 0);
        assert!(pd.inv.is_empty());
        assert_eq!(pd.raw.len(), 16);
    }

    #[test]
    fn join_errors_have_distinct_messages() {
        // The cross-version errors name the version they're locked to.
        assert!(join_error_text(JoinError::PcOnly).contains("PC"));
        assert!(join_error_text(JoinError::DcOnly).contains("Dreamcast"));
        assert!(join_error_text(JoinError::V1Only).contains("Version 1"));
        assert!(join_error_text(JoinError::V2Only).contains("Version 2"));
    }
}
