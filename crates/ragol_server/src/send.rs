//! Outbound packet builders.
//!
//! Every builder returns a fully framed, padded byte buffer in the target
//! client's header shape; encryption happens in the codec when the writer
//! task flushes. Text is converted to the client's encoding here.

use ragol_common::packets::{self, PacketHeader};
use ragol_common::text;
use ragol_common::version::{Language, Version};

use crate::client::Client;
use crate::lobby::{Lobby, LobbyState};

/// Frame a packet for `version` from a raw body.
pub fn build(version: Version, pkt_type: u16, flags: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(version.header_len() + body.len() + 8);

    let hdr = PacketHeader {
        pkt_type,
        flags,
        pkt_len: (version.header_len() + body.len()) as u16,
    };

    hdr.write(version, &mut out);
    out.extend_from_slice(body);
    packets::pad_packet(version, &mut out);
    out
}

/// An in-chat text line (the coloured `\tE\tC7...` strings).
pub fn send_txt(c: &Client, msg: &str) {
    let st = c.lock();
    let version = st.version;
    let lang = st.language;
    drop(st);

    let mut body = text::encode_string(version, lang, msg);
    body.push(0);
    if version.has_pc_header() || version.is_bb() {
        body.push(0);
    }

    c.send(build(version, packets::TEXT_MSG_TYPE, 0, &body));
}

/// A modal message box; used for bans and protocol errors right before a
/// disconnect.
pub fn send_msg_box(c: &Client, msg: &str) {
    let st = c.lock();
    let version = st.version;
    let lang = st.language;
    drop(st);

    let mut body = text::encode_string(version, lang, msg);
    body.push(0);
    if version.has_pc_header() || version.is_bb() {
        body.push(0);
    }

    c.send(build(version, packets::MSG_BOX_TYPE, 0, &body));
}

/// Simple (unformatted) lobby chat from another player.
pub fn send_chat(c: &Client, from_gc: u32, from_name: &str, msg: &str) {
    let st = c.lock();
    let version = st.version;
    let lang = st.language;
    drop(st);

    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(&from_gc.to_le_bytes());

    let line = format!("{}\t{}", from_name, msg);
    body.extend(text::encode_string(version, lang, &line));
    body.push(0);
    if version.has_pc_header() || version.is_bb() {
        body.push(0);
    }

    c.send(build(version, packets::CHAT_TYPE, 0, &body));
}

/// The ping the server sends periodically; clients echo it back.
pub fn send_ping(c: &Client) {
    let version = c.version();
    c.send(build(version, packets::PING_TYPE, 0, &[]));
}

/// A redirect to another address/port (used at login to bounce the client
/// to its block).
pub fn send_redirect(c: &Client, addr: std::net::Ipv4Addr, port: u16) {
    let version = c.version();

    let mut body = Vec::new();
    body.extend_from_slice(&addr.octets());
    body.extend_from_slice(&port.to_le_bytes());
    body.extend_from_slice(&[0u8; 2]);

    c.send(build(version, packets::REDIRECT_TYPE, 0, &body));
}

/// Game/lobby join headers share a small per-member entry. This builds
/// the slimmed form every version understands for the packets the server
/// synthesises; per-version player blobs ride along opaquely.
fn member_entry(version: Version, slot: u8, gc: u32, name: &str, lang: Language) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(slot as u32).to_le_bytes());
    out.extend_from_slice(&gc.to_le_bytes());

    let mut name_bytes = text::encode_string(version, lang, name);
    name_bytes.resize(if version.has_pc_header() || version.is_bb() { 32 } else { 16 }, 0);
    out.extend_from_slice(&name_bytes);
    out
}

/// Tell a client it has joined a (default) lobby: its slot, the leader and
/// the current membership.
pub fn send_lobby_join(c: &Client, l: &Lobby) {
    let st = l.lock();
    let (version, lang, my_slot) = {
        let cs = c.lock();
        (cs.version, cs.language, cs.client_id)
    };

    let mut body = Vec::new();
    body.push(my_slot);
    body.push(st.leader_id);
    body.push(0); // disable udp
    body.push((l.lobby_id & 0xFF) as u8);
    body.extend_from_slice(&(l.block as u16).to_le_bytes());
    body.extend_from_slice(&(st.event as u16).to_le_bytes());

    for (slot, member) in st.clients.iter().enumerate() {
        if let Some(member) = member {
            let ms = member.lock();
            body.extend(member_entry(version, slot as u8, ms.guildcard, &ms.player.name, lang));
        }
    }

    c.send(build(version, packets::LOBBY_JOIN_TYPE, st.num_clients as u32, &body));
}

/// Tell a client it has joined a team.
pub fn send_game_join(c: &Client, l: &Lobby) {
    let st = l.lock();
    let (version, lang, my_slot) = {
        let cs = c.lock();
        (cs.version, cs.language, cs.client_id)
    };

    let mut body = Vec::new();

    for pair in st.maps.iter() {
        body.extend_from_slice(&pair.to_le_bytes());
    }

    body.push(my_slot);
    body.push(st.leader_id);
    body.push(1); // disable udp
    body.push(st.difficulty);
    body.push(st.battle as u8);
    body.push(st.event);
    body.push(st.section);
    body.push(st.challenge as u8);
    body.extend_from_slice(&st.rand_seed.to_le_bytes());
    body.push(st.episode);
    body.push(if st.flags & crate::lobby::LOBBY_FLAG_SINGLEPLAYER != 0 { 1 } else { 0 });
    body.extend_from_slice(&[0u8; 2]);

    for (slot, member) in st.clients.iter().take(st.max_clients).enumerate() {
        if let Some(member) = member {
            let ms = member.lock();
            body.extend(member_entry(version, slot as u8, ms.guildcard, &ms.player.name, lang));
        }
    }

    c.send(build(version, packets::GAME_JOIN_TYPE, st.num_clients as u32, &body));
}

/// Announce a new arrival to everyone already in the lobby/team.
pub fn send_add_player(l: &Lobby, joiner: &Client) {
    let st = l.lock();
    let (gc, name, slot) = {
        let js = joiner.lock();
        (js.guildcard, js.player.name.clone(), js.client_id)
    };

    let pkt_type = if l.is_team() {
        packets::GAME_ADD_PLAYER_TYPE
    } else {
        packets::LOBBY_ADD_PLAYER_TYPE
    };

    for member in st.clients[..st.max_clients].iter().flatten() {
        if std::ptr::eq(member.as_ref() as *const Client, joiner as *const Client) {
            continue;
        }

        let (version, lang) = {
            let ms = member.lock();
            (ms.version, ms.language)
        };

        let mut body = Vec::new();
        body.push(slot);
        body.push(st.leader_id);
        body.push(0);
        body.push((l.lobby_id & 0xFF) as u8);
        body.extend_from_slice(&[0u8; 4]);
        body.extend(member_entry(version, slot, gc, &name, lang));

        member.send(build(version, pkt_type, 1, &body));
    }
}

/// Announce a departure, with the (possibly re-elected) leader.
pub fn send_leave(l_state: &LobbyState, is_team: bool, left_slot: u8) {
    let pkt_type = if is_team {
        packets::GAME_LEAVE_TYPE
    } else {
        packets::LOBBY_LEAVE_TYPE
    };

    for member in l_state.clients[..l_state.max_clients].iter().flatten() {
        let version = member.version();

        let mut body = Vec::new();
        body.push(left_slot);
        body.push(l_state.leader_id);
        body.extend_from_slice(&[0u8; 2]);

        member.send(build(version, pkt_type, left_slot as u32, &body));
    }
}

/// Broadcast a raw game packet (0x60/0x62/0x6D body) to lobby members,
/// skipping the sender and anyone ignoring them.
pub fn send_to_lobby(
    l_state: &LobbyState,
    sender: Option<&std::sync::Arc<Client>>,
    pkt_type: u16,
    flags: u32,
    body: &[u8],
    ignore_check: bool,
) {
    let sender_gc = sender.map(|s| s.guildcard()).unwrap_or(0);

    for member in l_state.clients[..l_state.max_clients].iter().flatten() {
        if let Some(sender) = sender {
            if std::sync::Arc::ptr_eq(member, sender) {
                continue;
            }
        }

        let ms = member.lock();
        if ignore_check && ms.ignores(sender_gc) {
            continue;
        }

        let version = ms.version;
        drop(ms);

        member.send(build(version, pkt_type, flags, body));
    }
}

/// A sub-command frame to one specific client.
pub fn send_subcmd(c: &Client, pkt_type: u16, flags: u32, body: &[u8]) {
    let version = c.version();
    c.send(build(version, pkt_type, flags, body));
}

/// The sub-command announcing a generated item drop to the whole team.
pub fn build_item_drop_subcmd(area: u8, entity_id: u16, item: [u32; 4], item_id: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(crate::subcmd::SUBCMD_ITEMDROP);
    body.push(0x07); // size in dwords
    body.extend_from_slice(&entity_id.to_le_bytes());
    body.push(area);
    body.push(0);
    body.extend_from_slice(&entity_id.to_le_bytes());
    body.extend_from_slice(&item[0].to_le_bytes());
    body.extend_from_slice(&item[1].to_le_bytes());
    body.extend_from_slice(&item[2].to_le_bytes());
    body.extend_from_slice(&item_id.to_le_bytes());
    body.extend_from_slice(&item[3].to_le_bytes());
    body
}

/// Warp one client to an area, via a directed game command.
pub fn send_warp(c: &Client, area: u8) {
    let slot = c.lock().client_id;

    let mut body = Vec::new();
    body.push(0x94); // warp sub-command
    body.push(0x02);
    body.push(slot);
    body.push(0);
    body.extend_from_slice(&(area as u32).to_le_bytes());

    send_subcmd(c, packets::GAME_COMMAND2_TYPE, slot as u32, &body);
}

/// A synced quest register write (sent to late joiners).
pub fn send_sync_register(c: &Client, reg: u8, value: u32) {
    let mut body = Vec::new();
    body.push(crate::subcmd::SUBCMD_SYNC_REG);
    body.push(0x03);
    body.extend_from_slice(&0u16.to_le_bytes());
    body.push(reg);
    body.extend_from_slice(&[0u8; 3]);
    body.extend_from_slice(&value.to_le_bytes());

    send_subcmd(c, packets::GAME_COMMAND0_TYPE, 0, &body);
}

/// Per-lobby arrow colour list.
pub fn send_arrows(l: &Lobby) {
    let st = l.lock();

    let mut body = Vec::new();
    for member in st.clients[..st.max_clients].iter().flatten() {
        let ms = member.lock();
        body.extend_from_slice(&0u32.to_le_bytes()); // tag
        body.extend_from_slice(&ms.guildcard.to_le_bytes());
        body.extend_from_slice(&(ms.arrow as u32).to_le_bytes());
    }

    for member in st.clients[..st.max_clients].iter().flatten() {
        let version = member.version();
        member.send(build(
            version,
            packets::LOBBY_ARROW_LIST_TYPE,
            st.num_clients as u32,
            &body,
        ));
    }
}

/// An info-reply window (menu hover text, /list output...).
pub fn send_info_reply(c: &Client, msg: &str) {
    let st = c.lock();
    let version = st.version;
    let lang = st.language;
    drop(st);

    let mut body = vec![0u8; 4];
    body.extend(text::encode_string(version, lang, msg));
    body.push(0);
    if version.has_pc_header() || version.is_bb() {
        body.push(0);
    }

    c.send(build(version, packets::INFO_REPLY_TYPE, 0, &body));
}

/// Ask the client to show a lobby-name banner.
pub fn send_lobby_name(c: &Client, name: &str) {
    let st = c.lock();
    let version = st.version;
    let lang = st.language;
    drop(st);

    let mut body = text::encode_string(version, lang, name);
    body.push(0);
    if version.has_pc_header() || version.is_bb() {
        body.push(0);
    }

    c.send(build(version, packets::LOBBY_NAME_TYPE, 0, &body));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framed_packets_are_padded_per_version() {
        let pkt = build(Version::Gc, packets::TEXT_MSG_TYPE, 0, b"hi");
        assert_eq!(pkt.len() % 8, 0);
        // Header carries the unpadded length.
        let hdr = PacketHeader::parse(Version::Gc, &pkt);
        assert_eq!(hdr.pkt_len, 6);

        let pkt = build(Version::BlueBurst, packets::TEXT_MSG_TYPE, 0, b"hello");
        assert_eq!(pkt.len() % 4, 0);
    }

    #[test]
    fn item_drop_subcmd_layout() {
        let body = build_item_drop_subcmd(1, 7, [0x0000_3302, 0x80, 0, 0], 0xF000_0001);
        assert_eq!(body[0], crate::subcmd::SUBCMD_ITEMDROP);
        assert_eq!(body[1], 0x07);
        assert_eq!(body.len(), 0x07 * 4);
        // The item dwords sit after the 8-byte preamble, then the item id
        // and the fourth data dword.
        assert_eq!(&body[8..12], &0x0000_3302u32.to_le_bytes());
        assert_eq!(&body[20..24], &0xF000_0001u32.to_le_bytes());
        assert_eq!(&body[24..28], &0u32.to_le_bytes());
    }
}
