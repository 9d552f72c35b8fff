//! The /command dispatcher.
//!
//! Chat lines starting with a slash parse into `(trigger, params)` and
//! dispatch by exact match. Each handler carries its own privilege and
//! context checks, mirrored from the original command set; invalid
//! invocations answer with a coloured chat line. Unknown commands are
//! offered to the script hooks before being rejected.

use std::sync::Arc;

use once_cell::sync::Lazy;

use ragol_common::shipgate as sg;
use ragol_common::Version;

use crate::bans::{BanEntry, BAN_PERMANENT};
use crate::client::{self, Client};
use crate::lobby;
use crate::scheduler::ShutdownKind;
use crate::scripts::{HookResult, ScriptAction, ScriptArg};
use crate::send;
use crate::ship::{Block, Ship};

type CmdHandler = fn(&Arc<Ship>, &Arc<Block>, &Arc<Client>, &str);

struct Command {
    trigger: &'static str,
    handler: CmdHandler,
}

macro_rules! command_table {
    ($(($name:literal, $hnd:ident)),* $(,)?) => {
        static COMMANDS: Lazy<Vec<Command>> = Lazy::new(|| vec![
            $(Command { trigger: $name, handler: $hnd }),*
        ]);
    };
}

command_table![
    ("warp", handle_warp),
    ("warpall", handle_warpall),
    ("kill", handle_kill),
    ("minlvl", handle_min_level),
    ("maxlvl", handle_max_level),
    ("bstat", handle_bstat),
    ("bcast", handle_bcast),
    ("arrow", handle_arrow),
    ("login", handle_login),
    ("item", handle_item),
    ("item4", handle_item4),
    ("event", handle_event),
    ("gameevent", handle_gameevent),
    ("passwd", handle_passwd),
    ("lname", handle_lname),
    ("clinfo", handle_clinfo),
    ("list", handle_list),
    ("legit", handle_legit),
    ("normal", handle_normal),
    ("shutdown", handle_shutdown),
    ("restart", handle_restart),
    ("log", handle_log),
    ("endlog", handle_endlog),
    ("friendadd", handle_friendadd),
    ("frienddel", handle_frienddel),
    ("friends", handle_friends),
    ("dconly", handle_dconly),
    ("v1only", handle_v1only),
    ("showdcpc", handle_showdcpc),
    ("allowgc", handle_allowgc),
    ("stfu", handle_stfu),
    ("unstfu", handle_unstfu),
    ("ignore", handle_ignore),
    ("unignore", handle_unignore),
    ("quit", handle_quit),
    ("gban:d", handle_gban_d),
    ("gban:w", handle_gban_w),
    ("gban:m", handle_gban_m),
    ("gban:p", handle_gban_p),
    ("ban:d", handle_ban_d),
    ("ban:w", handle_ban_w),
    ("ban:m", handle_ban_m),
    ("ban:p", handle_ban_p),
    ("unban", handle_unban),
    ("cc", handle_cc),
    ("qlang", handle_qlang),
    ("logout", handle_logout),
    ("override", handle_override),
    ("ver", handle_ver),
    ("search", handle_search),
    ("maps", handle_maps),
    ("showmaps", handle_showmaps),
    ("sdrops", handle_sdrops),
    ("gcprotect", handle_gcprotect),
    ("trackkill", handle_trackkill),
    ("trackinv", handle_trackinv),
    ("save", handle_save),
    ("restore", handle_restore),
    ("restorebk", handle_restorebk),
    ("enablebk", handle_enablebk),
    ("disablebk", handle_disablebk),
    ("showpos", handle_showpos),
    ("t", handle_teleport),
    ("info", handle_info),
    ("censor", handle_censor),
];

/// Dispatch a chat line that started with '/'. `line` excludes the slash.
pub fn handle_command(ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>, line: &str) {
    let (trigger, params) = match line.split_once(' ') {
        Some((t, p)) => (t, p.trim()),
        None => (line, ""),
    };

    for cmd in COMMANDS.iter() {
        if cmd.trigger == trigger {
            (cmd.handler)(ship, block, c, params);
            return;
        }
    }

    // Scripts get a shot at anything we don't know.
    let args = [
        ScriptArg::Client(c.guildcard()),
        ScriptArg::Str(line.to_string()),
    ];

    if ship.hooks.execute(ScriptAction::UnknownCommand, &args) == HookResult::Handled {
        return;
    }

    send::send_txt(c, "\tE\tC7Invalid Command.");
}

fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn require_gm(c: &Arc<Client>) -> bool {
    if c.lock().is_local_gm() {
        true
    } else {
        send::send_txt(c, "\tE\tC7Nice try.");
        false
    }
}

fn require_global_gm(c: &Arc<Client>) -> bool {
    if c.lock().is_global_gm() {
        true
    } else {
        send::send_txt(c, "\tE\tC7Nice try.");
        false
    }
}

/// In a team (not a chat lobby), or complain.
fn require_team(c: &Arc<Client>) -> Option<Arc<lobby::Lobby>> {
    match c.lock().cur_lobby.upgrade() {
        Some(l) if l.is_team() => Some(l),
        _ => {
            send::send_txt(c, "\tE\tC7Only valid in a game.");
            None
        }
    }
}

fn require_leader(c: &Arc<Client>) -> Option<Arc<lobby::Lobby>> {
    let l = require_team(c)?;

    let is_leader = {
        let st = l.lock();
        st.leader_id == c.lock().client_id
    };

    if !is_leader {
        send::send_txt(c, "\tE\tC7Only the leader may use this command.");
        return None;
    }

    Some(l)
}

fn require_not_protected(c: &Arc<Client>) -> bool {
    if c.lock().flags & client::FLAG_GC_PROTECT != 0 {
        send::send_txt(c, "\tE\tC7You must login before\nyou can do that.");
        false
    } else {
        true
    }
}

// --- Movement ------------------------------------------------------------

fn handle_warp(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    let Some(_l) = require_team(c) else { return };

    match params.parse::<u32>() {
        Ok(area) if area <= 17 => send::send_warp(c, area as u8),
        _ => send::send_txt(c, "\tE\tC7Invalid area."),
    }
}

fn handle_warpall(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    let Some(l) = require_team(c) else { return };

    match params.parse::<u32>() {
        Ok(area) if area <= 17 => {
            let st = l.lock();
            for member in st.clients[..st.max_clients].iter().flatten() {
                send::send_warp(member, area as u8);
            }
        }
        _ => send::send_txt(c, "\tE\tC7Invalid area."),
    }
}

fn handle_teleport(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    let Some(l) = require_team(c) else { return };

    let target_slot: u8 = match params.parse() {
        Ok(s) => s,
        Err(_) => {
            send::send_txt(c, "\tE\tC7Invalid client ID.");
            return;
        }
    };

    let target_area = {
        let st = l.lock();
        st.clients
            .get(target_slot as usize)
            .and_then(|t| t.as_ref())
            .map(|t| t.lock().cur_area)
    };

    match target_area {
        Some(area) => send::send_warp(c, area as u8),
        None => send::send_txt(c, "\tE\tC7Invalid client ID."),
    }
}

fn handle_showpos(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    let (pos, area) = {
        let cs = c.lock();
        (cs.pos, cs.cur_area)
    };

    send::send_txt(
        c,
        &format!("\tE\tC7Area: {}\nX: {:.2}\nY: {:.2}\nZ: {:.2}", area, pos.0, pos.1, pos.2),
    );
}

// --- Team levels / password / name ---------------------------------------

fn handle_min_level(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    let Some(l) = require_leader(c) else { return };

    let lvl: u32 = match params.parse() {
        Ok(v) if (1..=200).contains(&v) => v,
        _ => {
            send::send_txt(c, "\tE\tC7Invalid level value.");
            return;
        }
    };

    let mut st = l.lock();

    if lvl < lobby::GAME_REQUIRED_LEVEL[st.difficulty as usize & 3] {
        send::send_txt(c, "\tE\tC7Invalid level for this difficulty.");
        return;
    }

    if lvl > st.max_level {
        send::send_txt(c, "\tE\tC7Minimum level must be <= maximum.");
        return;
    }

    st.min_level = lvl;
    drop(st);
    send::send_txt(c, "\tE\tC7Minimum level set.");
}

fn handle_max_level(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    let Some(l) = require_leader(c) else { return };

    let lvl: u32 = match params.parse() {
        Ok(v) if (1..=200).contains(&v) => v,
        _ => {
            send::send_txt(c, "\tE\tC7Invalid level value.");
            return;
        }
    };

    let mut st = l.lock();

    if lvl < st.min_level {
        send::send_txt(c, "\tE\tC7Maximum level must be >= minimum.");
        return;
    }

    st.max_level = lvl;
    drop(st);
    send::send_txt(c, "\tE\tC7Maximum level set.");
}

fn handle_passwd(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    let Some(l) = require_leader(c) else { return };

    if params.len() > 16 {
        send::send_txt(c, "\tE\tC7Password too long.");
        return;
    }

    if params.bytes().any(|b| !(0x20..0x7F).contains(&b)) {
        send::send_txt(c, "\tE\tC7Illegal character in password.");
        return;
    }

    l.lock().passwd = params.to_string();
    send::send_txt(c, "\tE\tC7Password set.");
}

fn handle_lname(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    let Some(l) = require_leader(c) else { return };

    if params.len() > 16 {
        send::send_txt(c, "\tE\tC7Lobby name too long.");
        return;
    }

    l.lock().name = params.to_string();
    send::send_txt(c, "\tE\tC7Lobby name set.");
}

// --- Version locks on teams ----------------------------------------------

fn set_team_flag(c: &Arc<Client>, flag: u32, on: bool, done: &str) {
    let Some(l) = require_leader(c) else { return };

    let mut st = l.lock();
    if on {
        st.flags |= flag;
    } else {
        st.flags &= !flag;
    }
    drop(st);

    send::send_txt(c, done);
}

fn handle_dconly(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if params == "off" {
        set_team_flag(c, lobby::LOBBY_FLAG_DCONLY, false, "\tE\tC7DC-only mode off.");
    } else {
        set_team_flag(c, lobby::LOBBY_FLAG_DCONLY, true, "\tE\tC7DC-only mode on.");
    }
}

fn handle_v1only(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if params == "off" {
        set_team_flag(c, lobby::LOBBY_FLAG_V1ONLY, false, "\tE\tC7V1-only mode off.");
    } else {
        set_team_flag(c, lobby::LOBBY_FLAG_V1ONLY, true, "\tE\tC7V1-only mode on.");
    }
}

fn handle_allowgc(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    let Some(l) = require_leader(c) else { return };

    let mut st = l.lock();

    // Cross-play only works without quests or legit mode.
    if st.flags & (lobby::LOBBY_FLAG_QUESTING | lobby::LOBBY_FLAG_LEGIT_MODE) != 0 {
        send::send_txt(c, "\tE\tC7Cannot allow GC players\nin this game.");
        return;
    }

    st.flags |= lobby::LOBBY_FLAG_GC_ALLOWED;
    drop(st);
    send::send_txt(c, "\tE\tC7GC players allowed.");
}

fn handle_showdcpc(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    let mut cs = c.lock();

    if cs.version != Version::Gc {
        drop(cs);
        send::send_txt(c, "\tE\tC7Only valid on Gamecube.");
        return;
    }

    cs.flags ^= client::FLAG_SHOW_DCPC_ON_GC;
    let on = cs.flags & client::FLAG_SHOW_DCPC_ON_GC != 0;
    drop(cs);

    send::send_txt(c, if on { "\tE\tC7DC/PC games visible." } else { "\tE\tC7DC/PC games hidden." });
}

// --- Accounts / privileges -----------------------------------------------

fn handle_login(ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    let mut parts = params.split(' ');
    let username = parts.next().unwrap_or("");
    let password = parts.next().unwrap_or("");

    if username.is_empty() || password.is_empty() {
        send::send_txt(c, "\tE\tC7You must specify\nyour username and\npassword.");
        return;
    }

    if username.len() >= 32 {
        send::send_txt(c, "\tE\tC7Invalid username.");
        return;
    }

    if password.len() >= 32 {
        send::send_txt(c, "\tE\tC7Invalid password.");
        return;
    }

    // Success or failure arrives back from the shipgate.
    ship.sg
        .send_usrlogin(c.guildcard(), block.b, username, password);
}

fn handle_logout(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    let mut cs = c.lock();
    cs.privilege = 0;
    cs.flags &= !client::FLAG_LOGGED_IN;
    drop(cs);

    send::send_txt(c, "\tE\tC7Logged out.");
}

fn handle_override(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    if !require_gm(c) {
        return;
    }

    c.lock().flags |= client::FLAG_OVERRIDE_GAME;
    send::send_txt(c, "\tE\tC7Restriction override on\nfor next join.");
}

// --- GM items and drops --------------------------------------------------

fn handle_item(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    let mut item = [0u32; 4];
    let mut count = 0;

    for (i, part) in params.split(',').take(4).enumerate() {
        match u32::from_str_radix(part.trim(), 16) {
            Ok(v) => {
                item[i] = v;
                count += 1;
            }
            Err(_) => break,
        }
    }

    if count == 0 {
        send::send_txt(c, "\tE\tC7Invalid item code.");
        return;
    }

    c.lock().next_item = Some(item);
    send::send_txt(c, "\tE\tC7Next item set successfully.");
}

fn handle_item4(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    let v = match u32::from_str_radix(params.trim(), 16) {
        Ok(v) => v,
        Err(_) => {
            send::send_txt(c, "\tE\tC7Invalid item code.");
            return;
        }
    };

    let mut cs = c.lock();
    let mut item = cs.next_item.unwrap_or([0; 4]);
    item[3] = v;
    cs.next_item = Some(item);
    drop(cs);

    send::send_txt(c, "\tE\tC7Next item set successfully.");
}

fn handle_sdrops(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    let avail = ship.drop_data_availability();
    let mut cs = c.lock();

    let complete = match cs.version {
        Version::Gc => avail.gc_complete,
        Version::BlueBurst => true,
        _ => avail.v2_complete,
    };

    if !complete {
        drop(cs);
        send::send_txt(c, "\tE\tC7Server-side drops not\navailable for your version.");
        return;
    }

    cs.flags ^= client::FLAG_SERVER_DROPS;
    let on = cs.flags & client::FLAG_SERVER_DROPS != 0;
    drop(cs);

    send::send_txt(
        c,
        if on {
            "\tE\tC7Server-side drops on\nfor games you create."
        } else {
            "\tE\tC7Server-side drops off\nfor games you create."
        },
    );
}

// --- Events ---------------------------------------------------------------

fn handle_event(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    match params.parse::<u32>() {
        Ok(ev) if ev <= 14 => {
            ship.lobby_event
                .store(ev, std::sync::atomic::Ordering::Relaxed);
            send::send_txt(c, "\tE\tC7Event set.");
        }
        _ => send::send_txt(c, "\tE\tC7Invalid event code."),
    }
}

fn handle_gameevent(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    match params.parse::<u32>() {
        Ok(ev) if ev <= 6 => {
            ship.game_event
                .store(ev, std::sync::atomic::Ordering::Relaxed);
            send::send_txt(c, "\tE\tC7Game Event set.");
        }
        _ => send::send_txt(c, "\tE\tC7Invalid event code."),
    }
}

// --- Info ----------------------------------------------------------------

fn handle_bstat(_ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    let games = block.num_games.load(std::sync::atomic::Ordering::Relaxed);
    let players = block.num_clients.load(std::sync::atomic::Ordering::Relaxed);

    send::send_txt(
        c,
        &format!("\tE\tC7BLOCK{:02}:\n{} Users\n{} Teams", block.b, players, games),
    );
}

fn handle_ver(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    send::send_txt(
        c,
        &format!("\tE\tC7Ragol Ship Server\nVersion {}", env!("CARGO_PKG_VERSION")),
    );
}

fn handle_info(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    let (clients, games) = ship.counts();
    send::send_txt(
        c,
        &format!(
            "\tE\tC7{}\n{} Users\n{} Teams\nShipgate: {}",
            ship.cfg.name,
            clients,
            games,
            if ship.sg.is_connected() { "OK" } else { "DOWN" }
        ),
    );
}

fn handle_clinfo(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    let gc: u32 = match params.parse() {
        Ok(v) => v,
        Err(_) => {
            send::send_txt(c, "\tE\tC7Invalid Guild Card.");
            return;
        }
    };

    match ship.find_client(gc) {
        Some((block, target)) => {
            let ts = target.lock();
            send::send_txt(
                c,
                &format!(
                    "\tE\tC7{}\nGC: {}\nVersion: {}\nBlock: {:02}\nIP: {}",
                    ts.player.name, ts.guildcard, ts.version, block.b, target.addr
                ),
            );
        }
        None => send::send_txt(c, "\tE\tC7Client not found."),
    }
}

fn handle_list(_ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    if !require_gm(c) {
        return;
    }

    let mut text = String::from("\tEClients:\n");
    let clients = block.clients.read().unwrap_or_else(|e| e.into_inner());

    for target in clients.iter() {
        let ts = target.lock();
        if ts.guildcard != 0 {
            text.push_str(&format!("{} - {} ({})\n", ts.guildcard, ts.player.name, ts.version));
        }
    }

    drop(clients);
    send::send_info_reply(c, &text);
}

fn handle_search(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    let gc: u32 = match params.parse() {
        Ok(v) => v,
        Err(_) => {
            send::send_txt(c, "\tE\tC7Invalid Guild Card.");
            return;
        }
    };

    // Blocklist privacy applies to searches too.
    match ship.find_client(gc) {
        Some((block, target)) => {
            let blocked = target
                .lock()
                .blocklist_blocks(c.guildcard(), sg::BLOCKLIST_GSEARCH);

            if blocked {
                send::send_txt(c, "\tE\tC7Client not found.");
                return;
            }

            let (lobby, name) = {
                let ts = target.lock();
                (ts.cur_lobby.upgrade(), ts.player.name.clone())
            };

            let lobby_name = lobby.map(|l| l.lock().name.clone()).unwrap_or_default();

            send::send_txt(
                c,
                &format!("\tE\tC2{}\tC7\nBlock {:02}\n{}", name, block.b, lobby_name),
            );
        }
        None => send::send_txt(c, "\tE\tC7Client not found."),
    }
}

// --- Arrows, chat state ---------------------------------------------------

fn handle_arrow(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_not_protected(c) {
        return;
    }

    let color: u8 = params.parse().unwrap_or(0);
    c.lock().arrow = color;

    send::send_txt(c, "\tE\tC7Arrow set.");

    let lobby = { c.lock().cur_lobby.upgrade() };
    if let Some(l) = lobby {
        send::send_arrows(&l);
    }
}

fn handle_bcast(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    for block in &ship.blocks {
        let clients = block.clients.read().unwrap_or_else(|e| e.into_inner());
        for target in clients.iter() {
            send::send_txt(target, &format!("\tE\tC4Global:\tC7 {}", params));
        }
    }
}

fn handle_stfu(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    let gc: u32 = match params.parse() {
        Ok(v) => v,
        Err(_) => {
            send::send_txt(c, "\tE\tC7Invalid Guild Card.");
            return;
        }
    };

    match ship.find_client(gc) {
        Some((_, target)) => {
            target.lock().flags |= client::FLAG_STFU;
            send::send_txt(c, "\tE\tC7Client muted.");
        }
        None => send::send_txt(c, "\tE\tC7Client not found."),
    }
}

fn handle_unstfu(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    let gc: u32 = match params.parse() {
        Ok(v) => v,
        Err(_) => {
            send::send_txt(c, "\tE\tC7Invalid Guild Card.");
            return;
        }
    };

    match ship.find_client(gc) {
        Some((_, target)) => {
            target.lock().flags &= !client::FLAG_STFU;
            send::send_txt(c, "\tE\tC7Client unmuted.");
        }
        None => send::send_txt(c, "\tE\tC7Client not found."),
    }
}

fn handle_ignore(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    let slot: usize = match params.parse() {
        Ok(v) => v,
        Err(_) => {
            send::send_txt(c, "\tE\tC7Invalid client ID.");
            return;
        }
    };

    let lobby = { c.lock().cur_lobby.upgrade() };
    let target_gc = lobby.and_then(|l| {
        let st = l.lock();
        st.clients.get(slot).and_then(|t| t.as_ref()).map(|t| t.guildcard())
    });

    match target_gc {
        Some(gc) if gc != 0 => {
            if c.lock().add_ignore(gc) {
                send::send_txt(c, &format!("\tE\tC7Ignoring {}.", gc));
            } else {
                send::send_txt(c, "\tE\tC7Ignore list full.");
            }
        }
        _ => send::send_txt(c, "\tE\tC7Invalid client ID."),
    }
}

fn handle_unignore(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    let gc: u32 = match params.parse() {
        Ok(v) => v,
        Err(_) => {
            send::send_txt(c, "\tE\tC7Invalid Guild Card.");
            return;
        }
    };

    if c.lock().remove_ignore(gc) {
        send::send_txt(c, "\tE\tC7No longer ignoring them.");
    } else {
        send::send_txt(c, "\tE\tC7Not ignoring them.");
    }
}

fn handle_censor(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    let mut cs = c.lock();
    cs.flags ^= client::FLAG_WORD_CENSOR;
    let on = cs.flags & client::FLAG_WORD_CENSOR != 0;
    drop(cs);

    send::send_txt(c, if on { "\tE\tC7Word censor on." } else { "\tE\tC7Word censor off." });
}

fn handle_quit(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    c.disconnect();
}

fn handle_kill(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    let mut parts = params.splitn(2, ' ');
    let gc: u32 = match parts.next().unwrap_or("").parse() {
        Ok(v) => v,
        Err(_) => {
            send::send_txt(c, "\tE\tC7Invalid Guild Card.");
            return;
        }
    };
    let reason = parts.next().unwrap_or("");

    match ship.find_client(gc) {
        Some((_, target)) => {
            if reason.is_empty() {
                send::send_msg_box(&target, "\tEYou have been kicked by a GM.");
            } else {
                send::send_msg_box(
                    &target,
                    &format!("\tEYou have been kicked by a GM.\n\nReason:\n{}", reason),
                );
            }
            target.disconnect();
        }
        None => send::send_txt(c, "\tE\tC7Client not found."),
    }
}

// --- Bans ----------------------------------------------------------------

fn local_ban(ship: &Arc<Ship>, c: &Arc<Client>, params: &str, seconds: u32) {
    if !require_gm(c) {
        return;
    }

    let mut parts = params.splitn(2, ' ');
    let gc: u32 = match parts.next().unwrap_or("").parse() {
        Ok(v) => v,
        Err(_) => {
            send::send_txt(c, "\tE\tC7Invalid Guild Card.");
            return;
        }
    };
    let reason = parts.next().unwrap_or("No reason given").to_string();

    let until = if seconds == BAN_PERMANENT {
        BAN_PERMANENT
    } else {
        unix_now().saturating_add(seconds)
    };

    ship.bans.ban_guildcard(
        gc,
        BanEntry {
            banner_gc: c.guildcard(),
            until,
            reason: reason.clone(),
        },
    );

    if let Some((_, target)) = ship.find_client(gc) {
        let length = crate::bans::ban_length_text(until, unix_now());
        send::send_msg_box(
            &target,
            &format!("\tEYou have been banned from this ship.\nLength: {}\n\n{}", length, reason),
        );
        target.disconnect();
    }

    send::send_txt(c, "\tE\tC7Client banned.");
}

fn global_ban(ship: &Arc<Ship>, c: &Arc<Client>, params: &str, seconds: u32) {
    if !require_global_gm(c) {
        return;
    }

    let mut parts = params.splitn(2, ' ');
    let gc: u32 = match parts.next().unwrap_or("").parse() {
        Ok(v) => v,
        Err(_) => {
            send::send_txt(c, "\tE\tC7Invalid Guild Card.");
            return;
        }
    };
    let reason = parts.next().unwrap_or("No reason given");

    let until = if seconds == BAN_PERMANENT {
        BAN_PERMANENT
    } else {
        unix_now().saturating_add(seconds)
    };

    ship.sg
        .send_ban(sg::SHDR_TYPE_GCBAN, c.guildcard(), gc, until, reason);
    send::send_txt(c, "\tE\tC7Ban request sent.");
}

fn handle_ban_d(ship: &Arc<Ship>, _b: &Arc<Block>, c: &Arc<Client>, p: &str) {
    local_ban(ship, c, p, 86_400);
}

fn handle_ban_w(ship: &Arc<Ship>, _b: &Arc<Block>, c: &Arc<Client>, p: &str) {
    local_ban(ship, c, p, 7 * 86_400);
}

fn handle_ban_m(ship: &Arc<Ship>, _b: &Arc<Block>, c: &Arc<Client>, p: &str) {
    local_ban(ship, c, p, 30 * 86_400);
}

fn handle_ban_p(ship: &Arc<Ship>, _b: &Arc<Block>, c: &Arc<Client>, p: &str) {
    local_ban(ship, c, p, BAN_PERMANENT);
}

fn handle_gban_d(ship: &Arc<Ship>, _b: &Arc<Block>, c: &Arc<Client>, p: &str) {
    global_ban(ship, c, p, 86_400);
}

fn handle_gban_w(ship: &Arc<Ship>, _b: &Arc<Block>, c: &Arc<Client>, p: &str) {
    global_ban(ship, c, p, 7 * 86_400);
}

fn handle_gban_m(ship: &Arc<Ship>, _b: &Arc<Block>, c: &Arc<Client>, p: &str) {
    global_ban(ship, c, p, 30 * 86_400);
}

fn handle_gban_p(ship: &Arc<Ship>, _b: &Arc<Block>, c: &Arc<Client>, p: &str) {
    global_ban(ship, c, p, BAN_PERMANENT);
}

fn handle_unban(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    let gc: u32 = match params.parse() {
        Ok(v) => v,
        Err(_) => {
            send::send_txt(c, "\tE\tC7Invalid Guild Card.");
            return;
        }
    };

    if ship.bans.unban_guildcard(gc) {
        send::send_txt(c, "\tE\tC7Ban lifted.");
    } else {
        send::send_txt(c, "\tE\tC7No ban found.");
    }
}

// --- Friends --------------------------------------------------------------

fn handle_friendadd(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_not_protected(c) {
        return;
    }

    let mut parts = params.splitn(2, ' ');
    let gc: u32 = match parts.next().unwrap_or("").parse() {
        Ok(v) => v,
        Err(_) => {
            send::send_txt(c, "\tE\tC7Invalid Guild Card.");
            return;
        }
    };
    let nick = parts.next().unwrap_or("");

    if nick.is_empty() {
        send::send_txt(c, "\tE\tC7You must provide a nickname.");
        return;
    }

    ship.sg.send_friend_add(c.guildcard(), gc, nick);
    send::send_txt(c, "\tE\tC7Friend added.");
}

fn handle_frienddel(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_not_protected(c) {
        return;
    }

    let gc: u32 = match params.parse() {
        Ok(v) => v,
        Err(_) => {
            send::send_txt(c, "\tE\tC7Invalid Guild Card.");
            return;
        }
    };

    ship.sg.send_friend_del(c.guildcard(), gc);
    send::send_txt(c, "\tE\tC7Friend removed.");
}

fn handle_friends(ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    let start: u32 = params.parse().unwrap_or(0);
    ship.sg.send_frlist_req(c.guildcard(), block.b, start);
}

// --- Legit mode -----------------------------------------------------------

fn handle_legit(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    let limits = ship.limits.read().unwrap_or_else(|e| e.into_inner());

    let list = if params.is_empty() {
        limits.default_list()
    } else {
        limits.by_name(params)
    };

    match list {
        Some(list) => {
            let mut cs = c.lock();
            cs.legit_limits = Some(list);
            cs.flags |= client::FLAG_LEGIT;
            drop(cs);
            send::send_txt(c, "\tE\tC7Legit mode on\nfor next game.");
        }
        None => send::send_txt(c, "\tE\tC7No such limits file."),
    }
}

fn handle_normal(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    let mut cs = c.lock();
    cs.legit_limits = None;
    cs.flags &= !client::FLAG_LEGIT;
    drop(cs);

    send::send_txt(c, "\tE\tC7Legit mode off\nfor next game.");
}

// --- Ship control ---------------------------------------------------------

fn handle_shutdown(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    let minutes: u64 = params.parse().unwrap_or(0);
    ship.scheduler.schedule(ShutdownKind::Shutdown, minutes);
    send::send_txt(c, "\tE\tC7Shutdown scheduled.");
}

fn handle_restart(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    let minutes: u64 = params.parse().unwrap_or(0);
    ship.scheduler.schedule(ShutdownKind::Restart, minutes);
    send::send_txt(c, "\tE\tC7Restart scheduled.");
}

// --- Team logs ------------------------------------------------------------

fn handle_log(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    if !require_gm(c) {
        return;
    }

    let Some(l) = require_team(c) else { return };
    let mut st = l.lock();

    if st.log.is_some() {
        send::send_txt(c, "\tE\tC7Already logging.");
        return;
    }

    let dir = ship.cfg.log_dir.join("teams");
    let _ = std::fs::create_dir_all(&dir);
    let path = dir.join(format!("team_{}_{}.log", l.block, l.lobby_id));

    match std::fs::File::create(path) {
        Ok(f) => {
            st.log = Some(f);
            drop(st);
            send::send_txt(c, "\tE\tC7Logging started.");
        }
        Err(_) => {
            drop(st);
            send::send_txt(c, "\tE\tC7Cannot create log file.");
        }
    }
}

fn handle_endlog(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    if !require_gm(c) {
        return;
    }

    let Some(l) = require_team(c) else { return };
    let had = l.lock().log.take().is_some();

    send::send_txt(c, if had { "\tE\tC7Logging ended." } else { "\tE\tC7Not logging." });
}

// --- Character data -------------------------------------------------------

fn handle_save(ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_not_protected(c) {
        return;
    }

    let cs = c.lock();

    if let Some(l) = cs.cur_lobby.upgrade() {
        if l.is_team() {
            drop(cs);
            send::send_txt(c, "\tE\tC7Not valid in a game.");
            return;
        }
    }

    if cs.version == Version::BlueBurst {
        drop(cs);
        send::send_txt(c, "\tE\tC7Not valid on Blue Burst.");
        return;
    }

    let gc = cs.guildcard;
    let data = cs.player.raw.clone();
    drop(cs);

    let slot: u32 = match params.parse() {
        Ok(v) if (1..=4).contains(&v) => v,
        _ => {
            send::send_txt(c, "\tE\tC7Invalid slot value.");
            return;
        }
    };

    // Slots 1-4 map past the Blue Burst character slots.
    ship.sg.send_cdata(gc, slot + 4, block.b, &data);
}

fn handle_restore(ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_not_protected(c) {
        return;
    }

    let cs = c.lock();

    if let Some(l) = cs.cur_lobby.upgrade() {
        if l.is_team() {
            drop(cs);
            send::send_txt(c, "\tE\tC7Not valid in a game.");
            return;
        }
    }

    if cs.version == Version::BlueBurst {
        drop(cs);
        send::send_txt(c, "\tE\tC7Not valid on Blue Burst.");
        return;
    }

    let gc = cs.guildcard;
    drop(cs);

    let slot: u32 = match params.parse() {
        Ok(v) if (1..=4).contains(&v) => v,
        _ => {
            send::send_txt(c, "\tE\tC7Invalid slot value.");
            return;
        }
    };

    ship.sg.send_creq(gc, slot + 4);
}

fn handle_restorebk(ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    if !require_not_protected(c) {
        return;
    }

    let (gc, name, in_team) = {
        let cs = c.lock();
        let in_team = cs
            .cur_lobby
            .upgrade()
            .map(|l| l.is_team())
            .unwrap_or(false);
        (cs.guildcard, cs.player.name.clone(), in_team)
    };

    if in_team {
        send::send_txt(c, "\tE\tC7Not valid in a game.");
        return;
    }

    ship.sg.send_cbkup_req(gc, block.b, &name);
}

fn handle_enablebk(ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    if !require_not_protected(c) {
        return;
    }

    c.lock().flags |= client::FLAG_AUTO_BACKUP;
    ship.sg
        .send_user_opt(c.guildcard(), block.b, sg::USER_OPT_ENABLE_BACKUP, &[1]);
    send::send_txt(c, "\tE\tC7Automatic backups on.");
}

fn handle_disablebk(ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    if !require_not_protected(c) {
        return;
    }

    c.lock().flags &= !client::FLAG_AUTO_BACKUP;
    ship.sg
        .send_user_opt(c.guildcard(), block.b, sg::USER_OPT_ENABLE_BACKUP, &[0]);
    send::send_txt(c, "\tE\tC7Automatic backups off.");
}

fn handle_gcprotect(ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if params == "off" {
        ship.sg
            .send_user_opt(c.guildcard(), block.b, sg::USER_OPT_GC_PROTECT, &[0]);
        send::send_txt(c, "\tE\tC7Guild Card protection off.");
    } else {
        ship.sg
            .send_user_opt(c.guildcard(), block.b, sg::USER_OPT_GC_PROTECT, &[1]);
        send::send_txt(c, "\tE\tC7Guild Card protection on.\nLogin to use your card.");
    }
}

fn handle_trackkill(ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_not_protected(c) {
        return;
    }

    if params == "off" {
        c.lock().flags &= !client::FLAG_TRACK_KILLS;
        ship.sg
            .send_user_opt(c.guildcard(), block.b, sg::USER_OPT_TRACK_KILLS, &[0]);
        send::send_txt(c, "\tE\tC7Kill tracking off.");
    } else {
        c.lock().flags |= client::FLAG_TRACK_KILLS;
        ship.sg
            .send_user_opt(c.guildcard(), block.b, sg::USER_OPT_TRACK_KILLS, &[1]);
        send::send_txt(c, "\tE\tC7Kill tracking on.");
    }
}

fn handle_trackinv(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    c.lock().flags |= client::FLAG_TRACK_INV;
    send::send_txt(c, "\tE\tC7Inventory tracking on.");
}

// --- Misc -----------------------------------------------------------------

fn handle_cc(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    let lang = match params {
        "j" | "J" => 0u8,
        "e" | "E" => 1,
        "g" | "G" => 2,
        "f" | "F" => 3,
        "s" | "S" => 4,
        _ => {
            send::send_txt(c, "\tE\tC7Invalid language code.");
            return;
        }
    };

    c.lock().language = ragol_common::version::Language::from_code(lang);
    send::send_txt(c, "\tE\tC7Language set.");
}

fn handle_qlang(ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    let lang = match params {
        "j" | "J" => 0u8,
        "e" | "E" => 1,
        "g" | "G" => 2,
        "f" | "F" => 3,
        "s" | "S" => 4,
        _ => {
            send::send_txt(c, "\tE\tC7Invalid language code.");
            return;
        }
    };

    c.lock().quest_lang = ragol_common::version::Language::from_code(lang);
    ship.sg
        .send_user_opt(c.guildcard(), block.b, sg::USER_OPT_QUEST_LANG, &[lang]);
    send::send_txt(c, "\tE\tC7Quest language set.");
}

fn handle_maps(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, params: &str) {
    if !require_gm(c) {
        return;
    }

    let mut maps = [0u32; 0x20];
    let mut count = 0;

    for (i, part) in params.split_whitespace().take(0x20).enumerate() {
        match part.parse::<u32>() {
            Ok(v) => {
                maps[i] = v;
                count += 1;
            }
            Err(_) => {
                send::send_txt(c, "\tE\tC7Invalid map list.");
                return;
            }
        }
    }

    if count == 0 {
        c.lock().next_maps = None;
        send::send_txt(c, "\tE\tC7Map selection cleared.");
    } else {
        c.lock().next_maps = Some(maps);
        send::send_txt(c, "\tE\tC7Maps set for next game.");
    }
}

fn handle_showmaps(_ship: &Arc<Ship>, _block: &Arc<Block>, c: &Arc<Client>, _params: &str) {
    let Some(l) = require_team(c) else { return };

    let st = l.lock();
    let mut text = String::from("\tEMaps in use:\n");

    for i in 0..0x10 {
        text.push_str(&format!("{}: {} {}\n", i, st.maps[i << 1], st.maps[(i << 1) + 1]));
    }

    drop(st);
    send::send_info_reply(c, &text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobby::LobbyType;
    use crate::shipgate::ShipgateHandle;
    use tokio::sync::mpsc;

    fn test_env() -> (Arc<Ship>, Arc<Block>, Arc<Client>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let cfg = crate::config_provider::default_config_provider().ship_config();
        let (sg, _sg_rx) = ShipgateHandle::new();
        let ship = Ship::new(cfg, sg, crate::ship::LoadedData::default());
        let block = ship.blocks[0].clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let c = Arc::new(Client::new(
            1,
            "127.0.0.1:999".parse().unwrap(),
            1,
            Version::Dcv2,
            tx,
        ));
        c.lock().guildcard = 12345;

        (ship, block, c, rx)
    }

    fn join_team(ship: &Arc<Ship>, block: &Arc<Block>, c: &Arc<Client>) -> Arc<lobby::Lobby> {
        let mut rng = block.rng.lock().unwrap();
        let l = lobby::create_game(
            block.b,
            block.alloc_lobby_id(),
            &mut rng,
            lobby::CreateGameParams {
                name: "Cmd".into(),
                passwd: String::new(),
                difficulty: 1,
                battle: false,
                challenge: false,
                v2: true,
                version: Version::Dcv2,
                section: 0,
                event: 0,
                episode: 1,
                single_player: false,
            },
            c,
        );
        drop(rng);

        {
            let mut st = l.lock();
            lobby::add_client_locked(&mut st, &l, LobbyType::Game, c).unwrap();
        }

        block.add_lobby(l.clone());
        let _ = ship;
        l
    }

    #[test]
    fn maxlvl_accepts_200_but_not_201() {
        let (ship, block, c, _rx) = test_env();
        let l = join_team(&ship, &block, &c);

        handle_command(&ship, &block, &c, "maxlvl 200");
        assert_eq!(l.lock().max_level, 200);

        handle_command(&ship, &block, &c, "maxlvl 201");
        assert_eq!(l.lock().max_level, 200);
    }

    #[test]
    fn minlvl_respects_the_difficulty_floor() {
        let (ship, block, c, _rx) = test_env();
        let l = join_team(&ship, &block, &c);

        // Hard difficulty requires level 20.
        handle_command(&ship, &block, &c, "minlvl 5");
        assert_eq!(l.lock().min_level, 20);

        handle_command(&ship, &block, &c, "minlvl 30");
        assert_eq!(l.lock().min_level, 30);
    }

    #[test]
    fn passwd_enforces_length_and_ascii() {
        let (ship, block, c, _rx) = test_env();
        let l = join_team(&ship, &block, &c);

        handle_command(&ship, &block, &c, "passwd sixteen__chars__");
        assert_eq!(l.lock().passwd, "sixteen__chars__");

        handle_command(&ship, &block, &c, "passwd seventeen__chars_X");
        assert_eq!(l.lock().passwd, "sixteen__chars__");

        handle_command(&ship, &block, &c, "passwd bad\u{00FF}pass");
        assert_eq!(l.lock().passwd, "sixteen__chars__");
    }

    #[test]
    fn login_forwards_credentials_to_the_shipgate() {
        let cfg = crate::config_provider::default_config_provider().ship_config();
        let (sg, mut sg_rx) = ShipgateHandle::new();
        let ship = Ship::new(cfg, sg, crate::ship::LoadedData::default());
        let block = ship.blocks[0].clone();

        let (tx, _rx) = mpsc::unbounded_channel();
        let c = Arc::new(Client::new(
            1,
            "127.0.0.1:999".parse().unwrap(),
            1,
            Version::Pcv2,
            tx,
        ));
        c.lock().guildcard = 777;

        handle_command(&ship, &block, &c, "login alice hunter2");

        let frame = sg_rx.try_recv().expect("a USRLOGIN frame");
        assert_eq!(
            u16::from_le_bytes([frame[2], frame[3]]),
            sg::SHDR_TYPE_USRLOGIN
        );
        // gc, then block, then the credential strings.
        assert_eq!(u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]), 777);
        assert_eq!(u32::from_le_bytes([frame[12], frame[13], frame[14], frame[15]]), 1);
        assert_eq!(&frame[16..21], b"alice");
        assert_eq!(&frame[48..55], b"hunter2");
    }

    #[test]
    fn commands_require_their_privileges() {
        let (ship, block, c, _rx) = test_env();

        // Not a GM: /item refused, next_item untouched.
        handle_command(&ship, &block, &c, "item 3302,0,0,0");
        assert!(c.lock().next_item.is_none());

        c.lock().privilege = client::PRIV_LOCAL_GM;
        handle_command(&ship, &block, &c, "item 3302,0,0,0");
        assert_eq!(c.lock().next_item, Some([0x3302, 0, 0, 0]));
    }

    #[test]
    fn unknown_commands_fall_through_to_hooks() {
        let (ship, block, c, _rx) = test_env();

        ship.hooks.register(
            ScriptAction::UnknownCommand,
            Box::new(|args| {
                match &args[1] {
                    ScriptArg::Str(s) => assert_eq!(s, "madeup param"),
                    _ => panic!("wrong arg"),
                }
                HookResult::Handled
            }),
        );

        handle_command(&ship, &block, &c, "madeup param");
    }

    #[test]
    fn local_ban_enforces_on_the_spot() {
        let (ship, block, c, _rx) = test_env();
        c.lock().privilege = client::PRIV_LOCAL_GM;

        handle_command(&ship, &block, &c, "ban:d 9999 spamming");

        let ban = ship.bans.check_guildcard(9999, unix_now()).expect("banned");
        assert_eq!(ban.reason, "spamming");
        assert!(ban.until > unix_now() && ban.until <= unix_now() + 86_400);

        handle_command(&ship, &block, &c, "unban 9999");
        assert!(ship.bans.check_guildcard(9999, 0).is_none());
    }
}
