//! Client packet headers and the packet-type constants the server handles.
//!
//! Three header shapes exist on the wire:
//!
//! * DC/GC/Xbox: `{ pkt_type: u8, flags: u8, pkt_len: u16le }`
//! * PC:         `{ pkt_len: u16le, pkt_type: u8, flags: u8 }`
//! * Blue Burst: `{ pkt_len: u16le, pkt_type: u16le, flags: u32le }`
//!
//! Parsed headers are normalised into [`PacketHeader`]; the raw body is kept
//! as bytes and interpreted by the handler for the `(version, type)` pair.

use bytes::BufMut;

use crate::version::Version;

pub const MSG1_TYPE: u16 = 0x0001;
pub const WELCOME_TYPE: u16 = 0x0002;
pub const BB_WELCOME_TYPE: u16 = 0x0003;
pub const SECURITY_TYPE: u16 = 0x0004;
pub const CHAT_TYPE: u16 = 0x0006;
pub const BLOCK_LIST_TYPE: u16 = 0x0007;
pub const GAME_LIST_TYPE: u16 = 0x0008;
pub const INFO_REQUEST_TYPE: u16 = 0x0009;
pub const DC_GAME_CREATE_TYPE: u16 = 0x000C;
pub const MENU_SELECT_TYPE: u16 = 0x0010;
pub const INFO_REPLY_TYPE: u16 = 0x0011;
pub const REDIRECT_TYPE: u16 = 0x0019;
pub const MSG_BOX_TYPE: u16 = 0x001A;
pub const PING_TYPE: u16 = 0x001D;
pub const LOBBY_INFO_TYPE: u16 = 0x001F;
pub const GUILD_SEARCH_TYPE: u16 = 0x0040;
pub const GUILD_REPLY_TYPE: u16 = 0x0041;
pub const QUEST_FILE_TYPE: u16 = 0x0044;
pub const GAME_COMMAND0_TYPE: u16 = 0x0060;
pub const CHAR_DATA_TYPE: u16 = 0x0061;
pub const GAME_COMMAND2_TYPE: u16 = 0x0062;
pub const GAME_JOIN_TYPE: u16 = 0x0064;
pub const GAME_ADD_PLAYER_TYPE: u16 = 0x0065;
pub const GAME_LEAVE_TYPE: u16 = 0x0066;
pub const LOBBY_JOIN_TYPE: u16 = 0x0067;
pub const LOBBY_ADD_PLAYER_TYPE: u16 = 0x0068;
pub const LOBBY_LEAVE_TYPE: u16 = 0x0069;
pub const GAME_COMMANDC_TYPE: u16 = 0x006C;
pub const GAME_COMMANDD_TYPE: u16 = 0x006D;
pub const DONE_BURSTING_TYPE: u16 = 0x006F;
pub const SIMPLE_MAIL_TYPE: u16 = 0x0081;
pub const LOBBY_LIST_TYPE: u16 = 0x0083;
pub const LOBBY_CHANGE_TYPE: u16 = 0x0084;
pub const LOBBY_ARROW_LIST_TYPE: u16 = 0x0088;
pub const LOBBY_ARROW_CHANGE_TYPE: u16 = 0x0089;
pub const LOBBY_NAME_TYPE: u16 = 0x008A;
pub const LOGIN_93_TYPE: u16 = 0x0093;
pub const CHAR_DATA_REQUEST_TYPE: u16 = 0x0095;
pub const CHECKSUM_TYPE: u16 = 0x0096;
pub const CHECKSUM_REPLY_TYPE: u16 = 0x0097;
pub const LEAVE_GAME_PL_DATA_TYPE: u16 = 0x0098;
pub const SHIP_LIST_REQ_TYPE: u16 = 0x0099;
pub const LOGIN_9A_TYPE: u16 = 0x009A;
pub const LOGIN_9D_TYPE: u16 = 0x009D;
pub const LOGIN_9E_TYPE: u16 = 0x009E;
pub const SHIP_LIST_TYPE: u16 = 0x00A0;
pub const BLOCK_LIST_REQ_TYPE: u16 = 0x00A1;
pub const QUEST_LIST_TYPE: u16 = 0x00A2;
pub const QUEST_INFO_TYPE: u16 = 0x00A3;
pub const QUEST_LOAD_DONE_TYPE: u16 = 0x00AC;
pub const TEXT_MSG_TYPE: u16 = 0x00B0;
pub const TIMESTAMP_TYPE: u16 = 0x00B1;
pub const GAME_CREATE_TYPE: u16 = 0x00C1;
pub const BLACKLIST_TYPE: u16 = 0x00C6;
pub const AUTOREPLY_SET_TYPE: u16 = 0x00C7;
pub const AUTOREPLY_CLEAR_TYPE: u16 = 0x00C8;
pub const GAME_COMMAND_C9_TYPE: u16 = 0x00C9;
pub const GAME_COMMAND_CB_TYPE: u16 = 0x00CB;
pub const BURST_DONE_TYPE: u16 = 0x00D4;
pub const BB_FULL_CHARACTER_TYPE: u16 = 0x00E7;

/// A parsed, version-independent packet header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub pkt_type: u16,
    pub flags: u32,
    pub pkt_len: u16,
}

impl PacketHeader {
    /// Parse a header from the first `version.header_len()` bytes.
    pub fn parse(version: Version, buf: &[u8]) -> PacketHeader {
        if version.is_bb() {
            PacketHeader {
                pkt_len: u16::from_le_bytes([buf[0], buf[1]]),
                pkt_type: u16::from_le_bytes([buf[2], buf[3]]),
                flags: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            }
        } else if version.has_pc_header() {
            PacketHeader {
                pkt_len: u16::from_le_bytes([buf[0], buf[1]]),
                pkt_type: buf[2] as u16,
                flags: buf[3] as u32,
            }
        } else {
            PacketHeader {
                pkt_type: buf[0] as u16,
                flags: buf[1] as u32,
                pkt_len: u16::from_le_bytes([buf[2], buf[3]]),
            }
        }
    }

    /// Write this header in the given version's shape.
    pub fn write(&self, version: Version, out: &mut impl BufMut) {
        if version.is_bb() {
            out.put_u16_le(self.pkt_len);
            out.put_u16_le(self.pkt_type);
            out.put_u32_le(self.flags);
        } else if version.has_pc_header() {
            out.put_u16_le(self.pkt_len);
            out.put_u8(self.pkt_type as u8);
            out.put_u8(self.flags as u8);
        } else {
            out.put_u8(self.pkt_type as u8);
            out.put_u8(self.flags as u8);
            out.put_u16_le(self.pkt_len);
        }
    }
}

/// One sub-command inside a 0x60/0x62/0x6D envelope. The header is a type
/// byte, a size-in-dwords byte and a 16-bit parameter whose meaning varies
/// by sub-command (usually the target client or entity id).
#[derive(Debug, Copy, Clone)]
pub struct SubcmdHeader {
    pub sub_type: u8,
    pub size: u8,
    pub param: u16,
}

impl SubcmdHeader {
    pub fn parse(body: &[u8]) -> Option<SubcmdHeader> {
        if body.len() < 4 {
            return None;
        }

        Some(SubcmdHeader {
            sub_type: body[0],
            size: body[1],
            param: u16::from_le_bytes([body[2], body[3]]),
        })
    }

    /// Validate the declared dword size against the actual body length
    /// (header included, as the game counts it).
    pub fn size_matches(&self, body_len: usize) -> bool {
        // Sub-commands with size 0 use an extended 32-bit length that the
        // router treats as opaque; anything else must match exactly.
        if self.size == 0 {
            return body_len >= 8;
        }

        body_len == self.size as usize * 4
    }
}

/// Read a little-endian u32 out of a packet body at the given offset.
pub fn get_u32_le(body: &[u8], off: usize) -> Option<u32> {
    let b = body.get(off..off + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn get_u16_le(body: &[u8], off: usize) -> Option<u16> {
    let b = body.get(off..off + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

/// Append padding zeroes up to the version's packet alignment.
pub fn pad_packet(version: Version, buf: &mut Vec<u8>) {
    let align = version.padding();
    while buf.len() % align != 0 {
        buf.push(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_round_trip_per_version() {
        let hdr = PacketHeader {
            pkt_type: GAME_COMMAND0_TYPE,
            flags: 0,
            pkt_len: 0x24,
        };

        for v in [Version::Dcv1, Version::Pcv2, Version::BlueBurst] {
            let mut out = Vec::new();
            hdr.write(v, &mut out);
            assert_eq!(out.len(), v.header_len());
            assert_eq!(PacketHeader::parse(v, &out), hdr);
        }
    }

    #[test]
    fn dc_and_pc_disagree_on_field_order() {
        let hdr = PacketHeader {
            pkt_type: 0x60,
            flags: 1,
            pkt_len: 8,
        };

        let mut dc = Vec::new();
        let mut pc = Vec::new();
        hdr.write(Version::Gc, &mut dc);
        hdr.write(Version::Pcv2, &mut pc);

        assert_eq!(dc, [0x60, 0x01, 0x08, 0x00]);
        assert_eq!(pc, [0x08, 0x00, 0x60, 0x01]);
    }

    #[test]
    fn subcmd_size_is_in_dwords() {
        let body = [0x60u8, 0x03, 0x10, 0x00, 1, 2, 3, 4, 5, 6, 7, 8];
        let hdr = SubcmdHeader::parse(&body).unwrap();
        assert_eq!(hdr.sub_type, 0x60);
        assert!(hdr.size_matches(body.len()));
        assert!(!hdr.size_matches(body.len() + 4));
    }
}
