//! The shipgate frame format: an 8-byte little-endian header followed by a
//! payload padded to 8 bytes. Message payload layouts live with the link
//! code in the server; this module owns the framing, the type/flag/error
//! constants and the codec used over the TLS stream.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub const HDR_LEN: usize = 8;

/// Header flags.
pub const SHDR_RESPONSE: u16 = 0x8000;
pub const SHDR_FAILURE: u16 = 0x4000;

/// Packet types.
pub const SHDR_TYPE_DC: u16 = 0x0001;
pub const SHDR_TYPE_BB: u16 = 0x0002;
pub const SHDR_TYPE_PC: u16 = 0x0003;
pub const SHDR_TYPE_GC: u16 = 0x0004;
pub const SHDR_TYPE_EP3: u16 = 0x0005;
pub const SHDR_TYPE_XBOX: u16 = 0x0006;
pub const SHDR_TYPE_LOGIN: u16 = 0x0010;
pub const SHDR_TYPE_COUNT: u16 = 0x0011;
pub const SHDR_TYPE_SSTATUS: u16 = 0x0012;
pub const SHDR_TYPE_PING: u16 = 0x0013;
pub const SHDR_TYPE_CDATA: u16 = 0x0014;
pub const SHDR_TYPE_CREQ: u16 = 0x0015;
pub const SHDR_TYPE_USRLOGIN: u16 = 0x0016;
pub const SHDR_TYPE_GCBAN: u16 = 0x0017;
pub const SHDR_TYPE_IPBAN: u16 = 0x0018;
pub const SHDR_TYPE_BLKLOGIN: u16 = 0x0019;
pub const SHDR_TYPE_BLKLOGOUT: u16 = 0x001A;
pub const SHDR_TYPE_FRLOGIN: u16 = 0x001B;
pub const SHDR_TYPE_FRLOGOUT: u16 = 0x001C;
pub const SHDR_TYPE_ADDFRIEND: u16 = 0x001D;
pub const SHDR_TYPE_DELFRIEND: u16 = 0x001E;
pub const SHDR_TYPE_LOBBYCHG: u16 = 0x001F;
pub const SHDR_TYPE_BCLIENTS: u16 = 0x0020;
pub const SHDR_TYPE_KICK: u16 = 0x0021;
pub const SHDR_TYPE_FRLIST: u16 = 0x0022;
pub const SHDR_TYPE_GLOBALMSG: u16 = 0x0023;
pub const SHDR_TYPE_USEROPT: u16 = 0x0024;
pub const SHDR_TYPE_LOGIN6: u16 = 0x0025;
pub const SHDR_TYPE_BBOPTS: u16 = 0x0026;
pub const SHDR_TYPE_BBOPT_REQ: u16 = 0x0027;
pub const SHDR_TYPE_CBKUP: u16 = 0x0028;
pub const SHDR_TYPE_MKILL: u16 = 0x0029;
pub const SHDR_TYPE_SCHUNK: u16 = 0x002B;
pub const SHDR_TYPE_SDATA: u16 = 0x002C;
pub const SHDR_TYPE_SSET: u16 = 0x002D;
pub const SHDR_TYPE_QFLAG_SET: u16 = 0x002E;
pub const SHDR_TYPE_QFLAG_GET: u16 = 0x002F;
pub const SHDR_TYPE_SHIP_CTL: u16 = 0x0030;
pub const SHDR_TYPE_UBLOCKS: u16 = 0x0031;
pub const SHDR_TYPE_UBL_ADD: u16 = 0x0032;

/// Login capability flags.
pub const LOGIN_FLAG_GMONLY: u32 = 0x0000_0001;
pub const LOGIN_FLAG_NOV1: u32 = 0x0000_0010;
pub const LOGIN_FLAG_NOV2: u32 = 0x0000_0020;
pub const LOGIN_FLAG_NOPC: u32 = 0x0000_0040;
pub const LOGIN_FLAG_NOEP12: u32 = 0x0000_0080;
pub const LOGIN_FLAG_NOEP3: u32 = 0x0000_0100;
pub const LOGIN_FLAG_NOBB: u32 = 0x0000_0200;
pub const LOGIN_FLAG_NODCNTE: u32 = 0x0000_0400;
pub const LOGIN_FLAG_NOXBOX: u32 = 0x0000_0800;

/// General error codes.
pub const ERR_NO_ERROR: u32 = 0x0000_0000;
pub const ERR_BAD_ERROR: u32 = 0x8000_0001;
pub const ERR_REQ_LOGIN: u32 = 0x8000_0002;

pub const ERR_LOGIN_BAD_KEY: u32 = 0x0000_0001;
pub const ERR_LOGIN_BAD_PROTO: u32 = 0x0000_0002;
pub const ERR_LOGIN_BAD_MENU: u32 = 0x0000_0003;

pub const ERR_CREQ_NO_DATA: u32 = 0x0000_0001;
pub const ERR_USRLOGIN_NO_ACC: u32 = 0x0000_0001;
pub const ERR_USRLOGIN_BAD_CRED: u32 = 0x0000_0002;
pub const ERR_BLOGIN_ONLINE: u32 = 0x0000_0002;
pub const ERR_QFLAG_NO_DATA: u32 = 0x0000_0001;
pub const ERR_QFLAG_INVALID_FLAG: u32 = 0x0000_0002;

/// Quest-flag id modifiers.
pub const QFLAG_LONG_FLAG: u32 = 0x8000_0000;
pub const QFLAG_DELETE_FLAG: u32 = 0x4000_0000;

/// User option ids delivered in USEROPT.
pub const USER_OPT_QUEST_LANG: u32 = 0x0000_0001;
pub const USER_OPT_ENABLE_BACKUP: u32 = 0x0000_0002;
pub const USER_OPT_GC_PROTECT: u32 = 0x0000_0003;
pub const USER_OPT_TRACK_KILLS: u32 = 0x0000_0004;
pub const USER_OPT_LEGIT_ALWAYS: u32 = 0x0000_0005;
pub const USER_OPT_WORD_CENSOR: u32 = 0x0000_0006;

/// Script chunk types and errors.
pub const SCHUNK_TYPE_SCRIPT: u8 = 0x01;
pub const SCHUNK_TYPE_MODULE: u8 = 0x02;
pub const SCHUNK_CHECK: u8 = 0x80;
pub const ERR_SCHUNK_NEED_SCRIPT: u32 = 0x0000_0001;

/// Ship control sub-commands.
pub const SCTL_TYPE_UNAME: u32 = 0x0000_0001;
pub const SCTL_TYPE_VERSION: u32 = 0x0000_0002;
pub const SCTL_TYPE_RESTART: u32 = 0x0000_0003;
pub const SCTL_TYPE_SHUTDOWN: u32 = 0x0000_0004;

/// Blocklist reasons (what a blocklist entry suppresses).
pub const BLOCKLIST_CHAT: u32 = 0x0000_0001;
pub const BLOCKLIST_SCHAT: u32 = 0x0000_0002;
pub const BLOCKLIST_MAIL: u32 = 0x0000_0004;
pub const BLOCKLIST_GSEARCH: u32 = 0x0000_0008;
pub const BLOCKLIST_IGCHAT: u32 = 0x0000_0040;
pub const BLOCKLIST_IGSCHAT: u32 = 0x0000_0080;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ShipgateHeader {
    pub pkt_len: u16,
    pub pkt_type: u16,
    pub version: u8,
    pub flags: u16,
}

impl ShipgateHeader {
    pub fn is_response(&self) -> bool {
        self.flags & SHDR_RESPONSE != 0
    }

    pub fn is_failure(&self) -> bool {
        self.flags & SHDR_FAILURE != 0
    }
}

/// A complete shipgate message (payload excludes the header but includes
/// any trailing padding the sender added).
#[derive(Debug)]
pub struct ShipgateFrame {
    pub hdr: ShipgateHeader,
    pub payload: BytesMut,
}

impl ShipgateFrame {
    /// Build an outgoing frame. Pads the payload to 8 bytes and fills in
    /// the length.
    pub fn build(pkt_type: u16, flags: u16, payload: &[u8]) -> Vec<u8> {
        let padded = payload.len().div_ceil(8) * 8;
        let len = (HDR_LEN + padded) as u16;

        let mut out = Vec::with_capacity(len as usize);
        out.put_u16_le(len);
        out.put_u16_le(pkt_type);
        out.put_u8(0); // protocol version byte; zero except in LOGIN6
        out.put_u8(0);
        out.put_u16_le(flags);
        out.put_slice(payload);
        out.resize(len as usize, 0);
        out
    }
}

#[derive(Debug, Error)]
pub enum ShipgateCodecError {
    #[error("shipgate frame length {0} is invalid")]
    BadLength(u16),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Length-prefixed frame codec for the TLS stream.
pub struct ShipgateCodec;

impl Decoder for ShipgateCodec {
    type Item = ShipgateFrame;
    type Error = ShipgateCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ShipgateFrame>, Self::Error> {
        if src.len() < HDR_LEN {
            return Ok(None);
        }

        let pkt_len = u16::from_le_bytes([src[0], src[1]]);

        if (pkt_len as usize) < HDR_LEN {
            return Err(ShipgateCodecError::BadLength(pkt_len));
        }

        if src.len() < pkt_len as usize {
            src.reserve(pkt_len as usize - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(pkt_len as usize);
        let hdr = ShipgateHeader {
            pkt_len,
            pkt_type: u16::from_le_bytes([frame[2], frame[3]]),
            version: frame[4],
            flags: u16::from_le_bytes([frame[6], frame[7]]),
        };

        frame.advance(HDR_LEN);
        Ok(Some(ShipgateFrame {
            hdr,
            payload: frame,
        }))
    }
}

impl Encoder<Vec<u8>> for ShipgateCodec {
    type Error = ShipgateCodecError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip() {
        let pkt = ShipgateFrame::build(SHDR_TYPE_PING, 0, &[]);
        assert_eq!(pkt.len(), 8);

        let mut buf = BytesMut::from(&pkt[..]);
        let frame = ShipgateCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.hdr.pkt_type, SHDR_TYPE_PING);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn payloads_are_padded_to_eight() {
        let pkt = ShipgateFrame::build(SHDR_TYPE_COUNT, 0, &[1, 2, 3, 4, 5]);
        assert_eq!(pkt.len(), 16);
        assert_eq!(u16::from_le_bytes([pkt[0], pkt[1]]), 16);
    }

    #[test]
    fn partial_frames_stay_buffered() {
        let pkt = ShipgateFrame::build(SHDR_TYPE_COUNT, 0, &[0u8; 8]);
        let mut buf = BytesMut::from(&pkt[..10]);

        assert!(ShipgateCodec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(&pkt[10..]);
        assert!(ShipgateCodec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn response_and_failure_flags() {
        let pkt = ShipgateFrame::build(SHDR_TYPE_USRLOGIN, SHDR_RESPONSE | SHDR_FAILURE, &[0u8; 8]);
        let mut buf = BytesMut::from(&pkt[..]);
        let frame = ShipgateCodec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.hdr.is_response());
        assert!(frame.hdr.is_failure());
    }
}
