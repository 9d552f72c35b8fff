//! Framed, encrypted packet codec for client connections.
//!
//! The decoder decrypts the header as soon as four (or eight, for Blue
//! Burst) bytes arrive, then waits until the padded body is complete before
//! decrypting and yielding the packet; partial data stays buffered. The
//! encoder writes the header, pads the body to the version's alignment and
//! encrypts the whole frame in place. Until the welcome exchange installs
//! ciphers, both directions run in the clear.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::crypt::{BbCipher, PsoCipher};
use crate::packets::PacketHeader;
use crate::version::Version;

/// Either cipher flavor, so the codec is version-agnostic past setup.
pub enum CipherState {
    Pso(PsoCipher),
    Bb(BbCipher),
}

impl CipherState {
    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            CipherState::Pso(c) => c.apply(data),
            CipherState::Bb(c) => c.apply(data),
        }
    }
}

/// A fully received client packet: normalised header plus the body bytes
/// (padding stripped down to `pkt_len`).
#[derive(Debug)]
pub struct RawPacket {
    pub hdr: PacketHeader,
    pub body: BytesMut,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet length {0} is shorter than its header")]
    RuntPacket(u16),
    #[error("packet length {0} exceeds the per-version maximum")]
    OversizePacket(u16),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Hard cap on a single client packet. The biggest legitimate packets are
/// quest chunks and BB character data, well under this.
const MAX_PKT_LEN: u16 = 0x7FFF;

pub struct ShipCodec {
    version: Version,
    recv_cipher: Option<CipherState>,
    send_cipher: Option<CipherState>,
    /// Header already decrypted and parsed for the packet being received.
    pending: Option<PacketHeader>,
}

impl ShipCodec {
    pub fn new(version: Version) -> ShipCodec {
        ShipCodec {
            version,
            recv_cipher: None,
            send_cipher: None,
            pending: None,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Called once the client acknowledges the welcome packet. Anything
    /// already buffered but not yet decrypted belongs to the new stream.
    pub fn install_ciphers(&mut self, recv: CipherState, send: CipherState) {
        self.recv_cipher = Some(recv);
        self.send_cipher = Some(send);
    }

    /// Install only the inbound cipher. Used when the outbound direction
    /// is encrypted elsewhere (a writer task owning its own state).
    pub fn install_recv_cipher(&mut self, recv: CipherState) {
        self.recv_cipher = Some(recv);
    }

    /// The session may switch version during login (DC NTE detection, v1
    /// vs v2 login packets). Only legal before ciphers are installed.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn padded_len(&self, pkt_len: u16) -> usize {
        let align = self.version.padding();
        (pkt_len as usize).div_ceil(align) * align
    }
}

impl Decoder for ShipCodec {
    type Item = RawPacket;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawPacket>, CodecError> {
        let hdr_len = self.version.header_len();

        let hdr = match self.pending {
            Some(hdr) => hdr,
            None => {
                if src.len() < hdr_len {
                    return Ok(None);
                }

                if let Some(cipher) = &mut self.recv_cipher {
                    cipher.apply(&mut src[..hdr_len]);
                }

                let hdr = PacketHeader::parse(self.version, &src[..hdr_len]);

                if (hdr.pkt_len as usize) < hdr_len {
                    return Err(CodecError::RuntPacket(hdr.pkt_len));
                }

                if hdr.pkt_len > MAX_PKT_LEN {
                    return Err(CodecError::OversizePacket(hdr.pkt_len));
                }

                self.pending = Some(hdr);
                hdr
            }
        };

        let total = self.padded_len(hdr.pkt_len);

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        // Everything past the header still needs decrypting.
        if let Some(cipher) = &mut self.recv_cipher {
            cipher.apply(&mut src[hdr_len..total]);
        }

        let mut frame = src.split_to(total);
        frame.truncate(hdr.pkt_len as usize);
        let body = frame.split_off(hdr_len);

        self.pending = None;
        Ok(Some(RawPacket { hdr, body }))
    }
}

/// Outbound packets are pre-built byte buffers: header already written in
/// the right shape, body already padded. The encoder only encrypts.
impl Encoder<Vec<u8>> for ShipCodec {
    type Error = CodecError;

    fn encode(&mut self, mut pkt: Vec<u8>, dst: &mut BytesMut) -> Result<(), CodecError> {
        debug_assert_eq!(pkt.len() % self.version.padding(), 0);

        if let Some(cipher) = &mut self.send_cipher {
            cipher.apply(&mut pkt);
        }

        dst.put_slice(&pkt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets;

    fn build_packet(version: Version, pkt_type: u16, body: &[u8]) -> Vec<u8> {
        let hdr = PacketHeader {
            pkt_type,
            flags: 0,
            pkt_len: (version.header_len() + body.len()) as u16,
        };

        let mut out = Vec::new();
        hdr.write(version, &mut out);
        out.extend_from_slice(body);
        packets::pad_packet(version, &mut out);
        out
    }

    #[test]
    fn decodes_a_whole_cleartext_packet() {
        let mut codec = ShipCodec::new(Version::Gc);
        let pkt = build_packet(Version::Gc, packets::PING_TYPE, &[]);

        let mut buf = BytesMut::from(&pkt[..]);
        let got = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(got.hdr.pkt_type, packets::PING_TYPE);
        assert!(got.body.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_the_full_padded_frame() {
        let mut codec = ShipCodec::new(Version::Gc);
        let pkt = build_packet(Version::Gc, packets::CHAT_TYPE, b"hi there you");

        let mut buf = BytesMut::from(&pkt[..pkt.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_u8(pkt[pkt.len() - 1]);
        let got = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&got.body[..], b"hi there you");
    }

    #[test]
    fn two_packets_in_one_read() {
        let mut codec = ShipCodec::new(Version::Pcv2);
        let mut stream = build_packet(Version::Pcv2, packets::PING_TYPE, &[]);
        stream.extend(build_packet(Version::Pcv2, packets::MENU_SELECT_TYPE, &[1, 0, 0, 0]));

        let mut buf = BytesMut::from(&stream[..]);
        let a = codec.decode(&mut buf).unwrap().unwrap();
        let b = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(a.hdr.pkt_type, packets::PING_TYPE);
        assert_eq!(b.hdr.pkt_type, packets::MENU_SELECT_TYPE);
    }

    #[test]
    fn encrypted_round_trip() {
        let seed = 0xCAFE_F00D;
        let mut server = ShipCodec::new(Version::Gc);
        let mut client_recv = PsoCipher::new(seed);

        server.install_ciphers(
            CipherState::Pso(PsoCipher::new(seed ^ 1)),
            CipherState::Pso(PsoCipher::new(seed)),
        );

        let pkt = build_packet(Version::Gc, packets::MSG_BOX_TYPE, b"banned!!");
        let mut wire = BytesMut::new();
        server.encode(pkt.clone(), &mut wire).unwrap();
        assert_ne!(&wire[..], &pkt[..]);

        let mut wire = wire.to_vec();
        client_recv.apply(&mut wire);
        assert_eq!(wire, pkt);
    }

    #[test]
    fn runt_length_is_rejected() {
        let mut codec = ShipCodec::new(Version::Gc);
        // pkt_len = 2, below the 4-byte header.
        let mut buf = BytesMut::from(&[0x60u8, 0, 2, 0, 0, 0, 0, 0][..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
