//! Midea wire envelopes.
//! Handles v3 (8370) framing, 5a5a packets for the LAN and the cloud relay,
//! the relay's signed decimal encoding and the UDP discovery probe.

use crate::crypto::{Security, cbc_decrypt, cbc_encrypt};
use crate::error::{MideaError, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use chrono::{Datelike, Local, Timelike};
use log::debug;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// UDP port appliances answer discovery probes on.
pub const DISCOVERY_PORT: u16 = 6445;
/// TCP port of the appliance LAN service.
pub const LAN_PORT: u16 = 6444;

pub const PREFIX_8370: [u8; 2] = [0x83, 0x70];
pub const PREFIX_5A5A: [u8; 2] = [0x5A, 0x5A];

/// Size of the 5a5a packet header.
pub const PACKET_HEADER_LEN: usize = 40;
const FINGERPRINT_LEN: usize = 16;
const SIGNATURE_LEN: usize = 32;
const V3_HEADER_LEN: usize = 6;
/// Relay packets carry the command zero padded to this length.
const RELAY_COMMAND_LEN: usize = 49;
const RELAY_MESSAGE_ID: u32 = 1;

/// Broadcast probe understood by every appliance generation.
pub const DISCOVERY_MSG: [u8; 72] = [
    0x5A, 0x5A, 0x01, 0x11, 0x48, 0x00, 0x92, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x7F, 0x75, 0xBD, 0x6B, 0x3E, 0x4F, 0x8B, 0x76,
    0x2E, 0x84, 0x9C, 0x6E, 0x57, 0x8D, 0x65, 0x90, 0x03, 0x6E, 0x9D, 0x43, 0x42, 0xA5, 0x0F, 0x1F,
    0x56, 0x9E, 0xB8, 0xEC, 0x91, 0x8E, 0x92, 0xE5,
];

define_byte_enum! {
    /// v3 (8370) message types.
    pub enum FrameType {
        HandshakeRequest = 0x0 => "handshake request",
        HandshakeResponse = 0x1 => "handshake response",
        EncryptedResponse = 0x3 => "encrypted response",
        EncryptedRequest = 0x6 => "encrypted request",
        Transparent = 0xF => "transparent",
    }
}

impl FrameType {
    pub fn is_encrypted(self) -> bool {
        matches!(self, FrameType::EncryptedRequest | FrameType::EncryptedResponse)
    }
}

/// Stateful v3 codec for one TCP connection.
#[derive(Debug, Default)]
pub struct V3Codec {
    tcp_key: Option<[u8; 32]>,
    request_count: u16,
    response_count: u16,
}

impl V3Codec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tcp_key(tcp_key: [u8; 32]) -> Self {
        Self {
            tcp_key: Some(tcp_key),
            ..Self::default()
        }
    }

    pub fn set_tcp_key(&mut self, tcp_key: [u8; 32]) {
        self.tcp_key = Some(tcp_key);
    }

    pub fn has_tcp_key(&self) -> bool {
        self.tcp_key.is_some()
    }

    pub fn response_count(&self) -> u16 {
        self.response_count
    }

    /// Frames `data`, encrypting and signing it for encrypted message types.
    pub fn encode(&mut self, data: &[u8], kind: FrameType) -> Result<Vec<u8>> {
        let mut payload = data.to_vec();
        let mut size = data.len();
        let mut padding = 0usize;
        let tcp_key = if kind.is_encrypted() {
            let key = self.tcp_key.ok_or_else(|| {
                MideaError::Protocol("Missing TCP key for local network access".into())
            })?;
            if (size + 2) % 16 != 0 {
                padding = 16 - ((size + 2) & 0xF);
                let mut filler = vec![0u8; padding];
                rand::rng().fill_bytes(&mut filler);
                payload.extend_from_slice(&filler);
            }
            size += padding + SIGNATURE_LEN;
            Some(key)
        } else {
            None
        };
        let size = u16::try_from(size)
            .map_err(|_| MideaError::Protocol(format!("message too large: {} bytes", size)))?;

        let mut header = Vec::with_capacity(V3_HEADER_LEN);
        header.extend_from_slice(&PREFIX_8370);
        header.write_u16::<BigEndian>(size)?;
        header.push(0x20);
        header.push(((padding as u8) << 4) | kind.as_u8());

        let mut body = Vec::with_capacity(payload.len() + 2);
        body.write_u16::<BigEndian>(self.request_count)?;
        body.extend_from_slice(&payload);
        self.request_count = self.request_count.wrapping_add(1);

        if let Some(key) = tcp_key {
            let mut hasher = Sha256::new();
            hasher.update(&header);
            hasher.update(&body);
            let sign = hasher.finalize();
            body = cbc_encrypt(&key, &body)?;
            body.extend_from_slice(&sign);
        }
        header.extend_from_slice(&body);
        Ok(header)
    }

    /// Decodes every complete message in `data`.
    ///
    /// Returns the payloads and the unconsumed tail, which is kept by the
    /// caller until more bytes arrive.
    pub fn decode(&mut self, data: &[u8]) -> Result<(Vec<Vec<u8>>, Vec<u8>)> {
        let mut packets = Vec::new();
        let mut rest = data;
        loop {
            if rest.len() < V3_HEADER_LEN {
                return Ok((packets, rest.to_vec()));
            }
            if rest[..2] != PREFIX_8370 {
                return Err(MideaError::Protocol(
                    "Message was not a v3 (8370) message".into(),
                ));
            }
            let size = BigEndian::read_u16(&rest[2..4]) as usize + 8;
            if rest.len() < size {
                return Ok((packets, rest.to_vec()));
            }
            let (message, tail) = rest.split_at(size);
            if message[4] != 0x20 {
                return Err(MideaError::Protocol("Byte 4 was not 0x20".into()));
            }
            let padding = (message[5] >> 4) as usize;
            let encrypted = FrameType::try_from(message[5] & 0x0F).is_ok_and(|k| k.is_encrypted());
            let header = &message[..V3_HEADER_LEN];
            let mut body = message[V3_HEADER_LEN..].to_vec();

            if encrypted {
                let key = self.tcp_key.ok_or_else(|| {
                    MideaError::Protocol("Missing TCP key for local network access".into())
                })?;
                if body.len() < SIGNATURE_LEN {
                    return Err(MideaError::Protocol("Missing signature".into()));
                }
                let sign = body.split_off(body.len() - SIGNATURE_LEN);
                body = cbc_decrypt(&key, &body)?;
                let mut hasher = Sha256::new();
                hasher.update(header);
                hasher.update(&body);
                if hasher.finalize().as_slice() != sign.as_slice() {
                    return Err(MideaError::Protocol(
                        "Signature does not match payload".into(),
                    ));
                }
                body.truncate(body.len().saturating_sub(padding));
            }
            if body.len() < 2 {
                return Err(MideaError::Protocol("Missing message counter".into()));
            }
            self.response_count = BigEndian::read_u16(&body[..2]);
            packets.push(body.split_off(2));
            rest = tail;
        }
    }
}

/// Timestamp as reversed decimal pairs of `YYYYMMDDHHMMSScc`.
fn packet_time() -> [u8; 8] {
    let now = Local::now();
    let year = now.year();
    [
        ((now.nanosecond() / 10_000_000) % 100) as u8,
        now.second() as u8,
        now.minute() as u8,
        now.hour() as u8,
        now.day() as u8,
        now.month() as u8,
        (year % 100) as u8,
        (year / 100) as u8,
    ]
}

fn packet_header(kind: [u8; 2], message_id: u32, appliance_id: u64) -> Vec<u8> {
    let mut packet = Vec::with_capacity(PACKET_HEADER_LEN + 64);
    packet.extend_from_slice(&PREFIX_5A5A);
    packet.extend_from_slice(&kind);
    packet.extend_from_slice(&[0x00, 0x00, 0x20, 0x00]);
    packet.extend_from_slice(&message_id.to_le_bytes());
    packet.extend_from_slice(&packet_time());
    packet.extend_from_slice(&appliance_id.to_le_bytes());
    packet.resize(PACKET_HEADER_LEN, 0);
    packet
}

fn set_packet_len(packet: &mut [u8], len: usize) {
    LittleEndian::write_u16(&mut packet[4..6], len as u16);
}

/// Wraps a finalized command for direct LAN delivery: header, command under
/// the static key, MD5 fingerprint.
pub fn lan_packet(security: &Security, appliance_id: u64, command: &[u8]) -> Vec<u8> {
    let mut packet = packet_header([0x01, 0x11], 0, appliance_id);
    packet.extend_from_slice(&security.aes_encrypt(command));
    let len = packet.len() + FINGERPRINT_LEN;
    set_packet_len(&mut packet, len);
    let fingerprint = security.md5_fingerprint(&packet);
    packet.extend_from_slice(&fingerprint);
    packet
}

/// Extracts appliance frames from decoded v3 payloads.
pub fn lan_frames(security: &Security, packets: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
    let mut frames = Vec::new();
    for packet in packets {
        if packet.len() <= PACKET_HEADER_LEN + FINGERPRINT_LEN {
            debug!("Skipping short LAN packet ({} bytes)", packet.len());
            continue;
        }
        let decrypted =
            security.aes_decrypt(&packet[PACKET_HEADER_LEN..packet.len() - FINGERPRINT_LEN])?;
        if decrypted.len() > 10 {
            frames.push(decrypted);
        }
    }
    Ok(frames)
}

/// Wraps a finalized command for the cloud transparent relay.
pub fn relay_packet(appliance_id: u64, command: &[u8]) -> Vec<u8> {
    let mut packet = packet_header([0x01, 0x00], RELAY_MESSAGE_ID, appliance_id);
    packet.extend_from_slice(command);
    if command.len() < RELAY_COMMAND_LEN {
        packet.resize(PACKET_HEADER_LEN + RELAY_COMMAND_LEN, 0);
    }
    let len = packet.len();
    set_packet_len(&mut packet, len);
    packet
}

/// Relay payloads travel as comma separated signed bytes.
pub fn encode_signed_csv(data: &[u8]) -> String {
    data.iter()
        .map(|b| (*b as i8).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn decode_signed_csv(text: &str) -> Result<Vec<u8>> {
    text.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            let value: i16 = s
                .trim()
                .parse()
                .map_err(|_| MideaError::DecodeError(format!("invalid relay byte '{}'", s)))?;
            if !(-128..=255).contains(&value) {
                return Err(MideaError::DecodeError(format!(
                    "relay byte out of range: {}",
                    value
                )));
            }
            Ok(value as u8)
        })
        .collect()
}

/// Splits a decoded relay reply into appliance frames.
///
/// A reply holds one or more 5a5a packets back to back, each declaring its
/// own length at bytes 4..6. The appliance frame starts after the packet
/// header and is trimmed to its own length byte.
///
/// Splitting follows the packet length rather than a fixed frame size
/// because one reply can mix frames of different lengths (0x20 and 0x22).
pub fn split_relay_reply(reply: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut frames = Vec::new();
    let mut rest = reply;
    while !rest.is_empty() {
        if rest.len() < PACKET_HEADER_LEN {
            return Err(MideaError::ResponseTooShort {
                len: rest.len(),
                min: PACKET_HEADER_LEN,
            });
        }
        if rest[..2] != PREFIX_5A5A {
            return Err(MideaError::InvalidHeader(
                "relay packet does not start with 5a5a".into(),
            ));
        }
        let declared = LittleEndian::read_u16(&rest[4..6]) as usize;
        if declared <= PACKET_HEADER_LEN || declared > rest.len() {
            return Err(MideaError::ResponseTooShort {
                len: rest.len(),
                min: declared.max(PACKET_HEADER_LEN + 1),
            });
        }
        let (packet, tail) = rest.split_at(declared);
        frames.push(trim_frame(&packet[PACKET_HEADER_LEN..])?);
        rest = tail;
    }
    Ok(frames)
}

fn trim_frame(data: &[u8]) -> Result<Vec<u8>> {
    if data.first() != Some(&crate::command::FRAME_HEADER) || data.len() < 2 {
        return Err(MideaError::InvalidHeader(
            "relay packet does not carry an appliance frame".into(),
        ));
    }
    let len = data[1] as usize + 1;
    if data.len() < len {
        return Err(MideaError::ResponseTooShort {
            len: data.len(),
            min: len,
        });
    }
    Ok(data[..len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY_89: &str = "90,90,1,0,89,0,32,0,1,0,0,0,39,36,17,9,13,10,18,20,-38,73,0,0,0,16,0,0,\
        0,0,0,0,0,0,0,0,0,0,0,0,-86,32,-95,0,0,0,0,0,3,3,65,33,0,-1,3,0,0,2,0,0,0,0,0,0,0,0,0,0,\
        0,0,11,36,-92,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0";
    const REPLY_91: &str = "90,90,1,0,91,0,32,-128,1,0,0,0,0,0,0,0,0,0,0,0,-38,73,0,0,0,16,0,0,\
        0,0,0,0,0,0,0,0,1,0,0,0,-86,34,-95,0,0,0,0,0,3,3,-56,1,4,80,127,127,0,35,0,64,0,0,0,0,0,\
        0,61,86,0,0,0,0,-92,-85,-41,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0";

    fn tcp_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        hex::decode_to_slice(
            "d1d0b37a6cc407e9b8fcecc1f2e250f6a9cfd83cfbf7e4443d30a34cb4e9a62d",
            &mut key,
        )
        .unwrap();
        key
    }

    #[test]
    fn v3_encrypted_round_trip() {
        let msg = hex::decode("f4fe051b7611d07d54a7f0a5e07ca2beb920ebb829d567559397ded751813801")
            .unwrap();
        let mut plain = V3Codec::new();
        assert!(matches!(
            plain.encode(&msg, FrameType::EncryptedRequest),
            Err(MideaError::Protocol(_))
        ));

        let mut codec = V3Codec::with_tcp_key(tcp_key());
        let encoded = codec.encode(&msg, FrameType::EncryptedRequest).unwrap();
        assert_eq!(&encoded[..2], &PREFIX_8370);
        assert_eq!(BigEndian::read_u16(&encoded[2..4]) as usize + 8, encoded.len());

        let (packets, incomplete) = codec.decode(&encoded[..encoded.len() - 2]).unwrap();
        assert!(packets.is_empty());
        assert_eq!(incomplete, &encoded[..encoded.len() - 2]);

        let (packets, incomplete) = codec.decode(&encoded).unwrap();
        assert_eq!(packets, vec![msg.clone()]);
        assert!(incomplete.is_empty());

        let mut extra = encoded.clone();
        extra.extend_from_slice(&[0, 0]);
        let (packets, incomplete) = codec.decode(&extra).unwrap();
        assert_eq!(packets, vec![msg.clone()]);
        assert_eq!(incomplete, vec![0, 0]);

        assert!(matches!(plain.decode(&encoded), Err(MideaError::Protocol(_))));
        assert!(matches!(plain.decode(&msg), Err(MideaError::Protocol(_))));
    }

    #[test]
    fn v3_block_aligned_payload_keeps_signature_in_size() {
        let mut codec = V3Codec::with_tcp_key(tcp_key());
        let payload = [0x11u8; 30];
        let encoded = codec.encode(&payload, FrameType::EncryptedRequest).unwrap();
        assert_eq!(encoded[5] >> 4, 0);
        assert_eq!(encoded.len(), 6 + 32 + 32);
        let (packets, _) = codec.decode(&encoded).unwrap();
        assert_eq!(packets, vec![payload.to_vec()]);
    }

    #[test]
    fn v3_stacked_messages_and_counters() {
        let mut sender = V3Codec::with_tcp_key(tcp_key());
        let mut buffer = sender.encode(b"first", FrameType::EncryptedResponse).unwrap();
        buffer.extend(sender.encode(b"second", FrameType::EncryptedResponse).unwrap());

        let mut receiver = V3Codec::with_tcp_key(tcp_key());
        let (packets, rest) = receiver.decode(&buffer).unwrap();
        assert_eq!(packets, vec![b"first".to_vec(), b"second".to_vec()]);
        assert!(rest.is_empty());
        assert_eq!(receiver.response_count(), 1);

        let mut tampered = sender.encode(b"third", FrameType::EncryptedResponse).unwrap();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(matches!(
            receiver.decode(&tampered),
            Err(MideaError::Protocol(_))
        ));
    }

    #[test]
    fn v3_handshake_is_plain() {
        let mut codec = V3Codec::new();
        let token = [0xABu8; 64];
        let encoded = codec.encode(&token, FrameType::HandshakeRequest).unwrap();
        assert_eq!(&encoded[..8], &[0x83, 0x70, 0x00, 0x40, 0x20, 0x00, 0x00, 0x00]);
        assert_eq!(&encoded[8..], &token[..]);
        let second = codec.encode(&token, FrameType::HandshakeRequest).unwrap();
        assert_eq!(&second[6..8], &[0x00, 0x01]);
    }

    #[test]
    fn lan_packet_layout() {
        let security = Security::default();
        let command = hex::decode("aa20a100000000000003418100ff03ff000000000000000000000000000001294f")
            .unwrap();
        let packet = lan_packet(&security, 0x12345, &command);
        assert_eq!(hex::encode(&packet[..12]), "5a5a01116800200000000000");
        assert_eq!(&packet[20..28], &[0x45, 0x23, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(packet.len(), 0x68);

        let body_end = packet.len() - 16;
        assert_eq!(security.md5_fingerprint(&packet[..body_end]), packet[body_end..]);
        let frames = lan_frames(&security, &[packet]).unwrap();
        assert_eq!(frames, vec![command]);
    }

    #[test]
    fn relay_packet_layout() {
        let command = hex::decode("aa20a100000000000003418100ff03ff000000000000000000000000000001294f")
            .unwrap();
        let packet = relay_packet(12345, &command);
        assert_eq!(packet.len(), 89);
        assert_eq!(&packet[..8], &[0x5A, 0x5A, 0x01, 0x00, 89, 0x00, 0x20, 0x00]);
        assert_eq!(&packet[8..12], &[1, 0, 0, 0]);
        assert_eq!(&packet[40..73], &command[..]);
        assert!(packet[73..].iter().all(|b| *b == 0));

        let csv = encode_signed_csv(&packet);
        assert!(csv.starts_with("90,90,1,0,89,0,32,0,1,0,0,0,"));
        assert!(csv.contains(",-86,32,-95,"));
        assert_eq!(decode_signed_csv(&csv).unwrap(), packet);
    }

    #[test]
    fn signed_csv_rejects_garbage() {
        assert!(decode_signed_csv("1,2,x").unwrap_err().is_crypto());
        assert!(decode_signed_csv("1,300").is_err());
        assert_eq!(decode_signed_csv("-1,255,0").unwrap(), vec![255, 255, 0]);
    }

    #[test]
    fn split_stacked_relay_reply() {
        let mut reply = decode_signed_csv(REPLY_89).unwrap();
        reply.extend(decode_signed_csv(REPLY_91).unwrap());
        let frames = split_relay_reply(&reply).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(
            hex::encode(&frames[0]),
            "aa20a100000000000303412100ff030000020000000000000000000000000b24a4"
        );
        assert_eq!(
            hex::encode(&frames[1]),
            "aa22a100000000000303c80104507f7f002300400000000000003d5600000000a4abd7"
        );

        reply.extend_from_slice(&[0x5A, 0x5A, 0x01]);
        assert!(split_relay_reply(&reply).unwrap_err().is_codec());
        assert!(split_relay_reply(&[]).unwrap().is_empty());
    }
}
