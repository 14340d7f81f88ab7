//! Minecraft Classic 0.30 wire packets: just enough of the protocol to run
//! the proxy's hard core. Individual field layouts are deliberately kept
//! small — this module plays the role the specification assigns to a
//! "supplied" `PacketDecoder`/`PacketEncoder`, not a complete Classic
//! protocol library.

use anyhow::{Result, bail};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed-width string field length used throughout Classic ("64-byte
/// space-padded").
const STRING_LEN: usize = 64;

/// `Identification.id`. Also the first byte every client connection must
/// send.
pub const ID_IDENTIFICATION: u8 = 0x00;
pub const ID_MESSAGE: u8 = 0x0d;
pub const ID_DISCONNECT_PLAYER: u8 = 0x0e;
/// Known-length packets beyond the three named shapes, kept only so the
/// decoder can skip past them correctly while relaying.
const ID_PING: u8 = 0x01;
const ID_LEVEL_INITIALIZE: u8 = 0x02;
const ID_LEVEL_DATA_CHUNK: u8 = 0x03;
const ID_LEVEL_FINALIZE: u8 = 0x04;
const ID_SET_BLOCK_CLIENT: u8 = 0x05;
const ID_SET_BLOCK_SERVER: u8 = 0x06;
const ID_SPAWN_PLAYER: u8 = 0x07;
const ID_POSITION_ORIENTATION: u8 = 0x08;
const ID_POSITION_ORIENTATION_UPDATE: u8 = 0x09;
const ID_POSITION_UPDATE: u8 = 0x0a;
const ID_ORIENTATION_UPDATE: u8 = 0x0b;
const ID_DESPAWN_PLAYER: u8 = 0x0c;
const ID_UPDATE_USER_TYPE: u8 = 0x0f;
/// CPE extension-negotiation packets (`ExtInfo`/`ExtEntry`); used to
/// populate the extension-name table consulted by `extension_name()`.
const ID_EXT_INFO: u8 = 0x10;
const ID_EXT_ENTRY: u8 = 0x11;

/// Reserved sentinel id for the `HookRegistry` wildcard bucket. No real
/// Classic packet id ever uses this value.
pub const ALL_PACKETS: u8 = 0xff;

/// `Identification.userType` value meaning "this client speaks CPE".
pub const USER_TYPE_CPE: u8 = 0x42;

/// A decoded Classic packet. Three shapes (`Identification`, `Message`,
/// `DisconnectPlayer`) are named directly by the proxy core; everything
/// else passes through as `Other` with its raw body bytes intact so it can
/// be relayed byte-for-byte without the proxy needing to understand it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Identification {
        name: String,
        key_motd: String,
        user_type: u8,
    },
    Message {
        speaker_id: u8,
        message: String,
    },
    DisconnectPlayer {
        reason: String,
    },
    Other {
        id: u8,
        body: Vec<u8>,
        extension_name: Option<String>,
    },
}

impl Packet {
    pub fn new_message(speaker_id: u8, text: impl Into<String>) -> Self {
        Packet::Message {
            speaker_id,
            message: text.into(),
        }
    }

    pub fn new_disconnect_player(reason: impl Into<String>) -> Self {
        Packet::DisconnectPlayer {
            reason: reason.into(),
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            Packet::Identification { .. } => ID_IDENTIFICATION,
            Packet::Message { .. } => ID_MESSAGE,
            Packet::DisconnectPlayer { .. } => ID_DISCONNECT_PLAYER,
            Packet::Other { id, .. } => *id,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes().len()
    }

    /// CPE extension name this packet advertises, if any. Only populated
    /// for ids that were observed via an `ExtEntry` negotiation packet
    /// (see `PacketDecoder::next`).
    pub fn extension_name(&self) -> Option<&str> {
        match self {
            Packet::Other { extension_name, .. } => extension_name.as_deref(),
            _ => None,
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Packet::Identification {
                name,
                key_motd,
                user_type,
            } => {
                out.push(ID_IDENTIFICATION);
                out.push(0x07); // protocol version
                write_fixed_string(&mut out, name);
                write_fixed_string(&mut out, key_motd);
                out.push(*user_type);
            }
            Packet::Message { speaker_id, message } => {
                out.push(ID_MESSAGE);
                out.push(*speaker_id);
                write_fixed_string(&mut out, message);
            }
            Packet::DisconnectPlayer { reason } => {
                out.push(ID_DISCONNECT_PLAYER);
                write_fixed_string(&mut out, reason);
            }
            Packet::Other { id, body, .. } => {
                out.push(*id);
                out.extend_from_slice(body);
            }
        }
        out
    }
}

fn write_fixed_string(out: &mut Vec<u8>, s: &str) {
    let mut bytes = s.as_bytes().to_vec();
    bytes.truncate(STRING_LEN);
    bytes.resize(STRING_LEN, b' ');
    out.extend_from_slice(&bytes);
}

fn trim_fixed_string(bytes: &[u8]) -> String {
    let trimmed = bytes
        .iter()
        .rposition(|&b| b != b' ')
        .map(|end| &bytes[..=end])
        .unwrap_or(&[]);
    String::from_utf8_lossy(trimmed).into_owned()
}

/// Body length (bytes following the id byte) of packets this decoder
/// recognizes well enough to skip. Unknown ids are a protocol error: the
/// proxy can't safely resynchronize the stream without knowing how many
/// bytes to consume.
fn known_body_len(id: u8) -> Option<usize> {
    Some(match id {
        ID_PING => 0,
        ID_LEVEL_INITIALIZE => 0,
        ID_LEVEL_DATA_CHUNK => 1027,
        ID_LEVEL_FINALIZE => 6,
        ID_SET_BLOCK_CLIENT => 8,
        ID_SET_BLOCK_SERVER => 7,
        ID_SPAWN_PLAYER => 73,
        ID_POSITION_ORIENTATION => 9,
        ID_POSITION_ORIENTATION_UPDATE => 6,
        ID_POSITION_UPDATE => 4,
        ID_ORIENTATION_UPDATE => 3,
        ID_DESPAWN_PLAYER => 1,
        ID_UPDATE_USER_TYPE => 1,
        ID_EXT_INFO => 2 * STRING_LEN + 2,
        ID_EXT_ENTRY => STRING_LEN + 4,
        _ => return None,
    })
}

/// Decodes packets off an `AsyncRead` stream, tracking CPE extension-id
/// negotiation (`ExtEntry`) so later `Other` packets can report an
/// `extension_name()`.
pub struct PacketDecoder<R> {
    reader: R,
    /// Extension names declared via `ExtEntry`, keyed by the order they
    /// were declared in (kurafuto doesn't implement the full per-id
    /// extension packet catalog — see module docs).
    known_extensions: HashMap<usize, String>,
    ext_entry_count: usize,
}

impl<R: AsyncRead + Unpin> PacketDecoder<R> {
    pub fn new(reader: R) -> Self {
        PacketDecoder {
            reader,
            known_extensions: HashMap::new(),
            ext_entry_count: 0,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Reads and decodes the next packet from the stream.
    pub async fn next(&mut self) -> std::io::Result<Packet> {
        let id = self.reader.read_u8().await?;
        let packet = match id {
            ID_IDENTIFICATION => {
                let _protocol_version = self.reader.read_u8().await?;
                let name = self.read_fixed_string().await?;
                let key_motd = self.read_fixed_string().await?;
                let user_type = self.reader.read_u8().await?;
                Packet::Identification {
                    name,
                    key_motd,
                    user_type,
                }
            }
            ID_MESSAGE => {
                let speaker_id = self.reader.read_u8().await?;
                let message = self.read_fixed_string().await?;
                Packet::Message {
                    speaker_id,
                    message,
                }
            }
            ID_DISCONNECT_PLAYER => {
                let reason = self.read_fixed_string().await?;
                Packet::DisconnectPlayer { reason }
            }
            ID_EXT_ENTRY => {
                let name = self.read_fixed_string().await?;
                let mut version_buf = [0u8; 4];
                self.reader.read_exact(&mut version_buf).await?;
                let idx = self.ext_entry_count;
                self.ext_entry_count += 1;
                self.known_extensions.insert(idx, name.clone());
                let mut body = Vec::with_capacity(STRING_LEN + 4);
                write_fixed_string(&mut body, &name);
                body.extend_from_slice(&version_buf);
                Packet::Other {
                    id,
                    body,
                    extension_name: Some(name),
                }
            }
            other => {
                let len = known_body_len(other).ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("kurafuto: unrecognized packet id {other:#04x}"),
                    )
                })?;
                let mut body = vec![0u8; len];
                self.reader.read_exact(&mut body).await?;
                Packet::Other {
                    id: other,
                    body,
                    extension_name: None,
                }
            }
        };
        Ok(packet)
    }

    async fn read_fixed_string(&mut self) -> std::io::Result<String> {
        let mut buf = [0u8; STRING_LEN];
        self.reader.read_exact(&mut buf).await?;
        Ok(trim_fixed_string(&buf))
    }
}

/// Writes a packet's wire bytes to an `AsyncWrite` stream.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let bytes = packet.bytes();
    let n = writer.write(&bytes).await?;
    if n != bytes.len() {
        bail!(
            "kurafuto: short write for packet {:#04x}: {} of {} bytes",
            packet.id(),
            n,
            bytes.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_identification() {
        let packet = Packet::Identification {
            name: "alice".to_string(),
            key_motd: "secret".to_string(),
            user_type: USER_TYPE_CPE,
        };
        let (mut client, server) = duplex(256);
        write_packet(&mut client, &packet).await.unwrap();
        let mut decoder = PacketDecoder::new(server);
        let decoded = decoder.next().await.unwrap();
        assert_eq!(decoded, packet);
    }

    #[tokio::test]
    async fn round_trips_message() {
        let packet = Packet::new_message(127, "hello there");
        let (mut client, server) = duplex(256);
        write_packet(&mut client, &packet).await.unwrap();
        let mut decoder = PacketDecoder::new(server);
        let decoded = decoder.next().await.unwrap();
        assert_eq!(decoded, packet);
    }

    #[tokio::test]
    async fn skips_known_packets_to_stay_in_sync() {
        let (mut client, server) = duplex(512);
        let ping = Packet::Other {
            id: ID_PING,
            body: vec![],
            extension_name: None,
        };
        let msg = Packet::new_message(1, "after ping");
        write_packet(&mut client, &ping).await.unwrap();
        write_packet(&mut client, &msg).await.unwrap();
        let mut decoder = PacketDecoder::new(server);
        let first = decoder.next().await.unwrap();
        assert_eq!(first.id(), ID_PING);
        let second = decoder.next().await.unwrap();
        assert_eq!(second, msg);
    }

    #[tokio::test]
    async fn errors_on_unrecognized_packet_id() {
        let (mut client, server) = duplex(64);
        client.write_all(&[0x99]).await.unwrap();
        let mut decoder = PacketDecoder::new(server);
        assert!(decoder.next().await.is_err());
    }

    #[test]
    fn trims_trailing_padding() {
        let mut padded = b"alice".to_vec();
        padded.resize(STRING_LEN, b' ');
        assert_eq!(trim_fixed_string(&padded), "alice");
    }
}
