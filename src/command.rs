//! Binary command codec.
//!
//! Every command starts with a 4-byte tag and the sender's 8-byte packet
//! number, followed by fields specific to the command (all little-endian):
//!
//! ```text
//! Connect   [tag=1][packet u64][connection_id i32]
//! Forward   [tag=2][packet u64][connection_id i32][len i32][payload]
//! Purge     [tag=3][packet u64]
//! TearDown  [tag=4][packet u64][connection_id i32]
//! Ping      [tag=5][packet u64][kind u8]([responds_to u64] for responses)
//! ```
//!
//! The stream is positional: an unknown tag cannot be skipped, so decoding
//! fails instead of guessing.

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, TunnelError};
use crate::protocol::{ping_kind, tag, MAX_PAYLOAD_SIZE};

pub type ConnectionId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ping {
    Request,
    Response { responds_to: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { connection_id: ConnectionId },
    Forward { connection_id: ConnectionId, payload: Vec<u8> },
    TearDown { connection_id: ConnectionId },
    Purge,
    Ping(Ping),
}

/// A decoded command together with the packet number its sender assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub number: u64,
    pub command: Command,
}

/// Monotonic packet number source. One per channel, shared by everything
/// that channel sends.
#[derive(Debug, Default)]
pub struct PacketCounter(AtomicU64);

impl PacketCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Command {
    pub fn tag(&self) -> u32 {
        match self {
            Command::Connect { .. } => tag::CONNECT,
            Command::Forward { .. } => tag::FORWARD,
            Command::TearDown { .. } => tag::TEAR_DOWN,
            Command::Purge => tag::PURGE,
            Command::Ping(_) => tag::PING,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "Connect",
            Command::Forward { .. } => "Forward",
            Command::TearDown { .. } => "TearDown",
            Command::Purge => "Purge",
            Command::Ping(Ping::Request) => "Ping",
            Command::Ping(Ping::Response { .. }) => "Pong",
        }
    }

    /// Payload bytes carried by a Forward, zero for everything else.
    pub fn payload_len(&self) -> usize {
        match self {
            Command::Forward { payload, .. } => payload.len(),
            _ => 0,
        }
    }

    /// Size of the encoded command. Independent of the packet number.
    pub fn encoded_len(&self) -> usize {
        let fields = match self {
            Command::Connect { .. } | Command::TearDown { .. } => 4,
            Command::Forward { payload, .. } => 8 + payload.len(),
            Command::Purge => 0,
            Command::Ping(Ping::Request) => 1,
            Command::Ping(Ping::Response { .. }) => 9,
        };
        12 + fields
    }

    /// Append the encoded command to `out`.
    pub fn encode(&self, packet_number: u64, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        out.extend_from_slice(&self.tag().to_le_bytes());
        out.extend_from_slice(&packet_number.to_le_bytes());

        match self {
            Command::Connect { connection_id } | Command::TearDown { connection_id } => {
                out.extend_from_slice(&connection_id.to_le_bytes());
            }
            Command::Forward {
                connection_id,
                payload,
            } => {
                out.extend_from_slice(&connection_id.to_le_bytes());
                out.extend_from_slice(&(payload.len() as i32).to_le_bytes());
                out.extend_from_slice(payload);
            }
            Command::Purge => {}
            Command::Ping(Ping::Request) => out.push(ping_kind::REQUEST),
            Command::Ping(Ping::Response { responds_to }) => {
                out.push(ping_kind::RESPONSE);
                out.extend_from_slice(&responds_to.to_le_bytes());
            }
        }
    }

    pub fn to_bytes(&self, packet_number: u64) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(packet_number, &mut out);
        out
    }
}

/// Decode the next command.
///
/// Returns `Ok(None)` when the reader is exhausted before the first tag byte.
/// Running out of bytes anywhere later is reported as a malformed command.
pub fn decode<R: Read>(reader: &mut R) -> Result<Option<Packet>> {
    let mut tag_bytes = [0u8; 4];
    let first = loop {
        match reader.read(&mut tag_bytes[..1]) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    };
    if first == 0 {
        return Ok(None);
    }
    read_field(reader, &mut tag_bytes[1..], "command")?;
    let tag = u32::from_le_bytes(tag_bytes);

    let name = match tag {
        tag::CONNECT => "Connect",
        tag::FORWARD => "Forward",
        tag::PURGE => "Purge",
        tag::TEAR_DOWN => "TearDown",
        tag::PING => "Ping",
        other => return Err(TunnelError::UnknownCommand(other)),
    };

    let number = read_u64(reader, name)?;
    let command = match tag {
        tag::CONNECT => Command::Connect {
            connection_id: read_i32(reader, name)?,
        },
        tag::TEAR_DOWN => Command::TearDown {
            connection_id: read_i32(reader, name)?,
        },
        tag::FORWARD => {
            let connection_id = read_i32(reader, name)?;
            let len = read_i32(reader, name)?;
            if len < 0 || len as usize > MAX_PAYLOAD_SIZE {
                return Err(TunnelError::Malformed {
                    command: name,
                    reason: format!("payload length {len} out of range"),
                });
            }
            let mut payload = vec![0u8; len as usize];
            read_field(reader, &mut payload, name)?;
            Command::Forward {
                connection_id,
                payload,
            }
        }
        tag::PURGE => Command::Purge,
        _ => {
            let mut kind = [0u8; 1];
            read_field(reader, &mut kind, name)?;
            match kind[0] {
                ping_kind::REQUEST => Command::Ping(Ping::Request),
                ping_kind::RESPONSE => Command::Ping(Ping::Response {
                    responds_to: read_u64(reader, name)?,
                }),
                other => {
                    return Err(TunnelError::Malformed {
                        command: name,
                        reason: format!("unknown ping kind {other}"),
                    })
                }
            }
        }
    };

    Ok(Some(Packet { number, command }))
}

fn read_field<R: Read>(reader: &mut R, buf: &mut [u8], command: &'static str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TunnelError::Malformed {
                command,
                reason: "truncated".into(),
            }
        } else {
            TunnelError::Io(e)
        }
    })
}

fn read_i32<R: Read>(reader: &mut R, command: &'static str) -> Result<i32> {
    let mut b = [0u8; 4];
    read_field(reader, &mut b, command)?;
    Ok(i32::from_le_bytes(b))
}

fn read_u64<R: Read>(reader: &mut R, command: &'static str) -> Result<u64> {
    let mut b = [0u8; 8];
    read_field(reader, &mut b, command)?;
    Ok(u64::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn forward_layout_is_little_endian() {
        let cmd = Command::Forward {
            connection_id: 7,
            payload: b"hello".to_vec(),
        };
        let bytes = cmd.to_bytes(0x0102);
        assert_eq!(&bytes[0..4], &tag::FORWARD.to_le_bytes());
        assert_eq!(&bytes[4..12], &0x0102u64.to_le_bytes());
        assert_eq!(&bytes[12..16], &7i32.to_le_bytes());
        assert_eq!(&bytes[16..20], &5i32.to_le_bytes());
        assert_eq!(&bytes[20..], b"hello");
    }

    #[test]
    fn decodes_a_sequence_then_end_of_stream() {
        let mut buf = Vec::new();
        Command::Connect { connection_id: 3 }.encode(10, &mut buf);
        Command::Ping(Ping::Response { responds_to: 9 }).encode(11, &mut buf);
        Command::Purge.encode(12, &mut buf);

        let mut cursor = Cursor::new(buf);
        let first = decode(&mut cursor).unwrap().unwrap();
        assert_eq!(first.number, 10);
        assert_eq!(first.command, Command::Connect { connection_id: 3 });

        let second = decode(&mut cursor).unwrap().unwrap();
        assert_eq!(
            second.command,
            Command::Ping(Ping::Response { responds_to: 9 })
        );

        let third = decode(&mut cursor).unwrap().unwrap();
        assert_eq!(third.command, Command::Purge);
        assert_eq!(third.number, 12);

        assert!(decode(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = 42u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);
        let err = decode(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, TunnelError::UnknownCommand(42)));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn negative_payload_length_is_malformed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&tag::FORWARD.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&1i32.to_le_bytes());
        buf.extend_from_slice(&(-5i32).to_le_bytes());
        let err = decode(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, TunnelError::Malformed { command: "Forward", .. }));
    }

    #[test]
    fn truncated_command_is_malformed() {
        let bytes = Command::Forward {
            connection_id: 1,
            payload: vec![1, 2, 3, 4],
        }
        .to_bytes(5);
        let err = decode(&mut Cursor::new(&bytes[..bytes.len() - 2])).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn encoded_len_matches_encoding() {
        let commands = [
            Command::Connect { connection_id: 1 },
            Command::Forward {
                connection_id: 1,
                payload: vec![0; 300],
            },
            Command::TearDown { connection_id: 1 },
            Command::Purge,
            Command::Ping(Ping::Request),
            Command::Ping(Ping::Response { responds_to: 4 }),
        ];
        for cmd in commands {
            assert_eq!(cmd.encoded_len(), cmd.to_bytes(99).len(), "{}", cmd.name());
        }
    }

    #[test]
    fn counter_is_strictly_increasing() {
        let counter = PacketCounter::new();
        let a = counter.next();
        let b = counter.next();
        let c = counter.next();
        assert!(a < b && b < c);
    }
}
