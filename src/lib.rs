//! Parlo frames discrete packets over a reliable byte stream, with optional
//! payload compression, optional symmetric encryption, and a liveness
//! protocol built on periodic heartbeats.
//!
//! ## Design goals
//!
//! * Two counterparts, nothing more: a [`Listener`] that accepts inbound
//!   stream connections, and a [`NetworkClient`] that either connects
//!   outbound or wraps an accepted stream
//! * The abstraction is sending / receiving *packets* (defined-length chunks
//!   of data with an application-chosen id), not a stream of bytes
//!   * the receive path reassembles packets from however the transport
//!     chunks the stream; application handlers only ever see whole packets,
//!     in arrival order
//! * Keep-alive and failure detection are built in: both sides emit
//!   heartbeats on a fixed interval and declare the peer dead after too many
//!   silent intervals
//!   * heartbeats double as an RTT probe, which in turn gates whether
//!     outgoing payloads are worth compressing
//! * Orderly shutdown is a protocol concern: each side announces a goodbye
//!   with a grace period before tearing the transport down
//! * Explicitly *not* in scope: routing beyond a single endpoint pair,
//!   logical-channel multiplexing, delivery guarantees over datagrams,
//!   authentication, key exchange, TLS
//!
//! ## Wire format
//!
//! Standard frame, length in little-endian byte order:
//!
//! ```ascii
//! 0: packet id (u8)
//! 1: compressed flag (u8, 0 or 1)
//! 2: total frame length including this header (u16 LE)
//! 4: payload (length - 4 bytes)
//! ```
//!
//! The datagram variant carries one extra flag byte (reliable, u8) between
//! the compressed flag and the length; its header is 5 bytes. Only the
//! layout is defined here - reassembly, retransmission and ordering over an
//! unreliable transport are out of scope.
//!
//! Encrypted frames reuse the standard layout with the flag byte as the
//! encryption marker and the ciphertext as payload, so they pass through the
//! same reassembly path.
//!
//! Ids `0xFD` (heartbeat), `0xFE` (server goodbye) and `0xFF` (client
//! goodbye) are reserved for the protocol; see [`control_packets::ids`].
//!
//! Heartbeat body (16 bytes): `time_since_last` (i64 LE millis), then
//! `sent_timestamp` (i64 LE millis since the epoch). Goodbye body (16
//! bytes): `timeout` (i64 LE seconds), then `sent_time` (i64 LE seconds
//! since the epoch).
//!
//! ## Concurrency
//!
//! Everything runs on the shared tokio runtime. A server with N live
//! connections runs one accept task plus, per connection, a receive task, a
//! heartbeat sender, a heartbeat monitor and the reassembly worker. Packet
//! handlers for one connection run serialized on its reassembly worker.
//! Teardown is cooperative: stop signals plus task aborts as a backstop on
//! drop.

pub mod blocking_queue;
pub mod compression;
pub mod config;
pub mod control_packets;
pub mod encryption;
pub mod error;
pub mod listener;
pub mod network_client;
pub mod packet;
pub mod packet_handler;
pub mod processing_buffer;
pub mod socket;

pub use blocking_queue::BlockingQueue;
pub use compression::{DeflateCodec, PayloadCodec};
pub use config::ParloConfig;
pub use control_packets::{GoodbyePayload, HeartbeatPayload};
pub use encryption::{CipherMode, EncryptedPacket, EncryptionArgs};
pub use error::{ParloError, Result};
pub use listener::{ClientRegistry, Listener};
pub use network_client::NetworkClient;
pub use packet::{Packet, MAX_PACKET_SIZE};
pub use packet_handler::PacketHandlerRegistry;
pub use processing_buffer::ProcessingBuffer;
pub use socket::{StreamSocket, TcpStreamSocket};
