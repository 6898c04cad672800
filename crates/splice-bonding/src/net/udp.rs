use splice_transport::wire::{classify_recv, decode, parse, Message, PacketHeader, RxStatus};
use std::net::{SocketAddr, UdpSocket};
use tracing::{debug, warn};

use crate::error::SessionError;

/// One classified read from a socket.
pub struct Datagram {
    pub status: RxStatus,
    pub len: usize,
    pub from: Option<SocketAddr>,
}

impl Datagram {
    /// Header of a datagram that was read, whatever its classification.
    pub fn header(&self, buf: &[u8]) -> Option<PacketHeader> {
        self.from?;
        decode(&buf[..self.len]).map(|(hdr, _)| hdr)
    }

    /// Decode a datagram that passed validation. Undecodable bodies are
    /// logged and yield `None`.
    pub fn message(&self, buf: &[u8]) -> Option<(PacketHeader, Message)> {
        if self.status != RxStatus::Ok && self.status != RxStatus::PeerTerminated {
            return None;
        }
        match parse(&buf[..self.len]) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(error = %e, "undecodable packet dropped");
                None
            }
        }
    }
}

/// Read one datagram into `buf` and classify it for `local_id`. `buf` should
/// be one byte longer than the largest packet so oversize datagrams are
/// detected.
pub fn recv_classified(socket: &UdpSocket, buf: &mut [u8], local_id: u8) -> Datagram {
    match socket.recv_from(buf) {
        Ok((len, from)) => Datagram {
            status: classify_recv(&Ok(len), buf, local_id),
            len,
            from: Some(from),
        },
        Err(e) => Datagram {
            status: classify_recv(&Err(e), buf, local_id),
            len: 0,
            from: None,
        },
    }
}

pub fn send_message(
    socket: &UdpSocket,
    msg: &Message,
    src: u8,
    dst: u8,
    to: SocketAddr,
) -> Result<(), SessionError> {
    let pkt = msg.encode(src, dst)?;
    socket.send_to(&pkt, to)?;
    debug!(packet_type = %msg.packet_type(), dst, %to, "sent");
    Ok(())
}

/// Send `msg` to every server, addressing each with its own id. Send
/// failures are logged and counted; the return value is the number that
/// went out.
pub fn broadcast(socket: &UdpSocket, msg: &Message, src: u8, servers: &[SocketAddr]) -> usize {
    let mut sent = 0;
    for (dst, addr) in servers.iter().enumerate() {
        match send_message(socket, msg, src, dst as u8, *addr) {
            Ok(()) => sent += 1,
            Err(e) => warn!(dst, %addr, packet_type = %msg.packet_type(), error = %e, "broadcast send failed"),
        }
    }
    sent
}
