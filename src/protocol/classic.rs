/// Classic protocol framing
///
/// Packets are a 3-byte little-endian payload length, a sequence id, and the
/// payload. The server always speaks first; the handshake is complete once
/// the authentication result packet (sequence 2) has passed through. Clients
/// that switch to TLS stop being inspectable after their handshake response,
/// and a server error packet during the handshake is forwarded as-is.
use std::io;

use super::{Conduit, TransferState};

pub(crate) const DEFAULT_PORT: u16 = 3306;

/// Length prefix (3 bytes) plus sequence id
const HEADER_LEN: usize = 4;
/// First payload byte of an error packet
const ERR_MARKER: u8 = 0xff;

/// Capability flag: client switches to TLS after the handshake response
const CLIENT_SSL: u32 = 0x0800;
const CLIENT_PROTOCOL_41: u32 = 0x0200;
const CLIENT_CONNECT_WITH_DB: u32 = 0x0008;
const CLIENT_SECURE_CONNECTION: u32 = 0x8000;

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

pub(crate) async fn copy_packets<S, D>(
    src: &S,
    dst: &mut D,
    buffer: &mut [u8],
    state: &mut TransferState,
    server_to_client: bool,
) -> io::Result<usize>
where
    S: Conduit + ?Sized,
    D: Conduit + ?Sized,
{
    let n = match src.try_read(buffer) {
        Ok(0) => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ))
        }
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
        Err(e) => return Err(e),
    };

    if !state.handshake_done {
        inspect_handshake(&buffer[..n], state, server_to_client)?;
        // The authentication result packet carries sequence 2; from here on
        // the session is established and packets pass through unframed.
        if state.pktnr >= 2 {
            state.handshake_done = true;
        }
    }

    dst.send_all(&buffer[..n]).await?;
    Ok(n)
}

fn inspect_handshake(
    data: &[u8],
    state: &mut TransferState,
    server_to_client: bool,
) -> io::Result<()> {
    if data.len() < HEADER_LEN {
        return Err(invalid("incomplete packet header during handshake".to_string()));
    }

    let seq = data[3];
    if state.pktnr > 0 && seq != state.pktnr.wrapping_add(1) {
        return Err(invalid(format!(
            "unexpected packet number {} (last was {})",
            seq, state.pktnr
        )));
    }

    // Server reported a handshake failure. The packet is forwarded verbatim
    // and the handshake counts as finished; the client decides what to do.
    if server_to_client && data.len() > HEADER_LEN && data[HEADER_LEN] == ERR_MARKER {
        state.pktnr = 2;
        return Ok(());
    }

    // Handshake response from the client. If it asks for TLS, everything
    // after this packet is opaque to us.
    if !server_to_client && seq == 1 && data.len() >= HEADER_LEN + 4 {
        let caps = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if caps & CLIENT_SSL != 0 {
            state.pktnr = 2;
            return Ok(());
        }
    }

    state.pktnr = seq;
    Ok(())
}

pub(crate) async fn send_error<D>(
    dst: &mut D,
    code: u16,
    message: &str,
    sql_state: &str,
) -> io::Result<()>
where
    D: Conduit + ?Sized,
{
    dst.send_all(&error_packet(0, code, message, sql_state)).await
}

/// Serialize an error packet with the given sequence id.
pub(crate) fn error_packet(seq: u8, code: u16, message: &str, sql_state: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(9 + message.len());
    payload.push(ERR_MARKER);
    payload.extend_from_slice(&code.to_le_bytes());
    payload.push(b'#');
    let mut state_bytes = [b'0'; 5];
    for (i, b) in sql_state.bytes().take(5).enumerate() {
        state_bytes[i] = b;
    }
    payload.extend_from_slice(&state_bytes);
    payload.extend_from_slice(message.as_bytes());
    frame(seq, &payload)
}

/// A handshake response for a non-existent user, written to the server when
/// its client got rejected. Backends track aborted handshakes per source
/// host; completing the exchange keeps the router itself off that list.
pub(crate) fn fake_handshake_response() -> Vec<u8> {
    let caps = CLIENT_PROTOCOL_41 | CLIENT_CONNECT_WITH_DB | CLIENT_SECURE_CONNECTION;
    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(&caps.to_le_bytes());
    payload.extend_from_slice(&(16u32 * 1024 * 1024).to_le_bytes());
    payload.push(0x21); // utf8_general_ci
    payload.extend_from_slice(&[0u8; 23]);
    payload.extend_from_slice(b"ROUTER\0");
    payload.push(0); // empty auth response
    payload.extend_from_slice(b"fake_router_login\0");
    frame(1, &payload)
}

pub(crate) async fn on_block_client_host<D>(server: &mut D, route: &str) -> io::Result<()>
where
    D: Conduit + ?Sized,
{
    log::debug!("[{}] writing fake handshake response to server", route);
    server.send_all(&fake_handshake_response()).await
}

fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(HEADER_LEN + len);
    out.push((len & 0xff) as u8);
    out.push(((len >> 8) & 0xff) as u8);
    out.push(((len >> 16) & 0xff) as u8);
    out.push(seq);
    out.extend_from_slice(payload);
    out
}
