/// X protocol framing
///
/// Messages are a 4-byte little-endian length (covering the type byte and
/// payload) followed by a one-byte message type. The client speaks first;
/// the handshake is over once the server answers authentication with
/// AuthenticateOk, or with an Error message. Synthesized errors are
/// hand-encoded Mysqlx.Error messages, the only protobuf this module ever
/// has to produce.
use std::io;

use super::{Conduit, TransferState};

pub(crate) const DEFAULT_PORT: u16 = 33060;

/// Length prefix plus message type
const HEADER_LEN: usize = 5;

/// Server message type: Mysqlx.Error
const MSG_ERROR: u8 = 1;
/// Server message type: Mysqlx.Session.AuthenticateOk
const MSG_AUTHENTICATE_OK: u8 = 4;

/// Mysqlx.Error severity FATAL
const SEVERITY_FATAL: u64 = 1;

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
        inspect_frames(&buffer[..n], state, server_to_client)?;
    }

    dst.send_all(&buffer[..n]).await?;
    Ok(n)
}

/// Walk the complete frames in a read chunk. Only server messages can end
/// the handshake; client messages are passed through with a length sanity
/// check. A partial frame at the end of the chunk is left to the peer's
/// reassembly, as the bytes are forwarded verbatim either way.
fn inspect_frames(data: &[u8], state: &mut TransferState, server_to_client: bool) -> io::Result<()> {
    let mut offset = 0usize;
    while offset + HEADER_LEN <= data.len() {
        let length = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        if length < 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "zero-length message frame",
            ));
        }
        let msg_type = data[offset + 4];
        if server_to_client && (msg_type == MSG_AUTHENTICATE_OK || msg_type == MSG_ERROR) {
            state.handshake_done = true;
        }
        state.pktnr = state.pktnr.wrapping_add(1);
        offset += 4 + length;
    }
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
    dst.send_all(&error_frame(code, message, sql_state)).await
}

/// Serialize a Mysqlx.Error message (severity FATAL) inside a framed
/// X protocol message.
pub(crate) fn error_frame(code: u16, message: &str, sql_state: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(16 + message.len() + sql_state.len());
    // field 1 (severity), varint
    body.push(0x08);
    put_varint(SEVERITY_FATAL, &mut body);
    // field 2 (code), varint
    body.push(0x10);
    put_varint(code as u64, &mut body);
    // field 3 (msg), length-delimited
    body.push(0x1a);
    put_varint(message.len() as u64, &mut body);
    body.extend_from_slice(message.as_bytes());
    // field 4 (sql_state), length-delimited
    body.push(0x22);
    put_varint(sql_state.len() as u64, &mut body);
    body.extend_from_slice(sql_state.as_bytes());

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&((body.len() + 1) as u32).to_le_bytes());
    out.push(MSG_ERROR);
    out.extend_from_slice(&body);
    out
}

/// The X protocol has no handshake the server meters per source host, so
/// blocking a client needs no server-side advisory.
pub(crate) fn on_block_client_host(route: &str) -> io::Result<()> {
    log::debug!("[{}] client host blocked, nothing to tell the server", route);
    Ok(())
}

fn put_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(msg_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((payload.len() + 1) as u32).to_le_bytes());
        out.push(msg_type);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_varint_encoding() {
        let mut out = Vec::new();
        put_varint(1, &mut out);
        assert_eq!(out, [0x01]);

        out.clear();
        put_varint(300, &mut out);
        assert_eq!(out, [0xac, 0x02]);

        out.clear();
        put_varint(2003, &mut out);
        assert_eq!(out, [0xd3, 0x0f]);
    }

    #[test]
    fn test_error_frame_layout() {
        let frame = error_frame(1040, "Too many connections", "HY000");
        let length = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(length, frame.len() - 4);
        assert_eq!(frame[4], MSG_ERROR);

        let body = &frame[5..];
        // severity FATAL
        assert_eq!(&body[..2], &[0x08, 0x01]);
        // code 1040 as varint after tag 0x10
        assert_eq!(body[2], 0x10);
        assert_eq!(&body[3..5], &[0x90, 0x08]);
        // message then sqlstate as length-delimited fields
        assert!(body.windows(20).any(|w| w == b"Too many connections"));
        assert!(body.windows(5).any(|w| w == b"HY000"));
    }

    #[test]
    fn test_authenticate_ok_completes_handshake() {
        let mut state = TransferState::default();
        inspect_frames(&message(4, b"\x0a\x00"), &mut state, true).unwrap();
        assert!(state.handshake_done);
    }

    #[test]
    fn test_server_error_completes_handshake() {
        let mut state = TransferState::default();
        let frame = error_frame(1045, "Access denied", "28000");
        inspect_frames(&frame, &mut state, true).unwrap();
        assert!(state.handshake_done);
    }

    #[test]
    fn test_client_messages_do_not_complete_handshake() {
        let mut state = TransferState::default();
        // CapabilitiesGet (client type 1) must not be mistaken for an error
        inspect_frames(&message(1, &[]), &mut state, false).unwrap();
        // AuthenticateStart (client type 4)
        inspect_frames(&message(4, b"mysql41"), &mut state, false).unwrap();
        assert!(!state.handshake_done);
        assert_eq!(state.pktnr, 2);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut state = TransferState::default();
        let mut chunk = message(3, b"continue");
        chunk.extend_from_slice(&message(MSG_AUTHENTICATE_OK, &[]));
        inspect_frames(&chunk, &mut state, true).unwrap();
        assert!(state.handshake_done);
        assert_eq!(state.pktnr, 2);
    }

    #[test]
    fn test_zero_length_frame_is_error() {
        let mut state = TransferState::default();
        let bad = [0u8, 0, 0, 0, 1];
        let err = inspect_frames(&bad, &mut state, true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
