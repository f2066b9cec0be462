//! Length-prefixed JSON framing.
//!
//! Every frame is a 4-byte big-endian body length followed by exactly that
//! many bytes of UTF-8 JSON.  Reads and writes loop over partial I/O; a
//! zero-byte read or write means the peer has gone and surfaces as
//! [`TeleopError::ConnectionFault`].  A frame is either delivered whole or
//! not at all.

use std::io::{self, Read, Write};

use teleop_types::{Envelope, TeleopError};

/// Bytes in the length header.
pub const HEADER_LEN: usize = 4;

/// Largest body accepted from a peer.  A header beyond this is treated as
/// a broken stream rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Serialize `envelope` and write it as one frame.
///
/// # Errors
///
/// [`TeleopError::DecodeFault`] if the envelope cannot be encoded,
/// [`TeleopError::ConnectionFault`] if the stream fails or closes.
pub fn send<W: Write + ?Sized>(conn: &mut W, envelope: &Envelope) -> Result<(), TeleopError> {
    let body = envelope.to_json_bytes()?;
    let len = u32::try_from(body.len()).map_err(|_| {
        TeleopError::DecodeFault(format!(
            "{} body of {} bytes exceeds the frame header",
            envelope.cmd(),
            body.len()
        ))
    })?;
    write_all(conn, &len.to_be_bytes(), "send header")?;
    write_all(conn, &body, "send body")?;
    conn.flush()
        .map_err(|e| TeleopError::connection("flush", e))
}

/// Read exactly one frame and decode it.
///
/// # Errors
///
/// [`TeleopError::ConnectionFault`] if the stream fails, closes mid-frame
/// or announces an oversized body; [`TeleopError::DecodeFault`] if the body
/// is not a valid envelope.  In the latter case the frame has been fully
/// consumed and the stream is still aligned.
pub fn receive<R: Read + ?Sized>(conn: &mut R) -> Result<Envelope, TeleopError> {
    let mut header = [0u8; HEADER_LEN];
    read_exact(conn, &mut header, "receive header")?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TeleopError::connection(
            "receive header",
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"),
            ),
        ));
    }
    let mut body = vec![0u8; len];
    read_exact(conn, &mut body, "receive body")?;
    Envelope::from_json_bytes(&body)
}

fn write_all<W: Write + ?Sized>(conn: &mut W, mut buf: &[u8], context: &str) -> Result<(), TeleopError> {
    while !buf.is_empty() {
        match conn.write(buf) {
            Ok(0) => return Err(TeleopError::peer_closed(context)),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(TeleopError::connection(context, e)),
        }
    }
    Ok(())
}

fn read_exact<R: Read + ?Sized>(conn: &mut R, mut buf: &mut [u8], context: &str) -> Result<(), TeleopError> {
    while !buf.is_empty() {
        match conn.read(buf) {
            Ok(0) => return Err(TeleopError::peer_closed(context)),
            Ok(n) => buf = &mut buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(TeleopError::connection(context, e)),
        }
    }
    Ok(())
}
