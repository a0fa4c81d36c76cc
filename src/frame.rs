//! Length-prefixed message framing.
//!
//! Every message on the wire is `[4-byte big-endian length][payload]`. A
//! length of zero is not an empty payload: it is the orderly end-of-stream
//! marker, written by a closing endpoint so the peer's blocked reader can
//! return promptly on transports that cannot shut down half a stream.

use std::io;

use crate::channel::Channel;

const LEN_PREFIX_SIZE: usize = 4;

/// A single framed unit read off a channel.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// An opaque serialized payload.
    Payload(Vec<u8>),
    /// The zero-length marker, or a cleanly ended stream.
    EndOfStream,
}

/// Reads the next frame.
///
/// A stream that ends before the first length byte is a clean
/// [`Frame::EndOfStream`]; one that ends partway through the prefix or the
/// payload is a protocol error and surfaces as [`io::ErrorKind::UnexpectedEof`].
pub fn read_frame(channel: &dyn Channel) -> io::Result<Frame> {
    let mut prefix = [0u8; LEN_PREFIX_SIZE];
    match read_full(channel, &mut prefix)? {
        0 => return Ok(Frame::EndOfStream),
        LEN_PREFIX_SIZE => {}
        n => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("channel ended after {n} of {LEN_PREFIX_SIZE} length prefix bytes"),
            ));
        }
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Ok(Frame::EndOfStream);
    }

    let mut payload = vec![0u8; len];
    let got = read_full(channel, &mut payload)?;
    if got != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("channel ended after {got} of {len} payload bytes"),
        ));
    }
    Ok(Frame::Payload(payload))
}

/// Writes one payload frame and flushes it towards the peer.
pub fn write_frame(channel: &dyn Channel, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "message exceeds the 4-byte frame length limit",
        )
    })?;
    channel.write_all(&len.to_be_bytes())?;
    channel.write_all(payload)?;
    channel.flush()
}

/// Writes the orderly end-of-stream marker.
pub fn write_end_of_stream(channel: &dyn Channel) -> io::Result<()> {
    channel.write_all(&0u32.to_be_bytes())?;
    channel.flush()
}

/// Reads until `buf` is full or the stream ends, returning the bytes read.
fn read_full(channel: &dyn Channel, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = channel.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory;

    #[test]
    fn frame_round_trip() {
        let (a, b) = memory::pair();
        write_frame(a.as_ref(), b"hello").unwrap();
        assert_eq!(read_frame(b.as_ref()).unwrap(), Frame::Payload(b"hello".to_vec()));
    }

    #[test]
    fn frames_keep_their_boundaries() {
        let (a, b) = memory::pair();
        write_frame(a.as_ref(), b"first").unwrap();
        write_frame(a.as_ref(), b"second message").unwrap();

        assert_eq!(read_frame(b.as_ref()).unwrap(), Frame::Payload(b"first".to_vec()));
        assert_eq!(
            read_frame(b.as_ref()).unwrap(),
            Frame::Payload(b"second message".to_vec())
        );
    }

    #[test]
    fn zero_length_is_end_of_stream() {
        let (a, b) = memory::pair();
        write_end_of_stream(a.as_ref()).unwrap();
        assert_eq!(read_frame(b.as_ref()).unwrap(), Frame::EndOfStream);
    }

    #[test]
    fn clean_eof_is_end_of_stream() {
        let (a, b) = memory::pair();
        a.close();
        drop(a);
        assert_eq!(read_frame(b.as_ref()).unwrap(), Frame::EndOfStream);
    }

    #[test]
    fn partial_length_prefix_is_an_error() {
        let (a, b) = memory::pair();
        a.write_all(&[0, 0]).unwrap();
        a.close();
        drop(a);

        let err = read_frame(b.as_ref()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let (a, b) = memory::pair();
        a.write_all(&8u32.to_be_bytes()).unwrap();
        a.write_all(b"only").unwrap();
        a.close();
        drop(a);

        let err = read_frame(b.as_ref()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
