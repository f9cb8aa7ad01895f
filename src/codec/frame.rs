//! Length-delimited framing for the TCP transport: `{0x94, 0xC3, hi, lo}`
//! magic where `(hi, lo)` is the big-endian payload length, followed by
//! `payload` protobuf bytes. Mirrors the scan loop the device layer used to
//! run over raw serial bytes, generalized to any byte source.

const MAGIC_0: u8 = 0x94;
const MAGIC_1: u8 = 0xC3;
const MAX_FRAME_LEN: usize = 1024 * 16;

/// An accumulating frame scanner. Feed it bytes as they arrive from the
/// transport; it yields complete frames and silently discards noise that
/// doesn't start with the magic bytes (mirrors the serial transport's
/// tolerance of framing garbage without ever treating it as fatal).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder { buf: Vec::new() }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete frame out of the buffer, if any. Resyncs past
    /// stray bytes until it finds the magic pair.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let magic_pos = self
                .buf
                .windows(2)
                .position(|w| w[0] == MAGIC_0 && w[1] == MAGIC_1)?;

            if magic_pos > 0 {
                self.buf.drain(0..magic_pos);
            }

            if self.buf.len() < 4 {
                return None;
            }

            let hi = self.buf[2] as usize;
            let lo = self.buf[3] as usize;
            let len = (hi << 8) | lo;

            if len == 0 || len > MAX_FRAME_LEN {
                // Not a plausible length for a real frame; skip the magic
                // bytes we just matched and keep resyncing.
                self.buf.drain(0..2);
                continue;
            }

            let total = 4 + len;
            if self.buf.len() < total {
                return None;
            }

            let frame: Vec<u8> = self.buf.drain(0..total).collect();
            return Some(frame[4..].to_vec());
        }
    }
}

/// Encode a `ToRadio` payload as a length-delimited frame ready to write to
/// the transport.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(4 + len);
    out.push(MAGIC_0);
    out.push(MAGIC_1);
    out.push((len >> 8) as u8);
    out.push((len & 0xFF) as u8);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_frame() {
        let payload = b"hello meshtastic";
        let framed = encode_frame(payload);

        let mut dec = FrameDecoder::new();
        dec.feed(&framed);
        let got = dec.next_frame().expect("frame");
        assert_eq!(got, payload);
        assert!(dec.next_frame().is_none());
    }

    #[test]
    fn resyncs_past_garbage_prefix() {
        let payload = b"abc";
        let mut bytes = vec![0x01, 0x02, 0x03];
        bytes.extend(encode_frame(payload));

        let mut dec = FrameDecoder::new();
        dec.feed(&bytes);
        assert_eq!(dec.next_frame().unwrap(), payload);
    }

    #[test]
    fn handles_split_reads() {
        let payload = b"fragmented payload";
        let framed = encode_frame(payload);
        let mut dec = FrameDecoder::new();

        dec.feed(&framed[0..3]);
        assert!(dec.next_frame().is_none());
        dec.feed(&framed[3..]);
        assert_eq!(dec.next_frame().unwrap(), payload);
    }

    #[test]
    fn yields_multiple_queued_frames() {
        let mut bytes = Vec::new();
        bytes.extend(encode_frame(b"one"));
        bytes.extend(encode_frame(b"two"));

        let mut dec = FrameDecoder::new();
        dec.feed(&bytes);
        assert_eq!(dec.next_frame().unwrap(), b"one");
        assert_eq!(dec.next_frame().unwrap(), b"two");
        assert!(dec.next_frame().is_none());
    }
}
