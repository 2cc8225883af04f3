//! Little-endian cursor codecs and packet framing constants.
//!
//! Every writer/reader takes the buffer plus an in/out cursor and
//! bounds-checks against the buffer length. Violating the bounds is a
//! programming error, not a recoverable condition, so the checks are plain
//! asserts rather than `Result`s.

/// Maximum length of a framed packet including header and length prefix.
pub const MAX_PACKET_LEN: usize = 4096;
/// Header byte plus the u16 payload length prefix.
pub const MIN_PACKET_LEN: usize = 3;
/// Maximum payload bytes that fit in a single packet.
pub const MAX_PAYLOAD_LEN: usize = MAX_PACKET_LEN - MIN_PACKET_LEN;

/// Maximum bytes of a length-prefixed string payload.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

macro_rules! write_le {
    ($name:ident, $ty:ty) => {
        pub fn $name(buf: &mut [u8], pos: &mut usize, val: $ty) {
            let size = std::mem::size_of::<$ty>();
            assert!(*pos + size <= buf.len(), "out of buffer space");
            buf[*pos..*pos + size].copy_from_slice(&val.to_le_bytes());
            *pos += size;
        }
    };
}

macro_rules! read_le {
    ($name:ident, $ty:ty) => {
        pub fn $name(buf: &[u8], pos: &mut usize) -> $ty {
            let size = std::mem::size_of::<$ty>();
            assert!(*pos + size <= buf.len(), "out of buffer space");
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            raw.copy_from_slice(&buf[*pos..*pos + size]);
            *pos += size;
            <$ty>::from_le_bytes(raw)
        }
    };
}

write_le!(write_u8, u8);
write_le!(write_i8, i8);
write_le!(write_u16, u16);
write_le!(write_i16, i16);
write_le!(write_u32, u32);
write_le!(write_i32, i32);
write_le!(write_u64, u64);
write_le!(write_i64, i64);
write_le!(write_f32, f32);
write_le!(write_f64, f64);

read_le!(read_u8, u8);
read_le!(read_i8, i8);
read_le!(read_u16, u16);
read_le!(read_i16, i16);
read_le!(read_u32, u32);
read_le!(read_i32, i32);
read_le!(read_u64, u64);
read_le!(read_i64, i64);
read_le!(read_f32, f32);
read_le!(read_f64, f64);

pub fn write_bool(buf: &mut [u8], pos: &mut usize, val: bool) {
    write_u8(buf, pos, val as u8);
}

pub fn read_bool(buf: &[u8], pos: &mut usize) -> bool {
    read_u8(buf, pos) != 0
}

/// Writes a u16-length-prefixed UTF-8 string (no terminator).
pub fn write_str(buf: &mut [u8], pos: &mut usize, val: &str) {
    let bytes = val.as_bytes();
    assert!(bytes.len() <= MAX_STRING_LEN, "string too long");
    write_u16(buf, pos, bytes.len() as u16);
    assert!(*pos + bytes.len() <= buf.len(), "out of buffer space");
    buf[*pos..*pos + bytes.len()].copy_from_slice(bytes);
    *pos += bytes.len();
}

/// Reads a u16-length-prefixed UTF-8 string.
///
/// Non-UTF-8 payload bytes are replaced, never rejected; the framing layer
/// already guarantees the length is in bounds for well-formed peers.
pub fn read_str(buf: &[u8], pos: &mut usize) -> String {
    let len = read_u16(buf, pos) as usize;
    assert!(*pos + len <= buf.len(), "out of buffer space");
    let s = String::from_utf8_lossy(&buf[*pos..*pos + len]).into_owned();
    *pos += len;
    s
}

/// Byte size `write_str` will occupy for the given string.
pub fn str_size(val: &str) -> usize {
    2 + val.len()
}

/// Serializes a packet frame (`header | len u16 LE | payload`) into `out`.
pub fn frame_packet(out: &mut Vec<u8>, header: u8, payload: &[u8]) {
    assert!(payload.len() <= MAX_PAYLOAD_LEN, "payload exceeds packet size");
    out.push(header);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Attempts to parse one complete packet from the head of `buf`.
///
/// Returns `(header, payload_len)` when a full packet is available;
/// the payload then spans `buf[MIN_PACKET_LEN..MIN_PACKET_LEN + len]`.
pub fn parse_packet(buf: &[u8]) -> Option<(u8, usize)> {
    if buf.len() < MIN_PACKET_LEN {
        return None;
    }
    let header = buf[0];
    let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
    if buf.len() < MIN_PACKET_LEN + len {
        return None;
    }
    Some((header, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut buf = [0u8; 128];
        let mut pos = 0;
        write_u8(&mut buf, &mut pos, 0xfe);
        write_u16(&mut buf, &mut pos, 0xbeef);
        write_u32(&mut buf, &mut pos, 0xdead_beef);
        write_u64(&mut buf, &mut pos, u64::MAX - 17);
        write_i64(&mut buf, &mut pos, -42);
        write_f32(&mut buf, &mut pos, 1.5);
        write_f64(&mut buf, &mut pos, -0.25);
        write_bool(&mut buf, &mut pos, true);
        let written = pos;

        let mut pos = 0;
        assert_eq!(read_u8(&buf, &mut pos), 0xfe);
        assert_eq!(read_u16(&buf, &mut pos), 0xbeef);
        assert_eq!(read_u32(&buf, &mut pos), 0xdead_beef);
        assert_eq!(read_u64(&buf, &mut pos), u64::MAX - 17);
        assert_eq!(read_i64(&buf, &mut pos), -42);
        assert_eq!(read_f32(&buf, &mut pos), 1.5);
        assert_eq!(read_f64(&buf, &mut pos), -0.25);
        assert!(read_bool(&buf, &mut pos));
        assert_eq!(pos, written);
    }

    #[test]
    fn strings_round_trip() {
        let mut buf = [0u8; 64];
        let mut pos = 0;
        write_str(&mut buf, &mut pos, "weather");
        write_str(&mut buf, &mut pos, "");
        assert_eq!(pos, str_size("weather") + str_size(""));

        let mut pos = 0;
        assert_eq!(read_str(&buf, &mut pos), "weather");
        assert_eq!(read_str(&buf, &mut pos), "");
    }

    #[test]
    fn integers_are_little_endian() {
        let mut buf = [0u8; 4];
        let mut pos = 0;
        write_u32(&mut buf, &mut pos, 0x0403_0201);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn packet_framing() {
        let mut out = Vec::new();
        frame_packet(&mut out, 7, b"xyz");
        assert_eq!(out, [7, 3, 0, b'x', b'y', b'z']);
        assert_eq!(parse_packet(&out), Some((7, 3)));
        // incomplete frames parse to nothing
        assert_eq!(parse_packet(&out[..2]), None);
        assert_eq!(parse_packet(&out[..5]), None);
    }
}
