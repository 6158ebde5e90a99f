//! # Frame Codec
//!
//! Little-endian framing shared by dictionaries, records and queues.
//!
//! ## Wire Layout
//!
//! ```text
//! frame     = [u32 size incl. header][u32 id][payload ...]
//! preamble  = "TNDM" [u8 version] [u8 byte order] [u32 socket id] dictionary-frame
//! ```
//!
//! Template ids start at 1. Id 0 marks a dictionary frame. A queue buffer
//! uses the same 8-byte header with the record count in place of the id.

use crate::error::{NetError, NetResult};
use crate::protocol::Dictionary;
use crate::transport::SocketId;
use std::io::{ErrorKind, Read, Write};

/// Bytes in a frame header: size then id.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest frame a peer may send.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// First bytes of every connection.
pub const PREAMBLE_MAGIC: [u8; 4] = *b"TNDM";

/// Protocol revision carried in the preamble.
pub const PROTOCOL_VERSION: u8 = 1;

/// Byte-order tag for little-endian. The only order we speak.
pub const BYTE_ORDER_LITTLE: u8 = 0;

/// Frame id reserved for the dictionary.
pub const DICTIONARY_FRAME_ID: u32 = 0;

/// Appends one frame to a growable buffer, patching the size on finish.
pub struct FrameWriter<'a> {
    out: &'a mut Vec<u8>,
    start: usize,
}

impl<'a> FrameWriter<'a> {
    /// Starts a frame with the given id.
    pub fn begin(out: &'a mut Vec<u8>, id: u32) -> Self {
        let start = out.len();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&id.to_le_bytes());
        Self { out, start }
    }

    /// Writes a single byte.
    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.out.push(value);
    }

    /// Writes a u32 in little-endian format.
    #[inline]
    pub fn write_u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes an i32 in little-endian format.
    #[inline]
    pub fn write_i32(&mut self, value: i32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes an f32 in little-endian format.
    #[inline]
    pub fn write_f32(&mut self, value: f32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes raw bytes.
    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) {
        self.write_u32(len_u32(value.len()));
        self.write_bytes(value.as_bytes());
    }

    /// Patches the size field. Returns the frame length.
    pub fn finish(self) -> usize {
        let size = self.out.len() - self.start;
        self.out[self.start..self.start + 4].copy_from_slice(&len_u32(size).to_le_bytes());
        size
    }
}

/// Cursor over a received frame.
pub struct FrameReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    /// Creates a reader at the start of `data`.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Bytes not yet consumed.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// Current offset.
    #[inline]
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Reads `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> NetResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(NetError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let bytes = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> NetResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Reads a u32 in little-endian format.
    pub fn read_u32(&mut self) -> NetResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Reads an i32 in little-endian format.
    pub fn read_i32(&mut self) -> NetResult<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    /// Reads an f32 in little-endian format.
    pub fn read_f32(&mut self) -> NetResult<f32> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> NetResult<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| NetError::MalformedDictionary("name is not UTF-8".into()))
    }

    fn read_array(&mut self) -> NetResult<[u8; 4]> {
        let bytes = self.read_bytes(4)?;
        Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

/// Size field of a frame, if the header is present.
#[must_use]
pub fn peek_size(frame: &[u8]) -> Option<usize> {
    let bytes: [u8; 4] = frame.get(0..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes) as usize)
}

/// Id field of a frame, if the header is present.
#[must_use]
pub fn peek_id(frame: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = frame.get(4..8)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Reads one whole frame into `buffer`, replacing its contents.
///
/// A clean end-of-stream before the header maps to [`NetError::Disconnected`].
pub fn read_frame<R: Read>(reader: &mut R, buffer: &mut Vec<u8>) -> NetResult<()> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).map_err(map_read_error)?;
    let size = u32::from_le_bytes(header) as usize;
    if !(FRAME_HEADER_SIZE..=MAX_FRAME_SIZE).contains(&size) {
        return Err(NetError::BadFrameSize {
            size,
            min: FRAME_HEADER_SIZE,
            max: MAX_FRAME_SIZE,
        });
    }
    buffer.clear();
    buffer.resize(size, 0);
    buffer[..4].copy_from_slice(&header);
    reader.read_exact(&mut buffer[4..]).map_err(map_read_error)?;
    Ok(())
}

/// Writes the connection preamble a server sends to every new socket.
pub fn write_preamble<W: Write>(writer: &mut W, socket_id: SocketId, dictionary: &Dictionary) -> NetResult<()> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&PREAMBLE_MAGIC);
    out.push(PROTOCOL_VERSION);
    out.push(BYTE_ORDER_LITTLE);
    out.extend_from_slice(&socket_id.0.to_le_bytes());
    dictionary.encode(&mut out);
    writer.write_all(&out)?;
    writer.flush()?;
    Ok(())
}

/// Reads the preamble: the id the server gave our socket, and its dictionary.
pub fn read_preamble<R: Read>(reader: &mut R) -> NetResult<(SocketId, Dictionary)> {
    let mut head = [0u8; 10];
    reader.read_exact(&mut head).map_err(map_read_error)?;
    let magic = [head[0], head[1], head[2], head[3]];
    if magic != PREAMBLE_MAGIC {
        return Err(NetError::BadMagic(magic));
    }
    if head[4] != PROTOCOL_VERSION {
        return Err(NetError::UnsupportedVersion(head[4]));
    }
    if head[5] != BYTE_ORDER_LITTLE {
        return Err(NetError::UnsupportedByteOrder(head[5]));
    }
    let socket_id = SocketId(u32::from_le_bytes([head[6], head[7], head[8], head[9]]));

    let mut frame = Vec::new();
    read_frame(reader, &mut frame)?;
    let dictionary = Dictionary::decode(&frame)?;
    Ok((socket_id, dictionary))
}

fn map_read_error(err: std::io::Error) -> NetError {
    if err.kind() == ErrorKind::UnexpectedEof {
        NetError::Disconnected
    } else {
        NetError::Io(err)
    }
}

/// Wire lengths are u32. Frames above [`MAX_FRAME_SIZE`] are rejected
/// on read, so saturating here only affects frames no peer would accept.
#[inline]
pub(crate) fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FieldKind, RecordTemplate};
    use std::io::Cursor;

    #[test]
    fn test_writer_patches_size() {
        let mut out = Vec::new();
        let mut writer = FrameWriter::begin(&mut out, 9);
        writer.write_i32(-1);
        writer.write_str("ab");
        let len = writer.finish();

        assert_eq!(len, 8 + 4 + 4 + 2);
        assert_eq!(peek_size(&out), Some(len));
        assert_eq!(peek_id(&out), Some(9));

        let mut reader = FrameReader::new(&out[FRAME_HEADER_SIZE..]);
        assert_eq!(reader.read_i32().unwrap(), -1);
        assert_eq!(reader.read_str().unwrap(), "ab");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_reader_reports_truncation() {
        let mut reader = FrameReader::new(&[1, 2]);
        match reader.read_u32() {
            Err(NetError::Truncated { needed: 4, available: 2 }) => {}
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn test_read_frame_rejects_bad_sizes() {
        let mut buffer = Vec::new();
        let tiny = 3u32.to_le_bytes();
        assert!(matches!(
            read_frame(&mut Cursor::new(tiny), &mut buffer),
            Err(NetError::BadFrameSize { size: 3, .. })
        ));

        let huge = u32::MAX.to_le_bytes();
        assert!(matches!(
            read_frame(&mut Cursor::new(huge), &mut buffer),
            Err(NetError::BadFrameSize { .. })
        ));
    }

    #[test]
    fn test_read_frame_eof_is_disconnect() {
        let mut buffer = Vec::new();
        assert!(matches!(
            read_frame(&mut Cursor::new(Vec::<u8>::new()), &mut buffer),
            Err(NetError::Disconnected)
        ));

        // Header promises 16 bytes, only 10 arrive.
        let mut partial = 16u32.to_le_bytes().to_vec();
        partial.extend_from_slice(&[0; 6]);
        assert!(matches!(
            read_frame(&mut Cursor::new(partial), &mut buffer),
            Err(NetError::Disconnected)
        ));
    }

    #[test]
    fn test_preamble_carries_id_and_dictionary() {
        let mut dictionary = Dictionary::new();
        dictionary.add(RecordTemplate::new("frame").with_field("counter", FieldKind::Int));

        let mut wire = Vec::new();
        write_preamble(&mut wire, SocketId(42), &dictionary).unwrap();

        let (id, received) = read_preamble(&mut Cursor::new(wire)).unwrap();
        assert_eq!(id, SocketId(42));
        assert_eq!(received, dictionary);
    }

    #[test]
    fn test_preamble_rejects_foreign_peers() {
        let mut wire = Vec::new();
        write_preamble(&mut wire, SocketId(1), &Dictionary::new()).unwrap();

        let mut bad_magic = wire.clone();
        bad_magic[0] = b'X';
        assert!(matches!(read_preamble(&mut Cursor::new(bad_magic)), Err(NetError::BadMagic(_))));

        let mut big_endian = wire;
        big_endian[5] = 1;
        assert!(matches!(
            read_preamble(&mut Cursor::new(big_endian)),
            Err(NetError::UnsupportedByteOrder(1))
        ));
    }
}
