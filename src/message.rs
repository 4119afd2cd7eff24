//! Wire codec: typed field messages and their binary frame encoding
//!
//! A message is an ordered set of typed fields, unique by field id, plus a
//! 16-byte header. All multi-byte integers are network byte order; strings
//! travel as UTF-16BE code units with a byte-length prefix. Starting with
//! protocol version 2 every field is padded to an 8-byte boundary; version 1
//! pads only the whole frame. Decoding is deliberately lenient: a field that
//! would run past the end of the frame truncates the message there instead
//! of failing it (partial telemetry from imperfect peers is still useful).

use anyhow::{bail, Result};

use crate::protocol::{field_type, flags, pad8, HEADER_SIZE, VERSION};

/// One typed value inside a message
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Int16(u16),
    Int32(u32),
    Int64(u64),
    Float(f64),
    Str(String),
    Binary(Vec<u8>),
}

impl FieldValue {
    fn type_tag(&self) -> u8 {
        match self {
            FieldValue::Int32(_) => field_type::INT32,
            FieldValue::Str(_) => field_type::STRING,
            FieldValue::Int64(_) => field_type::INT64,
            FieldValue::Int16(_) => field_type::INT16,
            FieldValue::Binary(_) => field_type::BINARY,
            FieldValue::Float(_) => field_type::FLOAT,
        }
    }

    /// Encoded size excluding alignment padding
    fn encoded_size(&self) -> usize {
        match self {
            FieldValue::Int16(_) => 8,
            FieldValue::Int32(_) => 12,
            FieldValue::Int64(_) | FieldValue::Float(_) => 16,
            FieldValue::Str(s) => 12 + s.encode_utf16().count() * 2,
            FieldValue::Binary(b) => 12 + b.len(),
        }
    }
}

/// One identified, typed field
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub id: u32,
    pub value: FieldValue,
}

/// Decoded in-memory form of a frame
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    pub code: u16,
    pub flags: u16,
    pub id: u32,
    fields: Vec<Field>,
}

impl Message {
    pub fn new(code: u16, id: u32) -> Self {
        Message {
            code,
            flags: 0,
            id,
            ..Default::default()
        }
    }

    /// Generic completion response carrying a return code
    pub fn completion(id: u32, rcc_value: u32) -> Self {
        let mut msg = Message::new(crate::protocol::command::REQUEST_COMPLETED, id);
        msg.set_u32(crate::protocol::field::RCC, rcc_value);
        msg
    }

    pub fn is_end_of_sequence(&self) -> bool {
        self.flags & flags::END_OF_SEQUENCE != 0
    }

    pub fn set_end_of_sequence(&mut self) {
        self.flags |= flags::END_OF_SEQUENCE;
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    fn find(&self, id: u32) -> Option<usize> {
        self.fields.iter().position(|f| f.id == id)
    }

    /// Insert or replace a field; duplicate ids keep the last write
    pub fn set(&mut self, id: u32, value: FieldValue) {
        match self.find(id) {
            Some(i) => self.fields[i].value = value,
            None => self.fields.push(Field { id, value }),
        }
    }

    pub fn set_u16(&mut self, id: u32, v: u16) {
        self.set(id, FieldValue::Int16(v));
    }

    pub fn set_u32(&mut self, id: u32, v: u32) {
        self.set(id, FieldValue::Int32(v));
    }

    pub fn set_u64(&mut self, id: u32, v: u64) {
        self.set(id, FieldValue::Int64(v));
    }

    pub fn set_f64(&mut self, id: u32, v: f64) {
        self.set(id, FieldValue::Float(v));
    }

    pub fn set_str(&mut self, id: u32, v: &str) {
        self.set(id, FieldValue::Str(v.to_string()));
    }

    pub fn set_binary(&mut self, id: u32, v: &[u8]) {
        self.set(id, FieldValue::Binary(v.to_vec()));
    }

    /// Store an int32 array as a binary field of big-endian words
    pub fn set_u32_array(&mut self, id: u32, values: &[u32]) {
        let mut buf = Vec::with_capacity(values.len() * 4);
        for v in values {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        self.set(id, FieldValue::Binary(buf));
    }

    pub fn get(&self, id: u32) -> Option<&FieldValue> {
        self.find(id).map(|i| &self.fields[i].value)
    }

    pub fn get_u16(&self, id: u32) -> Option<u16> {
        match self.get(id) {
            Some(FieldValue::Int16(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u32(&self, id: u32) -> Option<u32> {
        match self.get(id) {
            Some(FieldValue::Int32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, id: u32) -> Option<u64> {
        match self.get(id) {
            Some(FieldValue::Int64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_f64(&self, id: u32) -> Option<f64> {
        match self.get(id) {
            Some(FieldValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, id: u32) -> Option<&str> {
        match self.get(id) {
            Some(FieldValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_binary(&self, id: u32) -> Option<&[u8]> {
        match self.get(id) {
            Some(FieldValue::Binary(b)) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn get_u32_array(&self, id: u32) -> Option<Vec<u32>> {
        let raw = self.get_binary(id)?;
        let mut out = Vec::with_capacity(raw.len() / 4);
        for chunk in raw.chunks_exact(4) {
            out.push(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Some(out)
    }

    /// Total encoded size for the given protocol version, header included
    pub fn encoded_size(&self, version: u16) -> usize {
        let mut size = HEADER_SIZE;
        for f in &self.fields {
            let n = f.value.encoded_size();
            size += if version >= 2 { pad8(n) } else { n };
        }
        if version < 2 {
            size = pad8(size);
        }
        size
    }

    /// Encode with the current protocol version
    pub fn encode(&self) -> Vec<u8> {
        self.encode_version(VERSION)
    }

    /// Encode to a complete wire frame for the given protocol version
    pub fn encode_version(&self, version: u16) -> Vec<u8> {
        let total = self.encoded_size(version);
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&self.code.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&(total as u32).to_be_bytes());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&(self.fields.len() as u32).to_be_bytes());

        for f in &self.fields {
            let start = buf.len();
            buf.extend_from_slice(&f.id.to_be_bytes());
            buf.push(f.value.type_tag());
            buf.push(0);
            match &f.value {
                FieldValue::Int16(v) => {
                    buf.extend_from_slice(&v.to_be_bytes());
                }
                FieldValue::Int32(v) => {
                    buf.extend_from_slice(&[0, 0]);
                    buf.extend_from_slice(&v.to_be_bytes());
                }
                FieldValue::Int64(v) => {
                    buf.extend_from_slice(&[0, 0]);
                    buf.extend_from_slice(&v.to_be_bytes());
                }
                FieldValue::Float(v) => {
                    buf.extend_from_slice(&[0, 0]);
                    buf.extend_from_slice(&v.to_bits().to_be_bytes());
                }
                FieldValue::Str(s) => {
                    buf.extend_from_slice(&[0, 0]);
                    let units: Vec<u16> = s.encode_utf16().collect();
                    buf.extend_from_slice(&((units.len() * 2) as u32).to_be_bytes());
                    for u in units {
                        buf.extend_from_slice(&u.to_be_bytes());
                    }
                }
                FieldValue::Binary(b) => {
                    buf.extend_from_slice(&[0, 0]);
                    buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
                    buf.extend_from_slice(b);
                }
            }
            if version >= 2 {
                buf.resize(start + pad8(buf.len() - start), 0);
            }
        }
        if version < 2 {
            buf.resize(pad8(buf.len()), 0);
        }
        debug_assert_eq!(buf.len(), total);
        buf
    }

    /// Decode a complete frame buffer. Fields that would run past the end
    /// of the frame (or carry an unknown type tag) truncate the field list;
    /// the header itself must be present and intact.
    pub fn decode(buf: &[u8], version: u16) -> Result<Message> {
        if buf.len() < HEADER_SIZE {
            bail!("frame shorter than header: {} bytes", buf.len());
        }
        let code = u16::from_be_bytes([buf[0], buf[1]]);
        let wire_flags = u16::from_be_bytes([buf[2], buf[3]]);
        let declared = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let id = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let count = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

        let mut msg = Message::new(code, id);
        msg.flags = wire_flags;

        // Never trust the declared size past the bytes actually provided
        let size = declared.min(buf.len());

        let mut pos = HEADER_SIZE;
        for _ in 0..count {
            if pos + 8 > size {
                break;
            }
            let fid = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
            let tag = buf[pos + 4];

            let var_size = match tag {
                field_type::INT16 => 8,
                field_type::INT32 => 12,
                field_type::INT64 | field_type::FLOAT => 16,
                field_type::STRING | field_type::BINARY => {
                    if pos + 12 > size {
                        break;
                    }
                    let len = u32::from_be_bytes([
                        buf[pos + 8],
                        buf[pos + 9],
                        buf[pos + 10],
                        buf[pos + 11],
                    ]) as usize;
                    match len.checked_add(12) {
                        Some(n) => n,
                        None => break,
                    }
                }
                _ => break, // unknown type tag: truncate here
            };
            match pos.checked_add(var_size) {
                Some(end) if end <= size => {}
                _ => break,
            }

            let value = match tag {
                field_type::INT16 => {
                    FieldValue::Int16(u16::from_be_bytes([buf[pos + 6], buf[pos + 7]]))
                }
                field_type::INT32 => FieldValue::Int32(u32::from_be_bytes([
                    buf[pos + 8],
                    buf[pos + 9],
                    buf[pos + 10],
                    buf[pos + 11],
                ])),
                field_type::INT64 => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(&buf[pos + 8..pos + 16]);
                    FieldValue::Int64(u64::from_be_bytes(b))
                }
                field_type::FLOAT => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(&buf[pos + 8..pos + 16]);
                    FieldValue::Float(f64::from_bits(u64::from_be_bytes(b)))
                }
                field_type::STRING => {
                    let data = &buf[pos + 12..pos + var_size];
                    let units: Vec<u16> = data
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect();
                    FieldValue::Str(String::from_utf16_lossy(&units))
                }
                field_type::BINARY => FieldValue::Binary(buf[pos + 12..pos + var_size].to_vec()),
                _ => unreachable!(),
            };
            msg.set(fid, value);

            pos += if version >= 2 { pad8(var_size) } else { var_size };
        }

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{command, field, rcc};

    fn sample_message() -> Message {
        let mut msg = Message::new(command::LOGIN, 42);
        msg.set_u16(1, 0x0102);
        msg.set_u32(2, 0xDEAD_BEEF);
        msg.set_u64(3, 0x0102_0304_0506_0708);
        msg.set_f64(4, -273.15);
        msg.set_str(5, "operator");
        msg.set_binary(6, &[1, 2, 3, 4, 5]);
        msg.set_u32_array(7, &[10, 20, 30]);
        msg
    }

    #[test]
    fn test_round_trip_version_2() {
        let msg = sample_message();
        let buf = msg.encode_version(2);
        let decoded = Message::decode(&buf, 2).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.get_u32_array(7).unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn test_round_trip_version_1() {
        let msg = sample_message();
        let buf = msg.encode_version(1);
        assert_eq!(buf.len() % 8, 0);
        let decoded = Message::decode(&buf, 1).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_header_layout_network_byte_order() {
        let mut msg = Message::new(0x0102, 0x0A0B0C0D);
        msg.flags = 0x0304;
        msg.set_u32(9, 7);
        let buf = msg.encode_version(2);
        assert_eq!(&buf[0..2], &[0x01, 0x02]);
        assert_eq!(&buf[2..4], &[0x03, 0x04]);
        assert_eq!(&buf[8..12], &[0x0A, 0x0B, 0x0C, 0x0D]);
        // one 12-byte int32 field padded to 16
        assert_eq!(&buf[4..8], &(32u32).to_be_bytes());
        assert_eq!(&buf[12..16], &(1u32).to_be_bytes());
    }

    #[test]
    fn test_declared_size_matches_field_sum() {
        for version in [1u16, 2u16] {
            let msg = sample_message();
            let buf = msg.encode_version(version);
            let declared = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
            assert_eq!(declared, buf.len());
            assert_eq!(declared, msg.encoded_size(version));
        }
    }

    #[test]
    fn test_alignment_invariant_version_2() {
        let msg = sample_message();
        let buf = msg.encode_version(2);
        // Walk the frame and confirm every field starts on an 8-byte boundary
        let mut pos = HEADER_SIZE;
        let mut seen = 0;
        while pos + 8 <= buf.len() && seen < msg.field_count() {
            assert_eq!(pos % 8, 0, "field {} starts at unaligned offset {}", seen, pos);
            let tag = buf[pos + 4];
            let n = match tag {
                field_type::INT16 => 8,
                field_type::INT32 => 12,
                field_type::INT64 | field_type::FLOAT => 16,
                _ => {
                    let len = u32::from_be_bytes([
                        buf[pos + 8],
                        buf[pos + 9],
                        buf[pos + 10],
                        buf[pos + 11],
                    ]) as usize;
                    12 + len
                }
            };
            pos += pad8(n);
            seen += 1;
        }
        assert_eq!(seen, msg.field_count());
    }

    #[test]
    fn test_truncation_safety() {
        let msg = sample_message();
        for version in [1u16, 2u16] {
            let full = msg.encode_version(version);
            let full_fields = Message::decode(&full, version).unwrap().field_count();
            for k in 1..full.len() - HEADER_SIZE + 1 {
                let cut = &full[..full.len() - k];
                let decoded = Message::decode(cut, version).unwrap();
                // Must be a strict prefix of the original field list
                assert!(decoded.field_count() <= full_fields);
                for (a, b) in decoded.fields().iter().zip(msg.fields().iter()) {
                    assert_eq!(a, b);
                }
            }
        }
    }

    #[test]
    fn test_decode_rejects_missing_header() {
        assert!(Message::decode(&[0u8; 15], 2).is_err());
        assert!(Message::decode(&[], 2).is_err());
    }

    #[test]
    fn test_duplicate_field_id_last_write_wins() {
        let mut msg = Message::new(1, 1);
        msg.set_u32(5, 100);
        msg.set_u32(5, 200);
        assert_eq!(msg.field_count(), 1);
        assert_eq!(msg.get_u32(5), Some(200));
        // Same value type replacement by a different kind
        msg.set_str(5, "text");
        assert_eq!(msg.field_count(), 1);
        assert_eq!(msg.get_str(5), Some("text"));
    }

    #[test]
    fn test_unknown_type_tag_truncates() {
        let mut msg = Message::new(1, 1);
        msg.set_u32(1, 11);
        msg.set_u32(2, 22);
        let mut buf = msg.encode_version(2);
        // Corrupt the second field's type tag (fields are 16 bytes apart in v2)
        buf[HEADER_SIZE + 16 + 4] = 0x7F;
        let decoded = Message::decode(&buf, 2).unwrap();
        assert_eq!(decoded.field_count(), 1);
        assert_eq!(decoded.get_u32(1), Some(11));
    }

    #[test]
    fn test_hostile_string_length_does_not_overread() {
        let mut msg = Message::new(1, 1);
        msg.set_str(1, "abc");
        let mut buf = msg.encode_version(2);
        // Claim a gigantic string length
        buf[HEADER_SIZE + 8..HEADER_SIZE + 12].copy_from_slice(&u32::MAX.to_be_bytes());
        let decoded = Message::decode(&buf, 2).unwrap();
        assert_eq!(decoded.field_count(), 0);
    }

    #[test]
    fn test_declared_size_larger_than_buffer_is_clamped() {
        let mut msg = Message::new(1, 1);
        msg.set_u32(1, 1);
        msg.set_u32(2, 2);
        let mut buf = msg.encode_version(2);
        buf[4..8].copy_from_slice(&(1_000_000u32).to_be_bytes());
        let decoded = Message::decode(&buf, 2).unwrap();
        assert_eq!(decoded.field_count(), 2);
    }

    #[test]
    fn test_non_ascii_string_round_trip() {
        let mut msg = Message::new(1, 1);
        msg.set_str(1, "температура °C — 通知");
        let decoded = Message::decode(&msg.encode(), VERSION).unwrap();
        assert_eq!(decoded.get_str(1), Some("температура °C — 通知"));
    }

    #[test]
    fn test_empty_message_round_trip() {
        let msg = Message::new(command::KEEPALIVE, 9);
        for version in [1u16, 2u16] {
            let buf = msg.encode_version(version);
            assert_eq!(buf.len(), HEADER_SIZE);
            let decoded = Message::decode(&buf, version).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_completion_helper() {
        let msg = Message::completion(7, rcc::SUCCESS);
        assert_eq!(msg.code, command::REQUEST_COMPLETED);
        assert_eq!(msg.id, 7);
        assert_eq!(msg.get_u32(field::RCC), Some(rcc::SUCCESS));
    }

    #[test]
    fn test_wrong_type_accessor_returns_none() {
        let mut msg = Message::new(1, 1);
        msg.set_u32(1, 5);
        assert_eq!(msg.get_str(1), None);
        assert_eq!(msg.get_u64(1), None);
        assert_eq!(msg.get_u32(1), Some(5));
    }
}
