//! # Records
//!
//! A record is one instance of a [`RecordTemplate`]: a typed array per
//! field. Frames carry the template id, so decoding needs the dictionary
//! the frame was written against.

use crate::error::{NetError, NetResult};
use crate::protocol::codec::{len_u32, FrameReader, FrameWriter, FRAME_HEADER_SIZE};
use crate::protocol::dictionary::{Dictionary, FieldKind, RecordTemplate};

/// Contents of one field.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Int array.
    Int(Vec<i32>),
    /// Float array.
    Float(Vec<f32>),
    /// Byte array.
    Char(Vec<u8>),
}

impl FieldValue {
    /// Empty array of the given kind.
    #[must_use]
    pub const fn empty(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Int => Self::Int(Vec::new()),
            FieldKind::Float => Self::Float(Vec::new()),
            FieldKind::Char => Self::Char(Vec::new()),
        }
    }

    /// Element kind.
    #[must_use]
    pub const fn kind(&self) -> FieldKind {
        match self {
            Self::Int(_) => FieldKind::Int,
            Self::Float(_) => FieldKind::Float,
            Self::Char(_) => FieldKind::Char,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int(values) => values.len(),
            Self::Float(values) => values.len(),
            Self::Char(values) => values.len(),
        }
    }

    /// True if the array is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One instance of a template.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    template_id: u32,
    fields: Vec<FieldValue>,
}

impl Record {
    /// Creates a record with every field empty.
    #[must_use]
    pub fn new(template: &RecordTemplate) -> Self {
        Self {
            template_id: template.id(),
            fields: template.fields().iter().map(|field| FieldValue::empty(field.kind)).collect(),
        }
    }

    /// Creates an empty record of the named template.
    pub fn from_dictionary(dictionary: &Dictionary, template: &str) -> NetResult<Self> {
        dictionary
            .find(template)
            .map(Self::new)
            .ok_or_else(|| NetError::MissingTemplate(template.to_owned()))
    }

    /// Template id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.template_id
    }

    /// Number of fields.
    #[inline]
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Raw field access.
    pub fn field(&self, index: usize) -> NetResult<&FieldValue> {
        let count = self.fields.len();
        self.fields.get(index).ok_or(NetError::FieldOutOfRange { index, count })
    }

    fn field_mut(&mut self, index: usize, expected: FieldKind) -> NetResult<&mut FieldValue> {
        let count = self.fields.len();
        let field = self.fields.get_mut(index).ok_or(NetError::FieldOutOfRange { index, count })?;
        if field.kind() != expected {
            return Err(NetError::FieldKindMismatch {
                index,
                expected,
                actual: field.kind(),
            });
        }
        Ok(field)
    }

    /// Replaces an int field.
    pub fn set_ints(&mut self, index: usize, values: &[i32]) -> NetResult<()> {
        *self.field_mut(index, FieldKind::Int)? = FieldValue::Int(values.to_vec());
        Ok(())
    }

    /// Replaces a float field.
    pub fn set_floats(&mut self, index: usize, values: &[f32]) -> NetResult<()> {
        *self.field_mut(index, FieldKind::Float)? = FieldValue::Float(values.to_vec());
        Ok(())
    }

    /// Replaces a byte field.
    pub fn set_bytes(&mut self, index: usize, values: &[u8]) -> NetResult<()> {
        *self.field_mut(index, FieldKind::Char)? = FieldValue::Char(values.to_vec());
        Ok(())
    }

    /// Int field contents.
    pub fn ints(&self, index: usize) -> NetResult<&[i32]> {
        match self.field(index)? {
            FieldValue::Int(values) => Ok(values),
            other => Err(mismatch(index, FieldKind::Int, other)),
        }
    }

    /// Float field contents.
    pub fn floats(&self, index: usize) -> NetResult<&[f32]> {
        match self.field(index)? {
            FieldValue::Float(values) => Ok(values),
            other => Err(mismatch(index, FieldKind::Float, other)),
        }
    }

    /// Byte field contents.
    pub fn bytes(&self, index: usize) -> NetResult<&[u8]> {
        match self.field(index)? {
            FieldValue::Char(values) => Ok(values),
            other => Err(mismatch(index, FieldKind::Char, other)),
        }
    }

    /// First element of an int field, if any.
    #[must_use]
    pub fn data_int(&self, index: usize) -> Option<i32> {
        self.ints(index).ok()?.first().copied()
    }

    /// Bytes this record occupies on the wire.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE
            + self
                .fields
                .iter()
                .map(|field| 5 + field.len() * field.kind().element_size())
                .sum::<usize>()
    }

    /// Appends the record frame to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        let mut writer = FrameWriter::begin(out, self.template_id);
        for field in &self.fields {
            writer.write_u8(field.kind() as u8);
            writer.write_u32(len_u32(field.len()));
            match field {
                FieldValue::Int(values) => values.iter().for_each(|&v| writer.write_i32(v)),
                FieldValue::Float(values) => values.iter().for_each(|&v| writer.write_f32(v)),
                FieldValue::Char(values) => writer.write_bytes(values),
            }
        }
        writer.finish();
    }

    /// Parses a record frame against `dictionary`.
    ///
    /// The frame must match its template field for field.
    pub fn decode(frame: &[u8], dictionary: &Dictionary) -> NetResult<Self> {
        let mut reader = FrameReader::new(frame);
        let size = reader.read_u32()? as usize;
        if size != frame.len() {
            return Err(NetError::Truncated {
                needed: size,
                available: frame.len(),
            });
        }
        let template_id = reader.read_u32()?;
        let template = dictionary.get(template_id).ok_or(NetError::UnknownTemplate(template_id))?;

        let mut fields = Vec::with_capacity(template.fields().len());
        for (index, def) in template.fields().iter().enumerate() {
            let tag = reader.read_u8()?;
            let kind = FieldKind::from_u8(tag).ok_or(NetError::BadFieldKind(tag))?;
            if kind != def.kind {
                return Err(NetError::FieldKindMismatch {
                    index,
                    expected: def.kind,
                    actual: kind,
                });
            }
            let count = reader.read_u32()? as usize;
            let available = reader.remaining();
            if count.saturating_mul(kind.element_size()) > available {
                return Err(NetError::Truncated {
                    needed: count.saturating_mul(kind.element_size()),
                    available,
                });
            }
            let value = match kind {
                FieldKind::Int => FieldValue::Int((0..count).map(|_| reader.read_i32()).collect::<NetResult<_>>()?),
                FieldKind::Float => {
                    FieldValue::Float((0..count).map(|_| reader.read_f32()).collect::<NetResult<_>>()?)
                }
                FieldKind::Char => FieldValue::Char(reader.read_bytes(count)?.to_vec()),
            };
            fields.push(value);
        }
        Ok(Self { template_id, fields })
    }
}

fn mismatch(index: usize, expected: FieldKind, actual: &FieldValue) -> NetError {
    NetError::FieldKindMismatch {
        index,
        expected,
        actual: actual.kind(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dictionary() -> Dictionary {
        let mut dictionary = Dictionary::new();
        dictionary.add(
            RecordTemplate::new("transform")
                .with_field("id", FieldKind::Int)
                .with_field("matrix", FieldKind::Float)
                .with_field("name", FieldKind::Char),
        );
        dictionary
    }

    #[test]
    fn test_typed_accessors() {
        let dictionary = dictionary();
        let mut record = Record::from_dictionary(&dictionary, "transform").unwrap();
        record.set_ints(0, &[7, 8]).unwrap();
        record.set_floats(1, &[1.0; 16]).unwrap();
        record.set_bytes(2, b"head").unwrap();

        assert_eq!(record.data_int(0), Some(7));
        assert_eq!(record.floats(1).unwrap().len(), 16);
        assert_eq!(record.bytes(2).unwrap(), b"head");
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let dictionary = dictionary();
        let mut record = Record::from_dictionary(&dictionary, "transform").unwrap();
        assert!(matches!(
            record.set_floats(0, &[1.0]),
            Err(NetError::FieldKindMismatch { index: 0, .. })
        ));
        assert!(matches!(record.ints(5), Err(NetError::FieldOutOfRange { index: 5, count: 3 })));
        assert_eq!(record.data_int(1), None);
    }

    #[test]
    fn test_frame_decodes_against_dictionary() {
        let dictionary = dictionary();
        let mut record = Record::from_dictionary(&dictionary, "transform").unwrap();
        record.set_ints(0, &[-3]).unwrap();
        record.set_bytes(2, b"x").unwrap();

        let mut wire = Vec::new();
        record.encode(&mut wire);
        assert_eq!(wire.len(), record.encoded_len());
        assert_eq!(Record::decode(&wire, &dictionary).unwrap(), record);
    }

    #[test]
    fn test_decode_rejects_unknown_template() {
        let dictionary = dictionary();
        let record = Record::from_dictionary(&dictionary, "transform").unwrap();
        let mut wire = Vec::new();
        record.encode(&mut wire);

        assert!(matches!(
            Record::decode(&wire, &Dictionary::new()),
            Err(NetError::UnknownTemplate(1))
        ));
    }

    #[test]
    fn test_decode_rejects_lying_count() {
        let dictionary = dictionary();
        let record = Record::from_dictionary(&dictionary, "transform").unwrap();
        let mut wire = Vec::new();
        record.encode(&mut wire);
        // First field's count sits right after its kind tag.
        wire[9..13].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(Record::decode(&wire, &dictionary), Err(NetError::Truncated { .. })));
    }
}
