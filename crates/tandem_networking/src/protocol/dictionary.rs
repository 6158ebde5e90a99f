//! # Record Dictionary
//!
//! Named record templates, each a list of typed array fields. A server
//! sends its dictionary in the connection preamble. Clients resolve
//! template and field names against it rather than assuming ids.

use crate::error::{NetError, NetResult};
use crate::protocol::codec::{len_u32, FrameReader, FrameWriter, DICTIONARY_FRAME_ID, FRAME_HEADER_SIZE};

/// Element type of a record field. Every field is an array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldKind {
    /// 32-bit signed ints.
    Int = 0,
    /// 32-bit floats.
    Float = 1,
    /// Raw bytes (strings travel as these).
    Char = 2,
}

impl FieldKind {
    /// Parses a wire tag.
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Int),
            1 => Some(Self::Float),
            2 => Some(Self::Char),
            _ => None,
        }
    }

    /// Bytes per element.
    #[inline]
    #[must_use]
    pub const fn element_size(self) -> usize {
        match self {
            Self::Int | Self::Float => 4,
            Self::Char => 1,
        }
    }
}

/// A named, typed field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDef {
    /// Field name, unique within its template.
    pub name: String,
    /// Element type.
    pub kind: FieldKind,
}

/// A named record layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordTemplate {
    id: u32,
    name: String,
    fields: Vec<FieldDef>,
}

impl RecordTemplate {
    /// Creates an empty template. The id is assigned when it joins a
    /// [`Dictionary`].
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Builder form of [`RecordTemplate::add_field`].
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.add_field(name, kind);
        self
    }

    /// Appends a field and returns its index.
    pub fn add_field(&mut self, name: impl Into<String>, kind: FieldKind) -> usize {
        self.fields.push(FieldDef {
            name: name.into(),
            kind,
        });
        self.fields.len() - 1
    }

    /// Id within the owning dictionary (0 until added).
    #[inline]
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Template name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in wire order.
    #[inline]
    #[must_use]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Index of the named field.
    #[must_use]
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }
}

/// Ordered set of templates with ids starting at 1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dictionary {
    templates: Vec<RecordTemplate>,
}

impl Dictionary {
    /// Creates an empty dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a template and returns its id.
    ///
    /// Adding a name that already exists returns the existing id and
    /// leaves the dictionary unchanged.
    pub fn add(&mut self, mut template: RecordTemplate) -> u32 {
        if let Some(existing) = self.find(&template.name) {
            return existing.id;
        }
        template.id = len_u32(self.templates.len() + 1);
        let id = template.id;
        self.templates.push(template);
        id
    }

    /// Template by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&RecordTemplate> {
        self.templates.iter().find(|template| template.name == name)
    }

    /// Template by id.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&RecordTemplate> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.templates.get(index)
    }

    /// Id of the named template.
    pub fn template_id(&self, name: &str) -> NetResult<u32> {
        self.find(name)
            .map(RecordTemplate::id)
            .ok_or_else(|| NetError::MissingTemplate(name.to_owned()))
    }

    /// Index of a field inside a named template.
    pub fn field_index(&self, template: &str, field: &str) -> NetResult<usize> {
        let found = self
            .find(template)
            .ok_or_else(|| NetError::MissingTemplate(template.to_owned()))?;
        found.field_index(field).ok_or_else(|| NetError::MissingField {
            template: template.to_owned(),
            field: field.to_owned(),
        })
    }

    /// Number of templates.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// True if there are no templates.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Templates in id order.
    pub fn iter(&self) -> impl Iterator<Item = &RecordTemplate> {
        self.templates.iter()
    }

    /// Appends the dictionary frame to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut writer = FrameWriter::begin(out, DICTIONARY_FRAME_ID);
        writer.write_u32(len_u32(self.templates.len()));
        for template in &self.templates {
            writer.write_u32(template.id);
            writer.write_str(&template.name);
            writer.write_u32(len_u32(template.fields.len()));
            for field in &template.fields {
                writer.write_str(&field.name);
                writer.write_u8(field.kind as u8);
            }
        }
        writer.finish();
    }

    /// Parses a dictionary frame.
    pub fn decode(frame: &[u8]) -> NetResult<Self> {
        let mut header = FrameReader::new(frame);
        let _size = header.read_u32()?;
        let id = header.read_u32()?;
        if id != DICTIONARY_FRAME_ID {
            return Err(NetError::MalformedDictionary(format!("frame id {id} is not a dictionary")));
        }

        let mut reader = FrameReader::new(&frame[FRAME_HEADER_SIZE..]);
        let count = reader.read_u32()? as usize;
        let mut dictionary = Self::new();
        for expected in 1..=count {
            let id = reader.read_u32()?;
            if id as usize != expected {
                return Err(NetError::MalformedDictionary(format!(
                    "template id {id} out of sequence, expected {expected}"
                )));
            }
            let mut template = RecordTemplate::new(reader.read_str()?);
            let fields = reader.read_u32()?;
            for _ in 0..fields {
                let name = reader.read_str()?;
                let tag = reader.read_u8()?;
                let kind = FieldKind::from_u8(tag).ok_or(NetError::BadFieldKind(tag))?;
                template.add_field(name, kind);
            }
            if dictionary.find(template.name()).is_some() {
                return Err(NetError::MalformedDictionary(format!(
                    "duplicate template {:?}",
                    template.name()
                )));
            }
            dictionary.add(template);
        }
        Ok(dictionary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dictionary {
        let mut dictionary = Dictionary::new();
        dictionary.add(
            RecordTemplate::new("frame")
                .with_field("counter", FieldKind::Int)
                .with_field("matrix", FieldKind::Float),
        );
        dictionary.add(RecordTemplate::new("label").with_field("text", FieldKind::Char));
        dictionary
    }

    #[test]
    fn test_ids_start_at_one() {
        let dictionary = sample();
        assert_eq!(dictionary.template_id("frame").unwrap(), 1);
        assert_eq!(dictionary.template_id("label").unwrap(), 2);
        assert!(dictionary.get(0).is_none());
        assert_eq!(dictionary.get(2).unwrap().name(), "label");
    }

    #[test]
    fn test_duplicate_name_keeps_first() {
        let mut dictionary = sample();
        let id = dictionary.add(RecordTemplate::new("frame"));
        assert_eq!(id, 1);
        assert_eq!(dictionary.len(), 2);
        assert_eq!(dictionary.get(1).unwrap().fields().len(), 2);
    }

    #[test]
    fn test_name_lookups_fail_loudly() {
        let dictionary = sample();
        assert_eq!(dictionary.field_index("frame", "matrix").unwrap(), 1);
        assert!(matches!(dictionary.template_id("nope"), Err(NetError::MissingTemplate(_))));
        assert!(matches!(
            dictionary.field_index("frame", "nope"),
            Err(NetError::MissingField { .. })
        ));
    }

    #[test]
    fn test_wire_form_survives_transfer() {
        let dictionary = sample();
        let mut wire = Vec::new();
        dictionary.encode(&mut wire);
        assert_eq!(Dictionary::decode(&wire).unwrap(), dictionary);
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let mut dictionary = Dictionary::new();
        dictionary.add(RecordTemplate::new("t").with_field("f", FieldKind::Int));
        let mut wire = Vec::new();
        dictionary.encode(&mut wire);
        // The kind tag is the final byte of the frame.
        let last = wire.len() - 1;
        wire[last] = 9;
        assert!(matches!(Dictionary::decode(&wire), Err(NetError::BadFieldKind(9))));
    }
}
