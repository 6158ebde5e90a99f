//! The barrier's four record types, resolved by name.
//!
//! The server builds the dictionary. A client resolves every template and
//! field against whatever dictionary its server sent, and refuses to run
//! the barrier if one is missing.

use crate::error::NetResult;
use crate::protocol::{Dictionary, FieldKind, Record, RecordTemplate};
use crate::transport::SocketId;
use tandem_shared::protocol::{
    BONDED_ID_FIELD, CLIENT_TUNING, CLIENT_TUNING_FIELD, HANDSHAKE, RESPONSE, SERVER_TUNING, SERVER_TUNING_FIELD,
};
use tandem_shared::{ClientTuning, ServerTuning};

/// What a barrier record is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierRecord {
    /// Handshake rounds 1 and 2.
    Handshake,
    /// Handshake round 3.
    Response,
    /// A client reached the barrier.
    ClientTuning,
    /// The barrier released.
    ServerTuning,
}

/// Resolved ids of the barrier templates.
#[derive(Clone, Debug)]
pub struct BarrierLanguage {
    dictionary: Dictionary,
    handshake: u32,
    response: u32,
    client_tuning: u32,
    server_tuning: u32,
    bonded_id_field: usize,
    client_tuning_field: usize,
    server_tuning_field: usize,
}

impl BarrierLanguage {
    /// Builds the server-side dictionary.
    #[must_use]
    pub fn new() -> Self {
        let mut dictionary = Dictionary::new();
        dictionary.add(RecordTemplate::new(HANDSHAKE).with_field(BONDED_ID_FIELD, FieldKind::Int));
        dictionary.add(RecordTemplate::new(RESPONSE));
        dictionary.add(RecordTemplate::new(CLIENT_TUNING).with_field(CLIENT_TUNING_FIELD, FieldKind::Int));
        dictionary.add(RecordTemplate::new(SERVER_TUNING).with_field(SERVER_TUNING_FIELD, FieldKind::Int));
        match Self::from_dictionary(&dictionary) {
            Ok(language) => language,
            // Every name above is added two lines earlier.
            Err(_) => unreachable!("barrier dictionary is self-consistent"),
        }
    }

    /// Resolves the barrier templates in a received dictionary.
    pub fn from_dictionary(dictionary: &Dictionary) -> NetResult<Self> {
        Ok(Self {
            handshake: dictionary.template_id(HANDSHAKE)?,
            response: dictionary.template_id(RESPONSE)?,
            client_tuning: dictionary.template_id(CLIENT_TUNING)?,
            server_tuning: dictionary.template_id(SERVER_TUNING)?,
            bonded_id_field: dictionary.field_index(HANDSHAKE, BONDED_ID_FIELD)?,
            client_tuning_field: dictionary.field_index(CLIENT_TUNING, CLIENT_TUNING_FIELD)?,
            server_tuning_field: dictionary.field_index(SERVER_TUNING, SERVER_TUNING_FIELD)?,
            dictionary: dictionary.clone(),
        })
    }

    /// The dictionary these ids were resolved against.
    #[must_use]
    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    /// Classifies a template id.
    #[must_use]
    pub fn classify(&self, id: u32) -> Option<BarrierRecord> {
        match id {
            id if id == self.handshake => Some(BarrierRecord::Handshake),
            id if id == self.response => Some(BarrierRecord::Response),
            id if id == self.client_tuning => Some(BarrierRecord::ClientTuning),
            id if id == self.server_tuning => Some(BarrierRecord::ServerTuning),
            _ => None,
        }
    }

    fn empty(&self, id: u32) -> Record {
        match self.dictionary.get(id) {
            Some(template) => Record::new(template),
            None => unreachable!("barrier template ids come from this dictionary"),
        }
    }

    /// Handshake record naming the sender's bonded data socket.
    #[must_use]
    pub fn handshake_record(&self, bonded: SocketId) -> Record {
        let mut record = self.empty(self.handshake);
        let value = if bonded.is_null() { -1 } else { i32::try_from(bonded.0).unwrap_or(-1) };
        // Field index and kind were checked in from_dictionary.
        let _ = record.set_ints(self.bonded_id_field, &[value]);
        record
    }

    /// Round-3 response record.
    #[must_use]
    pub fn response_record(&self) -> Record {
        self.empty(self.response)
    }

    /// Barrier arrival carrying the client's tuning.
    #[must_use]
    pub fn client_tuning_record(&self, tuning: ClientTuning) -> Record {
        let mut record = self.empty(self.client_tuning);
        let _ = record.set_ints(self.client_tuning_field, &tuning.to_array());
        record
    }

    /// Release broadcast.
    #[must_use]
    pub fn server_tuning_record(&self, tuning: ServerTuning) -> Record {
        let mut record = self.empty(self.server_tuning);
        let _ = record.set_ints(self.server_tuning_field, &[tuning.send_size]);
        record
    }

    /// Bonded socket named by a handshake.
    #[must_use]
    pub fn bonded_id(&self, record: &Record) -> SocketId {
        record
            .data_int(self.bonded_id_field)
            .and_then(|value| u32::try_from(value).ok())
            .map_or(SocketId::NULL, SocketId)
    }

    /// Tuning carried by a client arrival.
    #[must_use]
    pub fn client_tuning(&self, record: &Record) -> Option<ClientTuning> {
        ClientTuning::from_slice(record.ints(self.client_tuning_field).ok()?)
    }

    /// Payload of a release broadcast, negative sizes clamped to zero.
    #[must_use]
    pub fn server_tuning(&self, record: &Record) -> Option<ServerTuning> {
        record.data_int(self.server_tuning_field).map(ServerTuning::new)
    }
}

impl Default for BarrierLanguage {
    fn default() -> Self {
        Self::new()
    }
}
