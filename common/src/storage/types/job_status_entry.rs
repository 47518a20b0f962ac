use crate::stored_object;

stored_object!(JobStatusEntry, "job_status", {
    /// Status tag of the serialized record, kept alongside for guarding writes.
    status: String,
    /// Serialized status record, stored verbatim.
    payload: String,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    expires_at: DateTime<Utc>
});

impl JobStatusEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
