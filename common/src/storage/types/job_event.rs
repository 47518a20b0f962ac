use crate::stored_object;

stored_object!(JobEvent, "job_event", {
    job_id: String,
    /// Serialized update event.
    payload: String
});
