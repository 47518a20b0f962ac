use crate::stored_object;

stored_object!(JobSignals, "job_signal", {
    #[serde(default)]
    paused: bool,
    #[serde(default)]
    cancel_requested: bool
});
