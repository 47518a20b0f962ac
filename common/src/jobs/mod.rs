pub mod control;
pub mod events;
pub mod model_config;
pub mod record;
pub mod state_store;
pub mod update_channel;
