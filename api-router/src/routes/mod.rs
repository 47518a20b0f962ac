pub mod gateway;
pub mod jobs;
pub mod probes;
pub mod training;
