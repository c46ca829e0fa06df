pub mod actions;
pub mod log_tailer;
pub mod published;
pub mod status_poller;
