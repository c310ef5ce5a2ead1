pub mod backoff;
pub mod engine;
pub mod events;
pub mod index;
pub mod initial_sync;
pub mod local_fs;
pub mod local_watcher;
pub mod paths;
pub mod poller;
pub mod queue;
pub mod settings;
pub mod tracker;
pub mod transfer;
