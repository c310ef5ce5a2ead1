pub mod daemon;
pub mod oauth_flow;
pub mod setup;
pub mod storage;
pub mod sync;
