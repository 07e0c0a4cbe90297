pub mod codec;
pub mod config;
pub mod entities;
pub mod merge;
pub mod model;
pub mod remote;
pub mod session;
pub mod storage;
pub mod store;
pub mod sync;
