pub mod access;
pub mod blob_store;
pub mod expiry;
pub mod network;
pub mod reclaimer;
pub mod registry;
pub mod share_service;
