//! PlugFinder record-store client.

mod client;
mod wire;

pub use client::PlugFinderClient;
