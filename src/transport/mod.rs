// src/transport/mod.rs

//! Chunked, optionally encrypted trace delivery.

pub mod chunk;
pub mod client;
pub mod server;

pub use chunk::{Chunk, ChunkPayload, chunk_aad};
pub use client::{ChunkClient, ChunkClientOptions, ChunkFetch};
pub use server::{ChunkSet, partition};
