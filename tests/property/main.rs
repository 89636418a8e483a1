// tests/property/main.rs

mod chunking;
mod compaction;
