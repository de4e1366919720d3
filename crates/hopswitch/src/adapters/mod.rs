//! Reference collaborators with no cryptography or networking.

pub mod cleartext;
pub mod memory;

pub use cleartext::ClearTextDecoder;
pub use memory::MemoryChannel;
