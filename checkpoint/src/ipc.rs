//! Cross-process memory shared through a file mapping.

pub mod shmem;
