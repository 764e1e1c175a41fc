// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage subsystem — identifiers + metadata index + blobs + sweeper.

pub mod blob;
pub mod entry;
pub mod id;
pub mod metadata;
pub mod sweeper;
