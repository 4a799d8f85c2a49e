#![forbid(unsafe_code)]
//! On-disk codecs: superblock, tree-block buffers, and item payloads.
//!
//! Everything in this crate is pure byte manipulation over caller-provided
//! buffers. Multi-byte integers are little-endian on disk. I/O lives in
//! `sfs-block`; tree algorithms live in `sfs-tree`.

mod block;
mod items;
mod superblock;

pub use block::{check_leaf, check_node, TreeBlock, HEADER_SIZE, ITEM_SIZE, KEY_PTR_SIZE};
pub use items::*;
pub use superblock::{encode_superblock, Superblock};
