//! farview-cache presents a read-only, lazily-populated view of a
//! remote hierarchical object store as a POSIX-like namespace.
//!
//! Directory listings and file contents are fetched from the remote
//! on first access, cached on local disk in fixed-size blocks, and
//! retained until their reference counts drop to zero. The moving
//! parts, leaves first:
//!
//!  - [blocks::BlockStore]: refcounted scratch files of at most one
//!    block size each.
//!  - [inodes::InodeTable]: the mutable tree of file and directory
//!    inodes, with lazy state populated through capability hooks.
//!  - [transfer]: the single-consumer mailbox that deduplicates
//!    concurrent fetches and spawns the workers doing the remote i/o.
//!  - [service::FileService]: path resolution, `forget`
//!    invalidation, and the hook factories tying it all to a
//!    [remote::RemoteProvider].
//!  - [session::Session]: per-client file descriptors.

pub mod blocks;
pub mod errors;
pub mod inodes;
pub mod remote;
pub mod service;
pub mod session;
pub mod transfer;

#[cfg(test)]
mod tests;

pub use errors::Error;
pub use service::FileService;
pub use session::Session;
