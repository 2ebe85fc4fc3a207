//! Attachment storage
//!
//! Keys are relative paths of the form
//! `attachments/{instance_id}/{attachment_id}_{file_name}` (see [`keys`]).
//! Every backend validates keys before touching the filesystem; a key that is
//! absolute, contains `..` or a null byte, or resolves outside the root is
//! rejected with [`StorageError::InvalidKey`].

pub mod keys;
pub mod local;
pub mod traits;

pub use keys::{attachment_key, sanitize_file_name};
pub use local::LocalStorage;
pub use traits::{Storage, StorageError, StorageResult};
