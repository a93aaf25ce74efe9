//! Local message storage
//!
//! The [`LocalStore`] trait abstracts over where backed-up messages live.
//! [`FileMessageStore`] keeps one `.eml` file per message on disk;
//! [`InMemoryMessageStore`] is used for tests and dry runs.

mod file;
mod memory;
mod traits;

pub use file::FileMessageStore;
pub use memory::InMemoryMessageStore;
pub use traits::LocalStore;
