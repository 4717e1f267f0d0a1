//! Shared, lock-protected knowledge store.
//!
//! The blackboard is the coordination point between independent agents and
//! validators. It holds four fixed knowledge spaces (`raw`, `processed`,
//! `validated`, `consolidated`), each a map from key to the latest
//! [`KnowledgeEntry`] written there.
//!
//! # Serialized access
//!
//! One exclusive lock guards every space. Writes never interleave and reads
//! always see the most recent completed write for a key.
//!
//! # Merging
//!
//! Parallel agent outputs are combined through a [`MergePolicy`], an ordered
//! list of participant ids configured at construction. Conflicts found while
//! merging are kept in a registry that is part of every snapshot.

pub mod entry;
pub mod policy;
pub mod view;

pub use entry::{ConflictRecord, KnowledgeEntry, KnowledgeSpace, UnknownSpace};
pub use policy::MergePolicy;
pub use view::{Blackboard, BlackboardSnapshot};
