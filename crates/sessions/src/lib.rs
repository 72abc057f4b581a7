//! Session identity, the session store, and append-only transcripts.

pub mod key;
pub mod store;
pub mod transcript;

pub use key::SessionKey;
pub use store::{SessionEntry, SessionStore};
pub use transcript::{TranscriptLine, TranscriptWriter};
