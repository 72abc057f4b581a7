use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::message::{ContentBlock, Message, MessageContent};

/// A boolean predicate on endpoints: whether a given media type or feature
/// is supported. The LLM client selects endpoints whose capability set is a
/// superset of what a request requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Text,
    Vision,
    Video,
    Audio,
    Pdf,
    Tools,
    Thinking,
}

/// An ordered set of capabilities. Ordered so rendering and comparison are
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0.insert(cap);
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    pub fn superset_of(&self, required: &CapabilitySet) -> bool {
        required.0.is_subset(&self.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Capabilities in `required` that this set does not provide.
    pub fn missing_from(&self, required: &CapabilitySet) -> CapabilitySet {
        CapabilitySet(required.0.difference(&self.0).copied().collect())
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The capability a content block demands of an endpoint, if any beyond text.
pub fn block_capability(block: &ContentBlock) -> Option<Capability> {
    match block {
        ContentBlock::Image { .. } => Some(Capability::Vision),
        ContentBlock::Video { .. } => Some(Capability::Video),
        ContentBlock::Audio { .. } => Some(Capability::Audio),
        ContentBlock::Document { .. } => Some(Capability::Pdf),
        _ => None,
    }
}

/// Compute the capability set a request requires: `Text` always, `Tools` when
/// tool definitions are attached, media capabilities per content block, and
/// `Thinking` when the caller asks for it.
pub fn required_capabilities(
    messages: &[Message],
    has_tools: bool,
    thinking: bool,
) -> CapabilitySet {
    let mut set = CapabilitySet::new();
    set.insert(Capability::Text);
    if has_tools {
        set.insert(Capability::Tools);
    }
    if thinking {
        set.insert(Capability::Thinking);
    }
    for msg in messages {
        if let MessageContent::Blocks(blocks) = &msg.content {
            for block in blocks {
                if let Some(cap) = block_capability(block) {
                    set.insert(cap);
                }
            }
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MediaSource;

    fn video_message() -> Message {
        Message {
            role: crate::message::Role::User,
            content: MessageContent::Blocks(vec![
                ContentBlock::Text { text: "what's in this clip?".into() },
                ContentBlock::Video {
                    source: MediaSource::Url {
                        url: "https://example.com/clip.mp4".into(),
                        media_type: Some("video/mp4".into()),
                    },
                },
            ]),
        }
    }

    #[test]
    fn text_only_request_requires_text() {
        let msgs = vec![Message::user("hi")];
        let req = required_capabilities(&msgs, false, false);
        assert!(req.contains(Capability::Text));
        assert!(!req.contains(Capability::Tools));
        assert!(!req.contains(Capability::Video));
    }

    #[test]
    fn tools_and_thinking_flags() {
        let msgs = vec![Message::user("hi")];
        let req = required_capabilities(&msgs, true, true);
        assert!(req.contains(Capability::Tools));
        assert!(req.contains(Capability::Thinking));
    }

    #[test]
    fn media_blocks_add_capabilities() {
        let msgs = vec![video_message()];
        let req = required_capabilities(&msgs, false, false);
        assert!(req.contains(Capability::Video));
        assert!(!req.contains(Capability::Vision));
    }

    #[test]
    fn superset_and_missing() {
        let have: CapabilitySet =
            [Capability::Text, Capability::Tools, Capability::Vision].into_iter().collect();
        let need: CapabilitySet =
            [Capability::Text, Capability::Video].into_iter().collect();
        assert!(!have.superset_of(&need));

        let missing = have.missing_from(&need);
        assert!(missing.contains(Capability::Video));
        assert!(!missing.contains(Capability::Text));
    }
}
