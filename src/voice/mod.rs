//! Voice XP sessions and their recovery across restarts.

pub mod tracker;

pub use tracker::{VoicePresence, VoiceSession, VoiceXpTracker};
