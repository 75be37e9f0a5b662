use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::transcript::Transcript;

/// System instruction sent with every generate-mode request. Established at
/// session start and never mutated afterwards.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a creative storyteller. Your task is to craft detailed, imaginative, and engaging stories based on a provided image and the user's specific guidelines. Always aim for vivid descriptions and immersive narratives.";

/// Single-slot audio cache entry. The digest records which narrative the
/// audio was synthesized from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioArtifact {
    pub path: PathBuf,
    pub narrative_digest: String,
}

/// All mutable state owned by one interactive session.
///
/// Created at session start, discarded at session end. The audio slot is
/// filled at most once per session: later downloads reuse the cached
/// artifact instead of re-synthesizing.
#[derive(Debug, Clone)]
pub struct SessionState {
    system_instruction: String,
    transcript: Transcript,
    audio_artifact: Option<AudioArtifact>,
}

impl SessionState {
    pub fn new(system_instruction: impl Into<String>) -> Self {
        Self {
            system_instruction: system_instruction.into(),
            transcript: Transcript::new(),
            audio_artifact: None,
        }
    }

    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    pub fn audio_artifact(&self) -> Option<&AudioArtifact> {
        self.audio_artifact.as_ref()
    }

    /// Fills the audio slot. The first write wins; later calls are ignored
    /// so a cached artifact is never replaced mid-session.
    pub fn cache_audio_artifact(&mut self, artifact: AudioArtifact) -> &AudioArtifact {
        if self.audio_artifact.is_none() {
            self.audio_artifact = Some(artifact);
        }
        self.audio_artifact
            .as_ref()
            .expect("audio slot filled above")
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_INSTRUCTION)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{AudioArtifact, SessionState};

    #[test]
    fn audio_slot_is_write_once() {
        let mut state = SessionState::default();
        assert!(state.audio_artifact().is_none());

        let first = AudioArtifact {
            path: PathBuf::from("/tmp/a.mp3"),
            narrative_digest: "aaa".to_string(),
        };
        let second = AudioArtifact {
            path: PathBuf::from("/tmp/b.mp3"),
            narrative_digest: "bbb".to_string(),
        };

        state.cache_audio_artifact(first.clone());
        state.cache_audio_artifact(second);

        assert_eq!(state.audio_artifact(), Some(&first));
    }

    #[test]
    fn default_state_carries_storyteller_instruction() {
        let state = SessionState::default();
        assert!(state.system_instruction().contains("creative storyteller"));
        assert!(state.transcript().is_empty());
    }
}
