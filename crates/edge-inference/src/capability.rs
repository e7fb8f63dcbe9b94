//! Capability identifiers for request classes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A category of AI request. Each capability owns at most one active runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextGeneration,
    VisionTextGeneration,
    SpeechToText,
    TextToSpeech,
    ContentSafety,
}

/// Keyword table used to infer capabilities from a runner name. Vision comes
/// before plain text so `vlm_chat` does not resolve to text generation only.
const KEYWORDS: &[(&str, Capability)] = &[
    ("speech_to_text", Capability::SpeechToText),
    ("text_to_speech", Capability::TextToSpeech),
    ("vlm", Capability::VisionTextGeneration),
    ("vision", Capability::VisionTextGeneration),
    ("asr", Capability::SpeechToText),
    ("stt", Capability::SpeechToText),
    ("whisper", Capability::SpeechToText),
    ("tts", Capability::TextToSpeech),
    ("speech", Capability::TextToSpeech),
    ("guard", Capability::ContentSafety),
    ("safety", Capability::ContentSafety),
    ("llm", Capability::TextGeneration),
    ("chat", Capability::TextGeneration),
    ("text", Capability::TextGeneration),
];

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::TextGeneration,
        Capability::VisionTextGeneration,
        Capability::SpeechToText,
        Capability::TextToSpeech,
        Capability::ContentSafety,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::TextGeneration => "text_generation",
            Capability::VisionTextGeneration => "vision_text_generation",
            Capability::SpeechToText => "speech_to_text",
            Capability::TextToSpeech => "text_to_speech",
            Capability::ContentSafety => "content_safety",
        }
    }

    /// Infer capabilities from a runner name by substring match. The first
    /// matching keyword wins; an unrecognised name yields an empty list.
    pub fn infer_from_runner(runner: &str) -> Vec<Capability> {
        let lowered = runner.to_lowercase();
        KEYWORDS
            .iter()
            .find(|(keyword, _)| lowered.contains(*keyword))
            .map(|(_, capability)| vec![*capability])
            .unwrap_or_default()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .or_else(|| match normalized.as_str() {
                "llm" | "chat" => Some(Capability::TextGeneration),
                "vlm" | "vision" => Some(Capability::VisionTextGeneration),
                "asr" | "stt" => Some(Capability::SpeechToText),
                "tts" => Some(Capability::TextToSpeech),
                "safety" | "guard" => Some(Capability::ContentSafety),
                _ => None,
            })
            .ok_or_else(|| format!("unknown capability: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_serialization() {
        let json = serde_json::to_string(&Capability::SpeechToText).unwrap();
        assert_eq!(json, r#""speech_to_text""#);
        let parsed: Capability = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Capability::SpeechToText);
    }

    #[test]
    fn test_infer_from_runner_prefers_vision() {
        assert_eq!(
            Capability::infer_from_runner("mtk_vlm_chat"),
            vec![Capability::VisionTextGeneration]
        );
        assert_eq!(
            Capability::infer_from_runner("cpu_llm"),
            vec![Capability::TextGeneration]
        );
        assert_eq!(
            Capability::infer_from_runner("WhisperRunner"),
            vec![Capability::SpeechToText]
        );
        assert!(Capability::infer_from_runner("mystery").is_empty());
    }

    #[test]
    fn test_from_str_accepts_aliases() {
        assert_eq!("llm".parse::<Capability>().unwrap(), Capability::TextGeneration);
        assert_eq!(
            "text-to-speech".parse::<Capability>().unwrap(),
            Capability::TextToSpeech
        );
        assert!("teleport".parse::<Capability>().is_err());
    }
}
