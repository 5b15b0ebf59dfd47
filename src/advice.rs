//! Boundary types for the mixing-advice collaborator
//!
//! The engine never calls the collaborator. It only supplies the track labels
//! of both decks; hosts wire a concrete [`AdviceCollaborator`] and use the
//! parsers here to validate its JSON replies.

use serde::{Deserialize, Serialize};

use crate::error::AdviceError;

pub const SUGGESTION_COUNT: usize = 3;

/// Advice for moving from the track on deck A to the one on deck B
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixingAdvice {
  pub transition: String,
  pub energy: String,
  pub technical: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSuggestion {
  pub artist: String,
  pub title: String,
  /// Free text, e.g. "124" or "120-126"
  pub bpm: String,
  pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionsResponse {
  pub detected_vibe: String,
  pub suggestions: Vec<TrackSuggestion>,
}

/// Text-in, structured-out advisor
pub trait AdviceCollaborator {
  fn mixing_advice(&self, track_a: &str, track_b: &str) -> Result<MixingAdvice, AdviceError>;

  /// Up to two currently loaded tracks; replies carry exactly three suggestions
  fn track_suggestions(
    &self,
    track_a: Option<&str>,
    track_b: Option<&str>,
  ) -> Result<SuggestionsResponse, AdviceError>;
}

/// Loaded track labels joined for a prompt, or "nothing yet"
pub fn describe_context(track_a: Option<&str>, track_b: Option<&str>) -> String {
  let tracks: Vec<&str> = [track_a, track_b]
    .into_iter()
    .flatten()
    .filter(|t| !t.trim().is_empty())
    .collect();
  if tracks.is_empty() {
    "nothing yet".to_string()
  } else {
    tracks.join(" and ")
  }
}

pub fn parse_mixing_advice(json: &str) -> Result<MixingAdvice, AdviceError> {
  Ok(serde_json::from_str(json)?)
}

pub fn parse_suggestions(json: &str) -> Result<SuggestionsResponse, AdviceError> {
  let response: SuggestionsResponse = serde_json::from_str(json)?;
  if response.suggestions.len() != SUGGESTION_COUNT {
    return Err(AdviceError::SuggestionCount {
      expected: SUGGESTION_COUNT,
      actual: response.suggestions.len(),
    });
  }
  Ok(response)
}

#[cfg(test)]
mod tests {
  use super::*;

  const SUGGESTIONS: &str = r#"{
    "detectedVibe": "Deep house, late night",
    "suggestions": [
      {"artist": "A", "title": "One", "bpm": "122", "reason": "Same groove"},
      {"artist": "B", "title": "Two", "bpm": "124", "reason": "Lifts energy"},
      {"artist": "C", "title": "Three", "bpm": "123", "reason": "Key match"}
    ]
  }"#;

  struct Canned;

  impl AdviceCollaborator for Canned {
    fn mixing_advice(&self, track_a: &str, track_b: &str) -> Result<MixingAdvice, AdviceError> {
      Ok(MixingAdvice {
        transition: format!("{} into {}", track_a, track_b),
        ..MixingAdvice::default()
      })
    }

    fn track_suggestions(
      &self,
      _track_a: Option<&str>,
      _track_b: Option<&str>,
    ) -> Result<SuggestionsResponse, AdviceError> {
      parse_suggestions(SUGGESTIONS)
    }
  }

  #[test]
  fn test_parse_mixing_advice() {
    let advice =
      parse_mixing_advice(r#"{"transition": "Long blend", "energy": "Rising", "technical": "Cut lows"}"#)
        .unwrap();
    assert_eq!(advice.energy, "Rising");
    assert!(parse_mixing_advice(r#"{"transition": "x"}"#).is_err());
  }

  #[test]
  fn test_parse_suggestions_uses_camel_case() {
    let response = parse_suggestions(SUGGESTIONS).unwrap();
    assert_eq!(response.detected_vibe, "Deep house, late night");
    assert_eq!(response.suggestions[2].title, "Three");

    let json = serde_json::to_string(&response).unwrap();
    assert!(json.contains("detectedVibe"));
  }

  #[test]
  fn test_suggestions_must_be_exactly_three() {
    let two = r#"{"detectedVibe": "", "suggestions": [
      {"artist": "A", "title": "One", "bpm": "122", "reason": ""},
      {"artist": "B", "title": "Two", "bpm": "124", "reason": ""}
    ]}"#;
    assert!(matches!(
      parse_suggestions(two),
      Err(AdviceError::SuggestionCount {
        expected: 3,
        actual: 2
      })
    ));
  }

  #[test]
  fn test_describe_context() {
    assert_eq!(describe_context(None, None), "nothing yet");
    assert_eq!(describe_context(Some("Intro"), None), "Intro");
    assert_eq!(describe_context(Some("Intro"), Some("Peak")), "Intro and Peak");
    assert_eq!(describe_context(Some(" "), Some("Peak")), "Peak");
  }

  #[test]
  fn test_collaborator_trait_object() {
    let advisor: Box<dyn AdviceCollaborator> = Box::new(Canned);
    let advice = advisor.mixing_advice("Intro", "Peak").unwrap();
    assert_eq!(advice.transition, "Intro into Peak");
    assert_eq!(advisor.track_suggestions(None, None).unwrap().suggestions.len(), 3);
  }
}
