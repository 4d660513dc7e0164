//! Prompt builders and model-answer parsing for the pipeline stages.

use agent_core::{AgentError, SymbolAnalysis};
use serde::de::DeserializeOwned;

pub const ANALYSIS_SYSTEM_PROMPT: &str = "\
You are an equity analyst. Use the available market data tools to examine \
the requested symbol before concluding. Call one tool at a time; chain as \
many as you need. When you are done, respond ONLY with valid JSON in this \
exact format:
{
  \"signal\": \"bullish\" | \"neutral\" | \"bearish\",
  \"confidence\": 0.0,
  \"support\": 123.4,
  \"resistance\": 130.2,
  \"summary\": \"Two or three sentences citing the evidence you gathered.\"
}
support and resistance may be null when no clear level exists.";

pub const DECISION_SYSTEM_PROMPT: &str = "\
You are a portfolio manager synthesizing analyst work into actions. You \
will receive one analysis per symbol. Respond ONLY with valid JSON in this \
exact format:
{
  \"decisions\": [
    { \"symbol\": \"AAPL\", \"action\": \"BUY\" | \"SELL\" | \"HOLD\", \"rationale\": \"One sentence.\" }
  ]
}
Include every symbol exactly once, and no symbol that was not analyzed.";

pub const CHAT_SYSTEM_PROMPT: &str = "\
You are a financial research assistant. Use the available market data tools \
to ground every claim; call one tool at a time. Answer concisely and cite \
the figures the tools returned.";

pub fn analysis_prompt(symbol: &str) -> String {
    format!(
        "Analyze {} for a swing-trading horizon. Check price action and at \
         least one momentum indicator before concluding; add fundamentals, \
         news, or options flow if the picture is unclear.",
        symbol
    )
}

pub fn decision_prompt(analyses: &[SymbolAnalysis]) -> String {
    let mut prompt = String::from(
        "Decide BUY, SELL, or HOLD for each analyzed symbol below.\n\n",
    );
    for analysis in analyses {
        prompt.push_str(&format!(
            "- {}: {} (confidence {:.2}){}{} — {}\n",
            analysis.symbol,
            analysis.signal.as_str(),
            analysis.confidence,
            analysis
                .support
                .map(|s| format!(", support {:.2}", s))
                .unwrap_or_default(),
            analysis
                .resistance
                .map(|r| format!(", resistance {:.2}", r))
                .unwrap_or_default(),
            analysis.summary,
        ));
    }
    prompt
}

/// Parse a model answer that should be JSON. Tolerates markdown code fences
/// and leading prose around the JSON object.
pub fn parse_json_answer<T: DeserializeOwned>(answer: &str) -> Result<T, AgentError> {
    let trimmed = answer.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    // Strip ```json ... ``` fences
    let defenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim);
    if let Some(inner) = defenced {
        if let Ok(value) = serde_json::from_str(inner) {
            return Ok(value);
        }
    }

    // Last resort: widest brace-delimited slice
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(AgentError::Parse(format!(
        "model answer is not the expected JSON: {}",
        answer.chars().take(200).collect::<String>()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Probe {
        signal: String,
        confidence: f64,
    }

    #[test]
    fn parses_bare_json() {
        let p: Probe = parse_json_answer(r#"{"signal":"bullish","confidence":0.8}"#).unwrap();
        assert_eq!(p.signal, "bullish");
        assert!((p.confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_fenced_json() {
        let answer = "```json\n{\"signal\":\"bearish\",\"confidence\":0.6}\n```";
        let p: Probe = parse_json_answer(answer).unwrap();
        assert_eq!(p.signal, "bearish");
    }

    #[test]
    fn parses_json_embedded_in_prose() {
        let answer = "Here is my conclusion:\n{\"signal\":\"neutral\",\"confidence\":0.5} — done.";
        let p: Probe = parse_json_answer(answer).unwrap();
        assert_eq!(p.signal, "neutral");
    }

    #[test]
    fn rejects_non_json() {
        let result: Result<Probe, _> = parse_json_answer("I think it goes up.");
        assert!(matches!(result, Err(AgentError::Parse(_))));
    }
}
