//! Deterministic local generator.
//!
//! Used whenever no provider is configured, a provider call fails, or the
//! hard timeout elapses. Questions come from a built-in per-type bank;
//! summaries and answer analysis use length and keyword heuristics. Summary
//! output carries `"fallback": true` so downstream consumers can label it.

use serde_json::{Value, json};

use crate::policy::RubricWeights;
use crate::session::Session;
use crate::store::{Answer, Question, QuestionDraft};

/// Keywords whose presence nudges the technical sub-score.
const TECHNICAL_KEYWORDS: &[&str] = &[
    "complexity",
    "tradeoff",
    "test",
    "metric",
    "latency",
    "edge case",
    "design",
    "scale",
];

/// Builds the fallback question for a slot.
#[must_use]
pub fn question(session: &Session, question_type: &str, ordinal: u32) -> QuestionDraft {
    let role = session.config.role_category.as_str();
    let difficulty = session.config.difficulty.as_str();
    match question_type {
        "coding" => QuestionDraft {
            question_type: "coding".into(),
            text: "Write a function to find all duplicates in an array of integers.".into(),
            metadata: json!({
                "difficulty": difficulty,
                "hintAvailable": true,
                "language": "python",
                "functionName": "find_duplicates",
                "functionSignature": "def find_duplicates(arr):\n    # your code\n    pass",
                "tests": [
                    {"input": [[1, 2, 3, 2, 4, 1]], "expected": [1, 2]},
                    {"input": [[5, 5, 5]], "expected": [5]},
                    {"input": [[1, 2, 3]], "expected": []}
                ]
            }),
        },
        "mcq" => QuestionDraft {
            question_type: "mcq".into(),
            text: "Which of the following statements about Big-O notation are true?".into(),
            metadata: json!({
                "difficulty": difficulty,
                "hintAvailable": true,
                "options": [
                    "O(n log n) grows slower than O(n^2)",
                    "O(1) means constant time regardless of input size",
                    "O(n) always faster than O(log n)",
                    "O(2^n) is polynomial time"
                ],
                "multiple": true
            }),
        },
        "fib" => QuestionDraft {
            question_type: "fib".into(),
            text: "Fill in the blanks for the HTTP status codes: ______ means Not Found, ______ means OK."
                .into(),
            metadata: json!({
                "difficulty": difficulty,
                "hintAvailable": true,
                "fillSlots": ["Not Found", "OK"]
            }),
        },
        "scenario" => QuestionDraft {
            question_type: "scenario".into(),
            text: format!(
                "Your automated test suite is slow. Propose a plan to optimize it for the {role} role."
            ),
            metadata: json!({"difficulty": difficulty, "hintAvailable": true}),
        },
        _ => QuestionDraft {
            question_type: "behavioral".into(),
            text: format!(
                "Tell me about a time you solved a difficult problem in {role}. (Q{ordinal})"
            ),
            metadata: json!({"difficulty": difficulty, "hintAvailable": true}),
        },
    }
}

/// Heuristic score for one answer: 40 for an empty answer, otherwise 60 plus
/// one point per ten words, capped at 100.
fn length_score(text: &str) -> u32 {
    let words = text.split_whitespace().count() as u32;
    if words == 0 {
        40
    } else {
        (60 + (words / 10).min(40)).min(100)
    }
}

fn answer_text(answer: &Answer) -> String {
    answer
        .payload
        .get("responseText")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Heuristic analysis of one answer. Mirrors the per-type feedback the
/// provider path produces: score (0..100), feedback, model answer.
#[must_use]
pub fn analyze(question: &Question, answer: &Answer) -> Value {
    let text = answer_text(answer);
    let score = length_score(&text);
    let (feedback, model_answer) = match answer.kind.as_str() {
        "code" => (
            "Consider correctness, complexity, edge cases, and readability. Add tests where relevant.",
            "Provide a correct, efficient solution with O(n) or better if applicable; discuss tradeoffs and edge cases.",
        ),
        "mcq" => (
            "Review the selected choices and justify why they are correct; revisit the concept if unsure.",
            "State the correct option(s) with a brief explanation.",
        ),
        "fib" => (
            "Fill each blank with precise terminology; ensure consistency with the question context.",
            "Provide the expected term/value per blank with a short rationale.",
        ),
        _ => (
            "Good start. Add concrete details, metrics, and structure (STAR).",
            "Include Situation, Task, Action, Result with metrics; for coding, discuss complexity and edge cases.",
        ),
    };
    let _ = question;
    json!({
        "score": score,
        "feedback": feedback,
        "modelAnswer": model_answer,
        "fallback": true
    })
}

/// Heuristic session summary: sub-scores from answer length and keyword
/// presence, overall via the rubric weights, labelled `"fallback": true`.
#[must_use]
pub fn summary(session: &Session, questions: &[Question], answers: &[Answer]) -> Value {
    let texts: Vec<String> = answers.iter().map(answer_text).collect();
    let answered = texts.iter().filter(|t| !t.is_empty()).count();

    let avg_score = if texts.is_empty() {
        40.0
    } else {
        texts.iter().map(|t| f64::from(length_score(t))).sum::<f64>() / texts.len() as f64
    };

    let keyword_hits = texts
        .iter()
        .map(|t| {
            let lowered = t.to_lowercase();
            TECHNICAL_KEYWORDS
                .iter()
                .filter(|k| lowered.contains(**k))
                .count()
        })
        .sum::<usize>();

    let communication = avg_score;
    let technical = (avg_score + (keyword_hits as f64 * 5.0)).min(100.0);
    let coverage = if questions.is_empty() {
        0.0
    } else {
        answered as f64 / questions.len() as f64
    };
    let problem_solving = (avg_score * 0.5 + coverage * 50.0).min(100.0);

    let weights = RubricWeights::default();
    let overall = weights.overall(communication, technical, problem_solving);

    let mut strengths = Vec::new();
    let mut gaps = Vec::new();
    if coverage >= 1.0 {
        strengths.push("Answered every question".to_string());
    } else {
        gaps.push("Some questions went unanswered".to_string());
    }
    if keyword_hits > 0 {
        strengths.push("Grounded answers in technical specifics".to_string());
    } else {
        gaps.push("Add technical depth: metrics, tradeoffs, edge cases".to_string());
    }
    if avg_score >= 80.0 {
        strengths.push("Detailed, well-developed answers".to_string());
    } else {
        gaps.push("Expand answers with concrete detail and structure".to_string());
    }

    // Sub-scores on the wire are 0-5 like the rubric the client renders.
    let to_rubric = |score: f64| (score / 20.0).clamp(0.0, 5.0).round();

    json!({
        "rubric": {
            "communication": to_rubric(communication),
            "technical": to_rubric(technical),
            "problemSolving": to_rubric(problem_solving)
        },
        "strengths": strengths,
        "gaps": gaps,
        "scoreBreakdown": {
            "overall": overall,
            "communication": communication.round(),
            "technical": technical.round(),
            "problemSolving": problem_solving.round()
        },
        "fallback": true,
        "language": session.config.language,
    })
}
