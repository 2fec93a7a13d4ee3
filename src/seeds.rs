//! Built-in content: a demo survey and the generic fallback follow-up.

use crate::domain::{McqOption, Question, QuestionType, Survey};

pub const DEMO_SURVEY_ID: &str = "demo";

/// Minimal survey that guarantees the app is useful without external config.
pub fn seed_surveys() -> Vec<Survey> {
  vec![Survey {
    id: DEMO_SURVEY_ID.into(),
    title: "Workshop retrospective".into(),
    questions: vec![
      Question {
        key: "Q1".into(),
        parent_key: None,
        kind: QuestionType::Essay,
        prompt: "What was the most useful thing you learned today, and how will you apply it?".into(),
        rubric: Some("Names a concrete takeaway and a concrete next step.".into()),
        points_max: 100,
        threshold: Some(0.6),
        scale_min: None,
        scale_max: None,
        options: None,
      },
      Question {
        key: "Q2".into(),
        parent_key: None,
        kind: QuestionType::Degree,
        prompt: "How confident do you feel about the material?".into(),
        rubric: None,
        points_max: 20,
        threshold: None,
        scale_min: Some(1),
        scale_max: Some(5),
        options: None,
      },
      Question {
        key: "Q3".into(),
        parent_key: None,
        kind: QuestionType::Mcq,
        prompt: "Which format would you like next time?".into(),
        rubric: None,
        points_max: 10,
        threshold: None,
        scale_min: None,
        scale_max: None,
        options: Some(vec![
          McqOption { id: "a".into(), label: "Hands-on lab".into(), points: 10 },
          McqOption { id: "b".into(), label: "Talk + Q&A".into(), points: 10 },
          McqOption { id: "c".into(), label: "No preference".into(), points: 5 },
        ]),
      },
    ],
  }]
}

/// Last-resort follow-up used when neither the pool nor the generator delivers.
pub fn generic_follow_up(base: &Question) -> Question {
  Question {
    key: String::new(),
    parent_key: Some(base.root_key().to_string()),
    kind: QuestionType::Essay,
    prompt: format!(
      "Could you add more detail to your answer? Give a specific example. (Original question: {})",
      base.prompt
    ),
    rubric: base.rubric.clone(),
    points_max: base.points_max,
    threshold: base.threshold,
    scale_min: None,
    scale_max: None,
    options: None,
  }
}
