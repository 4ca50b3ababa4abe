use crate::core::workflow::executor::{
    PartialSink, TaskError, TaskErrorKind, TaskExecutor, TaskOutput, TaskRequest,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

const HARD_WEIGHT: f64 = 0.6;
const SOFT_WEIGHT: f64 = 0.25;
const KEYWORD_WEIGHT: f64 = 0.15;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Category {
    Hard,
    Soft,
    Keyword,
}

#[derive(Debug, Deserialize)]
struct MatchedItem {
    category: Category,
    matched: bool,
}

#[derive(Debug, Deserialize)]
struct MatchedChecklist {
    items: Vec<MatchedItem>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    matched: usize,
    total: usize,
}

impl Tally {
    fn ratio(&self) -> Option<f64> {
        (self.total > 0).then(|| self.matched as f64 / self.total as f64)
    }

    fn breakdown(&self) -> Value {
        json!({"matched": self.matched, "total": self.total})
    }
}

/// Weighted match score in `0..=100`.
///
/// Hard requirements weigh 0.6, soft 0.25 and keywords 0.15. Categories
/// without items are left out and the remaining weights renormalised; an
/// empty checklist scores 0.
pub fn score_checklist(checklist: &Value) -> Result<Value, TaskError> {
    let parsed: MatchedChecklist = serde_json::from_value(checklist.clone()).map_err(|err| {
        TaskError::new(
            TaskErrorKind::InvalidInput,
            format!("matchedChecklist is malformed: {}", err),
        )
    })?;

    let (mut hard, mut soft, mut keyword) = (Tally::default(), Tally::default(), Tally::default());
    for item in &parsed.items {
        let tally = match item.category {
            Category::Hard => &mut hard,
            Category::Soft => &mut soft,
            Category::Keyword => &mut keyword,
        };
        tally.total += 1;
        if item.matched {
            tally.matched += 1;
        }
    }

    let mut weighted = 0.0;
    let mut weight_sum = 0.0;
    for (tally, weight) in [(hard, HARD_WEIGHT), (soft, SOFT_WEIGHT), (keyword, KEYWORD_WEIGHT)] {
        if let Some(ratio) = tally.ratio() {
            weighted += ratio * weight;
            weight_sum += weight;
        }
    }
    let score = if weight_sum > 0.0 {
        (weighted / weight_sum * 100.0).round() as u64
    } else {
        0
    };

    Ok(json!({
        "score": score,
        "breakdown": {
            "hard": hard.breakdown(),
            "soft": soft.breakdown(),
            "keyword": keyword.breakdown(),
        },
    }))
}

/// Computes `score.calculation` locally from the matched checklist.
pub struct ScoreExecutor;

#[async_trait]
impl TaskExecutor for ScoreExecutor {
    async fn execute(
        &self,
        request: TaskRequest,
        _partials: PartialSink,
    ) -> Result<TaskOutput, TaskError> {
        let checklist = request.input_value("matchedChecklist")?;
        // Non-retryable: the same input always fails the same way.
        let value = score_checklist(checklist).map_err(|err| err.retryable(false))?;
        Ok(TaskOutput::new(value))
    }
}
