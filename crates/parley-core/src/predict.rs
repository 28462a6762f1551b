use crate::config::PredictionRule;

/// Produces the placeholder text shown before the first real fragment.
///
/// The guess is purely cosmetic; it never ends up in a finalized message.
pub trait Predictor: Send {
    fn predict(&self, query: &str) -> String;
}

/// Empty placeholder: just fills the "nothing is happening" gap
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyPredictor;

impl Predictor for EmptyPredictor {
    fn predict(&self, _query: &str) -> String {
        String::new()
    }
}

/// Picks the first rule whose keyword appears in the query
#[derive(Debug, Default, Clone)]
pub struct KeywordPredictor {
    rules: Vec<PredictionRule>,
}

impl KeywordPredictor {
    pub fn new(rules: Vec<PredictionRule>) -> Self {
        Self { rules }
    }
}

impl Predictor for KeywordPredictor {
    fn predict(&self, query: &str) -> String {
        let query = query.to_lowercase();
        self.rules
            .iter()
            .find(|rule| {
                rule.keywords
                    .iter()
                    .any(|keyword| query.contains(&keyword.to_lowercase()))
            })
            .map(|rule| rule.text.clone())
            .unwrap_or_default()
    }
}

/// Keyword rules when configured, an empty placeholder otherwise
pub fn from_rules(rules: &[PredictionRule]) -> Box<dyn Predictor> {
    if rules.is_empty() {
        Box::new(EmptyPredictor)
    } else {
        Box::new(KeywordPredictor::new(rules.to_vec()))
    }
}
