use chrono::{Local, NaiveDate};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// The shared secret new members send privately to get unmuted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyPassword {
    pub value: String,
    pub generated_on: NaiveDate,
}

impl DailyPassword {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            generated_on: Local::now().date_naive(),
        }
    }

    /// Exact, case-sensitive comparison.
    pub fn matches(&self, candidate: &str) -> bool {
        self.value == candidate
    }
}

/// Produces random alphanumeric passwords.
#[derive(Debug, Clone)]
pub struct PasswordGenerator {
    length: usize,
}

impl PasswordGenerator {
    pub fn new(length: usize) -> Self {
        Self { length }
    }

    pub fn generate(&self) -> DailyPassword {
        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.length)
            .map(char::from)
            .collect();
        DailyPassword::new(value)
    }
}

impl Default for PasswordGenerator {
    fn default() -> Self {
        Self::new(8)
    }
}
