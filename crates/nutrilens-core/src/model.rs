use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Authenticated user's profile, as served by `GET /user-profile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub username: String,
    #[serde(default = "default_daily_goal")]
    pub daily_calorie_goal: u32,
}

/// Goal assumed when the profile does not carry one.
pub const DEFAULT_DAILY_CALORIE_GOAL: u32 = 2000;

fn default_daily_goal() -> u32 {
    DEFAULT_DAILY_CALORIE_GOAL
}

/// Structured nutrition estimate returned by the analysis endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub food_name: String,
    pub calories: u32,
    #[serde(alias = "analysis", default)]
    pub narrative: String,
}

/// A confirmed entry in the food log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoodLogEntry {
    pub id: Uuid,
    pub food_name: String,
    pub calories: u32,
    pub logged_at: DateTime<Utc>,
    /// False until the backend has acknowledged this entry.
    pub synced: bool,
}

impl FoodLogEntry {
    /// Build an unsynced entry from a confirmed analysis.
    pub fn from_result(result: &AnalysisResult, logged_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            food_name: result.food_name.clone(),
            calories: result.calories,
            logged_at,
            synced: false,
        }
    }

    pub fn logged_on(&self) -> NaiveDate {
        self.logged_at.date_naive()
    }
}

/// Wire shape of a food log on the CRUD API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodLogRecord {
    pub id: Uuid,
    pub food_name: String,
    pub calories: u32,
    pub date: DateTime<Utc>,
}

impl From<&FoodLogEntry> for FoodLogRecord {
    fn from(entry: &FoodLogEntry) -> Self {
        Self {
            id: entry.id,
            food_name: entry.food_name.clone(),
            calories: entry.calories,
            date: entry.logged_at,
        }
    }
}

impl From<FoodLogRecord> for FoodLogEntry {
    fn from(record: FoodLogRecord) -> Self {
        Self {
            id: record.id,
            food_name: record.food_name,
            calories: record.calories,
            logged_at: record.date,
            synced: true,
        }
    }
}

/// Weekly nutrition summary, either served by `GET /insights` or computed
/// locally by [`crate::insights::weekly_summary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NutritionInsights {
    /// Calorie totals Monday..Sunday.
    pub weekly_calorie_data: Vec<u32>,
    /// Protein, carbs, fat (kcal).
    pub nutrient_breakdown: Vec<f64>,
    pub insights: Vec<String>,
}
