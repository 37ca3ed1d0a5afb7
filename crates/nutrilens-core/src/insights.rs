//! Local weekly summary, used when the backend's `/insights` is unavailable.

use chrono::{Datelike, Duration, NaiveDate};

use crate::model::{FoodLogEntry, NutritionInsights};

/// Share of calories attributed to protein, carbs and fat.
const MACRO_SPLIT: [f64; 3] = [0.3, 0.3, 0.4];

/// Summarize the Monday-to-Sunday week containing `today`.
pub fn weekly_summary(
    entries: &[FoodLogEntry],
    daily_goal: u32,
    today: NaiveDate,
) -> NutritionInsights {
    let week_start = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));

    let weekly_calorie_data: Vec<u32> = (0..7)
        .map(|offset| {
            let day = week_start + Duration::days(offset);
            entries
                .iter()
                .filter(|e| e.logged_on() == day)
                .fold(0u32, |sum, e| sum.saturating_add(e.calories))
        })
        .collect();

    let total: u64 = weekly_calorie_data.iter().map(|&c| u64::from(c)).sum();
    let total = total as f64;
    let nutrient_breakdown = MACRO_SPLIT.iter().map(|s| total * s).collect();

    let average = total / 7.0;
    let mut insights = vec![
        format!("Your average daily calorie intake this week was {average:.0} calories."),
        format!("Your calorie goal is {daily_goal} calories per day."),
    ];
    let goal = f64::from(daily_goal);
    if average > goal {
        insights.push(
            "You're currently above your calorie goal. Consider reducing portion sizes or \
             choosing lower-calorie options."
                .to_string(),
        );
    } else if average < goal {
        insights.push(
            "You're currently below your calorie goal. Make sure you're eating enough to meet \
             your nutritional needs."
                .to_string(),
        );
    }

    NutritionInsights {
        weekly_calorie_data,
        nutrient_breakdown,
        insights,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn entry(y: i32, m: u32, d: u32, calories: u32) -> FoodLogEntry {
        FoodLogEntry {
            id: Uuid::now_v7(),
            food_name: "x".into(),
            calories,
            logged_at: Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap(),
            synced: true,
        }
    }

    #[test]
    fn test_buckets_by_weekday() {
        // 2024-03-06 is a Wednesday; its week starts Monday 2024-03-04
        let today = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
        let entries = vec![
            entry(2024, 3, 4, 500),
            entry(2024, 3, 4, 300),
            entry(2024, 3, 6, 1000),
            entry(2024, 3, 10, 200),
            // previous week, excluded
            entry(2024, 3, 3, 9999),
        ];
        let summary = weekly_summary(&entries, 2000, today);
        assert_eq!(summary.weekly_calorie_data, vec![800, 0, 1000, 0, 0, 0, 200]);
    }

    #[test]
    fn test_breakdown_split() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let summary = weekly_summary(&[entry(2024, 3, 4, 1000)], 2000, today);
        assert_eq!(summary.nutrient_breakdown.len(), 3);
        assert!((summary.nutrient_breakdown[0] - 300.0).abs() < 1e-9);
        assert!((summary.nutrient_breakdown[1] - 300.0).abs() < 1e-9);
        assert!((summary.nutrient_breakdown[2] - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_below_goal_advice() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let summary = weekly_summary(&[], 2000, today);
        assert_eq!(summary.insights.len(), 3);
        assert!(summary.insights[0].contains("0 calories"));
        assert!(summary.insights[2].contains("below"));
    }

    #[test]
    fn test_above_goal_advice() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let entries: Vec<_> = (4..=10).map(|d| entry(2024, 3, d, 3000)).collect();
        let summary = weekly_summary(&entries, 2000, today);
        assert!(summary.insights[0].contains("3000"));
        assert!(summary.insights[2].contains("above"));
    }

    #[test]
    fn test_huge_entries_saturate() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let entries: Vec<_> = (4..=10)
            .flat_map(|d| [entry(2024, 3, d, u32::MAX), entry(2024, 3, d, u32::MAX)])
            .collect();
        let summary = weekly_summary(&entries, 2000, today);
        assert_eq!(summary.weekly_calorie_data, vec![u32::MAX; 7]);
        assert!(summary.nutrient_breakdown[2] > f64::from(u32::MAX));
        assert!(summary.insights[2].contains("above"));
    }

    #[test]
    fn test_on_goal_no_advice() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let entries: Vec<_> = (4..=10).map(|d| entry(2024, 3, d, 2000)).collect();
        let summary = weekly_summary(&entries, 2000, today);
        assert_eq!(summary.insights.len(), 2);
    }
}
