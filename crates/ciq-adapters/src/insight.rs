//! Prompt rendering and free-text insight parsing for analysis providers.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use ciq_core::{MetricSnapshot, PromptContext, StructuredInsight};

const MAX_LIST_ITEMS: usize = 3;

pub fn render_prompt(context: &PromptContext) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Analyze the following product data and provide insights.");
    let _ = writeln!(
        prompt,
        "Product: {} ({})",
        context.title.as_deref().unwrap_or("Unknown"),
        context.target_id
    );
    write_snapshot(&mut prompt, "Current", &context.current);
    if let Some(previous) = &context.previous {
        write_snapshot(&mut prompt, "Previous", previous);
    }
    prompt.push_str(
        "Provide:\n\
         1. A brief summary of current performance\n\
         2. Key opportunities for improvement\n\
         3. Specific recommendations\n",
    );
    prompt
}

fn write_snapshot(out: &mut String, label: &str, snapshot: &MetricSnapshot) {
    let _ = writeln!(
        out,
        "{label} ({}): price {}, rank {}, rating {}, reviews {}, available {}",
        snapshot.captured_at.to_rfc3339(),
        fmt_opt(snapshot.price),
        fmt_opt(snapshot.rank),
        fmt_opt(snapshot.rating),
        fmt_opt(snapshot.review_count),
        snapshot.available
    );
}

fn fmt_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| v.to_string())
}

/// Builds a structured insight from a model's free-text answer. Lines mentioning
/// advice become recommendations, lines mentioning upside become opportunities.
pub fn parse_insight(content: &str, generated_at: DateTime<Utc>) -> StructuredInsight {
    StructuredInsight {
        summary: content.trim().to_string(),
        recommendations: lines_with(content, &["recommend", "should", "consider"]),
        opportunities: lines_with(content, &["opportunity", "potential", "could"]),
        generated_at,
    }
}

fn lines_with(content: &str, keywords: &[&str]) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| {
            let lower = line.to_lowercase();
            keywords.iter().any(|k| lower.contains(k))
        })
        .take(MAX_LIST_ITEMS)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_recommendations_and_opportunities() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        let text = "Sales are steady.\n\
                    - You should lower the price slightly.\n\
                    - Consider bundling accessories.\n\
                    - There is potential in the EU market.\n";
        let insight = parse_insight(text, at);
        assert_eq!(insight.recommendations.len(), 2);
        assert_eq!(insight.opportunities, vec!["- There is potential in the EU market."]);
        assert!(insight.summary.starts_with("Sales are steady."));
    }

    #[test]
    fn prompt_mentions_both_snapshots() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        let snapshot = MetricSnapshot {
            entity_id: "B00TEST01".into(),
            captured_at: at,
            price: Some(19.5),
            rank: Some(300),
            rating: None,
            review_count: None,
            available: true,
        };
        let prompt = render_prompt(&PromptContext {
            target_id: "B00TEST01".into(),
            title: Some("Desk Lamp".into()),
            current: snapshot.clone(),
            previous: Some(snapshot),
        });
        assert!(prompt.contains("Desk Lamp (B00TEST01)"));
        assert!(prompt.contains("Current"));
        assert!(prompt.contains("Previous"));
        assert!(prompt.contains("rating n/a"));
    }
}
