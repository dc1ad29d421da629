//! Pattern extraction for financial text
//!
//! Quarter/year references, labeled financial figures, and plain
//! numbers. Shared by the planner (query hints), the retrieval executor
//! (filter fallback) and the calculation executor (input fallback).

use regex::Regex;
use std::sync::OnceLock;

/// A fiscal period reference, e.g. Q3 2024.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Period {
    pub quarter: String,
    pub year: i32,
}

impl Period {
    /// Label fragment for input maps, e.g. "q3_2024".
    pub fn label(&self) -> String {
        format!("{}_{}", self.quarter.to_lowercase(), self.year)
    }
}

fn quarter_first_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bQ([1-4])\s*'?\s*(\d{2}|\d{4})\b").expect("hardcoded pattern")
    })
}

fn year_first_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(\d{4})\s+Q([1-4])\b").expect("hardcoded pattern"))
}

fn normalize_year(raw: &str) -> Option<i32> {
    let value: i32 = raw.parse().ok()?;
    if raw.len() == 2 {
        Some(2000 + value)
    } else if (1990..=2100).contains(&value) {
        Some(value)
    } else {
        None
    }
}

/// Find period references like "Q3 2024", "Q3'24" or "2024 Q3",
/// in order of appearance, deduplicated.
pub fn extract_periods(text: &str) -> Vec<Period> {
    let mut periods: Vec<Period> = Vec::new();

    let mut candidates: Vec<(usize, Period)> = Vec::new();

    for captures in quarter_first_re().captures_iter(text) {
        if let (Some(full), Some(q), Some(y)) = (captures.get(0), captures.get(1), captures.get(2))
        {
            if let Some(year) = normalize_year(y.as_str()) {
                candidates.push((
                    full.start(),
                    Period {
                        quarter: format!("Q{}", q.as_str()),
                        year,
                    },
                ));
            }
        }
    }

    for captures in year_first_re().captures_iter(text) {
        if let (Some(full), Some(y), Some(q)) = (captures.get(0), captures.get(1), captures.get(2))
        {
            if let Some(year) = normalize_year(y.as_str()) {
                candidates.push((
                    full.start(),
                    Period {
                        quarter: format!("Q{}", q.as_str()),
                        year,
                    },
                ));
            }
        }
    }

    candidates.sort_by_key(|(offset, _)| *offset);
    for (_, period) in candidates {
        if !periods.contains(&period) {
            periods.push(period);
        }
    }

    periods
}

/// Metric labels and the phrasings they appear under in FAB documents.
pub const METRIC_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "net_profit",
        &[
            "net profit after tax",
            "net profit",
            "npat",
            "net income",
            "profit for the period",
        ],
    ),
    (
        "revenue",
        &["total revenue", "net operating income", "operating income"],
    ),
    ("total_assets", &["total assets"]),
    ("total_liabilities", &["total liabilities"]),
    (
        "shareholder_equity",
        &["shareholders' equity", "shareholder equity", "total equity"],
    ),
    (
        "total_loans",
        &["total loans", "loans and advances", "financing assets"],
    ),
    (
        "total_deposits",
        &["total deposits", "customer deposits", "deposits from customers"],
    ),
];

/// Pull one labeled figure out of a passage, trying AED-denominated
/// phrasings first and a bare trailing number last.
pub fn extract_metric(content: &str, keywords: &[&str]) -> Option<f64> {
    for keyword in keywords {
        let escaped = regex::escape(keyword);
        let patterns = [
            format!(
                r"(?i){}.*?AED\s*([\d,]+\.?\d*)\s*(?:million|bn|billion)",
                escaped
            ),
            format!(
                r"(?i){}.*?([\d,]+\.?\d*)\s*(?:million|bn|billion)\s*AED",
                escaped
            ),
            format!(r"(?i){}\D*?([\d,]+\.?\d*)", escaped),
        ];

        for pattern in &patterns {
            let Ok(re) = Regex::new(pattern) else {
                continue;
            };
            if let Some(captures) = re.captures(content) {
                if let Some(m) = captures.get(1) {
                    let cleaned = m.as_str().replace(',', "");
                    if let Ok(value) = cleaned.parse::<f64>() {
                        return Some(value);
                    }
                }
            }
        }
    }
    None
}

/// All known metrics present in a passage, as (label, value) pairs.
pub fn extract_metrics(content: &str) -> Vec<(String, f64)> {
    METRIC_KEYWORDS
        .iter()
        .filter_map(|(label, keywords)| {
            extract_metric(content, keywords).map(|value| (label.to_string(), value))
        })
        .collect()
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d[\d,]*(?:\.\d+)?").expect("hardcoded pattern"))
}

/// Every numeric literal in the text, commas stripped.
pub fn extract_numbers(text: &str) -> Vec<f64> {
    number_re()
        .find_iter(text)
        .filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok())
        .collect()
}

/// Numeric literals with their byte offsets, for claim extraction.
pub fn extract_numbers_with_spans(text: &str) -> Vec<(usize, usize, f64)> {
    number_re()
        .find_iter(text)
        .filter_map(|m| {
            m.as_str()
                .replace(',', "")
                .parse::<f64>()
                .ok()
                .map(|value| (m.start(), m.end(), value))
        })
        .collect()
}
