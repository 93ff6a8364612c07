//! Number grammar for narrative text and string-encoded fact values.
//!
//! The scanner recognizes integers, decimals, thousands separators, signs
//! (including the Unicode minus), percentages, scale words and currency
//! prefixes. It deliberately refuses tokens that are not quantities:
//!
//! | Refused | Example |
//! |---------|---------|
//! | glued to letters | `Q1`, `COVID-19`, `3rd`, `5G`, `12-month` |
//! | date and time parts | `2024-03-31`, `31/03/2024`, `10:30` |
//! | version-like chains | `1.2.3` |
//! | bare calendar years | `2024` (no sign, decimal, separator, percent, scale or currency) |
//! | identifier-length digit runs | `27401234567` when a minimum is configured |
//! | excluded spans | citation markers, redaction placeholders |
//!
//! Ranges written with a hyphen (`5-10`) are indistinguishable from dates
//! and are refused as well.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::types::Span;

lazy_static! {
    static ref NUMBER_PATTERN: Regex = Regex::new(
        r"(?xi)
        (?P<sign>[-+\x{2212}])?
        (?P<currency>\b(?:qar|usd|eur|gbp)\s?|[$€£]\s?)?
        (?P<digits>\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?|\.\d+)
        (?P<percent>\s?%|\s?(?:percentage\s+points?|percent|per\s?cent|pct)\b)?
        (?P<scale>\s?(?:thousand|million|billion|trillion|bn|mn)\b|(?:k|m)\b)?"
    )
    .unwrap();
}

const YEAR_RANGE: std::ops::RangeInclusive<i64> = 1900..=2100;

/// A number recognized in text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannedNumber {
    /// The matched substring
    pub raw: String,

    /// Signed value with any scale word applied
    pub value: f64,

    /// Signed value before scaling
    pub mantissa: f64,

    pub span: Span,

    /// Written with `%`, `percent`, `per cent`, `pct` or `percentage points`
    pub percent: bool,

    /// Multiplier from a scale word (`million` -> 1e6)
    pub scale: Option<f64>,

    /// Currency prefix as written (`QAR`, `$`)
    pub currency: Option<String>,

    /// Digits were written with thousands separators
    pub grouped: bool,

    /// Digits contained a decimal point
    pub decimal: bool,
}

impl ScannedNumber {
    /// A plain integer: no sign, currency, separators, decimals, percent or scale.
    pub fn is_bare_integer(&self) -> bool {
        !self.grouped
            && !self.decimal
            && !self.percent
            && self.scale.is_none()
            && self.currency.is_none()
            && !self.raw.starts_with(['-', '+', '\u{2212}'])
    }

    /// Looks like a calendar year (`1990`, `2024`).
    pub fn is_year(&self) -> bool {
        self.is_bare_integer()
            && self.raw.len() == 4
            && YEAR_RANGE.contains(&(self.value as i64))
    }
}

/// Controls which tokens the scanner refuses.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    /// Refuse bare calendar years
    pub skip_years: bool,

    /// Refuse bare digit runs of at least this many digits
    pub identifier_min_digits: Option<usize>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            skip_years: true,
            identifier_min_digits: None,
        }
    }
}

/// Scan text with default options and no excluded spans.
pub fn scan(text: &str) -> Vec<ScannedNumber> {
    scan_with(text, &ScanOptions::default(), &[])
}

/// Scan text, skipping numbers that start inside any excluded span.
pub fn scan_with(text: &str, options: &ScanOptions, excluded: &[Span]) -> Vec<ScannedNumber> {
    let mut numbers = Vec::new();

    for caps in NUMBER_PATTERN.captures_iter(text) {
        let Some(m) = caps.get(0) else { continue };

        if excluded.iter().any(|span| span.contains(m.start())) {
            continue;
        }
        if glued_before(text, m.start()) || glued_after(text, m.end()) {
            continue;
        }

        let Some(number) = from_captures(&caps, text) else {
            continue;
        };

        if options.skip_years && number.is_year() {
            continue;
        }
        if let Some(min_digits) = options.identifier_min_digits {
            if number.is_bare_integer() && number.raw.len() >= min_digits {
                continue;
            }
        }

        numbers.push(number);
    }

    numbers
}

/// A quantity parsed from a string-encoded fact value.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub value: f64,
    pub percent: bool,

    /// Remaining unit text, including any currency prefix
    pub unit: Option<String>,
}

/// Parse a string-encoded value such as `"0.10%"`, `"1,234"` or
/// `"QAR 1.2 million"`.
///
/// The number must lead the string (after an optional currency prefix) and
/// the remainder may not contain further digits.
pub fn parse_quantity(input: &str) -> Option<Quantity> {
    let trimmed = input.trim();
    let caps = NUMBER_PATTERN.captures(trimmed)?;
    let m = caps.get(0)?;
    if m.start() != 0 {
        return None;
    }

    let rest = trimmed[m.end()..].trim();
    if rest.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    // "12abc" is not a quantity, "12 abc" is
    if trimmed[m.end()..].starts_with(|c: char| c.is_alphanumeric()) {
        return None;
    }

    let number = from_captures(&caps, trimmed)?;

    let unit_parts: Vec<&str> = [number.currency.as_deref(), Some(rest)]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let unit = if unit_parts.is_empty() {
        None
    } else {
        Some(unit_parts.join(" "))
    };

    Some(Quantity {
        value: number.value,
        percent: number.percent,
        unit,
    })
}

fn from_captures(caps: &Captures<'_>, text: &str) -> Option<ScannedNumber> {
    let whole = caps.get(0)?;
    let digits = caps.name("digits")?.as_str();
    let magnitude: f64 = digits.replace(',', "").parse().ok()?;
    if !magnitude.is_finite() {
        return None;
    }

    let negative = caps
        .name("sign")
        .map_or(false, |s| s.as_str() == "-" || s.as_str() == "\u{2212}");
    let mantissa = if negative { -magnitude } else { magnitude };

    let scale = caps
        .name("scale")
        .and_then(|s| scale_multiplier(s.as_str().trim()));
    let value = mantissa * scale.unwrap_or(1.0);

    Some(ScannedNumber {
        raw: text[whole.start()..whole.end()].to_string(),
        value,
        mantissa,
        span: Span::new(whole.start(), whole.end()),
        percent: caps.name("percent").is_some(),
        scale,
        currency: caps
            .name("currency")
            .map(|c| c.as_str().trim().to_string()),
        grouped: digits.contains(','),
        decimal: digits.contains('.'),
    })
}

fn scale_multiplier(word: &str) -> Option<f64> {
    match word.to_lowercase().as_str() {
        "k" | "thousand" => Some(1e3),
        "m" | "mn" | "million" => Some(1e6),
        "bn" | "billion" => Some(1e9),
        "trillion" => Some(1e12),
        _ => None,
    }
}

/// The token is attached to something on its left (`Q1`, `2024-03`, `10:30`).
fn glued_before(text: &str, start: usize) -> bool {
    let mut before = text[..start].chars().rev();
    match before.next() {
        None => false,
        Some(c) if c.is_alphanumeric() || c == '_' => true,
        Some('-' | '/' | ':' | '.' | '\u{2212}') => {
            before.next().map_or(false, |p| p.is_alphanumeric())
        }
        Some(_) => false,
    }
}

/// The token is attached to something on its right (`3rd`, `5-year`, `1.2.3`).
fn glued_after(text: &str, end: usize) -> bool {
    let mut after = text[end..].chars();
    match after.next() {
        None => false,
        Some(c) if c.is_alphanumeric() || c == '_' => true,
        Some('-' | '\u{2212}') => after.next().map_or(false, |n| n.is_alphanumeric()),
        Some('/' | ':' | '.') => after.next().map_or(false, |n| n.is_ascii_digit()),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(text: &str) -> Vec<f64> {
        scan(text).into_iter().map(|n| n.value).collect()
    }

    fn raws(text: &str) -> Vec<String> {
        scan(text).into_iter().map(|n| n.raw).collect()
    }

    // Integers and decimals

    #[test]
    fn test_plain_integer() {
        assert_eq!(values("There were 42 vacancies."), vec![42.0]);
    }

    #[test]
    fn test_decimal() {
        assert_eq!(values("Growth of 3.75 points"), vec![3.75]);
    }

    #[test]
    fn test_leading_dot_decimal() {
        assert_eq!(values("a ratio of .5 overall"), vec![0.5]);
    }

    #[test]
    fn test_sentence_final_period_not_consumed() {
        let found = scan("The count was 17.");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].raw, "17");
        assert!(!found[0].decimal);
    }

    #[test]
    fn test_multiple_numbers_in_order() {
        assert_eq!(values("from 12 to 15 and then 18"), vec![12.0, 15.0, 18.0]);
    }

    // Thousands separators

    #[test]
    fn test_thousands_separator() {
        let found = scan("Employment reached 1,234,567 workers");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, 1_234_567.0);
        assert!(found[0].grouped);
    }

    #[test]
    fn test_thousands_separator_with_decimal() {
        assert_eq!(values("total of 12,500.75 riyals"), vec![12_500.75]);
    }

    #[test]
    fn test_malformed_grouping_is_refused() {
        // "1,2345" is neither a grouped number nor two clean numbers
        assert!(values("odd 1,2345 value").is_empty());
    }

    #[test]
    fn test_comma_list_splits() {
        assert_eq!(values("values 12, 15, 18"), vec![12.0, 15.0, 18.0]);
    }

    // Percentages

    #[test]
    fn test_percent_sign() {
        let found = scan("Qatar unemployment was 0.10% in Q1");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, 0.10);
        assert!(found[0].percent);
        assert_eq!(found[0].raw, "0.10%");
    }

    #[test]
    fn test_percent_with_space() {
        let found = scan("rate of 4.5 % this year");
        assert_eq!(found.len(), 1);
        assert!(found[0].percent);
    }

    #[test]
    fn test_percent_words() {
        for text in [
            "grew 12 percent",
            "grew 12 per cent",
            "grew 12 percent.",
            "grew 12 pct",
            "grew 12 Percent",
        ] {
            let found = scan(text);
            assert_eq!(found.len(), 1, "{}", text);
            assert!(found[0].percent, "{}", text);
            assert_eq!(found[0].value, 12.0, "{}", text);
        }
    }

    #[test]
    fn test_percentage_points() {
        let found = scan("down 1.5 percentage points");
        assert_eq!(found.len(), 1);
        assert!(found[0].percent);
        assert_eq!(found[0].value, 1.5);
    }

    #[test]
    fn test_percentage_word_alone_is_not_percent() {
        let found = scan("a 20 percentage share");
        // "percentage" without "points" does not end in a word boundary after "percent"
        assert!(found.iter().all(|n| !n.percent));
    }

    // Signs

    #[test]
    fn test_negative_values() {
        assert_eq!(values("change of -2.5 this quarter"), vec![-2.5]);
        assert_eq!(values("change of \u{2212}2.5 this quarter"), vec![-2.5]);
        assert_eq!(values("a shift of +3 points"), vec![3.0]);
    }

    #[test]
    fn test_negative_percent() {
        let found = scan("wages moved -0.4% year on year");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, -0.4);
        assert!(found[0].percent);
    }

    // Scale words and currency

    #[test]
    fn test_scale_words() {
        assert_eq!(values("a workforce of 2.1 million"), vec![2_100_000.0]);
        assert_eq!(values("spending of 3 billion"), vec![3e9]);
        assert_eq!(values("about 45 thousand"), vec![45_000.0]);
        assert_eq!(values("about 45k jobs"), vec![45_000.0]);
        assert_eq!(values("revenue of 1.5bn"), vec![1.5e9]);
        assert_eq!(values("a 2 trillion economy"), vec![2e12]);
    }

    #[test]
    fn test_scale_keeps_mantissa() {
        let found = scan("2.1 million people");
        assert_eq!(found[0].mantissa, 2.1);
        assert_eq!(found[0].scale, Some(1e6));
        assert_eq!(found[0].value, 2_100_000.0);
    }

    #[test]
    fn test_unit_after_space_is_not_scale() {
        // "km" is not a scale word; the number stands alone
        assert_eq!(values("a distance of 5 km"), vec![5.0]);
    }

    #[test]
    fn test_glued_unit_is_refused() {
        assert!(values("a 5km route").is_empty());
    }

    #[test]
    fn test_currency_prefix() {
        let found = scan("median wage of QAR 11,500 per month");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, 11_500.0);
        assert_eq!(found[0].currency.as_deref(), Some("QAR"));

        let found = scan("cost $2.5 million");
        assert_eq!(found[0].value, 2_500_000.0);
        assert_eq!(found[0].currency.as_deref(), Some("$"));
    }

    // Refusals

    #[test]
    fn test_quarter_and_hyphenated_tokens_refused() {
        assert!(values("in Q1-2024 data").is_empty());
        assert!(values("after COVID-19 measures").is_empty());
    }

    #[test]
    fn test_ordinals_refused() {
        assert!(values("the 3rd quarter and 21st century").is_empty());
    }

    #[test]
    fn test_compound_adjective_refused() {
        assert!(values("a 5-year plan and a 12-month window").is_empty());
    }

    #[test]
    fn test_dates_refused() {
        assert!(values("published 2024-03-31").is_empty());
        assert!(values("published 31/03/2024").is_empty());
        assert!(values("at 10:30 local time").is_empty());
    }

    #[test]
    fn test_version_chain_refused() {
        assert!(values("schema 1.2.3 applies").is_empty());
    }

    #[test]
    fn test_bare_year_refused_by_default() {
        assert!(values("In 2023 the labour force grew").is_empty());
        assert_eq!(values("In 2023 it was 4.1%"), vec![4.1]);
    }

    #[test]
    fn test_year_like_values_with_markers_kept() {
        // Separators or decimals make it a quantity, not a year
        assert_eq!(values("exactly 2,024 vacancies"), vec![2024.0]);
        assert_eq!(values("index at 2023.5"), vec![2023.5]);
        assert_eq!(values("a count of 1850 firms"), vec![1850.0]);
    }

    #[test]
    fn test_years_kept_when_disabled() {
        let options = ScanOptions {
            skip_years: false,
            ..Default::default()
        };
        let found = scan_with("In 2023", &options, &[]);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_identifier_runs_refused_when_configured() {
        let options = ScanOptions {
            identifier_min_digits: Some(8),
            ..Default::default()
        };
        let found = scan_with("worker 27401234567 earned 900", &options, &[]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, 900.0);
    }

    #[test]
    fn test_identifier_min_ignores_grouped_numbers() {
        let options = ScanOptions {
            identifier_min_digits: Some(8),
            ..Default::default()
        };
        let found = scan_with("population 12,345,678", &options, &[]);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_excluded_spans() {
        let text = "rate 5% [Per PSA Q1-2024 table 3]";
        let marker_start = text.find('[').unwrap();
        let excluded = [Span::new(marker_start, text.len())];
        let found = scan_with(text, &ScanOptions::default(), &excluded);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, 5.0);
    }

    #[test]
    fn test_currency_word_inside_other_word() {
        // "entrepreneur" ends in "eur" but carries no currency
        assert_eq!(values("each entrepreneur 5 times"), vec![5.0]);
    }

    #[test]
    fn test_email_digits_refused() {
        assert!(values("write to jane2024@example.com").is_empty());
    }

    #[test]
    fn test_parenthesized_number() {
        assert_eq!(values("the share (12.5%) rose"), vec![12.5]);
    }

    #[test]
    fn test_span_offsets() {
        let text = "was 0.10% then";
        let found = scan(text);
        assert_eq!(&text[found[0].span.start..found[0].span.end], "0.10%");
    }

    #[test]
    fn test_raw_text_multibyte_currency() {
        assert_eq!(raws("costs €40 each"), vec!["€40".to_string()]);
    }

    // parse_quantity

    #[test]
    fn test_parse_quantity_plain() {
        let q = parse_quantity("1,234").unwrap();
        assert_eq!(q.value, 1234.0);
        assert!(!q.percent);
        assert_eq!(q.unit, None);
    }

    #[test]
    fn test_parse_quantity_percent() {
        let q = parse_quantity(" 0.10% ").unwrap();
        assert_eq!(q.value, 0.10);
        assert!(q.percent);
    }

    #[test]
    fn test_parse_quantity_with_unit() {
        let q = parse_quantity("1.2 million QAR").unwrap();
        assert_eq!(q.value, 1_200_000.0);
        assert_eq!(q.unit.as_deref(), Some("QAR"));

        let q = parse_quantity("QAR 11,500 per month").unwrap();
        assert_eq!(q.value, 11_500.0);
        assert_eq!(q.unit.as_deref(), Some("QAR per month"));
    }

    #[test]
    fn test_parse_quantity_year_is_a_value() {
        let q = parse_quantity("2024").unwrap();
        assert_eq!(q.value, 2024.0);
    }

    #[test]
    fn test_parse_quantity_rejects() {
        assert!(parse_quantity("").is_none());
        assert!(parse_quantity("n/a").is_none());
        assert!(parse_quantity("about 12").is_none());
        assert!(parse_quantity("12 to 15").is_none());
        assert!(parse_quantity("12abc").is_none());
    }

    #[test]
    fn test_parse_quantity_negative() {
        let q = parse_quantity("-3.2").unwrap();
        assert_eq!(q.value, -3.2);
    }
}
