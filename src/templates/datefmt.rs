//! Date patterns used inside IRI templates, e.g. `yyyyMMdd'T'HHmm`.
//!
//! Patterns use Java-style letters (`yyyy`, `MM`, `HH`, quoted literals)
//! and are compiled once into a chrono format string.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatePattern {
    source: String,
    strftime: String,
}

impl DatePattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let chars: Vec<char> = pattern.chars().filter(|c| *c != '\\').collect();
        let mut out = String::new();
        let mut quoted = false;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if c == '\'' {
                // '' is a literal quote, inside or outside a quoted run
                if chars.get(i + 1) == Some(&'\'') {
                    out.push('\'');
                    i += 2;
                    continue;
                }
                quoted = !quoted;
                i += 1;
                continue;
            }
            if quoted || !c.is_ascii_alphabetic() {
                push_literal(&mut out, c);
                i += 1;
                continue;
            }

            let mut run = 1;
            while chars.get(i + run) == Some(&c) {
                run += 1;
            }
            out.push_str(letter_to_strftime(c, run).ok_or_else(|| {
                PipelineError::Config(format!(
                    "unsupported date pattern letter {c:?} in {pattern:?}"
                ))
            })?);
            i += run;
        }

        if quoted {
            return Err(PipelineError::Config(format!(
                "unterminated quote in date pattern {pattern:?}"
            )));
        }
        if StrftimeItems::new(&out).any(|item| matches!(item, Item::Error)) {
            return Err(PipelineError::Config(format!(
                "date pattern {pattern:?} compiled to invalid format {out:?}"
            )));
        }

        Ok(Self {
            source: pattern.to_string(),
            strftime: out,
        })
    }

    pub fn format(&self, t: &DateTime<FixedOffset>) -> String {
        t.format(&self.strftime).to_string()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}

fn letter_to_strftime(letter: char, run: usize) -> Option<&'static str> {
    Some(match (letter, run) {
        ('y', 2) => "%y",
        ('y', _) => "%Y",
        ('M', 1) => "%-m",
        ('M', 2) => "%m",
        ('M', 3) => "%b",
        ('M', _) => "%B",
        ('d', 1) => "%-d",
        ('d', _) => "%d",
        ('H', 1) => "%-H",
        ('H', _) => "%H",
        ('h', _) => "%I",
        ('m', 1) => "%-M",
        ('m', _) => "%M",
        ('s', 1) => "%-S",
        ('s', _) => "%S",
        ('S', _) => "%3f",
        ('a', _) => "%p",
        ('E', 1..=3) => "%a",
        ('E', _) => "%A",
        ('Z', _) | ('X', _) => "%z",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn test_backslash_escaped_quotes() {
        let p = DatePattern::parse(r"yyyyMMdd\'T\'HHmm").unwrap();
        assert_eq!(p.format(&at("2022-07-07T13:10:00+02:00")), "20220707T1310");
    }

    #[test]
    fn test_plain_quotes_and_separators() {
        let p = DatePattern::parse("yyyy-MM-dd'T'HH:mm:ss").unwrap();
        assert_eq!(
            p.format(&at("2022-01-02T03:04:05+00:00")),
            "2022-01-02T03:04:05"
        );
    }

    #[test]
    fn test_percent_is_literal() {
        let p = DatePattern::parse("HH'%'mm").unwrap();
        assert_eq!(p.format(&at("2022-01-02T03:04:05+00:00")), "03%04");
    }

    #[test]
    fn test_unknown_letter_rejected() {
        assert!(DatePattern::parse("yyyyQQ").is_err());
        assert!(DatePattern::parse("yyyy'T").is_err());
    }
}
