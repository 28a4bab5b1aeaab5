//! ✂️ The Record Parser: turns one raw dump line into a list of field values.
//!
//! Dumps are loose. Fields are separated by "whatever the person who made the dump felt
//! like that day", and spaces show up in the middle of fields like uninvited relatives.
//! So: strip every whitespace character, split on the one-char separator, keep the
//! columns we were asked for, in the order they sit on the line.
//!
//! A line that yields nothing is a skip, never an error. The job keeps going. 🦆

use std::collections::BTreeSet;

use anyhow::{Context, Result, bail};

/// 🔧 How to slice the lines of one file. Built once per job, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserConfig {
    /// 📏 0-based line index; anything before it is header and gets skipped
    pub start_line: usize,
    /// ✂️ the single field separator
    pub separator: char,
    /// 🎯 which split positions to keep. A set: order comes from the line, not from here.
    pub columns: BTreeSet<usize>,
}

impl ParserConfig {
    /// 🏗️ Build a config from a `{start}{separator}` pattern and the selected columns.
    ///
    /// `{1}{:}` means "skip line 0, split on `:`". The separator must be exactly one
    /// non-whitespace character, since whitespace is stripped before splitting and a
    /// whitespace separator would never match anything.
    pub fn new(pattern: &str, columns: &[usize]) -> Result<Self> {
        let (start_line, separator) = parse_pattern(pattern)?;
        if columns.is_empty() {
            bail!("💀 No columns selected. A record with zero fields is just a very expensive newline.");
        }
        Ok(Self {
            start_line,
            separator,
            columns: columns.iter().copied().collect(),
        })
    }

    /// ✂️ Parse one line. `None` means skip: the line was blank, or none of the selected
    /// columns had anything in them. Columns past the end of the line are ignored.
    pub fn parse_line(&self, line: &str) -> Option<Vec<String>> {
        // 🧹 all whitespace, everywhere, not just the edges
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return None;
        }

        let data: Vec<String> = compact
            .split(self.separator)
            .enumerate()
            .filter(|(position, field)| !field.is_empty() && self.columns.contains(position))
            .map(|(_, field)| field.to_string())
            .collect();

        if data.is_empty() { None } else { Some(data) }
    }
}

/// 🔍 `{<int>}{<char>}` → `(start_line, separator)`.
fn parse_pattern(pattern: &str) -> Result<(usize, char)> {
    let invalid = || {
        format!(
            "💀 Pattern '{pattern}' is not of the form {{<start line>}}{{<separator>}}, e.g. {{1}}{{:}}"
        )
    };

    let rest = pattern.trim().strip_prefix('{').with_context(invalid)?;
    let (start, rest) = rest.split_once('}').with_context(invalid)?;
    let start_line: usize = start
        .trim()
        .parse()
        .with_context(|| format!("💀 Start line '{start}' in pattern '{pattern}' is not a non-negative integer"))?;

    let rest = rest.strip_prefix('{').with_context(invalid)?;
    let inner = rest.strip_suffix('}').with_context(invalid)?;
    let mut chars = inner.chars();
    let separator = match (chars.next(), chars.next()) {
        (Some(c), None) if !c.is_whitespace() => c,
        _ => bail!(
            "💀 Separator in pattern '{pattern}' must be exactly one non-whitespace character, got '{inner}'"
        ),
    };

    Ok((start_line, separator))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comma_zero_two() -> ParserConfig {
        ParserConfig {
            start_line: 0,
            separator: ',',
            columns: [0, 2].into_iter().collect(),
        }
    }

    #[test]
    fn the_one_where_the_pattern_means_what_it_says() -> Result<()> {
        let config = ParserConfig::new("{1}{:}", &[0, 1])?;
        assert_eq!(config.start_line, 1);
        assert_eq!(config.separator, ':');
        assert_eq!(config.columns, [0, 1].into_iter().collect());
        Ok(())
    }

    #[test]
    fn the_one_where_bad_patterns_get_bounced() {
        for nope in ["", "{1}", "1:", "{x}{:}", "{-1}{:}", "{1}{::}", "{1}{ }", "{1}{}", "{1}:"] {
            assert!(
                ParserConfig::new(nope, &[0]).is_err(),
                "pattern {nope:?} should have been rejected"
            );
        }
    }

    #[test]
    fn the_one_where_no_columns_means_no_deal() {
        assert!(ParserConfig::new("{0}{,}", &[]).is_err());
    }

    #[test]
    fn the_one_where_selected_columns_come_back_in_line_order() {
        let config = comma_zero_two();
        assert_eq!(config.parse_line("a,b,c"), Some(vec!["a".to_string(), "c".to_string()]));
    }

    #[test]
    fn the_one_where_selection_order_does_not_matter() -> Result<()> {
        // 🎯 asked for 2 then 0, still get line order
        let config = ParserConfig::new("{0}{,}", &[2, 0])?;
        assert_eq!(config.parse_line("a,b,c"), Some(vec!["a".to_string(), "c".to_string()]));
        Ok(())
    }

    #[test]
    fn the_one_where_empty_lines_are_skipped() {
        let config = comma_zero_two();
        assert_eq!(config.parse_line(""), None);
        assert_eq!(config.parse_line("   \t \r\n"), None);
    }

    #[test]
    fn the_one_where_all_empty_fields_are_skipped() {
        assert_eq!(comma_zero_two().parse_line(",,"), None);
    }

    #[test]
    fn the_one_where_one_non_empty_column_is_enough() {
        assert_eq!(comma_zero_two().parse_line(",,c"), Some(vec!["c".to_string()]));
    }

    #[test]
    fn the_one_where_whitespace_is_removed_mid_field() {
        let config = comma_zero_two();
        assert_eq!(
            config.parse_line(" jo hn , x ,d o e\n"),
            Some(vec!["john".to_string(), "doe".to_string()])
        );
    }

    #[test]
    fn the_one_where_columns_past_the_end_are_ignored() -> Result<()> {
        let config = ParserConfig::new("{0}{:}", &[1, 7])?;
        assert_eq!(config.parse_line("user:pass"), Some(vec!["pass".to_string()]));
        Ok(())
    }

    #[test]
    fn the_one_where_unicode_separators_are_fine() -> Result<()> {
        let config = ParserConfig::new("{0}{¦}", &[0, 1])?;
        assert_eq!(
            config.parse_line("ä¦ö"),
            Some(vec!["ä".to_string(), "ö".to_string()])
        );
        Ok(())
    }
}
