//! Markdown rendering of result records.

use std::fmt::Write;

use crate::assemble::ResultRecord;

/// Message rendered when a query produced no records.
pub const NO_RESULTS: &str = "No results found for this query.";

/// How the corpus is named in the header line.
#[derive(Debug, Clone, Copy)]
pub struct CorpusLabel<'a> {
    pub name: &'a str,
    pub homepage: Option<&'a str>,
}

impl CorpusLabel<'_> {
    fn to_markdown(self) -> String {
        match self.homepage {
            Some(url) => format!("[{}]({url})", self.name),
            None => self.name.to_string(),
        }
    }
}

/// Renders records as a numbered markdown list under a header line.
///
/// Each entry is `N. **[title](url)**` followed by the italic snippet and,
/// when present, the explanation as a quote.
pub fn render_markdown(records: &[ResultRecord], label: CorpusLabel<'_>) -> String {
    if records.is_empty() {
        return format!("{NO_RESULTS}\n");
    }

    let mut out = format!(
        "---\nTop {} recommendations from {}:\n\n",
        records.len(),
        label.to_markdown()
    );

    for (i, record) in records.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}. **[{}]({})**\n*{}*",
            i + 1,
            record.title,
            record.url,
            record.text.trim()
        );
        if let Some(explanation) = &record.explanation {
            let _ = writeln!(out, "> {explanation}");
        }
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::ItemId;

    fn record(id: u32, title: &str, explanation: Option<&str>) -> ResultRecord {
        ResultRecord {
            id: ItemId::new(id),
            distance: 0.5,
            text: format!("About {title}"),
            title: title.to_string(),
            url: format!("https://example.com/{id}"),
            explanation: explanation.map(str::to_string),
        }
    }

    #[test]
    fn test_render_numbered_entries() {
        let records = vec![record(0, "Focus", None), record(1, "Teams", Some("Matches."))];
        let label = CorpusLabel {
            name: "The McKinsey podcast",
            homepage: Some("https://www.mckinsey.com/podcast"),
        };

        let output = render_markdown(&records, label);
        assert!(output.contains(
            "Top 2 recommendations from [The McKinsey podcast](https://www.mckinsey.com/podcast):"
        ));
        assert!(output.contains("1. **[Focus](https://example.com/0)**\n*About Focus*\n\n"));
        assert!(output.contains("2. **[Teams](https://example.com/1)**\n*About Teams*\n> Matches.\n"));
        assert!(output.find("1. ").unwrap() < output.find("2. ").unwrap());
    }

    #[test]
    fn test_render_empty() {
        let label = CorpusLabel {
            name: "talks",
            homepage: None,
        };
        assert_eq!(render_markdown(&[], label), format!("{NO_RESULTS}\n"));
    }
}
