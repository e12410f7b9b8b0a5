//! `-- migrate:up` / `-- migrate:down` section parsing

use once_cell::sync::Lazy;
use regex::Regex;

static MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[ \t]*--[ \t]*migrate:(up|down)\b[^\n]*$").expect("valid marker regex")
});

/// Up and down SQL of a migration or template file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sections {
    pub up: String,
    pub down: String,
}

impl Sections {
    /// Split file content on its markers
    ///
    /// Without an up marker everything before the first down marker is the up
    /// section. Without a down marker the down section is empty. Both sections
    /// are trimmed.
    pub fn parse(content: &str) -> Self {
        let markers: Vec<(&str, usize, usize)> = MARKER
            .captures_iter(content)
            .filter_map(|c| {
                let whole = c.get(0)?;
                let kind = c.get(1)?.as_str();
                Some((kind, whole.start(), whole.end()))
            })
            .collect();

        let section = |wanted: &str| -> Option<String> {
            let idx = markers
                .iter()
                .position(|(kind, _, _)| kind.eq_ignore_ascii_case(wanted))?;
            let body_start = markers[idx].2;
            let body_end = markers.get(idx + 1).map_or(content.len(), |m| m.1);
            Some(content[body_start..body_end].trim().to_string())
        };

        let up = section("up").unwrap_or_else(|| {
            let end = markers
                .iter()
                .find(|(kind, _, _)| kind.eq_ignore_ascii_case("down"))
                .map_or(content.len(), |m| m.1);
            content[..end].trim().to_string()
        });
        let down = section("down").unwrap_or_default();

        Self { up, down }
    }

    /// Whether the up section holds anything besides comments
    pub fn has_up(&self) -> bool {
        has_statements(&self.up)
    }

    /// Whether the down section holds anything besides comments
    pub fn has_down(&self) -> bool {
        has_statements(&self.down)
    }
}

/// Whether SQL text contains a line that is not blank or a `--` comment
pub fn has_statements(sql: &str) -> bool {
    sql.lines().any(|line| {
        let line = line.trim();
        !line.is_empty() && !line.starts_with("--")
    })
}
