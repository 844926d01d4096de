//! systemd unit files as ordered `(section, name, value)` triples.
//!
//! Deserialization keeps line continuations (a trailing `\` followed by a
//! newline) inside the option value, so that a unit that is deserialized and
//! serialized again without changes comes out byte for byte the same as long
//! as it was written in canonical form.

use thiserror::Error;

/// A single `Name=Value` line of a unit file, together with its section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitOption {
    /// The section, e.g. `Service`.
    pub section: String,
    /// The option name, e.g. `ExecStart`.
    pub name: String,
    /// The raw option value.
    pub value: String,
}

impl UnitOption {
    /// Creates a new unit option.
    pub fn new(section: &str, name: &str, value: &str) -> Self {
        UnitOption {
            section: section.to_owned(),
            name: name.to_owned(),
            value: value.to_owned(),
        }
    }
}

/// Errors while parsing a unit file.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum UnitError {
    /// An option appeared before the first section header.
    #[error("line {0}: option outside of a section")]
    OptionOutsideSection(usize),
    /// A line is neither a section header, an option, a comment nor blank.
    #[error("line {0}: expected section header or `Name=Value`")]
    Malformed(usize),
    /// A section header is not terminated by `]`.
    #[error("line {0}: unterminated section header")]
    UnterminatedSection(usize),
}

/// Parses unit file content into options, preserving their order.
pub fn deserialize(content: &str) -> Result<Vec<UnitOption>, UnitError> {
    let mut options = Vec::new();
    let mut section: Option<String> = None;
    let mut lines = content.lines().enumerate();

    while let Some((index, raw)) = lines.next() {
        let number = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            if !line.ends_with(']') {
                return Err(UnitError::UnterminatedSection(number));
            }
            section = Some(line[1..line.len() - 1].to_owned());
            continue;
        }
        let current = section
            .clone()
            .ok_or(UnitError::OptionOutsideSection(number))?;
        let (name, value) = line.split_once('=').ok_or(UnitError::Malformed(number))?;
        let mut value = value.trim_start().to_owned();
        while value.ends_with('\\') {
            match lines.next() {
                Some((_, next)) => {
                    value.push('\n');
                    value.push_str(next.trim_end());
                }
                None => break,
            }
        }
        options.push(UnitOption {
            section: current,
            name: name.trim_end().to_owned(),
            value,
        });
    }
    Ok(options)
}

/// Renders options into unit file content. Options are grouped by section in
/// the order sections first appear; sections are separated by a blank line.
pub fn serialize(options: &[UnitOption]) -> String {
    let mut sections: Vec<&str> = Vec::new();
    for option in options {
        if !sections.contains(&option.section.as_str()) {
            sections.push(&option.section);
        }
    }

    let mut out = String::new();
    for (i, section) in sections.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push('[');
        out.push_str(section);
        out.push_str("]\n");
        for option in options.iter().filter(|o| o.section == *section) {
            out.push_str(&option.name);
            out.push('=');
            out.push_str(&option.value);
            out.push('\n');
        }
    }
    out
}

/// Splits a command line value (as found in `ExecStart`) into its parts. Both
/// line continuations and plain whitespace separate arguments.
pub fn deserialize_command_line(value: &str) -> Vec<String> {
    value
        .split("\\\n")
        .flat_map(|chunk| chunk.split_whitespace())
        .map(str::to_owned)
        .collect()
}

/// Joins a command line, keeping the first `n` parts on the first line and
/// placing every further part on its own continuation line after `sep`.
pub fn serialize_command_line(command: &[String], n: usize, sep: &str) -> String {
    if command.len() <= n {
        return command.join(" ");
    }
    let head = command[..n].join(" ");
    let tail = command[n..].join(sep);
    if head.is_empty() {
        tail
    } else {
        format!("{}{}{}", head, sep, tail)
    }
}
