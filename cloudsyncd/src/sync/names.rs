use thiserror::Error;

const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameIssue {
    #[error("name is empty")]
    Empty,
    #[error("name contains forbidden character {0:?}")]
    ForbiddenChar(char),
    #[error("name {0} is reserved")]
    Reserved(String),
    #[error("name starts with a space")]
    LeadingSpace,
    #[error("name ends with a space")]
    TrailingSpace,
    #[error("name ends with a dot")]
    TrailingDot,
    #[error("name is {len} bytes long, limit is {max}")]
    TooLong { len: usize, max: usize },
}

/// Constraints shared by the server and the local filesystem.
#[derive(Debug, Clone)]
pub struct NameRules {
    pub forbidden_chars: Vec<char>,
    pub reserved_names: bool,
    pub max_len: usize,
}

impl Default for NameRules {
    fn default() -> Self {
        Self {
            forbidden_chars: vec!['\\', ':', '?', '*', '"', '<', '>', '|'],
            reserved_names: true,
            max_len: 255,
        }
    }
}

impl NameRules {
    pub fn validate_name(&self, name: &str) -> Result<(), NameIssue> {
        if name.is_empty() || name == "." || name == ".." {
            return Err(NameIssue::Empty);
        }
        if let Some(c) = name
            .chars()
            .find(|c| c.is_control() || *c == '/' || self.forbidden_chars.contains(c))
        {
            return Err(NameIssue::ForbiddenChar(c));
        }
        if name.starts_with(' ') {
            return Err(NameIssue::LeadingSpace);
        }
        if name.ends_with(' ') {
            return Err(NameIssue::TrailingSpace);
        }
        if name.ends_with('.') {
            return Err(NameIssue::TrailingDot);
        }
        if name.len() > self.max_len {
            return Err(NameIssue::TooLong {
                len: name.len(),
                max: self.max_len,
            });
        }
        if self.reserved_names {
            let (stem, _) = split_extension(name);
            let upper = stem.to_ascii_uppercase();
            if WINDOWS_RESERVED.contains(&upper.as_str()) {
                return Err(NameIssue::Reserved(name.to_string()));
            }
        }
        Ok(())
    }

    /// Best-effort valid replacement for an invalid name.
    pub fn sanitize_name(&self, name: &str) -> String {
        let replaced: String = name
            .chars()
            .map(|c| {
                if c.is_control() || c == '/' || self.forbidden_chars.contains(&c) {
                    '_'
                } else {
                    c
                }
            })
            .collect();
        let mut out = replaced.trim_matches(' ').trim_end_matches('.').to_string();
        if out.is_empty() {
            out.push('_');
        }
        if self.reserved_names {
            let (stem, ext) = split_extension(&out);
            if WINDOWS_RESERVED.contains(&stem.to_ascii_uppercase().as_str()) {
                out = match ext {
                    Some(ext) => format!("{stem}_.{ext}"),
                    None => format!("{stem}_"),
                };
            }
        }
        truncate_keeping_extension(&out, self.max_len)
    }
}

/// Splits "a.tar.gz" into ("a.tar", Some("gz")); dotfiles have no extension.
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

/// Inserts ` (suffix)` before the extension, shortening the stem so the
/// result fits in `max_len` bytes. An extension that leaves no room is
/// dropped.
fn with_suffix(name: &str, suffix: &str, max_len: usize) -> String {
    let (stem, ext) = split_extension(name);
    let mut tail = match ext {
        Some(ext) => format!(" ({suffix}).{ext}"),
        None => format!(" ({suffix})"),
    };
    if tail.len() >= max_len {
        tail = format!(" ({suffix})");
    }
    let mut cut = max_len.saturating_sub(tail.len()).min(stem.len());
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    match stem[..cut].trim_end_matches(' ') {
        "" => format!("_{tail}"),
        stem => format!("{stem}{tail}"),
    }
}

/// `name (conflicted copy <stamp>).ext`
pub fn conflict_copy_name(name: &str, stamp: &str, max_len: usize) -> String {
    with_suffix(name, &format!("conflicted copy {stamp}"), max_len)
}

pub fn case_clash_name(name: &str, n: u64, max_len: usize) -> String {
    with_suffix(name, &format!("case clash {n}"), max_len)
}

fn truncate_keeping_extension(name: &str, max_len: usize) -> String {
    if name.len() <= max_len {
        return name.to_string();
    }
    let (stem, ext) = split_extension(name);
    let ext_len = ext.map(|e| e.len() + 1).unwrap_or(0);
    let budget = max_len.saturating_sub(ext_len).max(1);
    let mut cut = budget.min(stem.len());
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    let stem = stem[..cut].trim_end_matches([' ', '.']);
    match ext {
        Some(ext) if ext_len < max_len => format!("{stem}.{ext}"),
        _ => stem.to_string(),
    }
}
