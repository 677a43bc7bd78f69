//! Collection and folder name sanitization.
//!
//! Backend collection names follow the Chroma constraints (3-63 chars,
//! `[A-Za-z0-9_-]`, alnum at both ends); folder names only strip characters
//! the filesystem can't take, so Unicode display names survive on disk.

/// Sanitize a raw collection name for the vector backend.
pub fn sanitize_collection_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    // Collapse runs of separators to a single '-'.
    let mut collapsed = String::with_capacity(name.len());
    let mut prev_sep = false;
    for c in name.chars() {
        let is_sep = c == '-' || c == '_';
        if is_sep && prev_sep {
            continue;
        }
        collapsed.push(if is_sep { '-' } else { c });
        prev_sep = is_sep;
    }
    name = collapsed;

    name = trim_non_alnum(&name);

    if name.len() < 3 {
        name = format!("kb-{}", stable_suffix(raw));
    }
    if name.len() > 63 {
        name.truncate(63);
        name = trim_non_alnum(&name);
    }
    if name.is_empty() {
        name = format!("kb-{}", stable_suffix(raw));
    }
    name
}

/// Sanitize a raw name into a filesystem folder name: strip forbidden
/// characters, trim leading/trailing dots and spaces, cap at 100 chars.
pub fn sanitize_folder_name(raw: &str) -> String {
    let source = if raw.is_empty() { "kb" } else { raw };
    let mut name: String = source
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '\\' | '/' | '|' | '?' | '*' => '-',
            other => other,
        })
        .collect();
    name = name.trim().trim_matches(|c| c == '.' || c == ' ').to_string();
    if name.is_empty() {
        name = format!("kb-{}", stable_suffix(raw));
    }
    if name.chars().count() > 100 {
        name = name.chars().take(100).collect();
        name = name.trim_end_matches(|c| c == '.' || c == ' ').to_string();
    }
    name
}

/// Lock file name for a collection: `<backend>_<collection>.lock` with path
/// separators made safe.
pub fn lock_file_name(backend: &str, collection: &str) -> String {
    let safe: String = collection
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{}_{}.lock", backend, safe)
}

fn trim_non_alnum(s: &str) -> String {
    s.trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// 6-hex suffix derived from the MD5 of the original name, so repeated
/// sanitization of the same input is stable.
fn stable_suffix(original: &str) -> String {
    format!("{:x}", md5::compute(original.as_bytes()))[..6].to_string()
}
