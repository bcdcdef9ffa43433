//! Raw value codec
//!
//! Reads and replaces a single value inside a line-oriented text file. A
//! [`Pattern`] such as `Port %s` or `AUTO="%s"` brackets the value with a
//! `before` and an `after` part. A line matches when, with leading comment
//! characters and indentation stripped, it begins with `before`. Lines are
//! handled as bytes, so files that are not valid UTF-8 pass through intact.
//!
//! Writing always produces an active (uncommented) line. Commenting a line out
//! is a separate pass, [`comment_out`], so disabling a setting never goes
//! through the value writer.
//!
//! Files are never edited in place: [`rewrite_file`] streams into a temporary
//! file in the same directory, keeps the previous content as `<file>~`, and
//! renames the new content over the original only after it is fully written.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{JobServiceError, Result};

/// Substitution marker in patterns
pub const MARKER: &str = "%s";

/// Suffix of the backup kept after a rewrite
pub const BACKUP_SUFFIX: &str = "~";

/// Bytes skipped before matching a line
const COMMENT_BYTES: &[u8] = b"#; \t";

/// Indentation skipped before deciding whether a line is commented
const INDENT_BYTES: &[u8] = b" \t";

/// A pattern split at its substitution marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    before: String,
    after: String,
    active_only: bool,
}

impl Pattern {
    /// Parse a pattern containing exactly one `%s`. Surrounding whitespace is trimmed.
    pub fn parse(pattern: &str) -> std::result::Result<Self, String> {
        let trimmed = pattern.trim();
        let mut parts = trimmed.split(MARKER);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(before), Some(after), None) => Ok(Self {
                before: before.to_string(),
                after: after.to_string(),
                active_only: false,
            }),
            _ => Err(format!(
                "pattern '{}' must contain exactly one {} marker",
                pattern, MARKER
            )),
        }
    }

    /// Restrict matching to lines that are not commented out
    pub fn active_only(mut self) -> Self {
        self.active_only = true;
        self
    }

    pub fn before(&self) -> &str {
        &self.before
    }

    pub fn after(&self) -> &str {
        &self.after
    }

    /// The part of `line` that is compared against `before`
    fn body<'l>(&self, line: &'l [u8]) -> &'l [u8] {
        if self.active_only {
            skip_leading(line, INDENT_BYTES)
        } else {
            skip_leading(line, COMMENT_BYTES)
        }
    }

    /// Whether `line` is the line this pattern addresses
    fn matches(&self, line: &[u8]) -> bool {
        self.body(line).starts_with(self.before.as_bytes())
    }

    /// Pull the value out of a matching line
    fn extract(&self, line: &[u8]) -> String {
        let rest = &trim_newline(self.body(line))[self.before.len()..];
        let value = match find(rest, self.after.as_bytes()) {
            Some(end) if !self.after.is_empty() => &rest[..end],
            _ => rest,
        };
        String::from_utf8_lossy(value).into_owned()
    }

    /// The active line carrying `value`
    fn render(&self, value: &str) -> Vec<u8> {
        format!("{}{}{}\n", self.before, value, self.after).into_bytes()
    }
}

fn skip_leading<'l>(line: &'l [u8], set: &[u8]) -> &'l [u8] {
    let start = line.iter().position(|b| !set.contains(b)).unwrap_or(line.len());
    &line[start..]
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Tracks the optional anchor line that enables matching
struct Anchor<'a> {
    marker: Option<&'a str>,
    armed: bool,
}

impl<'a> Anchor<'a> {
    fn new(marker: Option<&'a str>) -> Self {
        Self {
            marker,
            armed: marker.is_none(),
        }
    }

    /// Returns whether `line` may be matched. The anchor line itself may not.
    fn allows(&mut self, line: &[u8]) -> bool {
        if self.armed {
            return true;
        }
        if let Some(marker) = self.marker {
            if find(line, marker.as_bytes()).is_some() {
                self.armed = true;
            }
        }
        false
    }
}

/// Read the value of the first matching line, or `None` when nothing matches.
///
/// Lines are handled as raw bytes; only the extracted value is decoded, lossily.
pub fn read_value<R: BufRead>(
    pattern: &Pattern,
    prescan: Option<&str>,
    mut reader: R,
) -> std::io::Result<Option<String>> {
    let mut anchor = Anchor::new(prescan);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        if anchor.allows(&line) && pattern.matches(&line) {
            return Ok(Some(pattern.extract(&line)));
        }
    }
}

/// Copy `reader` to `writer`, replacing the first matching line with an
/// active line carrying `value`. Returns whether a line was replaced.
pub fn write_value<R: BufRead, W: Write>(
    pattern: &Pattern,
    prescan: Option<&str>,
    reader: R,
    writer: W,
    value: &str,
) -> std::io::Result<bool> {
    transform_first(prescan, reader, writer, |line| {
        pattern.matches(line).then(|| pattern.render(value))
    })
}

/// Copy `reader` to `writer`, commenting out the first matching line with `#`.
/// An already commented line is left as it is. Returns whether a line matched.
pub fn comment_out<R: BufRead, W: Write>(
    pattern: &Pattern,
    prescan: Option<&str>,
    reader: R,
    writer: W,
) -> std::io::Result<bool> {
    transform_first(prescan, reader, writer, |line| {
        if !pattern.matches(line) {
            return None;
        }
        let indent_stripped = skip_leading(line, INDENT_BYTES);
        if indent_stripped.starts_with(b"#") || indent_stripped.starts_with(b";") {
            Some(line.to_vec())
        } else {
            let mut commented = Vec::with_capacity(line.len() + 1);
            commented.push(b'#');
            commented.extend_from_slice(line);
            Some(commented)
        }
    })
}

/// Lines that are not replaced are copied byte for byte.
fn transform_first<R, W, F>(
    prescan: Option<&str>,
    mut reader: R,
    mut writer: W,
    mut replace: F,
) -> std::io::Result<bool>
where
    R: BufRead,
    W: Write,
    F: FnMut(&[u8]) -> Option<Vec<u8>>,
{
    let mut anchor = Anchor::new(prescan);
    let mut replaced = false;
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if !replaced && anchor.allows(&line) {
            if let Some(new_line) = replace(&line) {
                writer.write_all(&new_line)?;
                replaced = true;
                continue;
            }
        }
        writer.write_all(&line)?;
    }
    writer.flush()?;
    Ok(replaced)
}

/// Read the value addressed by `pattern` in the file at `path`.
pub fn read_file_value(
    path: &Path,
    pattern: &Pattern,
    prescan: Option<&str>,
) -> Result<Option<String>> {
    let file = File::open(path)?;
    Ok(read_value(pattern, prescan, BufReader::new(file))?)
}

/// Path of the backup kept for `path`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Stream `path` through `edit` into a temporary file and swap it in.
///
/// `edit` returns whether the new content should replace the original. When it
/// returns `false` or fails, the temporary file is discarded and the original
/// is left untouched.
pub fn rewrite_file<F>(path: &Path, edit: F) -> Result<bool>
where
    F: FnOnce(&mut dyn BufRead, &mut dyn Write) -> Result<bool>,
{
    let original = File::open(path).map_err(|e| JobServiceError::config_write(path, e))?;
    let permissions = original
        .metadata()
        .map_err(|e| JobServiceError::config_write(path, e))?
        .permissions();

    let mut tmp = create_temp(path)?;
    let commit = {
        let mut reader = BufReader::new(original);
        let mut writer = BufWriter::new(tmp.as_file_mut());
        let commit = edit(&mut reader, &mut writer)?;
        writer
            .flush()
            .map_err(|e| JobServiceError::config_write(path, e))?;
        commit
    };

    if !commit {
        debug!(path = %path.display(), "rewrite_file: nothing to change, discarding temporary file");
        return Ok(false);
    }

    fs::set_permissions(tmp.path(), permissions)
        .map_err(|e| JobServiceError::config_write(path, e))?;
    swap_in(path, tmp, true)?;
    Ok(true)
}

/// Atomically replace (or create) `path` with `contents`.
pub fn replace_file(path: &Path, contents: &str) -> Result<()> {
    let existing = fs::metadata(path).ok();
    let mut tmp = create_temp(path)?;
    tmp.write_all(contents.as_bytes())
        .and_then(|_| tmp.flush())
        .map_err(|e| JobServiceError::config_write(path, e))?;
    if let Some(meta) = &existing {
        fs::set_permissions(tmp.path(), meta.permissions())
            .map_err(|e| JobServiceError::config_write(path, e))?;
    }
    swap_in(path, tmp, existing.is_some())
}

fn create_temp(path: &Path) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let prefix = format!(
        ".{}.",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".new")
        .tempfile_in(dir)
        .map_err(|e| JobServiceError::config_write(path, e))
}

fn swap_in(path: &Path, tmp: NamedTempFile, keep_backup: bool) -> Result<()> {
    tmp.as_file()
        .sync_all()
        .map_err(|e| JobServiceError::config_write(path, e))?;

    let backup = backup_path(path);
    if keep_backup {
        fs::rename(path, &backup).map_err(|e| JobServiceError::config_write(path, e))?;
    }

    if let Err(e) = tmp.persist(path) {
        // Put the original back; the temporary file is removed when `e` drops
        if keep_backup {
            if let Err(restore) = fs::rename(&backup, path) {
                warn!(
                    path = %path.display(),
                    error = %restore,
                    "swap_in: failed to restore original from backup"
                );
            }
        }
        return Err(JobServiceError::config_write(path, e.error));
    }

    debug!(path = %path.display(), "swap_in: replaced file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn pattern(p: &str) -> Pattern {
        Pattern::parse(p).unwrap()
    }

    fn write_to_string(p: &Pattern, prescan: Option<&str>, input: &str, value: &str) -> (String, bool) {
        let mut out = Vec::new();
        let found = write_value(p, prescan, Cursor::new(input), &mut out, value).unwrap();
        (String::from_utf8(out).unwrap(), found)
    }

    // =========================================================================
    // Pattern parsing
    // =========================================================================

    #[test]
    fn test_pattern_split() {
        let p = pattern("  AUTO=\"%s\"\n");
        assert_eq!(p.before(), "AUTO=\"");
        assert_eq!(p.after(), "\"");
    }

    #[test]
    fn test_pattern_requires_single_marker() {
        assert!(Pattern::parse("AUTO=").is_err());
        assert!(Pattern::parse("%s=%s").is_err());
        assert!(Pattern::parse("%s").is_ok());
    }

    // =========================================================================
    // Read mode
    // =========================================================================

    #[test]
    fn test_read_first_match_wins() {
        let input = "# config\nPort 22\nPort 2222\n";
        let value = read_value(&pattern("Port %s"), None, Cursor::new(input)).unwrap();
        assert_eq!(value.as_deref(), Some("22"));
    }

    #[test]
    fn test_read_stops_at_after() {
        let input = "OPTS=\"-v -x\" # trailing\n";
        let value = read_value(&pattern("OPTS=\"%s\""), None, Cursor::new(input)).unwrap();
        assert_eq!(value.as_deref(), Some("-v -x"));
    }

    #[test]
    fn test_read_matches_commented_line() {
        let input = "\t;# AUTO=no\n";
        let value = read_value(&pattern("AUTO=%s"), None, Cursor::new(input)).unwrap();
        assert_eq!(value.as_deref(), Some("no"));
    }

    #[test]
    fn test_read_without_trailing_newline() {
        let value = read_value(&pattern("AUTO=%s"), None, Cursor::new("AUTO=yes")).unwrap();
        assert_eq!(value.as_deref(), Some("yes"));
    }

    #[test]
    fn test_read_missing_is_none() {
        let value = read_value(&pattern("AUTO=%s"), None, Cursor::new("OTHER=1\n")).unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn test_read_whole_line_pattern() {
        let value = read_value(&pattern("%s"), None, Cursor::new("myhost\n")).unwrap();
        assert_eq!(value.as_deref(), Some("myhost"));
    }

    #[test]
    fn test_prescan_skips_earlier_block() {
        let input = "[client]\nport=1\n[server]\nport=2\n";
        let value = read_value(&pattern("port=%s"), Some("[server]"), Cursor::new(input)).unwrap();
        assert_eq!(value.as_deref(), Some("2"));
    }

    #[test]
    fn test_prescan_never_seen() {
        let input = "port=1\n";
        let value = read_value(&pattern("port=%s"), Some("[server]"), Cursor::new(input)).unwrap();
        assert_eq!(value, None);
    }

    // =========================================================================
    // Write mode
    // =========================================================================

    #[test]
    fn test_write_replaces_only_matching_line() {
        let input = "# header\nAUTO=no\nOTHER=1\n";
        let (out, found) = write_to_string(&pattern("AUTO=%s"), None, input, "yes");
        assert!(found);
        assert_eq!(out, "# header\nAUTO=yes\nOTHER=1\n");
    }

    #[test]
    fn test_write_uncomments() {
        let input = "  #AUTO=no\n";
        let (out, _) = write_to_string(&pattern("AUTO=%s"), None, input, "no");
        assert_eq!(out, "AUTO=no\n");
    }

    #[test]
    fn test_write_only_first_match() {
        let input = "Port 22\nPort 23\n";
        let (out, _) = write_to_string(&pattern("Port %s"), None, input, "2200");
        assert_eq!(out, "Port 2200\nPort 23\n");
    }

    #[test]
    fn test_write_respects_prescan() {
        let input = "[client]\nport=1\n[server]\nport=2\n";
        let (out, found) = write_to_string(&pattern("port=%s"), Some("[server]"), input, "9");
        assert!(found);
        assert_eq!(out, "[client]\nport=1\n[server]\nport=9\n");
    }

    #[test]
    fn test_write_no_match_copies_stream() {
        let input = "A=1\r\nB=2";
        let (out, found) = write_to_string(&pattern("C=%s"), None, input, "3");
        assert!(!found);
        assert_eq!(out, input);
    }

    #[test]
    fn test_non_utf8_lines_pass_through() {
        let input: &[u8] = b"# caf\xe9 settings\nAUTO=no\nNAME=J\xfcrgen\n";
        let p = pattern("AUTO=%s");

        let value = read_value(&p, None, Cursor::new(input)).unwrap();
        assert_eq!(value.as_deref(), Some("no"));

        let mut out = Vec::new();
        let found = write_value(&p, None, Cursor::new(input), &mut out, "yes").unwrap();
        assert!(found);
        assert_eq!(out, b"# caf\xe9 settings\nAUTO=yes\nNAME=J\xfcrgen\n".to_vec());
    }

    #[test]
    fn test_non_utf8_value_read_lossily() {
        let value = read_value(&pattern("NAME=%s"), None, Cursor::new(&b"NAME=J\xfcrgen\n"[..])).unwrap();
        assert_eq!(value.as_deref(), Some("J\u{fffd}rgen"));
    }

    #[test]
    fn test_active_only_skips_commented_lines() {
        let p = pattern("env LANG=%s").active_only();
        let input = "# env LANG=old\n  env LANG=C\n";

        let value = read_value(&p, None, Cursor::new(input)).unwrap();
        assert_eq!(value.as_deref(), Some("C"));

        let (out, found) = write_to_string(&p, None, input, "C.UTF-8");
        assert!(found);
        assert_eq!(out, "# env LANG=old\nenv LANG=C.UTF-8\n");

        let (out, found) = write_to_string(&p, None, "#env LANG=old\n", "C");
        assert!(!found);
        assert_eq!(out, "#env LANG=old\n");
    }

    #[test]
    fn test_comment_out() {
        let p = pattern("AUTO=%s");
        let mut out = Vec::new();
        let found = comment_out(&p, None, Cursor::new("X=1\n  AUTO=yes\n"), &mut out).unwrap();
        assert!(found);
        assert_eq!(String::from_utf8(out).unwrap(), "X=1\n#  AUTO=yes\n");

        let mut out = Vec::new();
        comment_out(&p, None, Cursor::new("# AUTO=yes\n"), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "# AUTO=yes\n");
    }

    // =========================================================================
    // Atomic rewrite
    // =========================================================================

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_rewrite_keeps_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg.txt");
        fs::write(&path, "AUTO=no\nKEEP=1\n").unwrap();

        let p = pattern("AUTO=%s");
        let changed = rewrite_file(&path, |r, w| Ok(write_value(&p, None, r, w, "yes")?)).unwrap();

        assert!(changed);
        assert_eq!(fs::read_to_string(&path).unwrap(), "AUTO=yes\nKEEP=1\n");
        assert_eq!(fs::read_to_string(backup_path(&path)).unwrap(), "AUTO=no\nKEEP=1\n");
        assert_eq!(dir_entries(dir.path()), vec!["cfg.txt", "cfg.txt~"]);
    }

    #[test]
    fn test_rewrite_preserves_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg.txt");
        fs::write(&path, "AUTO=no\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let p = pattern("AUTO=%s");
        rewrite_file(&path, |r, w| Ok(write_value(&p, None, r, w, "yes")?)).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn test_rewrite_failure_leaves_original() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg.txt");
        fs::write(&path, "AUTO=no\n").unwrap();

        let result = rewrite_file(&path, |_r, w| {
            w.write_all(b"AUTO=half")?;
            Err(JobServiceError::config_write("cfg.txt", "interrupted"))
        });

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "AUTO=no\n");
        assert_eq!(dir_entries(dir.path()), vec!["cfg.txt"]);
    }

    #[test]
    fn test_rewrite_without_match_leaves_original() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg.txt");
        fs::write(&path, "OTHER=1\n").unwrap();

        let p = pattern("AUTO=%s");
        let changed = rewrite_file(&path, |r, w| Ok(write_value(&p, None, r, w, "yes")?)).unwrap();

        assert!(!changed);
        assert_eq!(dir_entries(dir.path()), vec!["cfg.txt"]);
    }

    #[test]
    fn test_rewrite_missing_file_is_config_write_error() {
        let dir = TempDir::new().unwrap();
        let result = rewrite_file(&dir.path().join("absent"), |_r, _w| Ok(true));
        assert!(matches!(result, Err(JobServiceError::ConfigWrite { .. })));
    }

    #[test]
    fn test_replace_file_creates_and_backs_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.override");

        replace_file(&path, "manual\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "manual\n");
        assert!(!backup_path(&path).exists());

        replace_file(&path, "").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
        assert_eq!(fs::read_to_string(backup_path(&path)).unwrap(), "manual\n");
    }
}
