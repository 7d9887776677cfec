/// End-of-session violation report.
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const RULE: &str = "--------------------------------------------------------------------------------";
const BANNER: &str = "--------------------------- ACCESS VIOLATION SUMMARY ---------------------------";

/// One line of the violation log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub operation: String,
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub log_file: PathBuf,
    pub log_present: bool,
    pub violations: Vec<Violation>,
    /// `None` when the shell was killed by a signal.
    pub shell_exit_code: Option<i32>,
    pub exit_code: i32,
}

impl SessionSummary {
    pub fn new(log_file: &Path, log_text: Option<&str>, shell_exit_code: Option<i32>) -> Self {
        let log_present = log_text.is_some();
        let violations = log_text.map(parse_log).unwrap_or_default();
        let exit_code = if log_present || shell_exit_code != Some(0) {
            1
        } else {
            0
        };
        Self {
            log_file: log_file.to_path_buf(),
            log_present,
            violations,
            shell_exit_code,
            exit_code,
        }
    }
}

/// Split `"<op>:<padding><path>"` lines. Lines without a colon are skipped.
pub fn parse_log(text: &str) -> Vec<Violation> {
    text.lines()
        .filter_map(|line| {
            let (op, path) = line.split_once(':')?;
            Some(Violation {
                operation: op.trim().to_string(),
                path: path.trim_start().to_string(),
            })
        })
        .collect()
}

/// Red banner, log location, the log verbatim, footer.
pub fn write_banner(out: &mut impl Write, log_file: &Path, log_text: &str) -> io::Result<()> {
    writeln!(out, "\x1b[31;01m{}\x1b[0m", BANNER)?;
    writeln!(out, "\x1b[31;01mLOG FILE = \"{}\"\x1b[0m", log_file.display())?;
    writeln!(out)?;
    out.write_all(log_text.as_bytes())?;
    if !log_text.is_empty() && !log_text.ends_with('\n') {
        writeln!(out)?;
    }
    writeln!(out, "\x1b[31;01m{}\x1b[0m", RULE)?;
    out.flush()
}

pub fn write_json(out: &mut impl Write, summary: &SessionSummary) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, summary)?;
    writeln!(out)?;
    out.flush()
}

/// Ring the terminal bell `count` times, `interval` apart.
pub fn beep(out: &mut impl Write, count: u32, interval: Duration) -> io::Result<()> {
    for i in 0..count {
        out.write_all(b"\x07")?;
        out.flush()?;
        if i + 1 < count {
            std::thread::sleep(interval);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const LOG: &str = "unlink:    /etc/passwd\nopen_write:/usr/lib/x.so\n";

    #[test]
    fn parses_padded_log_lines() {
        assert_eq!(
            parse_log(LOG),
            vec![
                Violation {
                    operation: "unlink".into(),
                    path: "/etc/passwd".into(),
                },
                Violation {
                    operation: "open_write".into(),
                    path: "/usr/lib/x.so".into(),
                },
            ]
        );
    }

    #[test]
    fn banner_contains_log_verbatim() {
        let mut out = Vec::new();
        write_banner(&mut out, Path::new("/tmp/sandbox-1.log"), LOG).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("ACCESS VIOLATION SUMMARY"));
        assert!(text.contains("LOG FILE = \"/tmp/sandbox-1.log\""));
        assert!(text.contains(LOG));
    }

    #[test]
    fn exit_code_reflects_log_or_shell_status() {
        let log = Path::new("/tmp/sandbox-1.log");
        assert_eq!(SessionSummary::new(log, None, Some(0)).exit_code, 0);
        assert_eq!(SessionSummary::new(log, Some(LOG), Some(0)).exit_code, 1);
        assert_eq!(SessionSummary::new(log, None, Some(2)).exit_code, 1);
        assert_eq!(SessionSummary::new(log, None, None).exit_code, 1);
    }

    #[test]
    fn json_summary_round_trips() {
        let summary = SessionSummary::new(Path::new("/tmp/s.log"), Some(LOG), Some(0));
        let mut out = Vec::new();
        write_json(&mut out, &summary).unwrap();
        let parsed: SessionSummary = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, summary);
    }

    #[test]
    fn beep_writes_bells() {
        let mut out = Vec::new();
        beep(&mut out, 3, Duration::ZERO).unwrap();
        assert_eq!(out, b"\x07\x07\x07");
    }
}
