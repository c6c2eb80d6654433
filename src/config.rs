use anyhow::Context as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Fallback user for trees that do not set `User`. Unprivileged mode points
/// this at the invoking user before any definitions are loaded.
static DEFAULT_USER: OnceLock<String> = OnceLock::new();

pub fn set_default_user(user: impl Into<String>) {
    let _ = DEFAULT_USER.set(user.into());
}

pub fn default_user() -> &'static str {
    DEFAULT_USER.get().map(String::as_str).unwrap_or("op")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    Always,
    Limited,
}

/// Parsed and validated tree definition. One file under the tree directory
/// produces exactly one of these; the file path doubles as the identity key
/// for later update/remove handling.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    pub name: String,
    pub origin_file: PathBuf,
    pub command: String,
    pub user: String,
    pub environment_file: Option<PathBuf>,
    pub log_file: PathBuf,
    pub max_log_age_days: u32,
    pub restart: RestartPolicy,
    pub restart_attempts: u32,
    pub restart_delay: Duration,
}

/// Load one tree definition. The grammar is line-oriented: blank lines and
/// `#` comments are skipped, everything else is `Key value` split at the
/// first space. Unknown keys and malformed values are hard errors.
pub fn load_tree_config(path: &Path) -> anyhow::Result<TreeConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read tree definition {}", path.display()))?;

    let mut cfg = TreeConfig {
        name: String::new(),
        origin_file: path.to_path_buf(),
        command: String::new(),
        user: default_user().to_string(),
        environment_file: None,
        log_file: PathBuf::new(),
        max_log_age_days: 7,
        restart: RestartPolicy::Never,
        restart_attempts: 3,
        restart_delay: Duration::from_secs(3),
    };

    for (idx, line) in raw.lines().enumerate() {
        let line_num = idx + 1;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((param, value)) = line.split_once(' ') else {
            anyhow::bail!("invalid syntax on line {line_num}: expected `Key value`");
        };
        let param = param.trim();
        let value = value.trim();
        if value.is_empty() {
            anyhow::bail!("missing value for '{param}' on line {line_num}");
        }
        match param {
            "Name" => cfg.name = value.to_string(),
            "Command" => cfg.command = value.to_string(),
            "User" => cfg.user = value.to_string(),
            "EnvironmentFile" => cfg.environment_file = Some(PathBuf::from(value)),
            "LogFile" => cfg.log_file = PathBuf::from(value),
            "MaxLogAge" => {
                cfg.max_log_age_days = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid max log age '{value}' on line {line_num}"))?;
            }
            "Restart" => {
                cfg.restart = match value {
                    "always" => RestartPolicy::Always,
                    "never" => RestartPolicy::Never,
                    "limited" => RestartPolicy::Limited,
                    _ => anyhow::bail!("unknown restart value '{value}' on line {line_num}"),
                };
            }
            "RestartAttempts" => {
                cfg.restart_attempts = value.parse().map_err(|_| {
                    anyhow::anyhow!("invalid restart attempts '{value}' on line {line_num}")
                })?;
            }
            "RestartDelay" => {
                cfg.restart_delay = parse_duration(value).map_err(|e| {
                    anyhow::anyhow!("invalid restart delay '{value}' on line {line_num}: {e}")
                })?;
            }
            _ => anyhow::bail!("unknown parameter '{param}' on line {line_num}"),
        }
    }

    validate(&mut cfg)?;
    Ok(cfg)
}

fn validate(cfg: &mut TreeConfig) -> anyhow::Result<()> {
    anyhow::ensure!(!cfg.command.is_empty(), "missing required Command");
    if cfg.name.is_empty() {
        cfg.name = cfg
            .origin_file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        anyhow::ensure!(
            !cfg.name.is_empty(),
            "cannot derive a name from {}",
            cfg.origin_file.display()
        );
    }
    if cfg.log_file.as_os_str().is_empty() {
        cfg.log_file = PathBuf::from(format!("/var/log/homelab/{}.log", cfg.name));
    }
    anyhow::ensure!(cfg.max_log_age_days >= 1, "MaxLogAge must be at least 1 day");
    Ok(())
}

/// Parse a compound duration like `3s`, `500ms` or `1m30s`.
///
/// Units must be specified from larger to smaller; no repeats.
/// Supported: d, h, m, s, ms.
pub fn parse_duration(spec: &str) -> anyhow::Result<Duration> {
    let t = spec.trim();
    anyhow::ensure!(!t.is_empty(), "empty duration");
    anyhow::ensure!(
        !t.chars().any(|c| c.is_whitespace()),
        "duration must not contain whitespace"
    );
    let s = t.to_ascii_lowercase();

    // Rank: d(5) > h(4) > m(3) > s(2) > ms(1)
    fn rank(unit: &str) -> u8 {
        match unit {
            "d" => 5,
            "h" => 4,
            "m" => 3,
            "s" => 2,
            _ => 1,
        }
    }
    fn mult(unit: &str) -> u64 {
        match unit {
            "d" => 86_400_000,
            "h" => 3_600_000,
            "m" => 60_000,
            "s" => 1_000,
            _ => 1,
        }
    }

    let b = s.as_bytes();
    let mut i = 0usize;
    let mut prev_rank: u8 = u8::MAX;
    let mut total: u64 = 0;

    while i < b.len() {
        let start = i;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
        anyhow::ensure!(i > start, "expected a number at offset {start}");
        let num: u64 = s[start..i].parse()?;

        anyhow::ensure!(i < b.len(), "missing unit after {num}");
        let unit = if s[i..].starts_with("ms") {
            i += 2;
            "ms"
        } else {
            let ch = b[i] as char;
            anyhow::ensure!(
                matches!(ch, 'd' | 'h' | 'm' | 's'),
                "invalid unit at offset {i} (use ms/s/m/h/d)"
            );
            i += 1;
            match ch {
                'd' => "d",
                'h' => "h",
                'm' => "m",
                _ => "s",
            }
        };

        let r = rank(unit);
        anyhow::ensure!(
            r < prev_rank,
            "units must go from larger to smaller (e.g. 1m30s); got {unit} after a smaller or equal unit"
        );
        prev_rank = r;

        let add = num
            .checked_mul(mult(unit))
            .ok_or_else(|| anyhow::anyhow!("duration overflow"))?;
        total = total
            .checked_add(add)
            .ok_or_else(|| anyhow::anyhow!("duration overflow"))?;
    }
    Ok(Duration::from_millis(total))
}
