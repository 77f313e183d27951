use anyhow::{Context, Result, bail};
use regex::Regex;
use std::path::Path;

/// Latest config schema version. Bump only when adding fields or changing
/// the config structure.
pub const CURRENT_CONFIG_VERSION: i64 = 1;

type MigrationFn = fn(&str) -> Result<String>;

/// Forward migrations, indexed by from-version. Each entry upgrades N to N+1.
const MIGRATIONS: &[(i64, MigrationFn)] = &[(0, migrate_v0_to_v1)];

/// Read the config at `path`, detect its schema version, and apply any
/// pending migrations in order. A timestamped backup is written before the
/// file is touched. Returns Ok(false) when the config is already current or
/// the file does not exist, Ok(true) when a migration ran.
///
/// Migrations operate on raw text rather than a decoded TOML tree so that
/// user comments and key ordering survive.
pub fn migrate_config_file(path: &Path) -> Result<bool> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).context("read config for migration"),
    };

    let version = detect_config_version(&data);
    if version >= CURRENT_CONFIG_VERSION {
        return Ok(false);
    }

    let mode = file_mode(path).context("stat config")?;
    backup_config_file(path, &data, mode).context("backup config")?;

    let mut current = data;
    for v in version..CURRENT_CONFIG_VERSION {
        let migration = MIGRATIONS
            .iter()
            .find(|(from, _)| *from == v)
            .map(|(_, f)| f);
        let Some(migration) = migration else {
            bail!("no migration registered for version {v} -> {}", v + 1);
        };
        current = migration(&current).with_context(|| format!("migrate v{v} -> v{}", v + 1))?;
    }

    write_with_mode(path, &current, mode).context("write migrated config")?;

    tracing::info!(
        from_version = version,
        to_version = CURRENT_CONFIG_VERSION,
        path = %path.display(),
        "config migrated"
    );
    Ok(true)
}

/// Decode only the `config_version` key. Absent or unparsable means 0.
pub fn detect_config_version(data: &str) -> i64 {
    #[derive(serde::Deserialize)]
    struct VersionOnly {
        #[serde(default)]
        config_version: i64,
    }
    toml::from_str::<VersionOnly>(data)
        .map(|v| v.config_version)
        .unwrap_or(0)
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(std::fs::metadata(path)?.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Result<u32> {
    Ok(0o600)
}

fn write_with_mode(path: &Path, data: &str, mode: u32) -> Result<()> {
    std::fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

/// Write `data` to `<path>.bak.<YYYYmmdd-HHMMSS>`. Backups are at most as
/// permissive as the source config and never readable by group/other, so a
/// backup can't leak credentials the config itself kept private.
fn backup_config_file(path: &Path, data: &str, mode: u32) -> Result<()> {
    let mut backup_mode = mode & 0o700;
    if backup_mode == 0 {
        backup_mode = 0o600;
    }
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let backup_path = path.with_file_name(format!(
        "{}.bak.{stamp}",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));
    write_with_mode(&backup_path, data, backup_mode)
}

/// v0 -> v1: insert `ci_check_interval` and `ci_check_timeout` into the
/// `[daemon]` section (when present) and stamp `config_version = 1`.
fn migrate_v0_to_v1(data: &str) -> Result<String> {
    let result = toml_insert_in_section(
        data,
        "daemon",
        &[
            (
                "ci_check_interval",
                "\"30s\"",
                "# How often to poll CI check-runs",
            ),
            (
                "ci_check_timeout",
                "\"30m\"",
                "# Max wait for CI checks before rejecting",
            ),
        ],
    );
    Ok(toml_set_config_version(&result, 1))
}

/// Set or insert `config_version` at the top level.
fn toml_set_config_version(data: &str, version: i64) -> String {
    let line = format!("config_version = {version}");
    let re = Regex::new(r"(?m)^config_version\s*=\s*\d+").unwrap();
    if re.is_match(data) {
        return re.replace_all(data, line.as_str()).into_owned();
    }
    toml_insert_top_level(data, &line)
}

/// Insert a line after leading comments/blank lines, before the first key or
/// section header.
fn toml_insert_top_level(data: &str, line: &str) -> String {
    let lines: Vec<&str> = data.split('\n').collect();
    let mut insert_idx = 0;
    for (i, l) in lines.iter().enumerate() {
        let trimmed = l.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            insert_idx = i + 1;
            continue;
        }
        break;
    }

    let mut result: Vec<String> = lines[..insert_idx].iter().map(|s| s.to_string()).collect();
    result.push(line.to_string());
    if insert_idx < lines.len() && !lines[insert_idx].trim().is_empty() {
        result.push(String::new());
    }
    result.extend(lines[insert_idx..].iter().map(|s| s.to_string()));
    result.join("\n")
}

/// Find a `[section]` header and append key/value pairs after its last key.
/// Keys already present in the section are left untouched; a missing section
/// means nothing to insert.
fn toml_insert_in_section(data: &str, section: &str, kvs: &[(&str, &str, &str)]) -> String {
    let lines: Vec<&str> = data.split('\n').collect();
    let header = format!("[{section}]");

    let mut in_section = false;
    let mut insert_idx: Option<usize> = None;

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed == header {
            in_section = true;
            insert_idx = Some(i + 1);
            continue;
        }
        if in_section {
            if trimmed.starts_with('[') {
                break;
            }
            if !trimmed.is_empty() && !trimmed.starts_with('#') {
                insert_idx = Some(i + 1);
            }
        }
    }

    let Some(insert_idx) = insert_idx else {
        return data.to_string();
    };

    let mut to_insert = Vec::new();
    for (key, value, comment) in kvs {
        if section_contains_key(&lines, section, key) {
            continue;
        }
        let mut entry = format!("{key} = {value}");
        if !comment.is_empty() {
            entry.push_str("   ");
            entry.push_str(comment);
        }
        to_insert.push(entry);
    }
    if to_insert.is_empty() {
        return data.to_string();
    }

    let mut result: Vec<String> = lines[..insert_idx].iter().map(|s| s.to_string()).collect();
    result.extend(to_insert);
    result.extend(lines[insert_idx..].iter().map(|s| s.to_string()));
    result.join("\n")
}

fn section_contains_key(lines: &[&str], section: &str, key: &str) -> bool {
    let header = format!("[{section}]");
    let key_re = Regex::new(&format!(r"^\s*{}\s*=", regex::escape(key))).unwrap();
    let mut in_section = false;
    for line in lines {
        let trimmed = line.trim();
        if trimmed == header {
            in_section = true;
            continue;
        }
        if in_section {
            if trimmed.starts_with('[') {
                return false;
            }
            if key_re.is_match(line) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const V0_CONFIG: &str = r#"# mender configuration
db_path = "mender.db"

[daemon]
webhook_port = 9000
max_workers = 2

[[projects]]
name = "myproject"
repo_url = "https://example.com/r.git"
test_cmd = "true"

[projects.github]
owner = "org"
repo = "repo"
"#;

    fn backups_in(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| {
                let path = e.unwrap().path();
                path.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .contains(".bak.")
                    .then_some(path)
            })
            .collect()
    }

    #[test]
    fn v0_to_v1_inserts_ci_keys_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mender.toml");
        std::fs::write(&path, V0_CONFIG).unwrap();

        let migrated = migrate_config_file(&path).unwrap();
        assert!(migrated);

        let out = std::fs::read_to_string(&path).unwrap();
        assert!(out.contains("config_version = 1"), "{out}");
        assert!(out.contains("ci_check_interval = \"30s\""), "{out}");
        assert!(out.contains("ci_check_timeout = \"30m\""), "{out}");
        // Comments survive the migration.
        assert!(out.contains("# mender configuration"));
        // Keys land inside [daemon], before the next section.
        let daemon_idx = out.find("[daemon]").unwrap();
        let projects_idx = out.find("[[projects]]").unwrap();
        let ci_idx = out.find("ci_check_interval").unwrap();
        assert!(daemon_idx < ci_idx && ci_idx < projects_idx);
    }

    #[test]
    fn migration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mender.toml");
        std::fs::write(&path, V0_CONFIG).unwrap();

        assert!(migrate_config_file(&path).unwrap());
        let after_first = std::fs::read_to_string(&path).unwrap();
        assert_eq!(backups_in(dir.path()).len(), 1);

        // Second run: no change, no new backup.
        assert!(!migrate_config_file(&path).unwrap());
        let after_second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(after_first, after_second);
        assert_eq!(backups_in(dir.path()).len(), 1);
    }

    #[test]
    fn missing_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.toml");
        assert!(!migrate_config_file(&path).unwrap());
    }

    #[test]
    fn current_version_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mender.toml");
        let body = format!("config_version = {CURRENT_CONFIG_VERSION}\n{V0_CONFIG}");
        std::fs::write(&path, &body).unwrap();

        assert!(!migrate_config_file(&path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), body);
        assert!(backups_in(dir.path()).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn backup_strips_group_and_other_bits() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mender.toml");
        std::fs::write(&path, V0_CONFIG).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o664)).unwrap();

        migrate_config_file(&path).unwrap();

        let backups = backups_in(dir.path());
        assert_eq!(backups.len(), 1);
        let mode = std::fs::metadata(&backups[0]).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode & 0o077, 0, "backup mode {mode:o} leaks group/other");
        // Source file keeps its own permissions.
        let src_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(src_mode, 0o664);
    }

    #[test]
    fn existing_ci_keys_are_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mender.toml");
        let body = V0_CONFIG.replace(
            "max_workers = 2",
            "max_workers = 2\nci_check_interval = \"10s\"",
        );
        std::fs::write(&path, body).unwrap();

        migrate_config_file(&path).unwrap();
        let out = std::fs::read_to_string(&path).unwrap();
        assert_eq!(out.matches("ci_check_interval").count(), 1);
        assert!(out.contains("ci_check_interval = \"10s\""));
        assert!(out.contains("ci_check_timeout = \"30m\""));
    }
}
