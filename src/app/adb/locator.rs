use std::path::{Path, PathBuf};

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Configured path first, then the SDK under `android_home`, then whatever `adb` is on PATH.
pub fn resolve_adb_program(config_command_path: &str, android_home: Option<&str>) -> String {
    let normalized = normalize_command_path(config_command_path);
    if !normalized.is_empty() {
        return normalized;
    }
    if let Some(home) = android_home.map(str::trim).filter(|home| !home.is_empty()) {
        let exe = if cfg!(windows) { "adb.exe" } else { "adb" };
        let candidate: PathBuf = Path::new(home).join("platform-tools").join(exe);
        return candidate.to_string_lossy().to_string();
    }
    "adb".to_string()
}

pub fn resolve_adb_program_from_env(config_command_path: &str) -> String {
    let android_home = std::env::var("ANDROID_HOME").ok();
    resolve_adb_program(config_command_path, android_home.as_deref())
}

pub fn validate_adb_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("ADB command is empty".to_string());
    }
    if program == "adb" {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err("ADB path must point to an executable file".to_string());
    }
    if !path.exists() {
        return Err("ADB executable not found at the configured path".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_wrapping_quotes() {
        assert_eq!(
            normalize_command_path("  \"/opt/android/platform-tools/adb\"  "),
            "/opt/android/platform-tools/adb"
        );
        assert_eq!(
            normalize_command_path("  '/opt/android/platform-tools/adb'  "),
            "/opt/android/platform-tools/adb"
        );
    }

    #[test]
    fn configured_path_wins() {
        assert_eq!(resolve_adb_program("/usr/bin/adb", Some("/sdk")), "/usr/bin/adb");
    }

    #[cfg(unix)]
    #[test]
    fn falls_back_to_android_home() {
        assert_eq!(resolve_adb_program("", Some("/sdk")), "/sdk/platform-tools/adb");
    }

    #[test]
    fn falls_back_to_bare_adb() {
        assert_eq!(resolve_adb_program("   ", None), "adb");
        assert_eq!(resolve_adb_program("", Some("  ")), "adb");
    }

    #[test]
    fn validates_nonexistent_path() {
        let err = validate_adb_program("/this/path/should/not/exist/adb").unwrap_err();
        assert!(err.to_lowercase().contains("not found"));
    }
}
