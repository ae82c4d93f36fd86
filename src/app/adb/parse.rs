use std::sync::OnceLock;

use regex::Regex;

use crate::app::models::DisplayBounds;

pub const UNKNOWN_SIZE: &str = "unknown";

fn re(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// `wm size` output to `WIDTHxHEIGHT`, preferring the override size. Anything unexpected maps to
/// [`UNKNOWN_SIZE`].
pub fn parse_wm_size(output: &str) -> String {
    static OVERRIDE: OnceLock<Option<Regex>> = OnceLock::new();
    static ANY: OnceLock<Option<Regex>> = OnceLock::new();

    if let Some(caps) = re(&OVERRIDE, r"Override size:\s*(\d+x\d+)").and_then(|r| r.captures(output)) {
        return caps[1].to_string();
    }
    if let Some(caps) = re(&ANY, r"size:\s*(\d+x\d+)").and_then(|r| r.captures(output)) {
        return caps[1].to_string();
    }
    UNKNOWN_SIZE.to_string()
}

pub fn parse_dimensions(size: &str) -> Option<(u32, u32)> {
    let (width, height) = size.trim().split_once('x')?;
    let width = width.trim().parse::<u32>().ok()?;
    let height = height.trim().parse::<u32>().ok()?;
    Some((width, height))
}

pub fn parse_user_rotation(output: &str) -> i32 {
    output.trim().parse::<i32>().unwrap_or(0)
}

/// `SurfaceOrientation: N` from `dumpsys input`.
pub fn parse_surface_orientation(output: &str) -> Option<i32> {
    static SURFACE: OnceLock<Option<Regex>> = OnceLock::new();
    let caps = re(&SURFACE, r"SurfaceOrientation:\s*(\d+)")?.captures(output)?;
    caps[1].parse().ok()
}

/// Landscape (`1`) or portrait (`0`) from the `cur=WxH` field of `dumpsys window displays`.
pub fn parse_display_cur_orientation(output: &str) -> Option<i32> {
    static CUR: OnceLock<Option<Regex>> = OnceLock::new();
    let caps = re(&CUR, r"cur=(\d+)x(\d+)")?.captures(output)?;
    let width: u32 = caps[1].parse().ok()?;
    let height: u32 = caps[2].parse().ok()?;
    Some(if width > height { 1 } else { 0 })
}

/// Focused package, read from `mCurrentFocus=` and then from `mFocusedApp=`.
pub fn parse_focused_package(dumpsys_window: &str) -> String {
    focus_component(dumpsys_window, "mCurrentFocus=")
        .or_else(|| focus_component(dumpsys_window, "mFocusedApp="))
        .map(|(package, _)| package)
        .unwrap_or_default()
}

/// Focused activity, with the same two-marker fallback as [`parse_focused_package`].
pub fn parse_focused_activity(dumpsys_window: &str) -> String {
    focus_component(dumpsys_window, "mCurrentFocus=")
        .or_else(|| focus_component(dumpsys_window, "mFocusedApp="))
        .map(|(_, activity)| activity)
        .unwrap_or_default()
}

fn focus_component(output: &str, marker: &str) -> Option<(String, String)> {
    for line in output.lines() {
        let Some(index) = line.find(marker) else {
            continue;
        };
        let value = &line[index + marker.len()..];
        if value.starts_with("null") {
            continue;
        }
        let Some((before, after)) = value.split_once('/') else {
            continue;
        };
        let package = before.rsplit(' ').next().unwrap_or_default().trim();
        let activity = after
            .split(|c: char| c == '}' || c.is_whitespace())
            .next()
            .unwrap_or_default()
            .trim();
        if package.is_empty() || activity.is_empty() {
            continue;
        }
        return Some((package.to_string(), activity.to_string()));
    }
    None
}

/// Window frame of `package` from `dumpsys window windows`. Falls back to the full
/// `width`x`height` rectangle at the origin when no frame is listed.
pub fn parse_window_bounds(
    dumpsys_windows: &str,
    package: &str,
    width: i32,
    height: i32,
    orientation: i32,
) -> DisplayBounds {
    static FRAME: OnceLock<Option<Regex>> = OnceLock::new();
    let mut bounds = DisplayBounds {
        x: 0,
        y: 0,
        width,
        height,
    };
    let Some(frame_re) = re(
        &FRAME,
        r"Frames: containing=\[(\d+\.?\d*),(\d+\.?\d*)\]\[(\d+\.?\d*),(\d+\.?\d*)\]",
    ) else {
        return bounds;
    };
    if package.is_empty() {
        return bounds;
    }
    let needle = format!("package={package}");
    for window in dumpsys_windows.split("Window #") {
        if !window.contains(&needle) {
            continue;
        }
        for caps in frame_re.captures_iter(window) {
            let values = (1..=4)
                .map(|i| caps[i].parse::<f64>().map(|v| v as i32))
                .collect::<Result<Vec<_>, _>>();
            let Ok(values) = values else {
                continue;
            };
            let (mut x, mut y, mut right, mut bottom) = (values[0], values[1], values[2], values[3]);
            if orientation == 1 || orientation == 3 {
                std::mem::swap(&mut x, &mut y);
                std::mem::swap(&mut right, &mut bottom);
            }
            bounds = DisplayBounds {
                x,
                y,
                width: right - x,
                height: bottom - y,
            };
        }
    }
    bounds
}

pub fn parse_pm_path(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("package:"))
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
}

pub fn has_version_name(dumpsys_package: &str, version: &str) -> bool {
    !version.is_empty() && dumpsys_package.contains(&format!("versionName={version}"))
}
