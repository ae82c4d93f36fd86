use std::sync::Arc;
use std::time::{Duration, Instant};

use devicehub_agent_lib::app::adb::bridge::AdbCli;
use devicehub_agent_lib::app::adb::executor::PROP_MANUFACTURER;
use devicehub_agent_lib::app::adb::locator::{resolve_adb_program_from_env, validate_adb_program};
use devicehub_agent_lib::app::adb::parse::UNKNOWN_SIZE;
use devicehub_agent_lib::app::adb::runner::run_command_with_timeout;
use devicehub_agent_lib::app::config::load_config;
use devicehub_agent_lib::app::logging::{init_logging, new_trace_id};
use devicehub_agent_lib::app::models::DeviceHandle;
use devicehub_agent_lib::app::ports::free_local_port;
use devicehub_agent_lib::app::registry::ForwardTarget;
use devicehub_agent_lib::app::state::AgentState;
use serde::Serialize;

#[derive(Debug, Clone)]
struct Args {
    serial: Option<String>,
    json: bool,
    with_forward: bool,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    serial: Option<String>,
    adb_program: Option<String>,
    checks: Vec<SmokeCheck>,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: &'static str, // pass|fail|warn|skip
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SmokeCheck {
    fn skipped(name: &'static str) -> Self {
        Self {
            name,
            status: "skip",
            duration_ms: 0,
            detail: None,
            error_code: None,
            error: None,
        }
    }
}

fn parse_args() -> Result<Args, String> {
    let mut serial = std::env::var("ANDROID_SERIAL")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let mut json = false;
    let mut with_forward = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => {
                serial = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--json" => {
                json = true;
            }
            "--with-forward" => {
                with_forward = true;
            }
            "-h" | "--help" => {
                return Err(
                    "Usage: cargo run --bin smoke -- [--serial SERIAL] [--json] [--with-forward]\n"
                        .to_string(),
                );
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    Ok(Args {
        serial,
        json,
        with_forward,
    })
}

fn pick_single_device(adb_program: &str, trace_id: &str) -> Result<String, String> {
    let output = run_command_with_timeout(
        adb_program,
        &["devices".to_string()],
        Duration::from_secs(10),
        trace_id,
    )
    .map_err(|err| err.to_string())?;
    let serials: Vec<String> = output
        .stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect();
    match serials.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err("No online device found".to_string()),
        _ => Err(format!(
            "Multiple devices online ({}); pass --serial",
            serials.join(", ")
        )),
    }
}

fn run_check<F>(checks: &mut Vec<SmokeCheck>, name: &'static str, f: F) -> Result<(), ()>
where
    F: FnOnce() -> Result<String, (&'static str, String)>,
{
    let start = Instant::now();
    match f() {
        Ok(detail) => {
            checks.push(SmokeCheck {
                name,
                status: "pass",
                duration_ms: start.elapsed().as_millis(),
                detail: Some(detail),
                error_code: None,
                error: None,
            });
            Ok(())
        }
        Err((code, err)) => {
            checks.push(SmokeCheck {
                name,
                status: "fail",
                duration_ms: start.elapsed().as_millis(),
                detail: None,
                error_code: Some(code),
                error: Some(err),
            });
            Err(())
        }
    }
}

fn run_warn<F>(checks: &mut Vec<SmokeCheck>, name: &'static str, f: F)
where
    F: FnOnce() -> Result<String, String>,
{
    let start = Instant::now();
    let (status, detail, error) = match f() {
        Ok(detail) => ("pass", Some(detail), None),
        Err(warning) => ("warn", None, Some(warning)),
    };
    checks.push(SmokeCheck {
        name,
        status,
        duration_ms: start.elapsed().as_millis(),
        detail,
        error_code: error.as_ref().map(|_| "WARN"),
        error,
    });
}

fn finish(args: &Args, summary: SmokeSummary) -> ! {
    let output = if args.json {
        serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "{}".to_string())
    } else {
        let mut text = format!("status: {}\ntrace_id: {}\n", summary.status, summary.trace_id);
        for check in &summary.checks {
            text.push_str(&format!("  {:<16} {}\n", check.name, check.status));
        }
        text
    };
    println!("{output}");
    std::process::exit(if summary.status == "pass" { 0 } else { 1 });
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = new_trace_id();
    let mut checks: Vec<SmokeCheck> = Vec::new();
    let mut status = "pass";

    let config = match load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            checks.push(SmokeCheck {
                name: "load_config",
                status: "fail",
                duration_ms: 0,
                detail: None,
                error_code: Some("ERR_CONFIG"),
                error: Some(err.to_string()),
            });
            let summary = SmokeSummary {
                tool: "devicehub_agent_smoke",
                status: "fail",
                trace_id,
                serial: args.serial.clone(),
                adb_program: None,
                checks,
            };
            finish(&args, summary);
        }
    };
    init_logging(&config.logging);

    let adb_program = resolve_adb_program_from_env(&config.bridge.adb_command_path);
    if run_check(&mut checks, "check_adb", || {
        validate_adb_program(&adb_program).map_err(|err| ("ERR_ADB", err))?;
        Ok(adb_program.clone())
    })
    .is_err()
    {
        status = "fail";
    }

    let serial = match args.serial.clone() {
        Some(s) => Some(s),
        None if status == "pass" => match pick_single_device(&adb_program, &trace_id) {
            Ok(s) => Some(s),
            Err(err) => {
                checks.push(SmokeCheck {
                    name: "pick_device",
                    status: "fail",
                    duration_ms: 0,
                    detail: None,
                    error_code: Some("ERR_PICK_DEVICE"),
                    error: Some(err),
                });
                None
            }
        },
        None => None,
    };
    let Some(serial) = serial else {
        let summary = SmokeSummary {
            tool: "devicehub_agent_smoke",
            status: "fail",
            trace_id,
            serial: None,
            adb_program: Some(adb_program),
            checks,
        };
        finish(&args, summary);
    };

    let bridge = Arc::new(AdbCli::new(adb_program.clone(), &config.bridge));
    let state = AgentState::new(config, bridge);
    let device = DeviceHandle::new(serial.clone());
    let executor = Arc::clone(&state.executor);

    if run_check(&mut checks, "api_level", || match executor.api_level(&device) {
        0 => Err(("ERR_PROPERTY", "ro.build.version.sdk unreadable".to_string())),
        level => Ok(level.to_string()),
    })
    .is_err()
    {
        status = "fail";
    }

    if run_check(&mut checks, "screen_size", || {
        let size = executor.screen_size(&device);
        if size == UNKNOWN_SIZE {
            return Err(("ERR_SCREEN_SIZE", "wm size returned no dimensions".to_string()));
        }
        Ok(size)
    })
    .is_err()
    {
        status = "fail";
    }

    run_warn(&mut checks, "orientation", || {
        Ok(executor.orientation(&device).to_string())
    });

    run_warn(&mut checks, "display_bounds", || {
        let bounds = executor.display_bounds(&device);
        if bounds.width == 0 || bounds.height == 0 {
            return Err("display bounds unknown".to_string());
        }
        Ok(format!("{}x{}", bounds.width, bounds.height))
    });

    run_warn(&mut checks, "current_package", || {
        let package = executor.current_package(&device);
        if package.is_empty() {
            return Err("no focused window".to_string());
        }
        Ok(package)
    });

    run_warn(&mut checks, "manufacturer", || {
        executor
            .query_property(&device, PROP_MANUFACTURER)
            .ok_or_else(|| "manufacturer property unreadable".to_string())
    });

    if args.with_forward {
        if run_check(&mut checks, "forward_lease", || {
            let port = free_local_port(&trace_id).map_err(|err| ("ERR_PORT", err.to_string()))?;
            let lease = executor
                .forward_lease(&device, port, ForwardTarget::Tcp(6790))
                .ok_or_else(|| ("ERR_FORWARD", format!("adb forward on port {port} failed")))?;
            let detail = format!("tcp:{} -> tcp:6790", lease.local_port());
            drop(lease);
            if !state.ports.is_empty() {
                return Err(("ERR_FORWARD", "forward still registered after release".to_string()));
            }
            Ok(detail)
        })
        .is_err()
        {
            status = "fail";
        }
    } else {
        checks.push(SmokeCheck::skipped("forward_lease"));
    }

    let summary = SmokeSummary {
        tool: "devicehub_agent_smoke",
        status,
        trace_id,
        serial: Some(serial),
        adb_program: Some(adb_program),
        checks,
    };
    finish(&args, summary);
}
