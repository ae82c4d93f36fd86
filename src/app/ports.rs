use std::net::TcpListener;

use crate::app::error::AppError;

/// Asks the OS for a currently unused loopback port.
pub fn free_local_port(trace_id: &str) -> Result<u16, AppError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .map_err(|err| AppError::system(format!("Failed to reserve local port: {err}"), trace_id))?;
    let port = listener
        .local_addr()
        .map_err(|err| AppError::system(format!("Failed to read local port: {err}"), trace_id))?
        .port();
    Ok(port)
}
