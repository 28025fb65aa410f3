//! Opens a URL in the operator's default browser.

use std::process::{Command, Stdio};

use log::info;

use crate::error::GatewayError;

/// Launch the platform URL handler, detached. The console URL stays valid
/// regardless, so a failed launch is reported but never tears the session
/// down.
pub fn open_url(url: &str) -> Result<(), GatewayError> {
    info!("opening {url} in browser");
    let mut command = launcher_command(url)?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| GatewayError::BrowserLaunch(e.to_string()))?;
    Ok(())
}

#[cfg(target_os = "windows")]
fn launcher_command(url: &str) -> Result<Command, GatewayError> {
    let mut cmd = Command::new("rundll32");
    cmd.arg("url.dll,FileProtocolHandler").arg(url);
    Ok(cmd)
}

#[cfg(target_os = "macos")]
fn launcher_command(url: &str) -> Result<Command, GatewayError> {
    let mut cmd = Command::new("open");
    cmd.arg(url);
    Ok(cmd)
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn launcher_command(url: &str) -> Result<Command, GatewayError> {
    let path = which::which("xdg-open")
        .map_err(|_| GatewayError::BrowserLaunch("xdg-open not found".to_string()))?;
    let mut cmd = Command::new(path);
    cmd.arg(url);
    Ok(cmd)
}
