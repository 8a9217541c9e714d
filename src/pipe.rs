use std::{
    collections::HashMap,
    ffi::CString,
    fs,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    sync::mpsc,
};

use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, BufReader},
    task,
};
use tracing::{info, warn};

use crate::{AnyResult, balance::BalanceMsg};

/// Operator commands accepted on the control pipe, each addressed to one
/// balance by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Ping,
    Tare,
    Calibrate,
}

pub fn parse_command(input: &str) -> Option<(OperatorCommand, &str)> {
    let mut parts = input.trim().splitn(2, char::is_whitespace);
    let verb = parts.next()?.to_ascii_uppercase();
    let target = parts.next().map(str::trim).filter(|s| !s.is_empty())?;
    let command = match verb.as_str() {
        "PING" => OperatorCommand::Ping,
        "TARE" => OperatorCommand::Tare,
        "CALIBRATE" => OperatorCommand::Calibrate,
        _ => return None,
    };
    Some((command, target))
}

/// Serves tare/calibrate/ping requests from a named FIFO, routing each to
/// the balance controller it names.
pub async fn serve_control_pipe(
    socket_path: PathBuf,
    balances: HashMap<String, mpsc::Sender<BalanceMsg>>,
) -> AnyResult<()> {
    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
    }

    task::spawn_blocking({
        let path = socket_path.clone();
        move || create_fifo(&path)
    })
    .await??;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&socket_path)
        .await?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            continue;
        }

        let Some((command, target)) = parse_command(&line) else {
            warn!("unrecognised control command: {:?}", line.trim());
            continue;
        };
        let Some(mailbox) = balances.get(target) else {
            warn!("control command for unknown balance '{target}'");
            continue;
        };
        info!("control pipe: {command:?} -> {target}");
        let msg = match command {
            OperatorCommand::Ping => BalanceMsg::Ping,
            OperatorCommand::Tare => BalanceMsg::Tare,
            OperatorCommand::Calibrate => BalanceMsg::Calibrate,
        };
        let _ = mailbox.send(msg);
    }
}

fn create_fifo(path: &Path) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    let mode = 0o666;
    let res = unsafe { libc::mkfifo(c_path.as_ptr(), mode) };
    if res == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_case_insensitively() {
        assert_eq!(
            parse_command("tare balance-left"),
            Some((OperatorCommand::Tare, "balance-left"))
        );
        assert_eq!(
            parse_command("  PING   balance-left  "),
            Some((OperatorCommand::Ping, "balance-left"))
        );
        assert_eq!(
            parse_command("Calibrate balance 2"),
            Some((OperatorCommand::Calibrate, "balance 2"))
        );
    }

    #[test]
    fn rejects_missing_target_or_unknown_verb() {
        assert_eq!(parse_command("tare"), None);
        assert_eq!(parse_command("tare   "), None);
        assert_eq!(parse_command("reboot balance-left"), None);
        assert_eq!(parse_command(""), None);
    }
}
