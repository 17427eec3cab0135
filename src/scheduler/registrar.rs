use async_trait::async_trait;
use chrono::{Local, NaiveTime, Timelike};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CrawlerError, Result};
use crate::scheduler::next_slot;

pub const TASK_NAME: &str = "CommercialRealEstateCrawler";
const CRON_TAG: &str = "# cre-crawler:scheduled-run";

/// What the OS scheduler should execute at each slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl TaskCommand {
    /// This executable's `run-scheduled` subcommand, with the same config file.
    pub fn current_exe(config_path: &Path) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| CrawlerError::Schedule(format!("cannot locate own executable: {}", e)))?;
        let config_path = if config_path.is_absolute() {
            config_path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| CrawlerError::Schedule(format!("cannot resolve config path: {}", e)))?
                .join(config_path)
        };
        let working_dir = program
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            program,
            args: vec![
                "--config".to_string(),
                config_path.display().to_string(),
                "run-scheduled".to_string(),
            ],
            working_dir,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrationStatus {
    pub installed: bool,
    pub enabled: bool,
    pub times: Vec<String>,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub detail: Option<String>,
}

/// OS-level scheduled task for the crawler
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskRegistrar: Send + Sync {
    /// Installs or replaces the task with one daily trigger per time.
    async fn install(&self, times: &[NaiveTime], command: &TaskCommand) -> Result<()>;
    /// Removing a task that is not installed is not an error.
    async fn remove(&self) -> Result<()>;
    async fn status(&self) -> Result<RegistrationStatus>;
}

pub fn platform_registrar() -> Box<dyn TaskRegistrar> {
    if cfg!(windows) {
        Box::new(SchtasksRegistrar::new())
    } else {
        Box::new(CrontabRegistrar::new())
    }
}

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn run_command(program: &str, args: &[&str], stdin: Option<&str>) -> Result<CommandOutput> {
    debug!("Running {} {:?}", program, args);
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CrawlerError::Schedule(format!("cannot run {}: {}", program, e)))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|e| CrawlerError::Schedule(format!("cannot write to {}: {}", program, e)))?;
        // closing stdin lets the child finish reading
        drop(pipe);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| CrawlerError::Schedule(format!("{} did not finish: {}", program, e)))?;
    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn next_run_text(times: &[NaiveTime]) -> Option<String> {
    next_slot(Local::now().naive_local(), times).map(|slot| slot.format("%Y-%m-%d %H:%M").to_string())
}

/// Windows Task Scheduler via `schtasks.exe` and a task XML definition.
/// `StartWhenAvailable` makes Windows run a missed slot once after wake.
pub struct SchtasksRegistrar {
    task_name: String,
}

impl SchtasksRegistrar {
    pub fn new() -> Self {
        Self {
            task_name: TASK_NAME.to_string(),
        }
    }

    async fn is_installed(&self) -> Result<bool> {
        Ok(run_command("schtasks", &["/query", "/tn", &self.task_name], None).await?.success)
    }
}

impl Default for SchtasksRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn windows_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(' ') {
                format!("\"{}\"", arg)
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Task Scheduler definition with one daily `CalendarTrigger` per time.
pub fn task_xml(times: &[NaiveTime], command: &TaskCommand) -> String {
    let mut triggers = String::new();
    for time in times {
        let _ = write!(
            triggers,
            "\n    <CalendarTrigger>\n      <StartBoundary>2024-01-01T{:02}:{:02}:00</StartBoundary>\n      <Enabled>true</Enabled>\n      <ScheduleByDay>\n        <DaysInterval>1</DaysInterval>\n      </ScheduleByDay>\n    </CalendarTrigger>",
            time.hour(),
            time.minute()
        );
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-16"?>
<Task version="1.2" xmlns="http://schemas.microsoft.com/windows/2004/02/mit/task">
  <RegistrationInfo>
    <Description>Commercial real estate listing crawler</Description>
  </RegistrationInfo>
  <Triggers>{triggers}
  </Triggers>
  <Principals>
    <Principal id="Author">
      <LogonType>InteractiveToken</LogonType>
      <RunLevel>LeastPrivilege</RunLevel>
    </Principal>
  </Principals>
  <Settings>
    <MultipleInstancesPolicy>IgnoreNew</MultipleInstancesPolicy>
    <DisallowStartIfOnBatteries>false</DisallowStartIfOnBatteries>
    <StopIfGoingOnBatteries>false</StopIfGoingOnBatteries>
    <AllowHardTerminate>true</AllowHardTerminate>
    <StartWhenAvailable>true</StartWhenAvailable>
    <RunOnlyIfNetworkAvailable>false</RunOnlyIfNetworkAvailable>
    <AllowStartOnDemand>true</AllowStartOnDemand>
    <Enabled>true</Enabled>
    <Hidden>true</Hidden>
    <RunOnlyIfIdle>false</RunOnlyIfIdle>
    <WakeToRun>false</WakeToRun>
    <ExecutionTimeLimit>PT2H</ExecutionTimeLimit>
    <Priority>7</Priority>
  </Settings>
  <Actions Context="Author">
    <Exec>
      <Command>"{program}"</Command>
      <Arguments>{arguments}</Arguments>
      <WorkingDirectory>{working_dir}</WorkingDirectory>
    </Exec>
  </Actions>
</Task>
"#,
        triggers = triggers,
        program = xml_escape(&command.program.display().to_string()),
        arguments = xml_escape(&windows_args(&command.args)),
        working_dir = xml_escape(&command.working_dir.display().to_string()),
    )
}

/// schtasks reads task files as UTF-16 with a byte order mark.
fn utf16_le(text: &str) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

/// Reads `schtasks /query /v /fo list` output.
pub fn parse_schtasks_list(output: &str) -> RegistrationStatus {
    let mut status = RegistrationStatus {
        installed: true,
        enabled: true,
        ..RegistrationStatus::default()
    };

    let meaningful = |value: &str| -> Option<String> {
        let value = value.trim();
        match value {
            "" | "N/A" | "Never" => None,
            _ => Some(value.to_string()),
        }
    };

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "Next Run Time" if status.next_run.is_none() => status.next_run = meaningful(value),
            "Last Run Time" if status.last_run.is_none() => status.last_run = meaningful(value),
            "Status" if status.detail.is_none() => status.detail = meaningful(value),
            "Scheduled Task State" => status.enabled = !value.trim().eq_ignore_ascii_case("disabled"),
            "Start Time" => {
                if let Some(time) = meaningful(value) {
                    if !status.times.contains(&time) {
                        status.times.push(time);
                    }
                }
            }
            _ => {}
        }
    }
    if status.detail.as_deref().map_or(false, |d| d.eq_ignore_ascii_case("disabled")) {
        status.enabled = false;
    }
    status
}

#[async_trait]
impl TaskRegistrar for SchtasksRegistrar {
    async fn install(&self, times: &[NaiveTime], command: &TaskCommand) -> Result<()> {
        if times.is_empty() {
            return Err(CrawlerError::Schedule("at least one run time is required".to_string()));
        }

        let xml_path = std::env::temp_dir().join(format!("{}-{}.xml", self.task_name, Uuid::new_v4().simple()));
        std::fs::write(&xml_path, utf16_le(&task_xml(times, command)))
            .map_err(|e| CrawlerError::Schedule(format!("cannot write task definition: {}", e)))?;

        let xml_arg = xml_path.display().to_string();
        let created = run_command(
            "schtasks",
            &["/create", "/tn", &self.task_name, "/xml", &xml_arg, "/f"],
            None,
        )
        .await;
        let _ = std::fs::remove_file(&xml_path);

        let created = created?;
        if !created.success {
            return Err(CrawlerError::Schedule(format!(
                "schtasks refused the task (try an elevated prompt): {}",
                created.stderr.trim()
            )));
        }
        info!("Scheduled task '{}' installed for {} time(s)", self.task_name, times.len());
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        if !self.is_installed().await? {
            info!("Scheduled task '{}' is not installed", self.task_name);
            return Ok(());
        }
        let deleted = run_command("schtasks", &["/delete", "/tn", &self.task_name, "/f"], None).await?;
        if !deleted.success {
            return Err(CrawlerError::Schedule(format!(
                "schtasks could not delete the task: {}",
                deleted.stderr.trim()
            )));
        }
        info!("Scheduled task '{}' removed", self.task_name);
        Ok(())
    }

    async fn status(&self) -> Result<RegistrationStatus> {
        let query = run_command("schtasks", &["/query", "/tn", &self.task_name, "/v", "/fo", "list"], None).await?;
        if !query.success {
            return Ok(RegistrationStatus::default());
        }
        Ok(parse_schtasks_list(&query.stdout))
    }
}

/// Per-user crontab entries, one line per time, each tagged so they can be
/// found again without touching the user's other jobs.
pub struct CrontabRegistrar;

impl CrontabRegistrar {
    pub fn new() -> Self {
        Self
    }

    async fn read(&self) -> Result<String> {
        let output = run_command("crontab", &["-l"], None).await?;
        if output.success {
            Ok(output.stdout)
        } else if output.stderr.to_lowercase().contains("no crontab") {
            Ok(String::new())
        } else {
            Err(CrawlerError::Schedule(format!("crontab -l failed: {}", output.stderr.trim())))
        }
    }

    async fn write(&self, crontab: &str) -> Result<()> {
        let output = run_command("crontab", &["-"], Some(crontab)).await?;
        if !output.success {
            return Err(CrawlerError::Schedule(format!("crontab rejected the update: {}", output.stderr.trim())));
        }
        Ok(())
    }
}

impl Default for CrontabRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-quoted for sh, with `%` escaped since cron turns a bare one into a newline.
fn cron_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''").replace('%', r"\%"))
}

pub fn cron_line(time: NaiveTime, command: &TaskCommand) -> String {
    let mut line = format!(
        "{} {} * * * cd {} && {}",
        time.minute(),
        time.hour(),
        cron_quote(&command.working_dir.display().to_string()),
        cron_quote(&command.program.display().to_string())
    );
    for arg in &command.args {
        line.push(' ');
        line.push_str(&cron_quote(arg));
    }
    line.push(' ');
    line.push_str(CRON_TAG);
    line
}

/// The crontab with every crawler line removed.
pub fn strip_tagged(crontab: &str) -> String {
    let mut kept: String = crontab
        .lines()
        .filter(|line| !line.trim_end().ends_with(CRON_TAG))
        .collect::<Vec<_>>()
        .join("\n");
    if !kept.is_empty() {
        kept.push('\n');
    }
    kept
}

/// Times of the crawler lines in a crontab.
pub fn tagged_times(crontab: &str) -> Vec<NaiveTime> {
    let mut times: Vec<NaiveTime> = crontab
        .lines()
        .filter(|line| line.trim_end().ends_with(CRON_TAG))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let minute = fields.next()?.parse().ok()?;
            let hour = fields.next()?.parse().ok()?;
            NaiveTime::from_hms_opt(hour, minute, 0)
        })
        .collect();
    times.sort();
    times.dedup();
    times
}

#[async_trait]
impl TaskRegistrar for CrontabRegistrar {
    async fn install(&self, times: &[NaiveTime], command: &TaskCommand) -> Result<()> {
        if times.is_empty() {
            return Err(CrawlerError::Schedule("at least one run time is required".to_string()));
        }

        let mut crontab = strip_tagged(&self.read().await?);
        for time in times {
            crontab.push_str(&cron_line(*time, command));
            crontab.push('\n');
        }
        self.write(&crontab).await?;
        info!("Installed {} crontab entr(ies)", times.len());
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        let current = self.read().await?;
        if tagged_times(&current).is_empty() {
            info!("No crawler entries in crontab");
            return Ok(());
        }
        self.write(&strip_tagged(&current)).await?;
        info!("Removed crawler entries from crontab");
        Ok(())
    }

    async fn status(&self) -> Result<RegistrationStatus> {
        let times = tagged_times(&self.read().await?);
        if times.is_empty() {
            return Ok(RegistrationStatus::default());
        }
        Ok(RegistrationStatus {
            installed: true,
            enabled: true,
            times: times.iter().map(|t| t.format("%H:%M").to_string()).collect(),
            next_run: next_run_text(&times),
            last_run: None,
            detail: Some("crontab".to_string()),
        })
    }
}
