use std::str::FromStr;

use crate::tasks::task::TaskId;

/// A line typed into the `run` console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start(TaskId),
    Pause(TaskId),
    Resume(TaskId),
    Stop(TaskId),
    Kill(u32),
    Status,
    Help,
    Quit,
}

pub const CONSOLE_HELP: &str = "commands: start <id> | pause <id> | resume <id> | stop <id> | kill <pid> | status | help | quit";

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| "empty command".to_string())?.to_lowercase();
        let argument = words.next();
        if words.next().is_some() {
            return Err(format!("too many arguments for '{}'", verb));
        }

        let task_id = || -> Result<TaskId, String> {
            let raw = argument.ok_or_else(|| format!("'{}' needs a task id", verb))?;
            raw.parse().map_err(|_| format!("'{}' is not a task id", raw))
        };

        match verb.as_str() {
            "start" => Ok(Self::Start(task_id()?)),
            "pause" => Ok(Self::Pause(task_id()?)),
            "resume" => Ok(Self::Resume(task_id()?)),
            "stop" => Ok(Self::Stop(task_id()?)),
            "kill" => {
                let raw = argument.ok_or_else(|| "'kill' needs a pid".to_string())?;
                raw.parse().map(Self::Kill).map_err(|_| format!("'{}' is not a pid", raw))
            }
            "status" | "ls" => Ok(Self::Status),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}
