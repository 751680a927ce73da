//! Pre/post-patch hooks and the environment they run in.

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use std::path::Path;

use crate::error::{Error, Result};
use crate::ops::Patch;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Variables handed to hook scripts. Built explicitly and passed to the
/// child process; the running process's own environment is left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptEnv {
    vars: Vec<(String, String)>,
}

impl ScriptEnv {
    pub fn for_patch(patch: &Patch, target: &Path) -> Self {
        let mut env = Self::default();
        env.set("PATCH_PRODUCT", &patch.product);
        env.set("PATCH_COMPONENT", patch.component.as_deref().unwrap_or(""));
        env.set("PATCH_VERSION", &patch.version);
        for (key, value) in &patch.fields {
            env.set(&format!("PATCH_{}", key.to_ascii_uppercase()), value);
        }
        env.set("PATCH_PATH", &target.to_string_lossy());
        env.set("PATCH_OS", std::env::consts::OS);
        env.set("PATCH_ARCH", std::env::consts::ARCH);
        env
    }

    /// Later values replace earlier ones with the same name.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.vars.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.vars.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }
}

/// Run `command` through the shell. A non-zero exit, a signal, or running
/// past `timeout` all come back as `ScriptFailure`.
pub fn run_script(command: &str, env: &ScriptEnv, timeout: Option<Duration>) -> Result<()> {
    log::info!("Running script: {command}");
    let failure = |detail: String| Error::ScriptFailure {
        command: command.to_string(),
        detail,
    };

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .envs(env.vars().iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| failure(format!("could not start: {e}")))?;

    let status = match timeout {
        None => child.wait().map_err(|e| failure(e.to_string()))?,
        Some(limit) => {
            let deadline = Instant::now() + limit;
            loop {
                if let Some(status) = child.try_wait().map_err(|e| failure(e.to_string()))? {
                    break status;
                }
                if Instant::now() >= deadline {
                    // already-exited races are harmless here
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(failure(format!("timed out after {}s", limit.as_secs_f64())));
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    };

    if status.success() {
        Ok(())
    } else {
        Err(failure(match status.code() {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by signal".to_string(),
        }))
    }
}
