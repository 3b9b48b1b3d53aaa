use std::time::Duration;

use crate::agent::run_captured;

/// Terminal-multiplexer operations. One window per worker hosts its agent.
pub trait Terminal: Send + Sync {
    fn session_exists(&self, session: &str) -> impl std::future::Future<Output = bool> + Send;

    fn create_session(
        &self,
        session: &str,
        first_window: &str,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    fn new_window(
        &self,
        session: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    /// Type `command` into `target` and press Enter.
    fn send_command(
        &self,
        target: &str,
        command: &str,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    /// Send Ctrl-C to the foreground process group of `target`.
    fn send_interrupt(
        &self,
        target: &str,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    fn pane_pid(&self, target: &str) -> impl std::future::Future<Output = Option<u32>> + Send;

    fn kill_session(
        &self,
        session: &str,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    /// Whether an agent process is running under the pane of `target`.
    fn agent_alive(&self, target: &str) -> impl std::future::Future<Output = bool> + Send;
}

pub fn window_name(worker_id: u32) -> String {
    format!("w{}", worker_id)
}

/// `session:window` target for a worker's pane.
pub fn window_target(session: &str, worker_id: u32) -> String {
    format!("{}:{}", session, window_name(worker_id))
}

/// `tmux` CLI implementation.
pub struct Tmux {
    pub timeout: Duration,
    /// Process name that identifies the agent under a pane.
    pub agent_process: String,
}

impl Tmux {
    pub fn new(timeout: Duration, agent_process: &str) -> Self {
        Self {
            timeout,
            agent_process: agent_process.to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, String> {
        let mut cmd = tokio::process::Command::new("tmux");
        cmd.args(args);
        let label = format!("tmux {}", args.first().unwrap_or(&""));
        run_captured(cmd, &label, self.timeout).await
    }
}

impl Terminal for Tmux {
    async fn session_exists(&self, session: &str) -> bool {
        self.run(&["has-session", "-t", session]).await.is_ok()
    }

    async fn create_session(&self, session: &str, first_window: &str) -> Result<(), String> {
        self.run(&["new-session", "-d", "-s", session, "-n", first_window])
            .await
            .map(|_| ())
    }

    async fn new_window(&self, session: &str, name: &str) -> Result<(), String> {
        self.run(&["new-window", "-t", session, "-n", name])
            .await
            .map(|_| ())
    }

    async fn send_command(&self, target: &str, command: &str) -> Result<(), String> {
        self.run(&["send-keys", "-t", target, command, "Enter"])
            .await
            .map(|_| ())
    }

    async fn send_interrupt(&self, target: &str) -> Result<(), String> {
        self.run(&["send-keys", "-t", target, "C-c"])
            .await
            .map(|_| ())
    }

    async fn pane_pid(&self, target: &str) -> Option<u32> {
        let out = self
            .run(&["list-panes", "-t", target, "-F", "#{pane_pid}"])
            .await
            .ok()?;
        out.lines().next()?.trim().parse().ok()
    }

    async fn kill_session(&self, session: &str) -> Result<(), String> {
        self.run(&["kill-session", "-t", session]).await.map(|_| ())
    }

    async fn agent_alive(&self, target: &str) -> bool {
        let Some(pid) = self.pane_pid(target).await else {
            return false;
        };
        let mut cmd = tokio::process::Command::new("pgrep");
        cmd.args(["-P", &pid.to_string(), "-f", &self.agent_process]);
        run_captured(cmd, "pgrep", self.timeout)
            .await
            .is_ok_and(|out| !out.trim().is_empty())
    }
}
