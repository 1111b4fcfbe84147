//! Access point lifecycle: apply and tear down.

use std::{sync::Arc, time::Duration};

use tokio::sync::Mutex;

use crate::{
    CommandRunner, FirewallRule, NetworkError, NetworkServiceState, Step, firewall::portal_rules,
};

/// Upper bound on duplicate copies of one rule removed before re-adding.
const MAX_RULE_COPIES: usize = 16;

/// Poll interval while waiting for a stopped daemon to exit.
const DAEMON_EXIT_POLL: Duration = Duration::from_millis(100);

/// Steps that failed during an otherwise completed apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub warnings: Vec<(Step, String)>,
}

impl ApplyReport {
    /// Whether every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warn(&mut self, step: Step, cause: impl Into<String>) {
        let cause = cause.into();
        tracing::warn!(%step, %cause, "Network step failed, continuing");
        self.warnings.push((step, cause));
    }
}

/// What the next teardown has to undo.
#[derive(Debug)]
struct Pending {
    target: NetworkServiceState,
    /// Whether the interface passed the existence check.
    interface_present: bool,
}

/// Brings the access point stack up and down.
///
/// `apply` and `teardown` are serialized. `teardown` undoes whatever the last
/// `apply` got through and runs at most once per `apply`.
pub struct NetworkManager {
    runner: Arc<dyn CommandRunner>,
    settle: Duration,
    daemon_exit_timeout: Duration,
    pending: Mutex<Option<Pending>>,
}

impl NetworkManager {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            settle: Duration::from_secs(1),
            daemon_exit_timeout: Duration::from_secs(2),
            pending: Mutex::new(None),
        }
    }

    /// Pause after interface state changes.
    #[must_use]
    pub const fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// How long a stopped daemon gets to exit before its replacement starts.
    #[must_use]
    pub const fn with_daemon_exit_timeout(mut self, timeout: Duration) -> Self {
        self.daemon_exit_timeout = timeout;
        self
    }

    /// Whether a teardown is pending.
    pub async fn is_applied(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    /// Bring the host to `target`.
    ///
    /// Only the interface check is fatal. Every later step is best-effort
    /// and reported in the returned [`ApplyReport`].
    ///
    /// # Errors
    /// Returns `NetworkError::Step` with [`Step::CheckInterface`] if the
    /// interface does not exist. The host is not changed in that case, but
    /// a following `teardown` still clears daemons and portal rules left by
    /// an earlier run.
    pub async fn apply(&self, target: &NetworkServiceState) -> Result<ApplyReport, NetworkError> {
        let mut pending = self.pending.lock().await;
        let iface = target.interface.as_str();
        tracing::info!(
            interface = iface,
            address = %target.cidr(),
            ssid = %target.ssid,
            "Applying network state"
        );

        if let Err(cause) = self.run("ip", &["link", "show", iface]).await {
            tracing::error!(interface = iface, %cause, "Interface not found");
            *pending = Some(Pending {
                target: target.clone(),
                interface_present: false,
            });
            return Err(NetworkError::step(Step::CheckInterface, cause));
        }
        *pending = Some(Pending {
            target: target.clone(),
            interface_present: true,
        });

        let mut report = ApplyReport::default();
        self.best_effort(
            &mut report,
            Step::ReleaseManager,
            "nmcli",
            &["device", "set", iface, "managed", "no"],
        )
        .await;
        tokio::time::sleep(self.settle).await;

        self.best_effort(
            &mut report,
            Step::LinkDown,
            "ip",
            &["link", "set", iface, "down"],
        )
        .await;
        tokio::time::sleep(self.settle).await;
        self.best_effort(
            &mut report,
            Step::FlushAddress,
            "ip",
            &["addr", "flush", "dev", iface],
        )
        .await;
        let cidr = target.cidr();
        self.best_effort(
            &mut report,
            Step::AssignAddress,
            "ip",
            &["addr", "add", cidr.as_str(), "dev", iface],
        )
        .await;
        self.best_effort(
            &mut report,
            Step::LinkUp,
            "ip",
            &["link", "set", iface, "up"],
        )
        .await;
        tokio::time::sleep(self.settle).await;

        if let Err(e) = render_configs(target).await {
            report.warn(Step::RenderConfig, e.to_string());
        }

        let hostapd_conf = target.hostapd_path().to_string_lossy().into_owned();
        self.restart_daemon(&mut report, Step::AccessPoint, "hostapd", &[hostapd_conf])
            .await;
        let dnsmasq_conf = target.dnsmasq_path().to_string_lossy().into_owned();
        self.restart_daemon(
            &mut report,
            Step::DhcpDns,
            "dnsmasq",
            &["-C".to_string(), dnsmasq_conf],
        )
        .await;

        let rules = portal_rules(target);
        for rule in rules.iter().rev() {
            self.remove_rule(rule).await;
        }
        for rule in &rules {
            if let Err(cause) = self.run_owned("iptables", &rule.add_args()).await {
                report.warn(Step::Firewall, cause);
            }
        }

        if report.is_clean() {
            tracing::info!(interface = iface, "Network state applied");
        } else {
            tracing::warn!(
                interface = iface,
                failed = report.warnings.len(),
                "Network state applied with failures"
            );
        }
        Ok(report)
    }

    /// Undo the last `apply`. Safe after a partial or failed apply; a no-op
    /// if `apply` was never called.
    ///
    /// Daemons and portal rules are always cleared. Interface steps are
    /// skipped when the interface was missing.
    pub async fn teardown(&self) {
        let mut pending = self.pending.lock().await;
        let Some(Pending {
            target,
            interface_present,
        }) = pending.take()
        else {
            tracing::debug!("No network state to tear down");
            return;
        };
        let iface = target.interface.as_str();
        tracing::info!(interface = iface, "Tearing down network state");

        let mut report = ApplyReport::default();
        self.best_effort(&mut report, Step::DhcpDns, "killall", &["dnsmasq"])
            .await;
        self.best_effort(&mut report, Step::AccessPoint, "killall", &["hostapd"])
            .await;
        for rule in portal_rules(&target) {
            self.remove_rule(&rule).await;
        }

        if interface_present {
            self.best_effort(
                &mut report,
                Step::FlushAddress,
                "ip",
                &["addr", "flush", "dev", iface],
            )
            .await;
            self.best_effort(
                &mut report,
                Step::LinkDown,
                "ip",
                &["link", "set", iface, "down"],
            )
            .await;
            self.best_effort(
                &mut report,
                Step::RestoreManager,
                "nmcli",
                &["device", "set", iface, "managed", "yes"],
            )
            .await;
        }

        tracing::info!(
            interface = iface,
            failed = report.warnings.len(),
            "Network state torn down"
        );
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<(), String> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        self.run_owned(program, &args).await
    }

    async fn run_owned(&self, program: &str, args: &[String]) -> Result<(), String> {
        match self.runner.run(program, args).await {
            Ok(output) if output.is_success() => Ok(()),
            Ok(output) => Err(format!("{program}: {}", output.describe())),
            Err(e) => Err(format!("{program}: {e}")),
        }
    }

    async fn best_effort(
        &self,
        report: &mut ApplyReport,
        step: Step,
        program: &str,
        args: &[&str],
    ) {
        if let Err(cause) = self.run(program, args).await {
            report.warn(step, cause);
        }
    }

    /// Stop any running instance, wait for it to exit, then start a fresh one.
    async fn restart_daemon(
        &self,
        report: &mut ApplyReport,
        step: Step,
        program: &str,
        args: &[String],
    ) {
        if self.run("killall", &[program]).await.is_ok() {
            if self.wait_for_exit(program).await {
                tracing::debug!(program, "Stopped previous instance");
            } else {
                tracing::warn!(
                    program,
                    timeout = ?self.daemon_exit_timeout,
                    "Previous instance still running, starting anyway"
                );
            }
        }
        match self.runner.spawn(program, args).await {
            Ok(pid) => tracing::info!(%step, program, pid, "Service started"),
            Err(e) => report.warn(step, format!("{program}: {e}")),
        }
    }

    /// Poll until no process named `program` is left, up to the exit timeout.
    async fn wait_for_exit(&self, program: &str) -> bool {
        let deadline = tokio::time::Instant::now() + self.daemon_exit_timeout;
        loop {
            // pgrep exits non-zero when nothing matches.
            if self.run("pgrep", &["-x", program]).await.is_err() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DAEMON_EXIT_POLL).await;
        }
    }

    /// Delete every copy of `rule`; deleting a missing rule fails, which
    /// ends the loop.
    async fn remove_rule(&self, rule: &FirewallRule) {
        let args = rule.delete_args();
        for _ in 0..MAX_RULE_COPIES {
            if self.run_owned("iptables", &args).await.is_err() {
                return;
            }
        }
        tracing::warn!(rule = %args.join(" "), "Rule still present after repeated deletes");
    }
}

async fn render_configs(target: &NetworkServiceState) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(&target.runtime_dir).await?;
    tokio::fs::write(target.hostapd_path(), target.render_hostapd()).await?;
    tokio::fs::write(target.dnsmasq_path(), target.render_dnsmasq()).await?;
    tracing::debug!(dir = %target.runtime_dir.display(), "Rendered service configs");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};

    use async_trait::async_trait;

    use super::*;
    use crate::CommandOutput;

    type RuleSet = BTreeMap<(String, String), Vec<Vec<String>>>;

    /// Interprets iptables against an in-memory rule set; everything else is
    /// recorded and succeeds.
    #[derive(Default)]
    struct FakeHost {
        rules: std::sync::Mutex<RuleSet>,
        commands: std::sync::Mutex<Vec<String>>,
        missing_interfaces: HashSet<String>,
        missing_programs: HashSet<String>,
        /// Daemons that keep showing up in `pgrep` after `killall`.
        stuck_programs: HashSet<String>,
    }

    impl FakeHost {
        fn rules(&self) -> RuleSet {
            self.rules.lock().unwrap().clone()
        }

        fn rule_count(&self) -> usize {
            self.rules.lock().unwrap().values().map(Vec::len).sum()
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        fn position(&self, command: &str) -> Option<usize> {
            self.commands().iter().position(|c| c == command)
        }

        /// Install a portal rule the way a crashed earlier run would have.
        fn preinstall(&self, rule: &FirewallRule) {
            assert!(self.iptables(&rule.add_args()).is_success());
        }

        fn iptables(&self, args: &[String]) -> CommandOutput {
            let mut args = args.to_vec();
            let mut table = "filter".to_string();
            if args.first().is_some_and(|a| a == "-t") {
                table = args[1].clone();
                args.drain(..2);
            }
            let action = args.remove(0);
            let chain = args.remove(0);
            let mut rules = self.rules.lock().unwrap();
            let chain_rules = rules.entry((table, chain)).or_default();
            match action.as_str() {
                "-I" => chain_rules.insert(0, args),
                "-A" => chain_rules.push(args),
                "-D" => match chain_rules.iter().position(|r| *r == args) {
                    Some(i) => {
                        chain_rules.remove(i);
                    }
                    None => {
                        return CommandOutput::failure(
                            "Bad rule (does a matching rule exist in that chain?).",
                        );
                    }
                },
                other => panic!("unexpected iptables action {other}"),
            }
            CommandOutput::success()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeHost {
        async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, NetworkError> {
            self.commands
                .lock()
                .unwrap()
                .push(format!("{program} {}", args.join(" ")));
            match program {
                "iptables" => Ok(self.iptables(args)),
                "ip" if args.len() == 3
                    && args[1] == "show"
                    && self.missing_interfaces.contains(&args[2]) =>
                {
                    Ok(CommandOutput::failure(format!(
                        "Device \"{}\" does not exist.",
                        args[2]
                    )))
                }
                "pgrep" if !self.stuck_programs.contains(&args[1]) => {
                    Ok(CommandOutput::failure(""))
                }
                _ => Ok(CommandOutput::success()),
            }
        }

        async fn spawn(&self, program: &str, args: &[String]) -> Result<u32, NetworkError> {
            self.commands
                .lock()
                .unwrap()
                .push(format!("spawn {program} {}", args.join(" ")));
            if self.missing_programs.contains(program) {
                return Err(NetworkError::ExecutableNotFound(program.to_string()));
            }
            Ok(4242)
        }
    }

    fn target(dir: &tempfile::TempDir) -> NetworkServiceState {
        NetworkServiceState {
            runtime_dir: dir.path().to_path_buf(),
            ..NetworkServiceState::default()
        }
    }

    fn manager(host: &Arc<FakeHost>) -> NetworkManager {
        NetworkManager::new(host.clone())
            .with_settle(Duration::ZERO)
            .with_daemon_exit_timeout(Duration::from_millis(30))
    }

    #[tokio::test]
    async fn test_apply_installs_everything() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let report = manager(&host).apply(&target(&dir)).await.unwrap();

        assert!(report.is_clean(), "{report:?}");
        assert_eq!(host.rule_count(), 7);
        let commands = host.commands();
        assert_eq!(commands[0], "ip link show wlan0");
        for expected in [
            "nmcli device set wlan0 managed no",
            "ip addr add 192.168.4.1/24 dev wlan0",
        ] {
            assert!(commands.iter().any(|c| c == expected), "{expected}");
        }
        assert!(commands.contains(&format!(
            "spawn hostapd {}",
            dir.path().join("hostapd.conf").display()
        )));
        assert!(dir.path().join("dnsmasq.conf").exists());

        let rules = host.rules();
        let input = &rules[&("filter".to_string(), "INPUT".to_string())];
        assert_eq!(input[0].join(" "), "-i wlan0 -p tcp --dport 53 -j ACCEPT");
        assert_eq!(input[1].join(" "), "-i wlan0 -p udp --dport 53 -j ACCEPT");
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let manager = manager(&host);

        manager.apply(&target(&dir)).await.unwrap();
        let once = host.rules();
        manager.apply(&target(&dir)).await.unwrap();
        assert_eq!(host.rules(), once);
        assert_eq!(host.rule_count(), 7);
    }

    #[tokio::test]
    async fn test_daemon_restart_waits_for_old_instance() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        manager(&host).apply(&target(&dir)).await.unwrap();

        let killed = host.position("killall dnsmasq").unwrap();
        let checked = host.position("pgrep -x dnsmasq").unwrap();
        let spawned = host
            .commands()
            .iter()
            .position(|c| c.starts_with("spawn dnsmasq"))
            .unwrap();
        assert!(killed < checked && checked < spawned);
    }

    #[tokio::test]
    async fn test_stuck_daemon_wait_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost {
            stuck_programs: HashSet::from(["hostapd".to_string()]),
            ..FakeHost::default()
        });

        let manager = manager(&host);
        let state = target(&dir);
        let report = tokio::time::timeout(Duration::from_secs(5), manager.apply(&state))
            .await
            .unwrap()
            .unwrap();

        assert!(report.is_clean());
        let commands = host.commands();
        assert!(commands.iter().any(|c| c.starts_with("spawn hostapd")));
    }

    #[tokio::test]
    async fn test_missing_interface_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost {
            missing_interfaces: HashSet::from(["wlan0".to_string()]),
            ..FakeHost::default()
        });
        let manager = manager(&host);

        let err = tokio_test::assert_err!(manager.apply(&target(&dir)).await);
        assert!(matches!(
            err,
            NetworkError::Step {
                step: Step::CheckInterface,
                ..
            }
        ));
        assert_eq!(host.commands(), ["ip link show wlan0"]);
    }

    #[tokio::test]
    async fn test_teardown_after_failed_check_clears_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost {
            missing_interfaces: HashSet::from(["wlan0".to_string()]),
            ..FakeHost::default()
        });
        let state = target(&dir);
        for rule in portal_rules(&state) {
            host.preinstall(&rule);
        }
        let manager = manager(&host);

        assert!(manager.apply(&state).await.is_err());
        assert!(manager.is_applied().await);
        manager.teardown().await;

        assert_eq!(host.rule_count(), 0);
        let commands = host.commands();
        assert!(commands.contains(&"killall dnsmasq".to_string()));
        assert!(commands.contains(&"killall hostapd".to_string()));
        assert!(!commands.iter().any(|c| c.starts_with("nmcli")));
        assert!(!commands.contains(&"ip link set wlan0 down".to_string()));
        assert!(!manager.is_applied().await);
    }

    #[tokio::test]
    async fn test_teardown_after_partial_apply() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost {
            missing_programs: HashSet::from(["hostapd".to_string()]),
            ..FakeHost::default()
        });
        let manager = manager(&host);

        let report = manager.apply(&target(&dir)).await.unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].0, Step::AccessPoint);

        manager.teardown().await;
        assert_eq!(host.rule_count(), 0);
        let commands = host.commands();
        assert!(commands.contains(&"killall dnsmasq".to_string()));
        let restored = "nmcli device set wlan0 managed yes";
        assert!(commands.iter().any(|c| c == restored));
        assert!(!manager.is_applied().await);
    }

    #[tokio::test]
    async fn test_teardown_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let manager = manager(&host);
        manager.apply(&target(&dir)).await.unwrap();

        tokio::join!(manager.teardown(), manager.teardown());
        let restores = host
            .commands()
            .iter()
            .filter(|c| *c == "nmcli device set wlan0 managed yes")
            .count();
        assert_eq!(restores, 1);
    }

    #[tokio::test]
    async fn test_teardown_without_apply_is_noop() {
        let host = Arc::new(FakeHost::default());
        manager(&host).teardown().await;
        assert!(host.commands().is_empty());
    }
}
